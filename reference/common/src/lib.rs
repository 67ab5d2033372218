//! Baton Common Types
//!
//! This crate contains the types shared by every Baton component: node
//! addresses, the cluster member model and its events, managed unit
//! identifiers, the error taxonomy and timing defaults.

pub mod identifiers;
pub mod member;
pub mod error;
pub mod time;

pub use identifiers::*;
pub use member::*;
pub use error::*;
pub use time::*;
