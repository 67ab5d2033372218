//! Baton Protocol Messages
//!
//! Message types exchanged between singleton coordinators running on
//! different nodes, the envelope that carries them and the JSON codec used
//! on the wire.

pub mod messages;

pub use messages::*;
