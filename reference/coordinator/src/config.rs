//! Coordinator configuration.

use std::collections::BTreeSet;
use std::time::Duration;

use baton_common::{constants, Address, BatonError, Result};

/// Signal sent to the managed unit when it has to stop.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TerminationSignal {
    /// Abort the unit immediately.
    #[default]
    StopNow,
    /// Ask the unit to finish its work; the unit stops on its own.
    Graceful(String),
}

/// Identity of the local node within the cluster.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Address of this node.
    pub self_address: Address,
    /// Roles carried by this node.
    pub roles: BTreeSet<String>,
    /// Removal margin of the downing provider, used when the singleton
    /// removal margin is left at zero.
    pub down_removal_margin: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            self_address: Address::from_parts("baton", "127.0.0.1", 2552),
            roles: BTreeSet::new(),
            down_removal_margin: Duration::ZERO,
        }
    }
}

/// Singleton management configuration.
#[derive(Debug, Clone)]
pub struct SingletonConfig {
    /// Name given to the managed unit.
    pub singleton_name: String,
    /// Only coordinate among members with this role; all members if unset.
    pub role: Option<String>,
    /// Interval between hand-over and take-over retries.
    pub hand_over_retry_interval: Duration,
    /// Delay before a member-removed event is trusted. Zero means
    /// "use the node's down removal margin".
    pub removal_margin: Duration,
    /// Lower bound of the derived hand-over retry count.
    pub min_hand_over_retries: u32,
    /// Signal sent to the managed unit on hand-over.
    pub termination_signal: TerminationSignal,
    /// Interval of the removed-member sweep.
    pub cleanup_interval: Duration,
    /// How long a removed member is remembered.
    pub removed_ttl: Duration,
    /// Capacity of the coordinator inbox.
    pub mailbox_capacity: usize,
}

impl Default for SingletonConfig {
    fn default() -> Self {
        Self {
            singleton_name: "singleton".to_string(),
            role: None,
            hand_over_retry_interval: constants::hand_over_retry_interval(),
            removal_margin: Duration::ZERO,
            min_hand_over_retries: constants::MIN_HAND_OVER_RETRIES,
            termination_signal: TerminationSignal::StopNow,
            cleanup_interval: constants::cleanup_interval(),
            removed_ttl: constants::removed_member_ttl(),
            mailbox_capacity: 1024,
        }
    }
}

/// Main coordinator configuration.
#[derive(Debug, Clone, Default)]
pub struct CoordinatorConfig {
    /// Local node identity.
    pub node: NodeConfig,
    /// Singleton configuration.
    pub singleton: SingletonConfig,
}

impl CoordinatorConfig {
    /// Configuration for the node at `self_address` with defaults elsewhere.
    pub fn for_node(self_address: Address) -> Self {
        let mut config = Self::default();
        config.node.self_address = self_address;
        config
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(address) = std::env::var("BATON_SELF_ADDRESS") {
            config.node.self_address = Address::new(address);
        }

        if let Ok(roles) = std::env::var("BATON_ROLES") {
            config.node.roles = roles
                .split(',')
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Ok(margin) = std::env::var("BATON_DOWN_REMOVAL_MARGIN_MS") {
            if let Ok(ms) = margin.parse() {
                config.node.down_removal_margin = Duration::from_millis(ms);
            }
        }

        if let Ok(role) = std::env::var("BATON_SINGLETON_ROLE") {
            config.singleton.role = Some(role).filter(|r| !r.is_empty());
        }

        if let Ok(name) = std::env::var("BATON_SINGLETON_NAME") {
            config.singleton.singleton_name = name;
        }

        if let Ok(interval) = std::env::var("BATON_HAND_OVER_RETRY_INTERVAL_MS") {
            if let Ok(ms) = interval.parse() {
                config.singleton.hand_over_retry_interval = Duration::from_millis(ms);
            }
        }

        if let Ok(margin) = std::env::var("BATON_REMOVAL_MARGIN_MS") {
            if let Ok(ms) = margin.parse() {
                config.singleton.removal_margin = Duration::from_millis(ms);
            }
        }

        if let Ok(retries) = std::env::var("BATON_MIN_HAND_OVER_RETRIES") {
            if let Ok(n) = retries.parse() {
                config.singleton.min_hand_over_retries = n;
            }
        }

        config
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.singleton.min_hand_over_retries < 1 {
            return Err(BatonError::Configuration(
                "min-number-of-hand-over-retries must be >= 1".to_string(),
            ));
        }

        if self.singleton.hand_over_retry_interval.is_zero() {
            return Err(BatonError::Configuration(
                "Hand-over retry interval cannot be zero".to_string(),
            ));
        }

        if self.singleton.cleanup_interval.is_zero() {
            return Err(BatonError::Configuration(
                "Cleanup interval cannot be zero".to_string(),
            ));
        }

        if self.singleton.mailbox_capacity == 0 {
            return Err(BatonError::Configuration(
                "Mailbox capacity cannot be zero".to_string(),
            ));
        }

        if let Some(role) = &self.singleton.role {
            if !self.node.roles.contains(role) {
                return Err(BatonError::MissingRole {
                    address: self.node.self_address.clone(),
                    role: role.clone(),
                });
            }
        }

        Ok(())
    }

    /// Removal margin actually applied to member-removed events.
    pub fn effective_removal_margin(&self) -> Duration {
        if self.singleton.removal_margin.is_zero() {
            self.node.down_removal_margin
        } else {
            self.singleton.removal_margin
        }
    }
}

/// Retry bounds derived once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryLimits {
    /// Maximum `HandOverRetry` count before giving up.
    pub max_hand_over_retries: u32,
    /// Maximum `TakeOverRetry` count before giving up.
    pub max_take_over_retries: u32,
}

impl RetryLimits {
    /// Derive the limits from the removal margin and retry interval.
    pub fn new(removal_margin: Duration, retry_interval: Duration, min_retries: u32) -> Result<Self> {
        if min_retries < 1 {
            return Err(BatonError::Configuration(
                "min-number-of-hand-over-retries must be >= 1".to_string(),
            ));
        }
        if retry_interval.is_zero() {
            return Err(BatonError::Configuration(
                "Hand-over retry interval cannot be zero".to_string(),
            ));
        }

        let n = u32::try_from(removal_margin.as_nanos() / retry_interval.as_nanos())
            .unwrap_or(u32::MAX);
        let max_hand_over_retries =
            min_retries.max(n.saturating_add(constants::HAND_OVER_RETRY_HEADROOM));
        let max_take_over_retries = max_hand_over_retries
            .saturating_sub(constants::HAND_OVER_RETRY_HEADROOM)
            .max(1);

        Ok(Self {
            max_hand_over_retries,
            max_take_over_retries,
        })
    }

    /// Derive the limits from a full configuration.
    pub fn derive(config: &CoordinatorConfig) -> Result<Self> {
        Self::new(
            config.effective_removal_margin(),
            config.singleton.hand_over_retry_interval,
            config.singleton.min_hand_over_retries,
        )
    }
}
