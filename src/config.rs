//! Controller configuration.
//!
//! Settings can be built in code or read from the environment.
//!
//! # Environment Variables
//!
//! | Setting | Variable | Values |
//! |---------|----------|--------|
//! | [`RmiDelivery`] | `FERROCTL_RMI_SYNC` | `1`, `true`, `yes`, `on` select synchronous delivery |

use std::env;

/// Environment variable selecting synchronous RMI delivery.
pub const RMI_SYNC_VAR: &str = "FERROCTL_RMI_SYNC";

/// How remote invocation frames are handed to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RmiDelivery {
    /// Trigger returns as soon as the frame is queued.
    #[default]
    Asynchronous,
    /// Trigger blocks until the target's dispatcher has received the frame.
    Synchronous,
}

/// Options for a [`ProcessController`](crate::ProcessController).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControllerConfig {
    rmi_delivery: RmiDelivery,
}

impl ControllerConfig {
    /// Default configuration: asynchronous RMI delivery.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the configuration from the environment.
    ///
    /// Missing or unrecognised values fall back to the defaults.
    pub fn from_env() -> Self {
        let rmi_delivery = if env::var(RMI_SYNC_VAR).ok().is_some_and(|v| parse_flag(&v)) {
            RmiDelivery::Synchronous
        } else {
            RmiDelivery::Asynchronous
        };
        ControllerConfig { rmi_delivery }
    }

    /// Set the RMI delivery mode.
    pub fn with_rmi_delivery(mut self, delivery: RmiDelivery) -> Self {
        self.rmi_delivery = delivery;
        self
    }

    /// RMI delivery mode.
    pub fn rmi_delivery(&self) -> RmiDelivery {
        self.rmi_delivery
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn asynchronous_by_default() {
        assert_eq!(ControllerConfig::new().rmi_delivery(), RmiDelivery::Asynchronous);
    }

    #[test]
    fn builder_overrides_delivery() {
        let config = ControllerConfig::new().with_rmi_delivery(RmiDelivery::Synchronous);
        assert_eq!(config.rmi_delivery(), RmiDelivery::Synchronous);
    }

    #[test]
    fn flag_parsing() {
        for yes in ["1", "true", "YES", " on "] {
            assert!(parse_flag(yes), "{yes}");
        }
        for no in ["0", "false", "", "maybe"] {
            assert!(!parse_flag(no), "{no}");
        }
    }

    #[test]
    fn from_env_without_variable() {
        // Only meaningful when the variable is not set by the caller's shell
        if std::env::var(RMI_SYNC_VAR).is_err() {
            assert_eq!(ControllerConfig::from_env(), ControllerConfig::default());
        }
    }
}
