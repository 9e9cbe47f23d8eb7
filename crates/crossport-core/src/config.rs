//! Centralized configuration for crossport.
//!
//! Holds the process-wide module name every publication is exposed under,
//! plus constant tables for channel framing and the variable binding naming
//! convention.

use crate::{CrossportError, Result};
use std::time::Duration;

/// Channel and transport limits.
pub struct ChannelConfig;

impl ChannelConfig {
    /// Separator between module and method in a channel name.
    pub const CHANNEL_NAME_SEPARATOR: char = '.';
    /// Largest single frame accepted by the TCP transport.
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16MB
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    /// Concurrent inbound channels accepted by one TCP listener.
    pub const MAX_CONNECTIONS: usize = 256;
}

/// Naming convention used by the variable binding protocol.
pub struct BindingConfig;

impl BindingConfig {
    pub const GETTER_PREFIX: &'static str = "__cm_get_";
    pub const SETTER_PREFIX: &'static str = "__cm_set_";

    /// Name of the subscribable publication that reads `variable`.
    pub fn getter_name(variable: &str) -> String {
        format!("{}{}", Self::GETTER_PREFIX, variable)
    }

    /// Name of the publication that assigns `variable`.
    pub fn setter_name(variable: &str) -> String {
        format!("{}{}", Self::SETTER_PREFIX, variable)
    }
}

/// Process-wide messaging configuration.
///
/// Construction validates the module name, so a missing name is reported
/// before anything is published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagingConfig {
    module_name: String,
}

impl MessagingConfig {
    /// Environment variable read by [`MessagingConfig::from_env`].
    pub const MODULE_NAME_ENV: &'static str = "CROSSPORT_MODULE_NAME";

    /// Create a configuration for the given module name.
    ///
    /// The name must be non-empty and must not contain the channel name
    /// separator.
    pub fn new(module_name: impl Into<String>) -> Result<Self> {
        let module_name = module_name.into();

        if module_name.trim().is_empty() {
            return Err(CrossportError::configuration(
                "a module name must be configured before publishing",
            ));
        }

        if module_name.contains(ChannelConfig::CHANNEL_NAME_SEPARATOR) {
            return Err(CrossportError::configuration(format!(
                "module name {:?} must not contain '{}'",
                module_name,
                ChannelConfig::CHANNEL_NAME_SEPARATOR
            )));
        }

        Ok(Self { module_name })
    }

    /// Read the module name from `CROSSPORT_MODULE_NAME`.
    pub fn from_env() -> Result<Self> {
        let name = std::env::var(Self::MODULE_NAME_ENV).map_err(|_| {
            CrossportError::configuration(format!("{} is not set", Self::MODULE_NAME_ENV))
        })?;
        Self::new(name)
    }

    pub fn module_name(&self) -> &str {
        &self.module_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_module_name() {
        let config = MessagingConfig::new("Background").unwrap();
        assert_eq!(config.module_name(), "Background");
    }

    #[test]
    fn test_empty_module_name_is_configuration_error() {
        assert!(MessagingConfig::new("").unwrap_err().is_configuration());
        assert!(MessagingConfig::new("   ").unwrap_err().is_configuration());
    }

    #[test]
    fn test_module_name_with_separator_rejected() {
        let err = MessagingConfig::new("my.module").unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_binding_names() {
        assert_eq!(BindingConfig::getter_name("user"), "__cm_get_user");
        assert_eq!(BindingConfig::setter_name("user"), "__cm_set_user");
    }

    #[test]
    fn test_limits_are_reasonable() {
        assert!(ChannelConfig::MAX_FRAME_SIZE > 1024);
        assert!(ChannelConfig::CONNECT_TIMEOUT > Duration::ZERO);
    }
}
