//! Client configuration

use crate::identity::{DEFAULT_PRODUCT_ID, DEFAULT_VENDOR_ID, DeviceIdentity};
use crate::platform::Direction;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default OUT endpoint of TSC printers
pub const DEFAULT_WRITE_ENDPOINT: u8 = 0x01;
/// Default IN endpoint of TSC printers
pub const DEFAULT_READ_ENDPOINT: u8 = 0x82;

/// What to do with a caught lifecycle or transfer failure
///
/// Either way the failure is logged and delivered to client listeners as
/// `connection_failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Keep running; the call returns `Ok`
    #[default]
    Report,
    /// Also return the error from the call
    Propagate,
}

/// Endpoint addresses the pipes bind to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// OUT endpoint for the write pipe
    #[serde(default = "EndpointConfig::default_write")]
    pub write: u8,
    /// IN endpoint for the read pipe
    #[serde(default = "EndpointConfig::default_read")]
    pub read: u8,
}

impl EndpointConfig {
    fn default_write() -> u8 {
        DEFAULT_WRITE_ENDPOINT
    }

    fn default_read() -> u8 {
        DEFAULT_READ_ENDPOINT
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            write: DEFAULT_WRITE_ENDPOINT,
            read: DEFAULT_READ_ENDPOINT,
        }
    }
}

/// Connection client settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "ClientConfig::default_vendor_id")]
    pub vendor_id: u16,
    #[serde(default = "ClientConfig::default_product_id")]
    pub product_id: u16,
    #[serde(default)]
    pub endpoints: EndpointConfig,
    #[serde(default)]
    pub error_policy: ErrorPolicy,
}

/// Invalid configuration values
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("read endpoint {0:#04x} is not an IN endpoint")]
    ReadEndpointNotIn(u8),

    #[error("write endpoint {0:#04x} is not an OUT endpoint")]
    WriteEndpointNotOut(u8),
}

impl ClientConfig {
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
            ..Self::default()
        }
    }

    pub fn with_endpoints(mut self, write: u8, read: u8) -> Self {
        self.endpoints = EndpointConfig { write, read };
        self
    }

    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity::new(self.vendor_id, self.product_id)
    }

    /// Check that the endpoints point the right way
    pub fn validate(&self) -> Result<(), ConfigError> {
        if Direction::of(self.endpoints.read) != Direction::In {
            return Err(ConfigError::ReadEndpointNotIn(self.endpoints.read));
        }
        if Direction::of(self.endpoints.write) != Direction::Out {
            return Err(ConfigError::WriteEndpointNotOut(self.endpoints.write));
        }
        Ok(())
    }

    fn default_vendor_id() -> u16 {
        DEFAULT_VENDOR_ID
    }

    fn default_product_id() -> u16 {
        DEFAULT_PRODUCT_ID
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            vendor_id: DEFAULT_VENDOR_ID,
            product_id: DEFAULT_PRODUCT_ID,
            endpoints: EndpointConfig::default(),
            error_policy: ErrorPolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.identity(), DeviceIdentity::new(0x1203, 0x0172));
        assert_eq!(config.endpoints.write, 0x01);
        assert_eq!(config.endpoints.read, 0x82);
        assert_eq!(config.error_policy, ErrorPolicy::Report);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_swapped_endpoints() {
        let config = ClientConfig::default().with_endpoints(0x82, 0x01);
        assert_eq!(config.validate(), Err(ConfigError::ReadEndpointNotIn(0x01)));

        let config = ClientConfig::default().with_endpoints(0x81, 0x82);
        assert_eq!(
            config.validate(),
            Err(ConfigError::WriteEndpointNotOut(0x81))
        );
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: ClientConfig = toml::from_str(
            r#"
vendor_id = 0x04f9
error_policy = "propagate"

[endpoints]
read = 0x81
"#,
        )
        .unwrap();

        assert_eq!(config.vendor_id, 0x04f9);
        assert_eq!(config.product_id, 0x0172);
        assert_eq!(config.endpoints.read, 0x81);
        assert_eq!(config.endpoints.write, 0x01);
        assert_eq!(config.error_policy, ErrorPolicy::Propagate);
    }

    #[test]
    fn test_parse_empty_toml_gives_defaults() {
        let config: ClientConfig = toml::from_str("").unwrap();
        assert_eq!(config, ClientConfig::default());
    }
}
