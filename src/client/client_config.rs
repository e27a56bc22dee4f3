use std::time::Duration;

use anyhow::bail;

use crate::messaging::connection_config::ConnectionConfig;
use crate::transport::DEFAULT_ID_PREFIX;

#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// prepended to a connection code to get the server's peer id; must match the server's
    pub id_prefix: String,
    /// upper bound for opening the local identity and the data channel to the server
    pub connect_timeout: Duration,
    pub connection: ConnectionConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig::new()
    }
}

impl ClientConfig {
    pub fn new() -> ClientConfig {
        ClientConfig {
            id_prefix: DEFAULT_ID_PREFIX.to_string(),
            connect_timeout: Duration::from_secs(5),
            connection: ConnectionConfig::new(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.connect_timeout.is_zero() {
            bail!("connect timeout must be positive");
        }
        self.connection.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.id_prefix, DEFAULT_ID_PREFIX);
        assert_eq!(config.connect_timeout, Duration::from_millis(5000));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_nested() {
        let mut config = ClientConfig::default();
        config.connection.message_timeout = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = ClientConfig::default();
        config.connect_timeout = Duration::ZERO;
        assert!(config.validate().is_err());
    }
}
