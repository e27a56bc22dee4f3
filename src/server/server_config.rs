use anyhow::bail;

use crate::messaging::connection_config::ConnectionConfig;
use crate::transport::DEFAULT_ID_PREFIX;

#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// prepended to the connection code to get the listening peer id; must match the clients'
    pub id_prefix: String,
    /// characters of randomly generated connection codes
    pub code_alphabet: String,
    pub code_length: usize,
    /// number of codes tried by `start()` before giving up; 0 is treated as 1
    pub max_start_retries: usize,
    /// applies to every hosted connection
    pub connection: ConnectionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig::new()
    }
}

impl ServerConfig {
    pub fn new() -> ServerConfig {
        ServerConfig {
            id_prefix: DEFAULT_ID_PREFIX.to_string(),
            code_alphabet: "ABCDEFGHIJKLMNOPQRSTUVWXYZ".to_string(),
            code_length: 5,
            max_start_retries: 10,
            connection: ConnectionConfig::new(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.code_alphabet.is_empty() {
            bail!("connection code alphabet must not be empty");
        }
        if self.code_length == 0 {
            bail!("connection code length must be positive");
        }
        self.connection.validate()
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.code_alphabet.len(), 26);
        assert_eq!(config.code_length, 5);
        assert_eq!(config.max_start_retries, 10);
        assert!(config.validate().is_ok());
    }

    #[rstest]
    #[case::empty_alphabet("", 5, false)]
    #[case::zero_length("AB", 0, false)]
    #[case::digits("0123456789", 4, true)]
    fn test_validate(#[case] alphabet: &str, #[case] length: usize, #[case] expected_ok: bool) {
        let mut config = ServerConfig::default();
        config.code_alphabet = alphabet.to_string();
        config.code_length = length;
        assert_eq!(config.validate().is_ok(), expected_ok);
    }
}
