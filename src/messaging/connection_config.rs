use std::time::Duration;

use anyhow::bail;

#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// A PING is sent after the connection was idle (nothing sent) for this long. This is
    ///  deliberately short relative to typical data channel idle-close windows. `None` disables
    ///  keep-alive.
    pub keep_alive_interval: Option<Duration>,
    /// A sent message that is not acknowledged within this window is marked as timed out. The
    ///  sweep runs once per window, so detection can take up to twice as long.
    pub message_timeout: Duration,
    /// send a DISCONNECT message before closing the channel on `disconnect()`
    pub graceful_disconnect: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig::new()
    }
}

impl ConnectionConfig {
    pub fn new() -> ConnectionConfig {
        ConnectionConfig {
            keep_alive_interval: Some(Duration::from_millis(80)),
            message_timeout: Duration::from_millis(1000),
            graceful_disconnect: false,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.keep_alive_interval == Some(Duration::ZERO) {
            bail!("keep-alive interval must be positive - use None to disable keep-alive");
        }
        if self.message_timeout.is_zero() {
            bail!("message timeout must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ConnectionConfig::default();
        assert_eq!(config.keep_alive_interval, Some(Duration::from_millis(80)));
        assert_eq!(config.message_timeout, Duration::from_secs(1));
        assert!(!config.graceful_disconnect);
        assert!(config.validate().is_ok());
    }

    #[rstest]
    #[case::disabled_keep_alive(None, 1000, true)]
    #[case::zero_keep_alive(Some(0), 1000, false)]
    #[case::zero_timeout(Some(80), 0, false)]
    #[case::regular(Some(80), 1000, true)]
    fn test_validate(#[case] keep_alive_millis: Option<u64>, #[case] timeout_millis: u64, #[case] expected_ok: bool) {
        let config = ConnectionConfig {
            keep_alive_interval: keep_alive_millis.map(Duration::from_millis),
            message_timeout: Duration::from_millis(timeout_millis),
            graceful_disconnect: false,
        };
        assert_eq!(config.validate().is_ok(), expected_ok);
    }
}
