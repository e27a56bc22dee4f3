use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

/// Keep-alive no-op, the payload is ignored
pub const PING_MESSAGE_TYPE: &str = "PING";
/// Asks the receiver to close the channel
pub const DISCONNECT_MESSAGE_TYPE: &str = "DISCONNECT";

pub fn is_reserved_message_type(message_type: &str) -> bool {
    message_type == PING_MESSAGE_TYPE || message_type == DISCONNECT_MESSAGE_TYPE
}

/// An outbound application message.
///
/// Ids are 1-based and strictly increasing per connection object. While a message is pending,
///  its acknowledgement / timeout fields are updated by the pending tracker only; the copies that
///  are handed out are snapshots.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub id: u64,
    pub message_type: String,
    pub payload: Value,
    pub sent_at: Option<Instant>,
    pub acknowledged_at: Option<Instant>,
    pub timed_out: bool,
}

impl Message {
    pub fn new(id: u64, message_type: impl Into<String>, payload: Value) -> Message {
        Message {
            id,
            message_type: message_type.into(),
            payload,
            sent_at: None,
            acknowledged_at: None,
            timed_out: false,
        }
    }

    /// Travel time from sending to receiving the acknowledgement, if both happened
    pub fn latency(&self) -> Option<Duration> {
        match (self.sent_at, self.acknowledged_at) {
            (Some(sent), Some(acknowledged)) => Some(acknowledged.saturating_duration_since(sent)),
            _ => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.timed_out || self.acknowledged_at.is_some()
    }
}

/// Application content received from the remote peer
#[derive(Clone, Debug, PartialEq)]
pub struct ReceivedMessage {
    pub id: u64,
    pub message_type: String,
    pub payload: Value,
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;
    use super::*;

    #[rstest]
    #[case::unsent(None, None, None)]
    #[case::pending(Some(0), None, None)]
    #[case::acknowledged(Some(10), Some(35), Some(25))]
    #[case::immediate(Some(10), Some(10), Some(0))]
    fn test_latency(#[case] sent_millis: Option<u64>, #[case] ack_millis: Option<u64>, #[case] expected_millis: Option<u64>) {
        let base = Instant::now();
        let mut msg = Message::new(1, "test", json!({"data": "data"}));
        msg.sent_at = sent_millis.map(|m| base + Duration::from_millis(m));
        msg.acknowledged_at = ack_millis.map(|m| base + Duration::from_millis(m));

        assert_eq!(msg.latency(), expected_millis.map(Duration::from_millis));
        assert_eq!(msg.is_resolved(), ack_millis.is_some());
    }

    #[rstest]
    #[case(PING_MESSAGE_TYPE, true)]
    #[case(DISCONNECT_MESSAGE_TYPE, true)]
    #[case("greet", false)]
    #[case("ping", false)]
    fn test_is_reserved(#[case] message_type: &str, #[case] expected: bool) {
        assert_eq!(is_reserved_message_type(message_type), expected);
    }
}
