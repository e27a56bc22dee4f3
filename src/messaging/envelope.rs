use anyhow::bail;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::messaging::message::Message;

/// The wire structure exchanged over a data channel, JSON encoded:
///
/// * content: `{"id": 1, "type": "greet", "data": {...}}`
/// * acknowledgement: `{"ack": 1}`
///
/// There is no version field, both peers must agree on this shape.
#[derive(Clone, Debug, PartialEq)]
pub enum Envelope {
    Content {
        id: u64,
        message_type: String,
        payload: Value,
    },
    Ack {
        id: u64,
    },
}

#[derive(Serialize)]
#[serde(untagged)]
enum WireEnvelope<'a> {
    Content {
        id: u64,
        #[serde(rename = "type")]
        message_type: &'a str,
        data: &'a Value,
    },
    Ack {
        ack: u64,
    },
}

/// lenient shape for reading: classification happens after parsing so that a missing type can
///  be reported as such rather than as a generic parse error
#[derive(Deserialize)]
struct RawEnvelope {
    ack: Option<u64>,
    id: Option<u64>,
    #[serde(rename = "type")]
    message_type: Option<String>,
    #[serde(default)]
    data: Value,
}

impl Envelope {
    pub fn for_message(message: &Message) -> Envelope {
        Envelope::Content {
            id: message.id,
            message_type: message.message_type.clone(),
            payload: message.payload.clone(),
        }
    }

    pub fn encode(&self) -> anyhow::Result<Bytes> {
        let wire = match self {
            Envelope::Content { id, message_type, payload } => WireEnvelope::Content {
                id: *id,
                message_type,
                data: payload,
            },
            Envelope::Ack { id } => WireEnvelope::Ack { ack: *id },
        };
        Ok(serde_json::to_vec(&wire)?.into())
    }

    pub fn try_decode(buf: &[u8]) -> anyhow::Result<Envelope> {
        let raw: RawEnvelope = serde_json::from_slice(buf)?;

        if let Some(ack) = raw.ack {
            return Ok(Envelope::Ack { id: ack });
        }

        let message_type = match raw.message_type {
            Some(t) if !t.is_empty() => t,
            _ => bail!("messages with no type can not be processed"),
        };
        let Some(id) = raw.id else {
            bail!("message of type {:?} has no id", message_type);
        };

        Ok(Envelope::Content {
            id,
            message_type,
            payload: raw.data,
        })
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;
    use serde_json::json;
    use super::*;

    #[rstest]
    #[case::ack(br#"{"ack":5}"#, Some(Envelope::Ack { id: 5 }))]
    #[case::ack_wins(br#"{"ack":5,"id":3,"type":"x"}"#, Some(Envelope::Ack { id: 5 }))]
    #[case::content(br#"{"id":1,"type":"greet","data":{"text":"hi"}}"#, Some(Envelope::Content { id: 1, message_type: "greet".to_string(), payload: json!({"text": "hi"}) }))]
    #[case::no_data(br#"{"id":2,"type":"PING"}"#, Some(Envelope::Content { id: 2, message_type: "PING".to_string(), payload: Value::Null }))]
    #[case::null_data(br#"{"id":2,"type":"t","data":null}"#, Some(Envelope::Content { id: 2, message_type: "t".to_string(), payload: Value::Null }))]
    #[case::extra_fields(br#"{"id":9,"type":"t","data":3,"x":true}"#, Some(Envelope::Content { id: 9, message_type: "t".to_string(), payload: json!(3) }))]
    #[case::no_type(br#"{"id":1,"data":"x"}"#, None)]
    #[case::empty_type(br#"{"id":1,"type":"","data":"x"}"#, None)]
    #[case::no_id(br#"{"type":"greet"}"#, None)]
    #[case::negative_ack(br#"{"ack":-1}"#, None)]
    #[case::not_an_object(br#"[1,2,3]"#, None)]
    #[case::not_json(b"\x01\x02garbage", None)]
    #[case::empty(b"", None)]
    fn test_try_decode(#[case] buf: &[u8], #[case] expected: Option<Envelope>) {
        match Envelope::try_decode(buf) {
            Ok(actual) => assert_eq!(Some(actual), expected),
            Err(e) => {
                println!("{}", e);
                assert!(expected.is_none());
            }
        }
    }

    #[rstest]
    #[case::ack(Envelope::Ack { id: 17 }, r#"{"ack":17}"#)]
    #[case::content(Envelope::Content { id: 3, message_type: "greet".to_string(), payload: json!({"text": "hi"}) }, r#"{"id":3,"type":"greet","data":{"text":"hi"}}"#)]
    #[case::null_payload(Envelope::Content { id: 4, message_type: "PING".to_string(), payload: Value::Null }, r#"{"id":4,"type":"PING","data":null}"#)]
    fn test_encode(#[case] envelope: Envelope, #[case] expected: &str) {
        let buf = envelope.encode().unwrap();
        assert_eq!(std::str::from_utf8(&buf).unwrap(), expected);
    }

    #[test]
    fn test_for_message() {
        let msg = Message::new(12, "greet", json!([1, 2]));
        assert_eq!(Envelope::for_message(&msg), Envelope::Content {
            id: 12,
            message_type: "greet".to_string(),
            payload: json!([1, 2]),
        });
    }
}
