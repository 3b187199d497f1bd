//! Wire format for realtime frames.
//!
//! Every frame is a JSON object `{"type": tag, "data": payload, "timestamp": millis}`.
//! The tag drives subscriber fan-out; `"ping"` is reserved for heartbeats.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::RealtimeError;

pub const PING_TAG: &str = "ping";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub tag: String,
    #[serde(default)]
    pub data: Value,
    /// Sender wall clock, epoch milliseconds.
    #[serde(default)]
    pub timestamp: i64,
}

impl Envelope {
    pub fn new(tag: impl Into<String>, data: Value) -> Self {
        Self {
            tag: tag.into(),
            data,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn ping() -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            tag: PING_TAG.to_owned(),
            data: json!({ "timestamp": now }),
            timestamp: now,
        }
    }

    pub fn is_ping(&self) -> bool {
        self.tag == PING_TAG
    }

    pub fn encode(&self) -> Result<String, RealtimeError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(frame: &str) -> Result<Self, RealtimeError> {
        Ok(serde_json::from_str(frame)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_travels_as_type_field() {
        let frame = Envelope::new("earnings", json!({"totalEarnings": 1234}))
            .encode()
            .unwrap();
        let raw: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(raw["type"], "earnings");
        assert_eq!(raw["data"]["totalEarnings"], 1234);
        assert!(raw["timestamp"].as_i64().unwrap() > 0);
    }

    #[test]
    fn decode_tolerates_missing_data_and_timestamp() {
        let env = Envelope::decode(r#"{"type":"device_status"}"#).unwrap();
        assert_eq!(env.tag, "device_status");
        assert_eq!(env.data, Value::Null);
        assert_eq!(env.timestamp, 0);
    }

    #[test]
    fn frames_without_a_tag_are_rejected() {
        assert!(matches!(
            Envelope::decode(r#"{"data": 1}"#),
            Err(RealtimeError::Envelope(_))
        ));
        assert!(Envelope::decode("not json").is_err());
    }

    #[test]
    fn ping_carries_its_timestamp_in_data() {
        let ping = Envelope::ping();
        assert!(ping.is_ping());
        assert_eq!(ping.data["timestamp"], ping.timestamp);
    }
}
