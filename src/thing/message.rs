use chrono::NaiveDateTime;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;

use super::error::ThingError;

/// Fields of a shadow "reported" section
///
/// The bridge wraps this into `{"state":{"reported": <fields>}}` before it is
/// published to the update topic.
pub type ReportedState = Map<String, Value>;

/// Message delivered by the broker on one of the thing's shadow topics
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub received_at: NaiveDateTime,
}

impl fmt::Display for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "TOPIC: {} PAYLOAD: {}",
            self.topic,
            String::from_utf8_lossy(&self.payload)
        )
    }
}

impl InboundMessage {
    pub fn from_topic(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        InboundMessage {
            topic: topic.into(),
            payload: payload.into(),
            received_at: chrono::Local::now().naive_local(),
        }
    }

    /// Parses the payload as JSON, as every shadow response is
    pub fn json(&self) -> Result<Value, ThingError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// Converts any serializable struct into reported state fields
///
/// # Errors
///
/// [`ThingError::Serialization`] if the value cannot be serialized or does not
/// serialize to a JSON object.
pub fn reported_state<T: Serialize>(value: &T) -> Result<ReportedState, ThingError> {
    match serde_json::to_value(value)? {
        Value::Object(fields) => Ok(fields),
        other => Err(ThingError::Serialization(serde::ser::Error::custom(
            format!("reported state must be a JSON object, got {}", other),
        ))),
    }
}

#[derive(Serialize)]
struct ShadowState<'a> {
    reported: &'a ReportedState,
}

#[derive(Serialize)]
struct ShadowDocument<'a> {
    state: ShadowState<'a>,
}

/// Encodes the shadow update document for the given reported fields
pub fn shadow_update(reported: &ReportedState) -> Result<Vec<u8>, ThingError> {
    let document = ShadowDocument {
        state: ShadowState { reported },
    };
    Ok(serde_json::to_vec(&document)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Serialize)]
    struct Color {
        red: u8,
        green: u8,
        blue: u8,
    }

    #[test]
    fn wraps_fields_in_reported_section() {
        let fields = reported_state(&Color {
            red: 187,
            green: 114,
            blue: 222,
        })
        .unwrap();

        let body = shadow_update(&fields).unwrap();
        let decoded: Value = serde_json::from_slice(&body).unwrap();

        assert_eq!(
            decoded,
            json!({"state": {"reported": {"red": 187, "green": 114, "blue": 222}}})
        );
    }

    #[test]
    fn keeps_nested_values() {
        let fields = json!({"led": {"on": true, "rgb": [1, 2, 3]}})
            .as_object()
            .cloned()
            .unwrap();

        let decoded: Value = serde_json::from_slice(&shadow_update(&fields).unwrap()).unwrap();
        assert_eq!(decoded["state"]["reported"]["led"]["rgb"], json!([1, 2, 3]));
    }

    #[test]
    fn rejects_non_object_state() {
        assert!(matches!(
            reported_state(&42),
            Err(ThingError::Serialization(_))
        ));
        assert!(matches!(
            reported_state(&vec!["red", "green"]),
            Err(ThingError::Serialization(_))
        ));
    }

    #[test]
    fn displays_topic_and_payload() {
        let msg = InboundMessage::from_topic(
            "$aws/things/sprk-1/shadow/update/accepted",
            br#"{"state":{}}"#.to_vec(),
        );
        assert_eq!(
            msg.to_string(),
            r#"TOPIC: $aws/things/sprk-1/shadow/update/accepted PAYLOAD: {"state":{}}"#
        );
        assert_eq!(msg.json().unwrap(), json!({"state": {}}));
    }
}
