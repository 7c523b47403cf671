//! Wire format of usage reports, shared by the upstream API and `POST /report` so that
//! proxies can be chained.
//!
//! ```json
//! {
//!   "clients": [{"id": "edge-1", "flags": {"beta": [{"active": true, "value": "on", "default": null, "count": 3}]}}],
//!   "receivedProperties": {"userId": [1700000000, 1700000042]},
//!   "receivedValues": {"userId": [["42", "Ada"], ["43"]]}
//! }
//! ```
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One deduplicated flag outcome and how many times it was observed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlagOutcomeRecord {
    pub active: bool,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub default: Value,
    pub count: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ClientReport {
    /// Omitted for outcomes evaluated by this instance.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub flags: IndexMap<String, Vec<FlagOutcomeRecord>>,
}

/// Outbound report. Empty sections are left out.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportPayload {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub clients: Vec<ClientReport>,
    #[serde(skip_serializing_if = "IndexMap::is_empty")]
    pub received_properties: IndexMap<String, [u64; 2]>,
    /// Property name to `[value]` or `[value, label]` tuples.
    #[serde(skip_serializing_if = "IndexMap::is_empty")]
    pub received_values: IndexMap<String, Vec<Vec<String>>>,
}

impl ReportPayload {
    /// Number of `(value[, label])` tuples in the payload.
    pub fn value_count(&self) -> usize {
        self.received_values.values().map(Vec::len).sum()
    }
}

/// A flag outcome as forwarded by a downstream instance. `count` defaults to 1.
#[derive(Debug, Deserialize)]
pub(crate) struct IncomingFlagOutcome {
    pub active: bool,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub default: Value,
    pub count: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct IncomingClient {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub flags: IndexMap<String, Vec<Value>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payload_serialization() {
        let mut payload = ReportPayload::default();
        assert_eq!(serde_json::to_value(&payload).unwrap(), json!({}));

        payload.clients.push(ClientReport {
            id: None,
            flags: IndexMap::from([(
                "beta".to_string(),
                vec![FlagOutcomeRecord {
                    active: true,
                    value: json!("on"),
                    default: Value::Null,
                    count: 2,
                }],
            )]),
        });
        payload
            .received_properties
            .insert("userId".into(), [10, 20]);
        payload.received_values.insert(
            "userId".into(),
            vec![vec!["42".into(), "Ada".into()], vec!["43".into()]],
        );

        assert_eq!(payload.value_count(), 2);
        assert_eq!(
            serde_json::to_value(&payload).unwrap(),
            json!({
                "clients": [{"flags": {"beta": [{"active": true, "value": "on", "default": null, "count": 2}]}}],
                "receivedProperties": {"userId": [10, 20]},
                "receivedValues": {"userId": [["42", "Ada"], ["43"]]}
            })
        );
    }

    #[test]
    fn test_incoming_defaults() {
        let outcome: IncomingFlagOutcome = serde_json::from_value(json!({"active": false})).unwrap();
        assert!(!outcome.active);
        assert_eq!(outcome.value, Value::Null);
        assert_eq!(outcome.count, None);

        let client: IncomingClient = serde_json::from_value(json!({"flags": {}})).unwrap();
        assert_eq!(client.id, None);
    }
}
