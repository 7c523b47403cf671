use crate::config::ReportingSettings;
use crate::metrics_defs::REPORTING_SEND_FAILURE;
use crate::protocol::{
    ClientReport, FlagOutcomeRecord, IncomingClient, IncomingFlagOutcome, ReportPayload,
};
use crate::sink::ReportSink;
use heck::ToShoutySnakeCase;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use shared::counter;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Client id under which this instance's own evaluations are recorded.
const LOCAL_CLIENT: &str = "";

// client id -> slug -> dedup key -> outcome
type FlagOutcomes = IndexMap<String, IndexMap<String, IndexMap<String, FlagOutcomeRecord>>>;
// property -> value -> label
type ValueLabels = IndexMap<String, IndexMap<String, Option<String>>>;
// property -> [first seen, last seen], epoch seconds
type PropertyWindows = IndexMap<String, [u64; 2]>;

/// A flag evaluated for one context.
#[derive(Clone, Debug, PartialEq)]
pub struct FlagOutcome {
    pub slug: String,
    pub active: bool,
    pub value: Value,
    pub default: Value,
}

/// One local evaluation: the context it ran against and the flags it produced.
#[derive(Clone, Copy, Debug)]
pub struct UsageEvent<'a> {
    pub context: &'a Map<String, Value>,
    pub flags: &'a [FlagOutcome],
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlushSummary {
    pub sent: usize,
    pub failed: usize,
}

/// Accumulates usage telemetry between flushes. Each accumulator has its own lock and is
/// swapped for an empty one when a flush starts, so events arriving while a flush is
/// sending land in the next one.
pub struct ReportingAggregator {
    property_windows: Mutex<PropertyWindows>,
    value_labels: Mutex<ValueLabels>,
    flag_outcomes: Mutex<FlagOutcomes>,
    sink: Arc<dyn ReportSink>,
    page_size: usize,
    max_value_length: usize,
}

impl ReportingAggregator {
    pub fn new(sink: Arc<dyn ReportSink>, settings: &ReportingSettings) -> Self {
        ReportingAggregator {
            property_windows: Mutex::new(IndexMap::new()),
            value_labels: Mutex::new(IndexMap::new()),
            flag_outcomes: Mutex::new(IndexMap::new()),
            sink,
            page_size: settings.page_size.max(1),
            max_value_length: settings.max_value_length,
        }
    }

    pub fn ingest(&self, event: &UsageEvent<'_>) {
        self.ingest_at(event, now_secs());
    }

    /// Records a local evaluation observed at `now` (epoch seconds).
    pub fn ingest_at(&self, event: &UsageEvent<'_>, now: u64) {
        {
            let mut windows = self.property_windows.lock();
            for key in event.context.keys() {
                widen(&mut windows, key, now, now);
            }
        }

        {
            let mut labels = self.value_labels.lock();
            for (key, value) in event.context {
                let Some(value) = value.as_str().filter(|v| !v.is_empty()) else {
                    continue;
                };
                let label = sibling_label(event.context, key);
                record_value(&mut labels, key, value, label);
            }
        }

        let mut outcomes = self.flag_outcomes.lock();
        for flag in event.flags {
            record_outcome(
                &mut outcomes,
                LOCAL_CLIENT,
                &flag.slug,
                flag.active,
                flag.value.clone(),
                flag.default.clone(),
                1,
            );
        }
    }

    /// Folds in a report forwarded by a downstream instance. Anything that does not have
    /// the expected shape is skipped.
    pub fn merge(&self, report: &Value) {
        let Some(report) = report.as_object() else {
            tracing::debug!("Ignoring report that is not an object");
            return;
        };

        if let Some(properties) = report.get("receivedProperties").and_then(Value::as_object) {
            let mut windows = self.property_windows.lock();
            for (key, window) in properties {
                if let Some([first, last]) = parse_window(window) {
                    widen(&mut windows, key, first, last);
                }
            }
        }

        if let Some(values) = report.get("receivedValues").and_then(Value::as_object) {
            let mut labels = self.value_labels.lock();
            for (key, tuples) in values {
                let Some(tuples) = tuples.as_array() else {
                    continue;
                };
                for tuple in tuples.iter().filter_map(Value::as_array) {
                    let Some(value) = tuple.first().and_then(Value::as_str) else {
                        continue;
                    };
                    let label = tuple.get(1).and_then(Value::as_str).filter(|l| !l.is_empty());
                    record_value(&mut labels, key, value, label);
                }
            }
        }

        if let Some(clients) = report.get("clients").and_then(Value::as_array) {
            let mut outcomes = self.flag_outcomes.lock();
            for client in clients {
                let Ok(client) = serde_json::from_value::<IncomingClient>(client.clone()) else {
                    continue;
                };
                let client_id = client.id.unwrap_or_default();
                for (slug, entries) in client.flags {
                    for entry in entries {
                        let Ok(outcome) = serde_json::from_value::<IncomingFlagOutcome>(entry)
                        else {
                            continue;
                        };
                        record_outcome(
                            &mut outcomes,
                            &client_id,
                            &slug,
                            outcome.active,
                            outcome.value,
                            outcome.default,
                            outcome.count.unwrap_or(1),
                        );
                    }
                }
            }
        }
    }

    /// Ships everything accumulated so far. Flag outcomes, property windows and each page
    /// of values go out as separate calls. A failed call drops its batch.
    pub async fn flush(&self) -> FlushSummary {
        let outcomes = std::mem::take(&mut *self.flag_outcomes.lock());
        let windows = std::mem::take(&mut *self.property_windows.lock());
        let labels = std::mem::take(&mut *self.value_labels.lock());

        let mut summary = FlushSummary::default();

        if !outcomes.is_empty() {
            let payload = ReportPayload {
                clients: client_reports(outcomes),
                ..Default::default()
            };
            self.send(&payload, "flags", &mut summary).await;
        }

        if !windows.is_empty() {
            let payload = ReportPayload {
                received_properties: windows,
                ..Default::default()
            };
            self.send(&payload, "properties", &mut summary).await;
        }

        let tuples = self.value_tuples(labels);
        for page in tuples.chunks(self.page_size) {
            let mut received_values: IndexMap<String, Vec<Vec<String>>> = IndexMap::new();
            for (key, tuple) in page {
                received_values
                    .entry(key.clone())
                    .or_default()
                    .push(tuple.clone());
            }
            let payload = ReportPayload {
                received_values,
                ..Default::default()
            };
            self.send(&payload, "values", &mut summary).await;
        }

        summary
    }

    async fn send(&self, payload: &ReportPayload, batch: &'static str, summary: &mut FlushSummary) {
        match self.sink.send(payload).await {
            Ok(()) => {
                summary.sent += 1;
            }
            Err(e) => {
                summary.failed += 1;
                counter!(REPORTING_SEND_FAILURE, "batch" => batch).increment(1);
                tracing::warn!(batch, error = %e, "Failed to send report, dropping it");
            }
        }
    }

    /// Flattens the value map into `(property, [value] | [value, label])` pairs with every
    /// string truncated.
    fn value_tuples(&self, labels: ValueLabels) -> Vec<(String, Vec<String>)> {
        let mut tuples = Vec::new();
        for (key, values) in labels {
            for (value, label) in values {
                let mut tuple = vec![truncate(&value, self.max_value_length)];
                if let Some(label) = label {
                    tuple.push(truncate(&label, self.max_value_length));
                }
                tuples.push((key.clone(), tuple));
            }
        }
        tuples
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

fn widen(windows: &mut PropertyWindows, key: &str, first: u64, last: u64) {
    match windows.get_mut(key) {
        Some(window) => {
            window[0] = window[0].min(first);
            window[1] = window[1].max(last);
        }
        None => {
            windows.insert(key.to_string(), [first, last]);
        }
    }
}

/// Records a value. A label replaces a missing one but a missing label never erases a
/// known one.
fn record_value(labels: &mut ValueLabels, key: &str, value: &str, label: Option<&str>) {
    let values = labels.entry(key.to_string()).or_default();
    match values.get_mut(value) {
        Some(existing) => {
            if let Some(label) = label {
                *existing = Some(label.to_string());
            }
        }
        None => {
            values.insert(value.to_string(), label.map(String::from));
        }
    }
}

fn record_outcome(
    outcomes: &mut FlagOutcomes,
    client_id: &str,
    slug: &str,
    active: bool,
    value: Value,
    default: Value,
    count: u64,
) {
    let key = dedup_key(active, &value, &default);
    let record = outcomes
        .entry(client_id.to_string())
        .or_default()
        .entry(slug.to_string())
        .or_default()
        .entry(key)
        .or_insert_with(|| FlagOutcomeRecord {
            active,
            value,
            default,
            count: 0,
        });
    record.count = record.count.saturating_add(count);
}

/// Serialized `[active, value, default]`; the array keeps the parts apart.
fn dedup_key(active: bool, value: &Value, default: &Value) -> String {
    Value::Array(vec![Value::Bool(active), value.clone(), default.clone()]).to_string()
}

/// For an identifier property such as `userId`, finds the matching name property
/// (`userName`) in the same context and returns its value.
fn sibling_label<'a>(context: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    let canonical = canonical_name(key);
    let prefix = canonical.strip_suffix("_ID")?;
    let target = format!("{prefix}_NAME");

    context
        .iter()
        .find(|(k, _)| canonical_name(k) == target)
        .and_then(|(_, v)| v.as_str())
        .filter(|label| !label.is_empty())
}

fn canonical_name(key: &str) -> String {
    let name = key.to_shouty_snake_case();
    match name.strip_suffix("_I_D") {
        Some(prefix) => format!("{prefix}_ID"),
        None => name,
    }
}

fn parse_window(window: &Value) -> Option<[u64; 2]> {
    let window = window.as_array()?;
    let first = as_seconds(window.first()?)?;
    let last = as_seconds(window.get(1)?)?;
    Some([first.min(last), first.max(last)])
}

fn as_seconds(value: &Value) -> Option<u64> {
    value.as_u64().or_else(|| {
        value
            .as_f64()
            .filter(|f| f.is_finite() && *f >= 0.0)
            .map(|f| f.round() as u64)
    })
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

fn client_reports(outcomes: FlagOutcomes) -> Vec<ClientReport> {
    outcomes
        .into_iter()
        .map(|(client_id, flags)| ClientReport {
            id: (!client_id.is_empty()).then_some(client_id),
            flags: flags
                .into_iter()
                .map(|(slug, table)| (slug, table.into_values().collect()))
                .collect(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::RecordingSink;
    use serde_json::json;

    fn aggregator() -> (Arc<RecordingSink>, ReportingAggregator) {
        let sink = Arc::new(RecordingSink::new());
        let aggregator = ReportingAggregator::new(sink.clone(), &ReportingSettings::default());
        (sink, aggregator)
    }

    fn context(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn outcome(slug: &str, active: bool, value: Value) -> FlagOutcome {
        FlagOutcome {
            slug: slug.into(),
            active,
            value,
            default: Value::Null,
        }
    }

    #[test]
    fn test_canonical_name() {
        assert_eq!(canonical_name("userId"), "USER_ID");
        assert_eq!(canonical_name("user_id"), "USER_ID");
        assert_eq!(canonical_name("USER_ID"), "USER_ID");
        assert_eq!(canonical_name("userName"), "USER_NAME");
        assert_eq!(canonical_name("email"), "EMAIL");
    }

    #[tokio::test]
    async fn test_identical_outcomes_are_deduplicated() {
        let (sink, aggregator) = aggregator();
        let ctx = context(json!({}));
        let flags = [outcome("beta", true, json!("on"))];

        aggregator.ingest(&UsageEvent { context: &ctx, flags: &flags });
        aggregator.ingest(&UsageEvent { context: &ctx, flags: &flags });

        let summary = aggregator.flush().await;
        assert_eq!(summary, FlushSummary { sent: 1, failed: 0 });

        let payloads = sink.payloads();
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0].clients.len(), 1);
        assert_eq!(payloads[0].clients[0].id, None);
        assert_eq!(
            payloads[0].clients[0].flags["beta"],
            vec![FlagOutcomeRecord {
                active: true,
                value: json!("on"),
                default: Value::Null,
                count: 2,
            }]
        );
    }

    #[tokio::test]
    async fn test_distinct_outcomes_are_kept_apart() {
        let (sink, aggregator) = aggregator();
        let ctx = context(json!({}));
        let flags = [
            outcome("beta", true, json!("on")),
            outcome("beta", false, Value::Null),
            outcome("beta", true, json!("off")),
        ];
        aggregator.ingest(&UsageEvent { context: &ctx, flags: &flags });
        aggregator.flush().await;

        assert_eq!(sink.payloads()[0].clients[0].flags["beta"].len(), 3);
    }

    #[tokio::test]
    async fn test_numeric_outcomes_do_not_collide() {
        let (sink, aggregator) = aggregator();
        let ctx = context(json!({}));
        let flags = [
            FlagOutcome {
                slug: "limit".into(),
                active: true,
                value: json!(1),
                default: json!(23),
            },
            FlagOutcome {
                slug: "limit".into(),
                active: true,
                value: json!(12),
                default: json!(3),
            },
        ];
        aggregator.ingest(&UsageEvent { context: &ctx, flags: &flags });
        aggregator.flush().await;

        let records = &sink.payloads()[0].clients[0].flags["limit"];
        assert_eq!(records.len(), 2);
        assert_eq!((&records[0].value, &records[0].default), (&json!(1), &json!(23)));
        assert_eq!((&records[1].value, &records[1].default), (&json!(12), &json!(3)));
        assert!(records.iter().all(|record| record.count == 1));
    }

    #[tokio::test]
    async fn test_forwarded_counts_saturate() {
        let (sink, aggregator) = aggregator();
        let report = json!({"clients": [{"flags": {"beta": [
            {"active": true, "count": u64::MAX}
        ]}}]});
        aggregator.merge(&report);
        aggregator.merge(&report);

        aggregator.flush().await;
        assert_eq!(sink.payloads()[0].clients[0].flags["beta"][0].count, u64::MAX);
    }

    #[test]
    fn test_property_windows_widen() {
        let (_, aggregator) = aggregator();
        let ctx = context(json!({"userId": "42", "plan": 3}));
        aggregator.ingest_at(&UsageEvent { context: &ctx, flags: &[] }, 100);
        aggregator.ingest_at(&UsageEvent { context: &ctx, flags: &[] }, 150);

        let windows = aggregator.property_windows.lock();
        assert_eq!(windows["userId"], [100, 150]);
        assert_eq!(windows["plan"], [100, 150]);

        // Only string values are recorded.
        let labels = aggregator.value_labels.lock();
        assert!(labels.contains_key("userId"));
        assert!(!labels.contains_key("plan"));
    }

    #[test]
    fn test_label_upgrade_never_downgrades() {
        let (_, aggregator) = aggregator();

        let first = context(json!({"USER_ID": "42"}));
        aggregator.ingest(&UsageEvent { context: &first, flags: &[] });
        assert_eq!(aggregator.value_labels.lock()["USER_ID"]["42"], None);

        let second = context(json!({"USER_ID": "42", "USER_NAME": "Ada"}));
        aggregator.ingest(&UsageEvent { context: &second, flags: &[] });
        assert_eq!(
            aggregator.value_labels.lock()["USER_ID"]["42"].as_deref(),
            Some("Ada")
        );

        aggregator.ingest(&UsageEvent { context: &first, flags: &[] });
        assert_eq!(
            aggregator.value_labels.lock()["USER_ID"]["42"].as_deref(),
            Some("Ada")
        );
    }

    #[test]
    fn test_label_from_camel_case_sibling() {
        let (_, aggregator) = aggregator();
        let ctx = context(json!({"tenantId": "t-1", "tenantName": "Acme", "userId": "u-1", "userName": ""}));
        aggregator.ingest(&UsageEvent { context: &ctx, flags: &[] });

        let labels = aggregator.value_labels.lock();
        assert_eq!(labels["tenantId"]["t-1"].as_deref(), Some("Acme"));
        assert_eq!(labels["userId"]["u-1"], None);
        assert_eq!(labels["tenantName"]["Acme"], None);
    }

    #[tokio::test]
    async fn test_value_pagination() {
        let (sink, aggregator) = aggregator();
        let values: Vec<Value> = (0..4500).map(|i| json!([format!("value-{i}")])).collect();
        aggregator.merge(&json!({"receivedValues": {"email": values}}));

        let summary = aggregator.flush().await;
        assert_eq!(summary, FlushSummary { sent: 3, failed: 0 });

        let sizes: Vec<usize> = sink.payloads().iter().map(ReportPayload::value_count).collect();
        assert_eq!(sizes, vec![2000, 2000, 500]);
    }

    #[tokio::test]
    async fn test_values_are_truncated() {
        let (sink, aggregator) = aggregator();
        let long = "x".repeat(300);
        aggregator.merge(&json!({"receivedValues": {"userId": [[long.clone(), long]]}}));
        aggregator.flush().await;

        let payloads = sink.payloads();
        let tuple = &payloads[0].received_values["userId"][0];
        assert_eq!(tuple.len(), 2);
        assert!(tuple.iter().all(|s| s.chars().count() == 240));
    }

    #[tokio::test]
    async fn test_merge_forwarded_report() {
        let (sink, aggregator) = aggregator();
        let ctx = context(json!({"userId": "42"}));
        aggregator.ingest_at(&UsageEvent { context: &ctx, flags: &[] }, 100);

        aggregator.merge(&json!({
            "clients": [
                {"id": "edge-1", "flags": {"beta": [
                    {"active": true, "value": "on", "count": 5},
                    {"active": true, "value": "on"}
                ]}},
                {"flags": {"beta": [{"active": false}]}}
            ],
            "receivedProperties": {"userId": [50, 120], "plan": [10, 20]},
            "receivedValues": {"userId": [["42", "Ada"], ["43"]]}
        }));

        {
            let windows = aggregator.property_windows.lock();
            assert_eq!(windows["userId"], [50, 120]);
            assert_eq!(windows["plan"], [10, 20]);
            let labels = aggregator.value_labels.lock();
            assert_eq!(labels["userId"]["42"].as_deref(), Some("Ada"));
            assert_eq!(labels["userId"]["43"], None);
        }

        aggregator.flush().await;
        let payloads = sink.payloads();
        assert_eq!(payloads.len(), 3);

        let clients = &payloads[0].clients;
        assert_eq!(clients.len(), 2);
        assert_eq!(clients[0].id.as_deref(), Some("edge-1"));
        assert_eq!(clients[0].flags["beta"][0].count, 6);
        assert_eq!(clients[1].id, None);
        assert_eq!(clients[1].flags["beta"][0].count, 1);
    }

    #[tokio::test]
    async fn test_malformed_reports_are_ignored() {
        let (sink, aggregator) = aggregator();
        for report in [
            json!(null),
            json!([1, 2]),
            json!("report"),
            json!({"clients": "nope", "receivedProperties": [1], "receivedValues": 3}),
            json!({"clients": [{"flags": {"beta": [{"value": "missing active"}]}}, 7]}),
            json!({"receivedProperties": {"a": ["x", 2], "b": [1]}}),
            json!({"receivedValues": {"a": [[1], "flat", []]}}),
        ] {
            aggregator.merge(&report);
        }

        assert_eq!(aggregator.flush().await, FlushSummary::default());
        assert!(sink.payloads().is_empty());
    }

    #[tokio::test]
    async fn test_flush_swaps_accumulators() {
        let (sink, aggregator) = aggregator();
        sink.set_failing(true);
        let ctx = context(json!({"userId": "42"}));
        let flags = [outcome("beta", true, Value::Bool(true))];
        aggregator.ingest(&UsageEvent { context: &ctx, flags: &flags });

        let summary = aggregator.flush().await;
        assert_eq!(summary, FlushSummary { sent: 0, failed: 3 });

        // The failed batches are dropped, not retried.
        sink.set_failing(false);
        assert_eq!(aggregator.flush().await, FlushSummary::default());
        assert_eq!(sink.payloads().len(), 3);
    }
}
