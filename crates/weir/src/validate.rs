use crate::masking::{self, Policy};
use crate::Error;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const MAX_BATCH_ENTRIES: usize = 500;
pub const MAX_BATCH_BYTES: usize = 1 << 20;
pub const MAX_MESSAGE_BYTES: usize = 32 << 10;
pub const MAX_NAME_CHARS: usize = 64;
pub const MAX_LABEL_VALUE_CHARS: usize = 64;
pub const MAX_LABELS: usize = 6;
pub const MAX_ID_CHARS: usize = 128;
pub const MAX_FUTURE_SKEW_HOURS: i64 = 24;
pub const MAX_PAST_SKEW_DAYS: i64 = 14;

/// Label keys which clients may supply directly.
pub const LABEL_ALLOWLIST: [&str; 6] = [
    "service",
    "env",
    "level",
    "schema_version",
    "region",
    "tenant",
];

#[derive(Debug, Deserialize)]
pub struct IngestBatch {
    pub entries: Vec<LogEntry>,
}

/// A client-supplied log entry. Unknown top-level fields are dropped by
/// deserialization, which is exactly the normalization the pipeline wants.
#[derive(Debug, Clone, Deserialize)]
pub struct LogEntry {
    pub timestamp: String,
    pub level: String,
    pub message: String,
    pub service: String,
    pub env: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl Level {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "DEBUG" => Some(Self::Debug),
            "INFO" => Some(Self::Info),
            "WARN" => Some(Self::Warn),
            "ERROR" => Some(Self::Error),
            "FATAL" => Some(Self::Fatal),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
            Self::Fatal => "FATAL",
        }
    }
}

/// The canonical record persisted to the WAL and forwarded to the sink.
/// `line` is compact JSON with deterministically ordered keys, so equal
/// records serialize to equal bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub labels: BTreeMap<String, String>,
    pub line: String,
    pub ingest_time: DateTime<Utc>,
}

fn name_ok(s: &str) -> bool {
    !s.is_empty()
        && s.chars().count() <= MAX_NAME_CHARS
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

fn check_entry(index: usize, entry: &LogEntry, received: DateTime<Utc>) -> Result<(), Error> {
    let fail = |what: String| Err(Error::SchemaInvalid(format!("entries[{index}]: {what}")));

    let Ok(ts) = DateTime::parse_from_rfc3339(&entry.timestamp) else {
        return fail(format!("timestamp {:?} is not RFC3339", entry.timestamp));
    };
    let ts = ts.with_timezone(&Utc);
    if ts > received + Duration::hours(MAX_FUTURE_SKEW_HOURS) {
        return fail(format!("timestamp {ts} is more than 24h in the future"));
    }
    if ts < received - Duration::days(MAX_PAST_SKEW_DAYS) {
        return fail(format!("timestamp {ts} is more than 14d in the past"));
    }

    if Level::parse(&entry.level).is_none() {
        return fail(format!("level {:?} is not one of DEBUG|INFO|WARN|ERROR|FATAL", entry.level));
    }
    if entry.message.is_empty() {
        return fail("message must be non-empty".to_string());
    }
    if entry.message.len() > MAX_MESSAGE_BYTES {
        return fail(format!("message exceeds {MAX_MESSAGE_BYTES} bytes"));
    }
    if !name_ok(&entry.service) {
        return fail(format!("service {:?} is not a valid name", entry.service));
    }
    if !name_ok(&entry.env) {
        return fail(format!("env {:?} is not a valid name", entry.env));
    }

    if entry.labels.len() > MAX_LABELS {
        return fail(format!("more than {MAX_LABELS} labels"));
    }
    for (key, value) in &entry.labels {
        if !LABEL_ALLOWLIST.contains(&key.as_str()) {
            return fail(format!("label key {key:?} is not in the allowlist"));
        }
        if value.chars().count() > MAX_LABEL_VALUE_CHARS {
            return fail(format!("label {key:?} value exceeds {MAX_LABEL_VALUE_CHARS} chars"));
        }
    }

    for (field, value) in [("trace_id", &entry.trace_id), ("span_id", &entry.span_id)] {
        if let Some(value) = value {
            if value.chars().count() > MAX_ID_CHARS {
                return fail(format!("{field} exceeds {MAX_ID_CHARS} chars"));
            }
        }
    }
    Ok(())
}

/// Validate an entire batch against the schema. The batch-level caps
/// (entry count, serialized size) are enforced by the admission path before
/// this point, because they map to TOO_LARGE rather than SCHEMA_INVALID.
pub fn check_batch(batch: &IngestBatch, received: DateTime<Utc>) -> Result<(), Error> {
    if batch.entries.is_empty() {
        return Err(Error::SchemaInvalid("entries must be non-empty".to_string()));
    }
    for (index, entry) in batch.entries.iter().enumerate() {
        check_entry(index, entry, received)?;
    }
    Ok(())
}

/// Turn a validated entry into its canonical record: allowed labels plus
/// `service`/`env`/`level`, and a masked, key-sorted `line`.
pub fn normalize(entry: LogEntry, ingest_time: DateTime<Utc>, policy: &Policy) -> NormalizedRecord {
    let LogEntry {
        timestamp,
        level,
        message,
        service,
        env,
        labels,
        trace_id,
        span_id,
        metadata,
    } = entry;

    let level = Level::parse(&level).expect("level was validated").as_str();

    let mut labels = labels;
    labels.insert("service".to_string(), service);
    labels.insert("env".to_string(), env);
    labels.insert("level".to_string(), level.to_string());

    // serde_json maps are BTree-backed, so nested keys serialize sorted.
    let mut line = serde_json::Map::new();
    let timestamp = DateTime::parse_from_rfc3339(&timestamp)
        .expect("timestamp was validated")
        .with_timezone(&Utc)
        .to_rfc3339_opts(SecondsFormat::Millis, true);
    line.insert("timestamp".to_string(), timestamp.into());
    line.insert("message".to_string(), message.into());
    if let Some(trace_id) = trace_id {
        line.insert("trace_id".to_string(), trace_id.into());
    }
    if let Some(span_id) = span_id {
        line.insert("span_id".to_string(), span_id.into());
    }
    if let Some(metadata) = metadata {
        let mut metadata = serde_json::Value::Object(metadata);
        masking::mask_tree(&mut metadata, policy);
        line.insert("metadata".to_string(), metadata);
    }

    NormalizedRecord {
        labels,
        line: serde_json::Value::Object(line).to_string(),
        ingest_time,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry() -> LogEntry {
        serde_json::from_value(json!({
            "timestamp": "2025-01-01T00:00:00.000Z",
            "level": "info",
            "message": "hi",
            "service": "checkout",
            "env": "prod",
        }))
        .unwrap()
    }

    fn received() -> DateTime<Utc> {
        "2025-01-01T12:00:00Z".parse().unwrap()
    }

    #[test]
    fn minimal_entry_passes() {
        assert!(check_entry(0, &entry(), received()).is_ok());
    }

    #[test]
    fn timestamp_bounds() {
        let mut e = entry();
        e.timestamp = "not-a-timestamp".to_string();
        assert!(check_entry(0, &e, received()).is_err());

        e.timestamp = "2025-01-03T00:00:00.000Z".to_string(); // +36h
        assert!(check_entry(0, &e, received()).is_err());

        e.timestamp = "2024-12-01T00:00:00.000Z".to_string(); // -31d
        assert!(check_entry(0, &e, received()).is_err());

        e.timestamp = "2025-01-02T00:00:00.000Z".to_string(); // +12h
        assert!(check_entry(0, &e, received()).is_ok());
    }

    #[test]
    fn level_is_canonicalized_not_invented() {
        assert_eq!(Level::parse("warn"), Some(Level::Warn));
        assert_eq!(Level::parse("Fatal"), Some(Level::Fatal));
        assert_eq!(Level::parse("TRACE"), None);
    }

    #[test]
    fn service_and_env_charset() {
        let mut e = entry();
        e.service = "front end".to_string();
        assert!(check_entry(0, &e, received()).is_err());

        e.service = "front-end.v2_1".to_string();
        assert!(check_entry(0, &e, received()).is_ok());

        e.env = "x".repeat(65);
        assert!(check_entry(0, &e, received()).is_err());
    }

    #[test]
    fn labels_must_be_allowlisted() {
        let mut e = entry();
        e.labels.insert("region".to_string(), "eu-west-1".to_string());
        assert!(check_entry(0, &e, received()).is_ok());

        e.labels.insert("pod".to_string(), "p-123".to_string());
        assert!(check_entry(0, &e, received()).is_err());
    }

    #[test]
    fn unknown_top_level_fields_are_stripped() {
        let e: LogEntry = serde_json::from_value(json!({
            "timestamp": "2025-01-01T00:00:00.000Z",
            "level": "INFO",
            "message": "hi",
            "service": "s",
            "env": "dev",
            "hostname": "should-vanish",
        }))
        .unwrap();
        let record = normalize(e, received(), &Policy::baseline(&Default::default()));
        assert!(!record.line.contains("hostname"));
    }

    #[test]
    fn normalize_builds_sorted_line_and_merged_labels() {
        let e: LogEntry = serde_json::from_value(json!({
            "timestamp": "2025-01-01T00:00:00+01:00",
            "level": "error",
            "message": "boom",
            "service": "s",
            "env": "dev",
            "labels": {"region": "eu"},
            "trace_id": "t-1",
            "metadata": {"zeta": 1, "alpha": {"password": "hunter2"}},
        }))
        .unwrap();
        let record = normalize(e, received(), &Policy::baseline(&Default::default()));

        assert_eq!(record.labels["service"], "s");
        assert_eq!(record.labels["env"], "dev");
        assert_eq!(record.labels["level"], "ERROR");
        assert_eq!(record.labels["region"], "eu");

        // Key-sorted, compact, timestamp converted to UTC, password masked.
        assert_eq!(
            record.line,
            r#"{"message":"boom","metadata":{"alpha":{"password":"****"},"zeta":1},"timestamp":"2024-12-31T23:00:00.000Z","trace_id":"t-1"}"#,
        );
    }

    #[test]
    fn empty_batches_are_rejected() {
        let batch = IngestBatch { entries: vec![] };
        assert!(matches!(
            check_batch(&batch, received()),
            Err(Error::SchemaInvalid(_))
        ));
    }
}
