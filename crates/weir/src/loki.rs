//! Client for the Loki-compatible push API: payload assembly under per-push
//! caps, response classification, and the readiness probe.

use crate::config::LokiConfig;
use crate::validate::NormalizedRecord;
use std::collections::BTreeMap;
use std::time::Duration;

/// One push request: streams keyed by exact label-set equality, values as
/// `[unix_nanos, line]` pairs in ascending timestamp order.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct PushRequest {
    pub streams: Vec<Stream>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Stream {
    pub stream: BTreeMap<String, String>,
    pub values: Vec<(String, String)>,
}

/// Accumulates records into a push while respecting the sink's per-push
/// value and byte caps.
pub struct PushBuilder {
    streams: BTreeMap<BTreeMap<String, String>, Vec<(i64, String)>>,
    values: usize,
    bytes: usize,
    max_values: usize,
    max_bytes: usize,
}

impl PushBuilder {
    pub fn new(cfg: &LokiConfig) -> Self {
        Self {
            streams: BTreeMap::new(),
            values: 0,
            bytes: 0,
            max_values: cfg.max_values_per_push,
            max_bytes: cfg.max_bytes_per_push,
        }
    }

    /// Add one record, or refuse because the push is full. The first record
    /// is always accepted so that an oversized cap still makes progress.
    pub fn push(&mut self, record: &NormalizedRecord) -> bool {
        // Label keys/values plus the line and timestamp, roughly as they
        // will appear on the wire.
        let cost = record.line.len()
            + record
                .labels
                .iter()
                .map(|(k, v)| k.len() + v.len() + 6)
                .sum::<usize>()
            + 32;
        if self.values > 0
            && (self.values + 1 > self.max_values || self.bytes + cost > self.max_bytes)
        {
            return false;
        }

        let ns = record
            .ingest_time
            .timestamp_nanos_opt()
            .unwrap_or(i64::MAX);
        self.streams
            .entry(record.labels.clone())
            .or_default()
            .push((ns, record.line.clone()));
        self.values += 1;
        self.bytes += cost;
        true
    }

    pub fn is_empty(&self) -> bool {
        self.values == 0
    }

    pub fn values(&self) -> usize {
        self.values
    }

    pub fn build(self) -> PushRequest {
        let streams = self
            .streams
            .into_iter()
            .map(|(labels, mut values)| {
                values.sort_by_key(|(ns, _)| *ns);
                Stream {
                    stream: labels,
                    values: values
                        .into_iter()
                        .map(|(ns, line)| (ns.to_string(), line))
                        .collect(),
                }
            })
            .collect();
        PushRequest { streams }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PushError {
    /// The sink permanently refuses this payload; retrying cannot help.
    #[error("sink permanently rejected push with status {status}")]
    Poison { status: reqwest::StatusCode },
    /// Retryable: overload, server error, or a network fault.
    #[error("transient push failure (status {status:?})")]
    Transient {
        status: Option<reqwest::StatusCode>,
        retry_after: Option<Duration>,
    },
}

#[derive(Clone)]
pub struct Client {
    http: reqwest::Client,
    push_url: url::Url,
    ready_url: url::Url,
    bearer: Option<String>,
}

impl Client {
    pub fn new(cfg: &LokiConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_seconds))
            .build()?;
        Ok(Self {
            http,
            push_url: cfg.base_url.join("loki/api/v1/push")?,
            ready_url: cfg.base_url.join("ready")?,
            bearer: cfg.bearer_token.clone(),
        })
    }

    pub async fn push(&self, request: &PushRequest) -> Result<(), PushError> {
        let mut builder = self.http.post(self.push_url.clone()).json(request);
        if let Some(bearer) = &self.bearer {
            builder = builder.bearer_auth(bearer);
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(_) => {
                return Err(PushError::Transient {
                    status: None,
                    retry_after: None,
                })
            }
        };

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(PushError::Transient {
                status: Some(status),
                retry_after,
            });
        }
        Err(PushError::Poison { status })
    }

    /// 2xx from the sink's readiness endpoint.
    pub async fn ready(&self) -> bool {
        match self.http.get(self.ready_url.clone()).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono::Utc;

    fn cfg() -> LokiConfig {
        serde_yaml::from_str(r#"base_url: "http://localhost:3100""#).unwrap()
    }

    fn record(labels: &[(&str, &str)], line: &str, at_ns: i64) -> NormalizedRecord {
        NormalizedRecord {
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            line: line.to_string(),
            ingest_time: Utc.timestamp_nanos(at_ns),
        }
    }

    #[test]
    fn streams_are_keyed_by_exact_label_set() {
        let mut builder = PushBuilder::new(&cfg());
        assert!(builder.push(&record(&[("service", "a")], "1", 10)));
        assert!(builder.push(&record(&[("service", "b")], "2", 20)));
        assert!(builder.push(&record(&[("service", "a")], "3", 30)));

        let push = builder.build();
        assert_eq!(push.streams.len(), 2);
        let a = &push.streams[0];
        assert_eq!(a.stream["service"], "a");
        assert_eq!(
            a.values,
            vec![
                ("10".to_string(), "1".to_string()),
                ("30".to_string(), "3".to_string()),
            ]
        );
    }

    #[test]
    fn values_sort_ascending_within_a_stream() {
        let mut builder = PushBuilder::new(&cfg());
        builder.push(&record(&[("service", "a")], "later", 30));
        builder.push(&record(&[("service", "a")], "earlier", 10));

        let push = builder.build();
        let ts: Vec<_> = push.streams[0].values.iter().map(|(ns, _)| ns.clone()).collect();
        assert_eq!(ts, vec!["10", "30"]);
    }

    #[test]
    fn value_cap_is_enforced() {
        let mut cfg = cfg();
        cfg.max_values_per_push = 2;
        let mut builder = PushBuilder::new(&cfg);

        assert!(builder.push(&record(&[("service", "a")], "1", 1)));
        assert!(builder.push(&record(&[("service", "a")], "2", 2)));
        assert!(!builder.push(&record(&[("service", "a")], "3", 3)));
        assert_eq!(builder.values(), 2);
    }

    #[test]
    fn byte_cap_is_enforced_but_first_record_always_fits() {
        let mut cfg = cfg();
        cfg.max_bytes_per_push = 64;
        let mut builder = PushBuilder::new(&cfg);

        let big = "x".repeat(256);
        assert!(builder.push(&record(&[("service", "a")], &big, 1)));
        assert!(!builder.push(&record(&[("service", "a")], "small", 2)));
    }

    #[test]
    fn push_request_wire_shape() {
        let mut builder = PushBuilder::new(&cfg());
        builder.push(&record(&[("env", "dev"), ("service", "s")], r#"{"message":"hi"}"#, 42));
        let json = serde_json::to_value(builder.build()).unwrap();

        insta::assert_json_snapshot!(json, @r###"
        {
          "streams": [
            {
              "stream": {
                "env": "dev",
                "service": "s"
              },
              "values": [
                [
                  "42",
                  "{\"message\":\"hi\"}"
                ]
              ]
            }
          ]
        }
        "###);
    }
}
