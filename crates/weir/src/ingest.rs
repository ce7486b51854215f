//! The admission pipeline: authenticate, rate-limit, parse, validate, mask,
//! normalize, append. Every step short-circuits with its mapped status, and
//! nothing reads the request body until auth and rate limiting have passed.

use crate::masking::Policy;
use crate::validate::{self, IngestBatch};
use crate::wal::Ack;
use crate::{auth, App, Error};
use axum::extract::State;
use axum::response::IntoResponse;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

/// Replay cache for `X-Idempotency-Key`: original Ack by (token hash, key).
pub type DedupeCache = moka::sync::Cache<(u64, String), Ack>;

pub const DEDUPE_TTL: Duration = Duration::from_secs(15 * 60);
const DEDUPE_CAPACITY: u64 = 65_536;
pub const MAX_IDEMPOTENCY_KEY_CHARS: usize = 128;

pub fn new_dedupe_cache() -> DedupeCache {
    moka::sync::Cache::builder()
        .max_capacity(DEDUPE_CAPACITY)
        .time_to_live(DEDUPE_TTL)
        .build()
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct IngestResponse {
    pub accepted: usize,
    pub segment_seq: u64,
}

pub async fn ingest(
    State(app): State<Arc<App>>,
    request: axum::extract::Request,
) -> axum::response::Response {
    let received = Utc::now();
    let (parts, body) = request.into_parts();

    let mut token_label = "unknown".to_string();
    let result = admit(&app, &parts.headers, body, received, &mut token_label).await;

    match result {
        Ok((ack, replayed)) => {
            if !replayed {
                metrics::counter!("logs_ingested_total", "token" => token_label)
                    .increment(ack.count as u64);
                metrics::histogram!("batch_size_entries").record(ack.count as f64);
            }
            (
                axum::http::StatusCode::ACCEPTED,
                axum::Json(IngestResponse {
                    accepted: ack.count,
                    segment_seq: ack.segment_seq,
                }),
            )
                .into_response()
        }
        Err(err) => {
            match &err {
                Error::RateLimited => {
                    metrics::counter!("rate_limit_exceeded_total", "token" => token_label)
                        .increment(1);
                }
                other => {
                    metrics::counter!(
                        "logs_rejected_total",
                        "token" => token_label,
                        "reason" => other.code(),
                    )
                    .increment(1);
                }
            }
            err.into_response()
        }
    }
}

async fn admit(
    app: &App,
    headers: &axum::http::HeaderMap,
    body: axum::body::Body,
    received: DateTime<Utc>,
    token_label: &mut String,
) -> Result<(Ack, bool), Error> {
    let snapshot = app.config.snapshot();

    let (token, spec) = auth::authenticate(&snapshot, headers)?;
    *token_label = spec.name.clone();

    // Rate limiting happens strictly before any body read.
    if !app.limiter.check(token, spec) {
        return Err(Error::RateLimited);
    }

    let dedupe_key = idempotency_key(headers, token)?;
    if let Some(key) = &dedupe_key {
        if let Some(ack) = app.dedupe.get(key) {
            return Ok((ack, true));
        }
    }

    if app.health.wal_failing() {
        return Err(Error::NotReady);
    }

    if let Some(length) = headers
        .get(axum::http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok())
    {
        if length > validate::MAX_BATCH_BYTES {
            return Err(Error::TooLarge(format!(
                "body of {length} bytes exceeds the {} byte cap",
                validate::MAX_BATCH_BYTES
            )));
        }
    }
    let body = axum::body::to_bytes(body, validate::MAX_BATCH_BYTES)
        .await
        .map_err(|_| {
            Error::TooLarge(format!(
                "body exceeds the {} byte cap",
                validate::MAX_BATCH_BYTES
            ))
        })?;

    let batch: IngestBatch = serde_json::from_slice(&body)
        .map_err(|err| Error::SchemaInvalid(format!("invalid batch JSON: {err}")))?;
    if batch.entries.len() > validate::MAX_BATCH_ENTRIES {
        return Err(Error::TooLarge(format!(
            "{} entries exceed the {} entry cap",
            batch.entries.len(),
            validate::MAX_BATCH_ENTRIES
        )));
    }
    validate::check_batch(&batch, received)?;

    let masking = &snapshot.config.masking;
    let policy = match Policy::for_token(masking, &spec.name) {
        Ok(policy) => policy,
        Err(err) => {
            tracing::warn!(?err, token = %spec.name, "masking override evaluation failed; using baseline");
            metrics::counter!("masking_errors_total").increment(1);
            Policy::baseline(masking)
        }
    };

    // ingest_time is stamped once per batch, at the receipt boundary.
    let records: Vec<_> = batch
        .entries
        .into_iter()
        .map(|entry| validate::normalize(entry, received, &policy))
        .collect();

    let ack = match app.wal.append(token, spec, &records).await {
        Ok(ack) => {
            app.health.note_wal_ok();
            ack
        }
        Err(err) => {
            if matches!(err, Error::Internal(_)) {
                app.health.note_wal_error();
            }
            return Err(err);
        }
    };

    if let Some(key) = dedupe_key {
        app.dedupe.insert(key, ack);
    }
    Ok((ack, false))
}

fn idempotency_key(
    headers: &axum::http::HeaderMap,
    token: &str,
) -> Result<Option<(u64, String)>, Error> {
    let Some(value) = headers.get("x-idempotency-key") else {
        return Ok(None);
    };
    let value = value
        .to_str()
        .map_err(|_| Error::SchemaInvalid("X-Idempotency-Key is not valid UTF-8".to_string()))?;
    if value.is_empty() || value.chars().count() > MAX_IDEMPOTENCY_KEY_CHARS {
        return Err(Error::SchemaInvalid(format!(
            "X-Idempotency-Key must be 1..={MAX_IDEMPOTENCY_KEY_CHARS} chars"
        )));
    }
    Ok(Some((
        xxhash_rust::xxh3::xxh3_64(token.as_bytes()),
        value.to_string(),
    )))
}
