//! Per-request usage accounting.
//!
//! Every executor call owns one [`UsageReporter`]. It emits exactly one
//! record: the success detail when the terminal upstream event arrives, or a
//! failure record when the reporter is dropped without having published.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::credential::Credential;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageDetail {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub cached_tokens: u64,
    pub reasoning_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub provider: String,
    pub model: String,
    pub credential_id: String,
    pub detail: UsageDetail,
    pub failed: bool,
    pub requested_at: DateTime<Utc>,
}

pub trait UsageSink: Send + Sync {
    fn publish(&self, record: UsageRecord);
}

#[derive(Debug, Default)]
pub struct NoopUsageSink;

impl UsageSink for NoopUsageSink {
    fn publish(&self, _record: UsageRecord) {}
}

/// Keeps every record in memory. Handy for tests and for callers that
/// aggregate usage themselves.
#[derive(Debug, Default)]
pub struct MemoryUsageSink {
    records: Mutex<Vec<UsageRecord>>,
}

impl MemoryUsageSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<UsageRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl UsageSink for MemoryUsageSink {
    fn publish(&self, record: UsageRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.push(record);
        }
    }
}

pub struct UsageReporter {
    provider: String,
    model: String,
    credential_id: String,
    requested_at: DateTime<Utc>,
    sink: Arc<dyn UsageSink>,
    published: AtomicBool,
}

impl UsageReporter {
    pub fn new(
        provider: impl Into<String>,
        model: impl Into<String>,
        credential: &Credential,
        sink: Arc<dyn UsageSink>,
    ) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            credential_id: credential.id.clone(),
            requested_at: Utc::now(),
            sink,
            published: AtomicBool::new(false),
        }
    }

    /// Publish the success detail. Only the first publish of either kind
    /// reaches the sink.
    pub fn publish(&self, detail: UsageDetail) {
        self.emit(detail, false);
    }

    pub fn publish_failure(&self) {
        self.emit(UsageDetail::default(), true);
    }

    pub fn is_published(&self) -> bool {
        self.published.load(Ordering::SeqCst)
    }

    fn emit(&self, detail: UsageDetail, failed: bool) {
        if self.published.swap(true, Ordering::SeqCst) {
            return;
        }
        let record = UsageRecord {
            provider: self.provider.clone(),
            model: self.model.clone(),
            credential_id: self.credential_id.clone(),
            detail,
            failed,
            requested_at: self.requested_at,
        };
        debug!(
            provider = %record.provider,
            model = %record.model,
            failed,
            input_tokens = detail.input_tokens,
            output_tokens = detail.output_tokens,
            "publishing usage"
        );
        let sink = Arc::clone(&self.sink);
        if catch_unwind(AssertUnwindSafe(|| sink.publish(record))).is_err() {
            warn!(provider = %self.provider, "usage sink panicked while publishing");
        }
    }
}

impl Drop for UsageReporter {
    fn drop(&mut self) {
        if !self.is_published() {
            self.publish_failure();
        }
    }
}

/// Extract usage from a `response.completed` event payload.
pub fn parse_codex_usage(event: &serde_json::Value) -> Option<UsageDetail> {
    let usage = event.pointer("/response/usage")?;
    if !usage.is_object() {
        return None;
    }
    let field = |path: &str| usage.pointer(path).and_then(|v| v.as_u64()).unwrap_or(0);

    let input_tokens = field("/input_tokens");
    let output_tokens = field("/output_tokens");
    let total_tokens = match field("/total_tokens") {
        0 => input_tokens + output_tokens,
        total => total,
    };
    Some(UsageDetail {
        input_tokens,
        output_tokens,
        total_tokens,
        cached_tokens: field("/input_tokens_details/cached_tokens"),
        reasoning_tokens: field("/output_tokens_details/reasoning_tokens"),
    })
}
