//! Upstream exchange recording.
//!
//! Every upstream call can be mirrored into a bounded ring buffer that is
//! optionally persisted as JSONL. Recording never affects the call itself.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

const MAX_LOG_ENTRIES: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeKind {
    Request,
    ResponseMeta,
    ResponseChunk,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeEntry {
    pub timestamp: DateTime<Utc>,
    pub kind: ExchangeKind,
    pub provider: String,
    pub detail: serde_json::Value,
}

impl ExchangeEntry {
    pub fn new(kind: ExchangeKind, provider: impl Into<String>, detail: serde_json::Value) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            provider: provider.into(),
            detail,
        }
    }
}

pub struct ExchangeLog {
    entries: VecDeque<ExchangeEntry>,
    file_path: Option<PathBuf>,
    writer: Option<BufWriter<File>>,
}

impl ExchangeLog {
    /// Memory-only log.
    pub fn in_memory() -> Self {
        Self {
            entries: VecDeque::new(),
            file_path: None,
            writer: None,
        }
    }

    /// Log persisted to `file_path`; existing entries are reloaded. A file
    /// holding more than the buffer keeps is rewritten down to it.
    pub fn open(file_path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file_path = file_path.as_ref().to_path_buf();

        if let Some(parent) = file_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut entries = VecDeque::with_capacity(MAX_LOG_ENTRIES);
        let mut evicted = 0usize;

        if file_path.exists() {
            let reader = BufReader::new(File::open(&file_path)?);
            for line in reader.lines().map_while(std::result::Result::ok) {
                if let Ok(entry) = serde_json::from_str::<ExchangeEntry>(&line) {
                    if entries.len() >= MAX_LOG_ENTRIES {
                        entries.pop_front();
                        evicted += 1;
                    }
                    entries.push_back(entry);
                }
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&file_path)?;

        let mut log = Self {
            entries,
            file_path: Some(file_path),
            writer: Some(BufWriter::new(file)),
        };
        if evicted > 0 {
            log.compact()?;
        }
        Ok(log)
    }

    pub fn record(&mut self, entry: ExchangeEntry) {
        if let Some(ref mut writer) = self.writer {
            if let Ok(json) = serde_json::to_string(&entry) {
                let _ = writeln!(writer, "{}", json);
                let _ = writer.flush();
            }
        }
        if self.entries.len() >= MAX_LOG_ENTRIES {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn recent(&self, limit: usize) -> Vec<ExchangeEntry> {
        self.entries.iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Rewrite the backing file so it only holds what is still buffered.
    fn compact(&mut self) -> std::io::Result<()> {
        let Some(path) = self.file_path.clone() else {
            return Ok(());
        };
        self.writer = None;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        let mut writer = BufWriter::new(file);
        for entry in &self.entries {
            if let Ok(json) = serde_json::to_string(entry) {
                writeln!(writer, "{}", json)?;
            }
        }
        writer.flush()?;
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        self.writer = Some(BufWriter::new(file));
        Ok(())
    }
}

#[derive(Clone)]
pub struct SharedExchangeLog(Arc<Mutex<ExchangeLog>>);

impl SharedExchangeLog {
    pub fn in_memory() -> Self {
        Self(Arc::new(Mutex::new(ExchangeLog::in_memory())))
    }

    pub fn open(file_path: impl AsRef<Path>) -> std::io::Result<Self> {
        Ok(Self(Arc::new(Mutex::new(ExchangeLog::open(file_path)?))))
    }

    pub fn record(&self, entry: ExchangeEntry) {
        if let Ok(mut log) = self.0.lock() {
            log.record(entry);
        }
    }

    pub fn request(
        &self,
        provider: &str,
        url: &str,
        headers: &reqwest::header::HeaderMap,
        body: &[u8],
    ) {
        let headers: serde_json::Map<String, serde_json::Value> = headers
            .iter()
            .map(|(name, value)| {
                let shown = if *name == reqwest::header::AUTHORIZATION {
                    "Bearer ***".to_string()
                } else {
                    String::from_utf8_lossy(value.as_bytes()).into_owned()
                };
                (name.as_str().to_string(), serde_json::Value::String(shown))
            })
            .collect();
        self.record(ExchangeEntry::new(
            ExchangeKind::Request,
            provider,
            serde_json::json!({
                "method": "POST",
                "url": url,
                "headers": headers,
                "body": String::from_utf8_lossy(body),
            }),
        ));
    }

    pub fn response_meta(&self, provider: &str, status: u16, headers: &reqwest::header::HeaderMap) {
        let headers: serde_json::Map<String, serde_json::Value> = headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    serde_json::Value::String(String::from_utf8_lossy(value.as_bytes()).into_owned()),
                )
            })
            .collect();
        self.record(ExchangeEntry::new(
            ExchangeKind::ResponseMeta,
            provider,
            serde_json::json!({ "status": status, "headers": headers }),
        ));
    }

    pub fn response_chunk(&self, provider: &str, chunk: &[u8]) {
        self.record(ExchangeEntry::new(
            ExchangeKind::ResponseChunk,
            provider,
            serde_json::Value::String(String::from_utf8_lossy(chunk).into_owned()),
        ));
    }

    pub fn error(&self, provider: &str, message: impl std::fmt::Display) {
        self.record(ExchangeEntry::new(
            ExchangeKind::Error,
            provider,
            serde_json::Value::String(message.to_string()),
        ));
    }

    pub fn recent(&self, limit: usize) -> Vec<ExchangeEntry> {
        self.0.lock().map(|l| l.recent(limit)).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};

    #[test]
    fn test_request_redacts_bearer_token() {
        let log = SharedExchangeLog::in_memory();
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer sk-secret"));

        log.request("codex", "http://upstream/responses", &headers, b"{}");

        let entries = log.recent(10);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, ExchangeKind::Request);
        let rendered = entries[0].detail.to_string();
        assert!(!rendered.contains("sk-secret"));
        assert!(rendered.contains("Bearer ***"));
    }

    #[test]
    fn test_recent_is_newest_first() {
        let log = SharedExchangeLog::in_memory();
        log.response_chunk("codex", b"first");
        log.response_chunk("codex", b"second");

        let entries = log.recent(1);
        assert_eq!(entries[0].detail, serde_json::json!("second"));
    }

    #[test]
    fn test_persisted_entries_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exchanges.jsonl");

        {
            let log = SharedExchangeLog::open(&path).unwrap();
            log.error("codex", "connection reset");
            log.response_meta("codex", 429, &HeaderMap::new());
        }

        let reopened = ExchangeLog::open(&path).unwrap();
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.recent(5)[1].kind, ExchangeKind::Error);
    }

    #[test]
    fn test_oversized_file_is_compacted_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exchanges.jsonl");
        let lines: String = (0..MAX_LOG_ENTRIES + 5)
            .map(|i| {
                let entry = ExchangeEntry::new(ExchangeKind::ResponseChunk, "codex", serde_json::json!(i));
                format!("{}\n", serde_json::to_string(&entry).unwrap())
            })
            .collect();
        std::fs::write(&path, lines).unwrap();

        let log = ExchangeLog::open(&path).unwrap();
        assert_eq!(log.len(), MAX_LOG_ENTRIES);
        assert_eq!(log.recent(1)[0].detail, serde_json::json!(MAX_LOG_ENTRIES + 4));

        let on_disk = std::fs::read_to_string(&path).unwrap();
        assert_eq!(on_disk.lines().count(), MAX_LOG_ENTRIES);
        assert!(on_disk.lines().next().unwrap().contains("\"detail\":5"));
    }
}
