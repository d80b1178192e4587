//! Local token estimation for providers without a counting endpoint.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tiktoken_rs::{cl100k_base, get_bpe_from_model, CoreBPE};
use tracing::debug;

/// Approximate token counter. Implementations must be deterministic: the
/// same `(model, content)` always yields the same count.
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, model: &str, content: &[u8]) -> i64;
}

/// `tiktoken-rs` backed estimator. Encoders are built lazily per model and
/// reused.
#[derive(Default)]
pub struct TiktokenEstimator {
    encoders: Mutex<HashMap<String, Option<Arc<CoreBPE>>>>,
}

impl TiktokenEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    fn encoder_for(&self, model: &str) -> Option<Arc<CoreBPE>> {
        let name = model.trim().to_string();
        if let Ok(encoders) = self.encoders.lock() {
            if let Some(cached) = encoders.get(&name) {
                return cached.clone();
            }
        }

        let bpe = get_bpe_from_model(&name)
            .or_else(|_| {
                debug!(model = %name, "no model-specific encoding, using cl100k_base");
                cl100k_base()
            })
            .ok()
            .map(Arc::new);

        if let Ok(mut encoders) = self.encoders.lock() {
            encoders.insert(name, bpe.clone());
        }
        bpe
    }
}

impl TokenEstimator for TiktokenEstimator {
    fn estimate(&self, model: &str, content: &[u8]) -> i64 {
        if content.is_empty() {
            return 0;
        }
        match self.encoder_for(model) {
            Some(bpe) => bpe.encode_ordinary(&String::from_utf8_lossy(content)).len() as i64,
            None => ((content.len() / 4) as i64).max(1),
        }
    }
}

/// Last-resort count: a quarter of the character count, never below one.
pub fn rune_fallback(content: &[u8]) -> i64 {
    let chars = String::from_utf8_lossy(content).chars().count();
    ((chars / 4) as i64).max(1)
}
