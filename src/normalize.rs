//! Final rewrite of the translated Codex body before it is sent upstream.

use serde_json::{Map, Value};
use tracing::debug;

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::models::{resolve_codex_model, Metadata, ResolvedModel};

/// Rewrite a translated Responses body for the Codex backend:
///
/// - `model` becomes the concrete upstream model (aliases and reasoning
///   suffixes resolved, Claude names mapped through the fallback table);
/// - `reasoning.effort` is set from request metadata, then the alias, and is
///   otherwise left as translated;
/// - `stream` is forced on and `store` off, `instructions` is always present;
/// - fields listed in `params.drop` are removed.
pub fn normalize_codex_body(
    body: &[u8],
    model: &str,
    metadata: &Metadata,
    config: &BridgeConfig,
) -> Result<(Vec<u8>, ResolvedModel)> {
    let mut value: Value = serde_json::from_slice(body)?;
    let Some(obj) = value.as_object_mut() else {
        return Err(BridgeError::translation("upstream body is not a JSON object"));
    };

    let resolved = resolve_codex_model(model, metadata, &config.model_mapping);
    obj.insert("model".into(), Value::String(resolved.model.clone()));

    if let Some(effort) = &resolved.effort {
        let reasoning = obj
            .entry("reasoning")
            .or_insert_with(|| Value::Object(Map::new()));
        if !reasoning.is_object() {
            *reasoning = Value::Object(Map::new());
        }
        if let Some(reasoning) = reasoning.as_object_mut() {
            reasoning.insert("effort".into(), Value::String(effort.clone()));
        }
    }

    obj.insert("stream".into(), Value::Bool(true));
    obj.insert("store".into(), Value::Bool(false));
    if !obj.get("instructions").is_some_and(|v| v.is_string()) {
        obj.insert("instructions".into(), Value::String(String::new()));
    }

    for key in &config.params.drop {
        if obj.remove(key).is_some() {
            debug!(param = %key, "dropped unsupported upstream parameter");
        }
    }

    Ok((serde_json::to_vec(&value)?, resolved))
}

/// Set `prompt_cache_key` on an upstream body.
pub fn set_prompt_cache_key(body: &[u8], cache_id: &str) -> Result<Vec<u8>> {
    let mut value: Value = serde_json::from_slice(body)?;
    if let Some(obj) = value.as_object_mut() {
        obj.insert("prompt_cache_key".into(), Value::String(cache_id.to_string()));
    }
    Ok(serde_json::to_vec(&value)?)
}
