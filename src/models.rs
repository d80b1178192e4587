//! Model resolution between Claude and Codex names.
//!
//! Codex exposes one base model per family and selects the reasoning effort
//! through the request body. Clients address the combinations through alias
//! names (`gpt-5.1-codex-high`) or suffixes (`gpt-5.2(xhigh)`). Everything in
//! this module is a pure lookup.

use crate::config::ModelMappingConfig;
use crate::translate::Format;

pub type Metadata = serde_json::Map<String, serde_json::Value>;

pub const THINKING_ORIGINAL_MODEL_KEY: &str = "thinking_original_model";
pub const BASE_MODEL_KEY: &str = "base_model";
pub const REASONING_EFFORT_KEY: &str = "reasoning_effort";

pub const REASONING_EFFORTS: &[&str] = &["none", "minimal", "low", "medium", "high", "xhigh"];

const DEFAULT_CODEX_MODEL: &str = "gpt-5.2";
const DEFAULT_CLAUDE_MODEL: &str = "claude-sonnet-4-5-20250929";

/// An alias the upstream does not know, mapped to the base model it sends
/// and the reasoning effort it implies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelAlias {
    pub alias: &'static str,
    pub base_model: &'static str,
    pub effort: &'static str,
}

const fn alias(alias: &'static str, base_model: &'static str, effort: &'static str) -> ModelAlias {
    ModelAlias {
        alias,
        base_model,
        effort,
    }
}

const ALIASES: &[ModelAlias] = &[
    alias("gpt-5-minimal", "gpt-5", "minimal"),
    alias("gpt-5-low", "gpt-5", "low"),
    alias("gpt-5-medium", "gpt-5", "medium"),
    alias("gpt-5-high", "gpt-5", "high"),
    alias("gpt-5-codex-low", "gpt-5-codex", "low"),
    alias("gpt-5-codex-medium", "gpt-5-codex", "medium"),
    alias("gpt-5-codex-high", "gpt-5-codex", "high"),
    alias("gpt-5-codex-mini-medium", "gpt-5-codex-mini", "medium"),
    alias("gpt-5-codex-mini-high", "gpt-5-codex-mini", "high"),
    alias("gpt-5.1-none", "gpt-5.1", "none"),
    alias("gpt-5.1-low", "gpt-5.1", "low"),
    alias("gpt-5.1-medium", "gpt-5.1", "medium"),
    alias("gpt-5.1-high", "gpt-5.1", "high"),
    alias("gpt-5.1-codex-low", "gpt-5.1-codex", "low"),
    alias("gpt-5.1-codex-medium", "gpt-5.1-codex", "medium"),
    alias("gpt-5.1-codex-high", "gpt-5.1-codex", "high"),
    alias("gpt-5.1-codex-mini-medium", "gpt-5.1-codex-mini", "medium"),
    alias("gpt-5.1-codex-mini-high", "gpt-5.1-codex-mini", "high"),
    alias("gpt-5.1-codex-max-low", "gpt-5.1-codex-max", "low"),
    alias("gpt-5.1-codex-max-medium", "gpt-5.1-codex-max", "medium"),
    alias("gpt-5.1-codex-max-high", "gpt-5.1-codex-max", "high"),
    alias("gpt-5.1-codex-max-xhigh", "gpt-5.1-codex-max", "xhigh"),
    alias("gpt-5.2-none", "gpt-5.2", "none"),
    alias("gpt-5.2-low", "gpt-5.2", "low"),
    alias("gpt-5.2-medium", "gpt-5.2", "medium"),
    alias("gpt-5.2-high", "gpt-5.2", "high"),
    alias("gpt-5.2-xhigh", "gpt-5.2", "xhigh"),
];

const CODEX_MODELS: &[&str] = &[
    "gpt-5",
    "gpt-5-codex",
    "gpt-5-codex-mini",
    "gpt-5.1",
    "gpt-5.1-codex",
    "gpt-5.1-codex-mini",
    "gpt-5.1-codex-max",
    "gpt-5.2",
    "gpt-5.2-codex",
];

const CLAUDE_MODELS: &[&str] = &[
    "claude-opus-4-5-20251101",
    "claude-opus-4-1-20250805",
    "claude-opus-4-20250514",
    "claude-sonnet-4-5-20250929",
    "claude-sonnet-4-20250514",
    "claude-3-7-sonnet-20250219",
    "claude-haiku-4-5-20251001",
    "claude-3-5-haiku-20241022",
];

/// Claude -> Codex fallbacks, matched by prefix in order.
const CLAUDE_TO_CODEX: &[(&str, &str)] = &[
    ("claude-opus-4-5", "gpt-5.2-xhigh"),
    ("claude-opus-4", "gpt-5.2-high"),
    ("claude-sonnet-4-5", "gpt-5.2-high"),
    ("claude-sonnet-4", "gpt-5.2-medium"),
    ("claude-3-7-sonnet", "gpt-5.2-medium"),
    ("claude-haiku-4-5", DEFAULT_CODEX_MODEL),
    ("claude-3-5-haiku", DEFAULT_CODEX_MODEL),
];

/// Codex -> Claude fallbacks keyed by the effort the name implies.
const EFFORT_TO_CLAUDE: &[(&str, &str)] = &[
    ("xhigh", "claude-opus-4-5-20251101"),
    ("high", "claude-opus-4-5-20251101"),
    ("medium", "claude-sonnet-4-5-20250929"),
    ("low", "claude-haiku-4-5-20251001"),
    ("minimal", "claude-haiku-4-5-20251001"),
    ("none", "claude-haiku-4-5-20251001"),
];

impl ModelAlias {
    #[must_use]
    pub fn from_name(name: &str) -> Option<&'static ModelAlias> {
        let name = name.trim().to_lowercase();
        ALIASES.iter().find(|a| a.alias == name)
    }

    #[must_use]
    pub fn all() -> &'static [ModelAlias] {
        ALIASES
    }
}

/// Upstream model id plus the reasoning effort to request with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedModel {
    pub model: String,
    pub effort: Option<String>,
}

pub fn is_reasoning_effort(value: &str) -> bool {
    REASONING_EFFORTS.contains(&value)
}

/// Whether `target` serves `model`, either directly or through an alias.
pub fn target_has_model(target: Format, model: &str) -> bool {
    let name = model.trim().to_lowercase();
    if name.is_empty() {
        return false;
    }
    match target {
        Format::Codex => {
            CODEX_MODELS.contains(&name.as_str())
                || ModelAlias::from_name(&name).is_some()
                || normalize_thinking_model(&name).1.is_some_and(|meta| {
                    meta.get(BASE_MODEL_KEY)
                        .and_then(|v| v.as_str())
                        .is_some_and(|base| CODEX_MODELS.contains(&base))
                })
        }
        Format::Claude => CLAUDE_MODELS.contains(&name.as_str()),
    }
}

/// Split a reasoning suffix off a model name.
///
/// `name(effort)` is accepted for any model; `name-effort` only for `gpt-`
/// models so Claude names such as `claude-opus-4-5-thinking-high` pass
/// through. Returns the base name and, when a suffix was found, metadata
/// holding the original name, the base and the effort.
pub fn normalize_thinking_model(model: &str) -> (String, Option<Metadata>) {
    let trimmed = model.trim();

    if let Some(open) = trimmed.rfind('(') {
        if trimmed.ends_with(')') {
            let effort = trimmed[open + 1..trimmed.len() - 1].trim().to_lowercase();
            let base = trimmed[..open].trim().to_lowercase();
            if !base.is_empty() && is_reasoning_effort(&effort) {
                return (base.clone(), Some(thinking_metadata(trimmed, &base, &effort)));
            }
        }
    }

    if trimmed.to_lowercase().starts_with("gpt-") {
        if let Some((base, suffix)) = trimmed.rsplit_once('-') {
            let effort = suffix.to_lowercase();
            let base = base.to_lowercase();
            if !base.is_empty() && is_reasoning_effort(&effort) {
                return (base.clone(), Some(thinking_metadata(trimmed, &base, &effort)));
            }
        }
    }

    (trimmed.to_string(), None)
}

fn thinking_metadata(original: &str, base: &str, effort: &str) -> Metadata {
    let mut meta = Metadata::new();
    meta.insert(THINKING_ORIGINAL_MODEL_KEY.into(), original.into());
    meta.insert(BASE_MODEL_KEY.into(), base.into());
    meta.insert(REASONING_EFFORT_KEY.into(), effort.into());
    meta
}

/// The model name the client originally asked for.
pub fn resolve_original_model(model: &str, metadata: &Metadata) -> String {
    metadata
        .get(THINKING_ORIGINAL_MODEL_KEY)
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(model)
        .to_string()
}

pub fn reasoning_effort_from_metadata(metadata: &Metadata) -> Option<String> {
    metadata
        .get(REASONING_EFFORT_KEY)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_lowercase())
        .filter(|s| is_reasoning_effort(s))
}

fn base_model_from_metadata(metadata: &Metadata) -> Option<&str> {
    metadata
        .get(BASE_MODEL_KEY)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Make `model` usable on `target`. Returns the name to use and whether it
/// was changed.
pub fn ensure_model_for_target(target: Format, model: &str) -> (String, bool) {
    if target_has_model(target, model) {
        return (model.to_string(), false);
    }
    let name = model.trim().to_lowercase();
    match target {
        Format::Codex => {
            let mapped = CLAUDE_TO_CODEX
                .iter()
                .find(|(prefix, _)| name.starts_with(*prefix))
                .map_or(DEFAULT_CODEX_MODEL, |(_, codex)| *codex);
            (mapped.to_string(), true)
        }
        Format::Claude => {
            let (_, meta) = normalize_thinking_model(&name);
            let effort = meta.as_ref().and_then(reasoning_effort_from_metadata).or_else(|| {
                ModelAlias::from_name(&name).map(|a| a.effort.to_string())
            });
            let mapped = effort
                .and_then(|e| EFFORT_TO_CLAUDE.iter().find(|(k, _)| *k == e))
                .map_or(DEFAULT_CLAUDE_MODEL, |(_, claude)| *claude);
            (mapped.to_string(), true)
        }
    }
}

/// Like [`ensure_model_for_target`], consulting configured overrides first.
pub fn ensure_model_for_target_with_config(
    mapping: &ModelMappingConfig,
    target: Format,
    model: &str,
) -> (String, bool) {
    if target_has_model(target, model) {
        return (model.to_string(), false);
    }
    if target == Format::Codex {
        let name = model.trim().to_lowercase();
        let configured = mapping
            .claude_to_codex
            .iter()
            .find(|(k, _)| k.trim().to_lowercase() == name)
            .map(|(_, v)| v.trim())
            .filter(|v| !v.is_empty());
        if let Some(mapped) = configured {
            return (mapped.to_string(), true);
        }
        if let Some(default) = mapping.default_codex.as_deref().map(str::trim).filter(|d| !d.is_empty()) {
            return (default.to_string(), true);
        }
    }
    ensure_model_for_target(target, model)
}

/// Resolve the model and effort actually sent to Codex.
///
/// Precedence: request metadata, then the alias table, then a reasoning
/// suffix on the name. Models the upstream does not serve go through the
/// Claude fallback table first.
pub fn resolve_codex_model(
    model: &str,
    metadata: &Metadata,
    mapping: &ModelMappingConfig,
) -> ResolvedModel {
    let requested = base_model_from_metadata(metadata).unwrap_or(model);
    let (name, _) = ensure_model_for_target_with_config(mapping, Format::Codex, requested);

    let (base, effort) = match ModelAlias::from_name(&name) {
        Some(a) => (a.base_model.to_string(), Some(a.effort.to_string())),
        None => {
            let (base, meta) = normalize_thinking_model(&name);
            (base, meta.as_ref().and_then(reasoning_effort_from_metadata))
        }
    };

    ResolvedModel {
        model: base,
        effort: reasoning_effort_from_metadata(metadata).or(effort),
    }
}

/// Map a Claude thinking budget onto a Codex reasoning effort.
pub fn effort_for_budget(budget_tokens: i64) -> &'static str {
    match budget_tokens {
        i64::MIN..=0 => "none",
        1..=4096 => "low",
        4097..=16384 => "medium",
        _ => "high",
    }
}

/// Map a Codex reasoning effort onto a Claude thinking budget. `None` means
/// thinking stays disabled.
pub fn budget_for_effort(effort: &str) -> Option<i64> {
    match effort {
        "minimal" => Some(1024),
        "low" => Some(4096),
        "medium" => Some(8192),
        "high" => Some(16384),
        "xhigh" => Some(24576),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alias_lookup() {
        let a = ModelAlias::from_name("GPT-5.1-Codex-Max-XHigh").unwrap();
        assert_eq!(a.base_model, "gpt-5.1-codex-max");
        assert_eq!(a.effort, "xhigh");
        assert!(ModelAlias::from_name("gpt-5").is_none());
    }

    #[test]
    fn test_all_aliases_point_at_known_models() {
        for a in ModelAlias::all() {
            assert!(CODEX_MODELS.contains(&a.base_model), "{} -> {}", a.alias, a.base_model);
            assert!(is_reasoning_effort(a.effort), "{} has bad effort", a.alias);
        }
    }

    #[test]
    fn test_normalize_hyphen_suffix() {
        for (input, base, effort) in [
            ("gpt-5.2-xhigh", "gpt-5.2", "xhigh"),
            ("gpt-5.2-high", "gpt-5.2", "high"),
            ("gpt-5.2-none", "gpt-5.2", "none"),
            ("gpt-5.2(xhigh)", "gpt-5.2", "xhigh"),
        ] {
            let (got, meta) = normalize_thinking_model(input);
            assert_eq!(got, base);
            let meta = meta.unwrap();
            assert_eq!(meta[THINKING_ORIGINAL_MODEL_KEY], input);
            assert_eq!(meta[REASONING_EFFORT_KEY], effort);
        }
    }

    #[test]
    fn test_normalize_lowercases_base_with_suffix() {
        let (base, meta) = normalize_thinking_model("GPT-5.2-HIGH");
        assert_eq!(base, "gpt-5.2");
        let meta = meta.unwrap();
        assert_eq!(meta[BASE_MODEL_KEY], "gpt-5.2");
        assert_eq!(meta[REASONING_EFFORT_KEY], "high");
        assert_eq!(meta[THINKING_ORIGINAL_MODEL_KEY], "GPT-5.2-HIGH");

        let resolved = resolve_codex_model("GPT-5.1-Codex(Low)", &Metadata::new(), &ModelMappingConfig::default());
        assert_eq!(resolved.model, "gpt-5.1-codex");
        assert_eq!(resolved.effort.as_deref(), Some("low"));
    }

    #[test]
    fn test_normalize_leaves_claude_alone() {
        let (base, meta) = normalize_thinking_model("claude-opus-4-5-thinking-high");
        assert_eq!(base, "claude-opus-4-5-thinking-high");
        assert!(meta.is_none());

        let (base, meta) = normalize_thinking_model("gpt-5-codex-mini");
        assert_eq!(base, "gpt-5-codex-mini");
        assert!(meta.is_none());
    }

    #[test]
    fn test_default_claude_to_codex_mapping() {
        assert_eq!(
            ensure_model_for_target(Format::Codex, "claude-opus-4-5-20251101"),
            ("gpt-5.2-xhigh".to_string(), true)
        );
        assert_eq!(
            ensure_model_for_target(Format::Codex, "claude-haiku-4-5-20251001"),
            ("gpt-5.2".to_string(), true)
        );
        assert_eq!(
            ensure_model_for_target(Format::Codex, "claude-unknown-model"),
            ("gpt-5.2".to_string(), true)
        );
        assert_eq!(
            ensure_model_for_target(Format::Codex, "gpt-5-codex"),
            ("gpt-5-codex".to_string(), false)
        );
    }

    #[test]
    fn test_codex_to_claude_mapping() {
        assert_eq!(
            ensure_model_for_target(Format::Claude, "gpt-5-high").0,
            "claude-opus-4-5-20251101"
        );
        assert_eq!(
            ensure_model_for_target(Format::Claude, "gpt-5"),
            (DEFAULT_CLAUDE_MODEL.to_string(), true)
        );
    }

    #[test]
    fn test_config_mapping_wins() {
        let mut mapping = ModelMappingConfig::default();
        mapping
            .claude_to_codex
            .insert("claude-opus-4-5-20251101".into(), "gpt-5.1-codex-max-high".into());
        mapping.default_codex = Some("gpt-5.1".into());

        assert_eq!(
            ensure_model_for_target_with_config(&mapping, Format::Codex, "claude-opus-4-5-20251101").0,
            "gpt-5.1-codex-max-high"
        );
        assert_eq!(
            ensure_model_for_target_with_config(&mapping, Format::Codex, "claude-unknown-model").0,
            "gpt-5.1"
        );
    }

    #[test]
    fn test_resolve_codex_model_precedence() {
        let mapping = ModelMappingConfig::default();

        let resolved = resolve_codex_model("gpt-5-codex-high", &Metadata::new(), &mapping);
        assert_eq!(resolved.model, "gpt-5-codex");
        assert_eq!(resolved.effort.as_deref(), Some("high"));

        let resolved = resolve_codex_model("claude-opus-4-5-20251101", &Metadata::new(), &mapping);
        assert_eq!(resolved.model, "gpt-5.2");
        assert_eq!(resolved.effort.as_deref(), Some("xhigh"));

        let (_, meta) = normalize_thinking_model("gpt-5.1(low)");
        let mut meta = meta.unwrap();
        meta.insert(REASONING_EFFORT_KEY.into(), "medium".into());
        let resolved = resolve_codex_model("ignored", &meta, &mapping);
        assert_eq!(resolved.model, "gpt-5.1");
        assert_eq!(resolved.effort.as_deref(), Some("medium"));

        let resolved = resolve_codex_model("gpt-5", &Metadata::new(), &mapping);
        assert_eq!(resolved.effort, None);
    }

    #[test]
    fn test_resolve_original_model() {
        let (_, meta) = normalize_thinking_model("gpt-5.2(high)");
        assert_eq!(resolve_original_model("gpt-5.2", &meta.unwrap()), "gpt-5.2(high)");
        assert_eq!(resolve_original_model("gpt-5.2", &Metadata::new()), "gpt-5.2");
    }

    #[test]
    fn test_budget_effort_mapping() {
        assert_eq!(effort_for_budget(0), "none");
        assert_eq!(effort_for_budget(2048), "low");
        assert_eq!(effort_for_budget(10_000), "medium");
        assert_eq!(effort_for_budget(32_000), "high");
        assert_eq!(budget_for_effort("none"), None);
        assert_eq!(budget_for_effort("medium"), Some(8192));
    }
}
