//! Typed decoding of vendor model records returned by backend discovery.
//!
//! Discovery payloads vary per vendor. Only the fields the registry understands are
//! decoded into [`DiscoveredModel`]; the complete raw object is kept in `extras` so new
//! vendor fields survive a round trip through the catalog.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::controller::BaseError;
use crate::schema::enum_def::{CatalogStatus, ProviderKind};
use crate::utils::slugify;

use cyder_tools::log::warn;

const MICRO_UNITS: i64 = 1_000_000;
const DEFAULT_CURRENCY: &str = "USD";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PriceUnit {
    #[serde(rename = "per_1k_prompt_tokens")]
    Per1kPromptTokens,
    #[serde(rename = "per_1k_completion_tokens")]
    Per1kCompletionTokens,
    #[serde(rename = "per_request")]
    PerRequest,
    #[serde(rename = "per_image")]
    PerImage,
    #[serde(rename = "per_web_search")]
    PerWebSearch,
    #[serde(rename = "per_internal_reasoning")]
    PerInternalReasoning,
}

impl PriceUnit {
    fn from_pricing_key(key: &str) -> Option<PriceUnit> {
        match key {
            "prompt" => Some(PriceUnit::Per1kPromptTokens),
            "completion" => Some(PriceUnit::Per1kCompletionTokens),
            "request" => Some(PriceUnit::PerRequest),
            "image" => Some(PriceUnit::PerImage),
            "web_search" => Some(PriceUnit::PerWebSearch),
            "internal_reasoning" => Some(PriceUnit::PerInternalReasoning),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLine {
    pub unit: PriceUnit,
    pub amount_micro: i64,
    pub currency: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenLimits {
    pub context_length: Option<i64>,
    pub max_completion_tokens: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Architecture {
    #[serde(default)]
    pub modality: Option<String>,
    #[serde(default)]
    pub input_modalities: Vec<String>,
    #[serde(default)]
    pub output_modalities: Vec<String>,
    #[serde(default)]
    pub tokenizer: Option<String>,
    #[serde(default)]
    pub instruct_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SupportedParameters {
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default)]
    pub defaults: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum PriceValue {
    Number(f64),
    Text(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
struct TopProvider {
    #[serde(default)]
    context_length: Option<i64>,
    #[serde(default)]
    max_completion_tokens: Option<i64>,
    #[serde(default)]
    is_moderated: Option<bool>,
}

/// The fields of a discovery record the registry consumes.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DiscoveredModel {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub created: Option<i64>,
    #[serde(default)]
    pub owned_by: Option<String>,
    #[serde(default)]
    canonical_slug: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    context_length: Option<i64>,
    #[serde(default)]
    max_completion_tokens: Option<i64>,
    #[serde(default)]
    pricing: BTreeMap<String, Option<PriceValue>>,
    #[serde(default)]
    top_provider: Option<TopProvider>,
    #[serde(default)]
    architecture: Option<Architecture>,
    #[serde(default)]
    supported_parameters: Vec<String>,
    #[serde(default)]
    default_parameters: BTreeMap<String, Value>,
    #[serde(skip)]
    pub extras: Map<String, Value>,
}

/// Catalog fields derived from one discovery record.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogDraft {
    pub public_id: String,
    pub supported_parameters: SupportedParameters,
    pub architecture: Architecture,
    pub notes: Option<String>,
    pub is_moderated: bool,
    pub extras: Map<String, Value>,
    pub status: CatalogStatus,
}

/// Provider-model fields derived from one discovery record.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderModelDraft {
    pub model_key: String,
    pub display_name: String,
    pub pricing: Vec<PriceLine>,
    pub token_limits: Option<TokenLimits>,
    pub family: Option<String>,
    pub supports_images: bool,
    pub supports_embeddings: bool,
    pub supports_reasoning: bool,
}

/// Outcome of decoding one raw discovery entry.
#[derive(Debug)]
pub enum DecodeOutcome {
    Model(DiscoveredModel),
    /// The entry had an id but some field could not be understood.
    Malformed { id: String, reason: String },
}

impl DiscoveredModel {
    /// Decodes one raw entry. A missing id is fatal for the whole batch; any other
    /// decode problem is reported as `Malformed` so the caller can skip just this entry.
    pub fn decode(raw: &Value) -> Result<DecodeOutcome, BaseError> {
        let id = raw
            .get("id")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default()
            .to_string();
        if id.is_empty() {
            return Err(BaseError::ParamInvalid(Some("model identifier missing".to_string())));
        }

        let mut model: DiscoveredModel = match serde_json::from_value(raw.clone()) {
            Ok(model) => model,
            Err(e) => return Ok(DecodeOutcome::Malformed { id, reason: e.to_string() }),
        };
        model.id = id.clone();
        if let Err(reason) = model.price_lines() {
            return Ok(DecodeOutcome::Malformed { id, reason });
        }
        model.extras = raw.as_object().cloned().unwrap_or_default();
        Ok(DecodeOutcome::Model(model))
    }

    /// Decodes a batch, skipping malformed entries and failing on a missing id.
    pub fn decode_batch(raw_models: &[Value]) -> Result<Vec<DiscoveredModel>, BaseError> {
        let mut models = Vec::with_capacity(raw_models.len());
        for raw in raw_models {
            match DiscoveredModel::decode(raw)? {
                DecodeOutcome::Model(model) => models.push(model),
                DecodeOutcome::Malformed { id, reason } => {
                    warn!("skipping malformed model '{}': {}", id, reason);
                }
            }
        }
        Ok(models)
    }

    /// Minimal record for backends that only report an id.
    #[cfg(test)]
    pub fn bare(id: &str) -> DiscoveredModel {
        DiscoveredModel { id: id.to_string(), ..Default::default() }
    }

    pub fn catalog_public_id(&self) -> String {
        match self.canonical_slug.as_deref().map(str::trim) {
            Some(slug) if !slug.is_empty() => slugify(slug),
            _ => slugify(&self.id),
        }
    }

    pub fn catalog_draft(&self, kind: ProviderKind) -> CatalogDraft {
        let status = if kind == ProviderKind::Openrouter {
            CatalogStatus::Filled
        } else {
            CatalogStatus::Init
        };
        CatalogDraft {
            public_id: self.catalog_public_id(),
            supported_parameters: SupportedParameters {
                names: self.supported_parameters.clone(),
                defaults: self.default_parameters.clone(),
            },
            architecture: self.architecture.clone().unwrap_or_default(),
            notes: self.description.clone().filter(|d| !d.trim().is_empty()),
            is_moderated: self
                .top_provider
                .as_ref()
                .and_then(|tp| tp.is_moderated)
                .unwrap_or(false),
            extras: self.extras.clone(),
            status,
        }
    }

    pub fn provider_model_draft(&self) -> ProviderModelDraft {
        let display_name = [self.display_name.as_deref(), self.name.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|n| !n.is_empty())
            .unwrap_or(self.id.as_str())
            .to_string();
        let input_modalities = self
            .architecture
            .as_ref()
            .map(|a| a.input_modalities.as_slice())
            .unwrap_or_default();

        ProviderModelDraft {
            model_key: self.id.clone(),
            display_name,
            pricing: self.price_lines().unwrap_or_default(),
            token_limits: self.token_limits(),
            family: self
                .id
                .split_once('/')
                .map(|(prefix, _)| prefix.trim().to_string())
                .filter(|prefix| !prefix.is_empty()),
            supports_images: input_modalities.iter().any(|m| m.eq_ignore_ascii_case("image")),
            supports_embeddings: self.id.to_lowercase().contains("embed"),
            supports_reasoning: self
                .supported_parameters
                .iter()
                .any(|p| p == "include_reasoning"),
        }
    }

    fn token_limits(&self) -> Option<TokenLimits> {
        let top = self.top_provider.clone().unwrap_or_default();
        let context_length = top
            .context_length
            .filter(|v| *v > 0)
            .or(self.context_length.filter(|v| *v > 0));
        let max_completion_tokens = top
            .max_completion_tokens
            .filter(|v| *v > 0)
            .or(self.max_completion_tokens.filter(|v| *v > 0));
        if context_length.is_none() && max_completion_tokens.is_none() {
            return None;
        }
        Some(TokenLimits { context_length, max_completion_tokens })
    }

    fn price_lines(&self) -> Result<Vec<PriceLine>, String> {
        let mut lines = Vec::new();
        for (key, value) in &self.pricing {
            let (Some(unit), Some(value)) = (PriceUnit::from_pricing_key(key), value) else {
                continue;
            };
            let amount_micro = match value {
                PriceValue::Text(text) => parse_micro_units(text),
                PriceValue::Number(number) => parse_micro_units(&number.to_string()),
            }
            .ok_or_else(|| format!("invalid {} price", key))?;
            lines.push(PriceLine {
                unit,
                amount_micro,
                currency: DEFAULT_CURRENCY.to_string(),
            });
        }
        Ok(lines)
    }
}

/// Converts a decimal currency amount into integer micro units, truncating extra precision.
fn parse_micro_units(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if raw.contains(['e', 'E']) {
        let value: f64 = raw.parse().ok()?;
        if !value.is_finite() {
            return None;
        }
        return parse_micro_units(&value.to_string());
    }
    let (negative, digits) = match raw.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, raw.strip_prefix('+').unwrap_or(raw)),
    };
    let (int_part, frac_part) = digits.split_once('.').unwrap_or((digits, ""));
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    if !int_part.chars().all(|c| c.is_ascii_digit()) || !frac_part.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let whole: i64 = if int_part.is_empty() { 0 } else { int_part.parse().ok()? };
    let mut frac: String = frac_part.chars().take(6).collect();
    while frac.len() < 6 {
        frac.push('0');
    }
    let fraction: i64 = frac.parse().ok()?;
    let amount = whole.checked_mul(MICRO_UNITS)?.checked_add(fraction)?;
    Some(if negative { -amount } else { amount })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode(raw: Value) -> DiscoveredModel {
        match DiscoveredModel::decode(&raw).unwrap() {
            DecodeOutcome::Model(model) => model,
            DecodeOutcome::Malformed { reason, .. } => panic!("unexpected malformed: {}", reason),
        }
    }

    #[test]
    fn test_parse_micro_units() {
        assert_eq!(parse_micro_units("0.000003"), Some(3));
        assert_eq!(parse_micro_units("0.0000015"), Some(1));
        assert_eq!(parse_micro_units("2"), Some(2_000_000));
        assert_eq!(parse_micro_units("-1"), Some(-1_000_000));
        assert_eq!(parse_micro_units(".5"), Some(500_000));
        assert_eq!(parse_micro_units("3e-6"), Some(3));
        assert_eq!(parse_micro_units("abc"), None);
        assert_eq!(parse_micro_units(""), None);
    }

    #[test]
    fn test_openrouter_style_record() {
        let model = decode(json!({
            "id": "anthropic/claude-3.5-sonnet",
            "canonical_slug": "anthropic/claude-3.5-sonnet-20240620",
            "name": "Anthropic: Claude 3.5 Sonnet",
            "description": "Fast and capable",
            "context_length": 100000,
            "pricing": { "prompt": "0.000003", "completion": 0.000015, "image": "0.0048", "discount": 0 },
            "top_provider": { "context_length": 200000, "max_completion_tokens": 8192, "is_moderated": true },
            "architecture": { "modality": "text+image->text", "input_modalities": ["text", "image"], "output_modalities": ["text"], "tokenizer": "Claude" },
            "supported_parameters": ["temperature", "include_reasoning"],
            "default_parameters": { "temperature": 1.0 },
            "hugging_face_id": ""
        }));

        let catalog = model.catalog_draft(ProviderKind::Openrouter);
        assert_eq!(catalog.public_id, "anthropic-claude-3-5-sonnet-20240620");
        assert_eq!(catalog.status, CatalogStatus::Filled);
        assert!(catalog.is_moderated);
        assert_eq!(catalog.notes.as_deref(), Some("Fast and capable"));
        assert_eq!(catalog.architecture.tokenizer.as_deref(), Some("Claude"));
        assert!(catalog.extras.contains_key("hugging_face_id"));

        let pm = model.provider_model_draft();
        assert_eq!(pm.display_name, "Anthropic: Claude 3.5 Sonnet");
        assert_eq!(pm.family.as_deref(), Some("anthropic"));
        assert!(pm.supports_images);
        assert!(pm.supports_reasoning);
        assert!(!pm.supports_embeddings);
        assert_eq!(
            pm.token_limits,
            Some(TokenLimits { context_length: Some(200000), max_completion_tokens: Some(8192) })
        );
        assert_eq!(pm.pricing.len(), 3);
        let prompt = pm.pricing.iter().find(|l| l.unit == PriceUnit::Per1kPromptTokens).unwrap();
        assert_eq!(prompt.amount_micro, 3);
        assert_eq!(prompt.currency, "USD");
    }

    #[test]
    fn test_bare_record_defaults() {
        let model = decode(json!({ "id": "text-embedding-3-small", "object": "model", "owned_by": "openai" }));
        let catalog = model.catalog_draft(ProviderKind::Openai);
        assert_eq!(catalog.public_id, "text-embedding-3-small");
        assert_eq!(catalog.status, CatalogStatus::Init);

        let pm = model.provider_model_draft();
        assert_eq!(pm.display_name, "text-embedding-3-small");
        assert!(pm.family.is_none());
        assert!(pm.supports_embeddings);
        assert!(pm.token_limits.is_none());
        assert!(pm.pricing.is_empty());
    }

    #[test]
    fn test_top_level_limits_fallback() {
        let model = decode(json!({ "id": "m", "context_length": 4096, "top_provider": { "context_length": 0 } }));
        assert_eq!(
            model.provider_model_draft().token_limits,
            Some(TokenLimits { context_length: Some(4096), max_completion_tokens: None })
        );
    }

    #[test]
    fn test_batch_skips_malformed_but_fails_on_missing_id() {
        let batch = vec![
            json!({ "id": "good-1" }),
            json!({ "id": "bad-price", "pricing": { "prompt": "cheap" } }),
            json!({ "id": "bad-shape", "context_length": "long" }),
            json!({ "id": "good-2" }),
        ];
        let models = DiscoveredModel::decode_batch(&batch).unwrap();
        assert_eq!(models.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(), vec!["good-1", "good-2"]);

        let err = DiscoveredModel::decode_batch(&[json!({ "id": "ok" }), json!({ "object": "model" })]).unwrap_err();
        assert!(matches!(err, BaseError::ParamInvalid(Some(ref msg)) if msg == "model identifier missing"));
    }
}
