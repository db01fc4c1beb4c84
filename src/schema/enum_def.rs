use diesel_derive_enum::DbEnum;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, DbEnum, Default, Display,
    EnumString, AsRefStr,
)]
#[db_enum(pg_type = "provider_kind_enum")]
#[db_enum(value_style = "snake_case")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ProviderKind {
    Platform,
    Openrouter,
    Openai,
    Anthropic,
    Gemini,
    Mistral,
    Groq,
    Cohere,
    Ollama,
    Replicate,
    AzureOpenai,
    AwsBedrock,
    Perplexity,
    Togetherai,
    Huggingface,
    VercelAi,
    Deepinfra,
    #[default]
    Custom,
}

impl ProviderKind {
    /// Maps a free-text vendor hint onto a known kind. Unknown hints become `Custom`.
    pub fn from_vendor(vendor: &str) -> ProviderKind {
        match vendor.trim().to_lowercase().as_str() {
            "platform" | "jan" => ProviderKind::Platform,
            "openrouter" => ProviderKind::Openrouter,
            "openai" => ProviderKind::Openai,
            "anthropic" => ProviderKind::Anthropic,
            "gemini" | "google" | "googleai" => ProviderKind::Gemini,
            "mistral" => ProviderKind::Mistral,
            "groq" => ProviderKind::Groq,
            "cohere" => ProviderKind::Cohere,
            "ollama" => ProviderKind::Ollama,
            "replicate" => ProviderKind::Replicate,
            "azure_openai" | "azure-openai" => ProviderKind::AzureOpenai,
            "aws_bedrock" | "bedrock" => ProviderKind::AwsBedrock,
            "perplexity" => ProviderKind::Perplexity,
            "togetherai" | "together" => ProviderKind::Togetherai,
            "huggingface" => ProviderKind::Huggingface,
            "vercel_ai" | "vercel-ai" | "vercel" => ProviderKind::VercelAi,
            "deepinfra" => ProviderKind::Deepinfra,
            _ => ProviderKind::Custom,
        }
    }

    /// Custom backends are exempt from the one-provider-per-kind rule.
    pub fn is_unique_per_scope(&self) -> bool {
        *self != ProviderKind::Custom
    }
}

/// Enrichment level of a catalog row. Only `Init` rows accept updates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, DbEnum, Default, Display)]
#[db_enum(pg_type = "catalog_status_enum")]
#[db_enum(value_style = "snake_case")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CatalogStatus {
    #[default]
    Init,
    Filled,
    Updated,
}

impl CatalogStatus {
    pub fn is_enriched(&self) -> bool {
        matches!(self, CatalogStatus::Filled | CatalogStatus::Updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vendor_aliases() {
        assert_eq!(ProviderKind::from_vendor("OpenAI"), ProviderKind::Openai);
        assert_eq!(ProviderKind::from_vendor(" google "), ProviderKind::Gemini);
        assert_eq!(ProviderKind::from_vendor("azure-openai"), ProviderKind::AzureOpenai);
        assert_eq!(ProviderKind::from_vendor("bedrock"), ProviderKind::AwsBedrock);
        assert_eq!(ProviderKind::from_vendor("together"), ProviderKind::Togetherai);
        assert_eq!(ProviderKind::from_vendor("vercel"), ProviderKind::VercelAi);
        assert_eq!(ProviderKind::from_vendor("jan"), ProviderKind::Platform);
        assert_eq!(ProviderKind::from_vendor("my-lab"), ProviderKind::Custom);
        assert_eq!(ProviderKind::from_vendor(""), ProviderKind::Custom);
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(ProviderKind::AzureOpenai.as_ref(), "azure_openai");
        assert_eq!(ProviderKind::VercelAi.to_string(), "vercel_ai");
        assert!(!ProviderKind::Custom.is_unique_per_scope());
        assert!(ProviderKind::Openai.is_unique_per_scope());
    }

    #[test]
    fn test_catalog_status_enriched() {
        assert!(!CatalogStatus::Init.is_enriched());
        assert!(CatalogStatus::Filled.is_enriched());
        assert!(CatalogStatus::Updated.is_enriched());
    }
}
