use serde::{Deserialize, Serialize, de};
use serde_with::serde_as;
use std::sync::Arc;

/// Represents an entry in the cache, which can either be a value (Positive)
/// or a marker indicating the value could not be produced (Negative).
#[serde_as]
#[derive(PartialEq, Debug, Clone, Serialize, Deserialize)]
pub enum CacheEntry<T: Clone + Serialize + de::DeserializeOwned> {
    Positive(#[serde_as(as = "Arc<serde_with::Same>")] Arc<T>),
    Negative,
}

/// One model as served in the OpenAI-compatible listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedModel {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub owned_by: String,
}

impl CachedModel {
    pub fn new(id: &str, created: i64, owned_by: &str) -> Self {
        CachedModel {
            id: id.to_string(),
            object: "model".to_string(),
            created,
            owned_by: owned_by.to_string(),
        }
    }
}
