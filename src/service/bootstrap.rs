use cyder_tools::log::info;
use std::collections::BTreeMap;

use crate::controller::BaseError;
use crate::database::provider::Provider;
use crate::schema::enum_def::ProviderKind;
use crate::service::registry::{ProviderRegistry, RegisterProviderInput};

pub const PLATFORM_PROVIDER_NAME: &str = "Platform Shared";

/// Makes sure the default organization owns a platform-kind provider and syncs its models.
///
/// An existing organization-level platform provider is reused; registration only happens
/// on the first boot.
pub async fn ensure_platform_provider(
    registry: &ProviderRegistry,
    inference_url: &str,
    api_key: Option<String>,
) -> Result<Provider, BaseError> {
    let organization_id = registry.default_scope().organization_id;
    let existing = registry
        .list_accessible_providers(organization_id, &[])?
        .into_iter()
        .find(|p| p.kind == ProviderKind::Platform && p.project_id.is_none());

    let provider = match existing {
        Some(provider) => {
            info!("platform provider {} already registered", provider.public_id);
            provider
        }
        None => {
            registry
                .register_provider(RegisterProviderInput {
                    organization_id: Some(organization_id),
                    name: PLATFORM_PROVIDER_NAME.to_string(),
                    vendor: ProviderKind::Platform.to_string(),
                    base_url: inference_url.to_string(),
                    api_key,
                    metadata: Some(BTreeMap::from([(
                        "description".to_string(),
                        "Default organization access to the platform provider".to_string(),
                    )])),
                    ..Default::default()
                })
                .await?
        }
    };

    let synced = registry.discover_and_sync(&provider).await?;
    info!("platform provider {} serves {} models", provider.public_id, synced.len());
    Ok(provider)
}
