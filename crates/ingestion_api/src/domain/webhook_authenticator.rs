use common::domain::{DomainError, DomainResult, WebhookConfig};

/// Credentials presented on an inbound webhook request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WebhookCredentials {
    /// `token` query parameter
    pub token: Option<String>,
    /// `X-Webhook-Secret` header
    pub secret: Option<String>,
    /// `X-Webhook-UUID` header
    pub uuid: Option<String>,
}

/// Check presented credentials against the stored webhook settings
///
/// Fails closed when the webhook is unconfigured or disabled. Every credential
/// that is presented must match; a credential that is not presented is not
/// checked. The token is only compared when one is configured.
pub fn authenticate(
    config: Option<&WebhookConfig>,
    credentials: &WebhookCredentials,
) -> DomainResult<()> {
    let config = match config {
        Some(config) if config.enabled => config,
        _ => return Err(DomainError::WebhookDisabled),
    };

    if let (Some(expected), Some(presented)) = (&config.verification_token, &credentials.token) {
        if expected != presented {
            return Err(DomainError::InvalidWebhookToken);
        }
    }

    if let Some(presented) = &credentials.secret {
        if config.webhook_secret.as_deref() != Some(presented.as_str()) {
            return Err(DomainError::InvalidWebhookSecret);
        }
    }

    if let Some(presented) = &credentials.uuid {
        if config.webhook_uuid.as_deref() != Some(presented.as_str()) {
            return Err(DomainError::InvalidWebhookUuid);
        }
    }

    Ok(())
}
