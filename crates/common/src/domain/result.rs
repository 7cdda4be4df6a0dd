use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

#[derive(Error, Debug)]
pub enum DomainError {
    #[error("Webhook disabled")]
    WebhookDisabled,

    #[error("Invalid webhook verification token")]
    InvalidWebhookToken,

    #[error("Invalid webhook secret")]
    InvalidWebhookSecret,

    #[error("Invalid webhook UUID")]
    InvalidWebhookUuid,

    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Device identity already exists: {0}")]
    DeviceIdentityAlreadyExists(String),

    #[error("Alert rule not found: {0}")]
    AlertRuleNotFound(String),

    #[error("Notification delivery failed: {0}")]
    NotificationFailed(String),

    #[error("Notification delivery timed out after {0}s")]
    NotificationTimeout(u64),

    #[error("Repository error: {0}")]
    RepositoryError(#[from] anyhow::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl DomainError {
    /// True for the rejections raised while checking webhook credentials
    pub fn is_authentication_failure(&self) -> bool {
        matches!(
            self,
            DomainError::WebhookDisabled
                | DomainError::InvalidWebhookToken
                | DomainError::InvalidWebhookSecret
                | DomainError::InvalidWebhookUuid
        )
    }
}
