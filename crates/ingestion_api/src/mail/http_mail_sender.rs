use async_trait::async_trait;
use common::domain::{DomainError, DomainResult, NotificationSender};
use serde::Serialize;
use tracing::{debug, instrument};

#[derive(Debug, Serialize)]
struct MailRequest<'a> {
    from: &'a str,
    to: &'a [String],
    subject: &'a str,
    text: &'a str,
}

/// Delivers alerts through an HTTP mail relay
///
/// The relay receives `{from, to, subject, text}` as JSON. Any non-2xx answer
/// is a delivery failure.
#[derive(Debug, Clone)]
pub struct HttpMailSender {
    http: reqwest::Client,
    relay_url: String,
    from: String,
}

impl HttpMailSender {
    pub fn new(relay_url: impl Into<String>, from: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            relay_url: relay_url.into(),
            from: from.into(),
        }
    }
}

#[async_trait]
impl NotificationSender for HttpMailSender {
    #[instrument(skip(self, body), fields(relay_url = %self.relay_url, recipients = recipients.len()))]
    async fn send(&self, recipients: &[String], subject: &str, body: &str) -> DomainResult<()> {
        let response = self
            .http
            .post(&self.relay_url)
            .json(&MailRequest {
                from: &self.from,
                to: recipients,
                subject,
                text: body,
            })
            .send()
            .await
            .map_err(|e| DomainError::NotificationFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(DomainError::NotificationFailed(format!(
                "mail relay responded {}: {}",
                status, detail
            )));
        }

        debug!(%status, "mail relay accepted notification");
        Ok(())
    }
}
