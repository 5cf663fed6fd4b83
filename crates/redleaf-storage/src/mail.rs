use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

const RESEND_ENDPOINT: &str = "https://api.resend.com/emails";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundEmail {
    pub to: String,
    pub subject: String,
    pub text: String,
}

#[derive(Debug, Error)]
pub enum MailError {
    #[error("mail request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("mail provider rejected message to {to} with status {status}: {body}")]
    Rejected { to: String, status: u16, body: String },
    #[error("{0}")]
    Transport(String),
}

/// One message in, one outcome out. Retries belong to the caller.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: &OutboundEmail) -> Result<(), MailError>;

    /// False for mailers that never reach a recipient. Their sends leave no
    /// delivery markers and never complete a record.
    fn is_live(&self) -> bool {
        true
    }
}

#[derive(Debug, Serialize)]
struct ResendPayload<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    text: &'a str,
}

/// Sends through the Resend HTTP API.
#[derive(Debug, Clone)]
pub struct ResendMailer {
    client: reqwest::Client,
    api_key: String,
    from: String,
    endpoint: String,
}

impl ResendMailer {
    pub fn new(
        api_key: impl Into<String>,
        from: impl Into<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building mail client")?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            from: from.into(),
            endpoint: RESEND_ENDPOINT.to_string(),
        })
    }

    #[cfg(test)]
    fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[async_trait]
impl Mailer for ResendMailer {
    async fn send(&self, email: &OutboundEmail) -> Result<(), MailError> {
        let payload = ResendPayload {
            from: &self.from,
            to: [email.to.as_str()],
            subject: &email.subject,
            text: &email.text,
        };
        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(MailError::Rejected {
            to: email.to.clone(),
            status: status.as_u16(),
            body,
        })
    }
}

/// Logs messages instead of sending them.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunMailer;

#[async_trait]
impl Mailer for DryRunMailer {
    async fn send(&self, email: &OutboundEmail) -> Result<(), MailError> {
        info!(to = %email.to, subject = %email.subject, "dry-run email (not sent)");
        Ok(())
    }

    fn is_live(&self) -> bool {
        false
    }
}
