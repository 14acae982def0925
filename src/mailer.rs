//! Outbound mail transport (Postmark-compatible JSON API).
//!
//! The engine only knows success or failure; provider semantics beyond a
//! non-2xx response are not interpreted here. Partial delivery within a
//! provider-accepted request is a provider concern, not retried per run.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;
use tracing::info;

#[derive(Debug, Clone)]
pub struct OutgoingEmail {
    pub to: Vec<String>,
    pub subject: String,
    pub html: Option<String>,
    pub text: Option<String>,
    pub reply_to: Option<String>,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    /// Deliver one message; returns the provider message id.
    async fn send(&self, email: &OutgoingEmail) -> Result<String>;
}

#[derive(Clone)]
pub struct PostmarkMailer {
    http: Client,
    api_url: Url,
    server_token: String,
    from: String,
}

impl fmt::Debug for PostmarkMailer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostmarkMailer")
            .field("api_url", &self.api_url)
            .field("from", &self.from)
            .finish_non_exhaustive()
    }
}

impl PostmarkMailer {
    pub fn new(api_url: &str, server_token: &str, from: &str) -> Result<Self> {
        let api_url = Url::parse(api_url).context("invalid mail.api_url")?;
        let http = Client::builder()
            .user_agent("rental-digest/0.1")
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            http,
            api_url,
            server_token: server_token.to_string(),
            from: from.to_string(),
        })
    }
}

/// Request body for the provider `POST /email` endpoint.
pub fn build_email_payload(from: &str, email: &OutgoingEmail) -> Value {
    let mut map = serde_json::Map::new();
    map.insert("From".into(), json!(from));
    map.insert("To".into(), json!(email.to.join(",")));
    map.insert("Subject".into(), json!(email.subject));
    map.insert("MessageStream".into(), json!("broadcast"));
    if let Some(html) = &email.html {
        map.insert("HtmlBody".into(), json!(html));
    }
    if let Some(text) = &email.text {
        map.insert("TextBody".into(), json!(text));
    }
    if let Some(reply_to) = &email.reply_to {
        map.insert("ReplyTo".into(), json!(reply_to));
    }
    Value::Object(map)
}

#[derive(Deserialize)]
struct SendResponse {
    #[serde(rename = "MessageID")]
    message_id: String,
}

#[async_trait]
impl Mailer for PostmarkMailer {
    async fn send(&self, email: &OutgoingEmail) -> Result<String> {
        if email.to.is_empty() {
            return Err(anyhow!("no recipients"));
        }
        let body = build_email_payload(&self.from, email);
        let res = self
            .http
            .post(self.api_url.clone())
            .header("X-Postmark-Server-Token", &self.server_token)
            .header("Accept", "application/json")
            .json(&body)
            .send()
            .await
            .context("failed to reach mail provider")?;
        if !res.status().is_success() {
            let status = res.status();
            let text = res.text().await.unwrap_or_default();
            return Err(anyhow!("mail provider error {}: {}", status, text));
        }
        let payload: SendResponse = res.json().await.context("invalid mail provider response")?;
        info!(message_id = %payload.message_id, "digest email accepted by provider");
        Ok(payload.message_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_email() -> OutgoingEmail {
        OutgoingEmail {
            to: vec!["a@x.com".into(), "b@x.com".into()],
            subject: "Daily digest".into(),
            html: Some("<html></html>".into()),
            text: Some("plain".into()),
            reply_to: Some("team@x.com".into()),
        }
    }

    #[test]
    fn payload_includes_all_bodies() {
        let body = build_email_payload("digest@x.com", &sample_email());
        assert_eq!(body["From"], "digest@x.com");
        assert_eq!(body["To"], "a@x.com,b@x.com");
        assert_eq!(body["Subject"], "Daily digest");
        assert_eq!(body["HtmlBody"], "<html></html>");
        assert_eq!(body["TextBody"], "plain");
        assert_eq!(body["ReplyTo"], "team@x.com");
    }

    #[test]
    fn payload_omits_absent_bodies() {
        let mut email = sample_email();
        email.html = None;
        email.reply_to = None;
        let body = build_email_payload("digest@x.com", &email);
        assert!(body.get("HtmlBody").is_none());
        assert!(body.get("ReplyTo").is_none());
        assert_eq!(body["TextBody"], "plain");
    }
}
