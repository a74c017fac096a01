//! Backup notifications
//!
//! Formats a run summary as HTML and hands it to a [`Mailer`]. Delivery
//! failures are returned to the caller, which logs and records them; they
//! never fail the backup itself.

use crate::config::MailConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Url};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum MailError {
    #[error("mail delivery is not configured")]
    NotConfigured,

    #[error("mail transport failed: {0}")]
    Transport(String),

    #[error("mail API rejected the message ({status}): {body}")]
    Rejected { status: u16, body: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Email {
    pub to: String,
    pub subject: String,
    pub html: String,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: &Email) -> Result<(), MailError>;
}

/// Posts messages to a JSON mail API (`{ from, to, subject, html }` with a bearer key)
pub struct HttpMailer {
    client: Client,
    endpoint: Url,
    api_key: Option<String>,
    from: String,
}

#[derive(Serialize)]
struct MailPayload<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    html: &'a str,
}

impl HttpMailer {
    pub fn new(endpoint: Url, api_key: Option<String>, from: String) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(Duration::from_secs(15)).build()?;
        Ok(Self {
            client,
            endpoint,
            api_key,
            from,
        })
    }
}

#[async_trait]
impl Mailer for HttpMailer {
    async fn send(&self, email: &Email) -> Result<(), MailError> {
        let mut request = self.client.post(self.endpoint.clone()).json(&MailPayload {
            from: &self.from,
            to: [email.to.as_str()],
            subject: &email.subject,
            html: &email.html,
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| MailError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MailError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

/// Used when no mail API is configured
pub struct DisabledMailer;

#[async_trait]
impl Mailer for DisabledMailer {
    async fn send(&self, _email: &Email) -> Result<(), MailError> {
        Err(MailError::NotConfigured)
    }
}

/// Build the mailer the configuration asks for
pub fn mailer_from_config(config: &MailConfig) -> Arc<dyn Mailer> {
    let Some(api_url) = &config.api_url else {
        info!("MAIL_API_URL not set, backup notifications disabled");
        return Arc::new(DisabledMailer);
    };

    let built = Url::parse(api_url)
        .map_err(|e| e.to_string())
        .and_then(|url| {
            HttpMailer::new(url, config.api_key.clone(), config.from.clone())
                .map_err(|e| e.to_string())
        });
    match built {
        Ok(mailer) => Arc::new(mailer),
        Err(e) => {
            warn!("Mail API misconfigured ({}), notifications disabled", e);
            Arc::new(DisabledMailer)
        }
    }
}

/// What a notification reports about one run
#[derive(Debug, Clone)]
pub struct BackupSummary {
    pub file_name: String,
    pub captured_at: DateTime<Utc>,
    pub total_tables: usize,
    pub total_records: usize,
    pub download_url: Option<String>,
    pub errors: Vec<String>,
}

pub struct NotificationSender {
    mailer: Arc<dyn Mailer>,
}

impl NotificationSender {
    pub fn new(mailer: Arc<dyn Mailer>) -> Self {
        Self { mailer }
    }

    pub async fn send_backup_summary(&self, to: &str, summary: &BackupSummary) -> Result<(), MailError> {
        let email = Email {
            to: to.to_string(),
            subject: subject(summary),
            html: render_summary(summary),
        };
        self.mailer.send(&email).await?;
        info!("Backup summary for {} sent to {}", summary.file_name, to);
        Ok(())
    }
}

fn subject(summary: &BackupSummary) -> String {
    if summary.errors.is_empty() {
        format!("Database backup completed: {}", summary.file_name)
    } else {
        format!(
            "Database backup completed with {} error(s): {}",
            summary.errors.len(),
            summary.file_name
        )
    }
}

fn render_summary(summary: &BackupSummary) -> String {
    let mut html = String::from("<h2>Database backup</h2>\n<table>\n");
    let rows = [
        ("File", escape_html(&summary.file_name)),
        ("Captured", summary.captured_at.to_rfc2822()),
        ("Tables", summary.total_tables.to_string()),
        ("Records", summary.total_records.to_string()),
    ];
    for (label, value) in rows {
        html.push_str(&format!("<tr><th align=\"left\">{}</th><td>{}</td></tr>\n", label, value));
    }
    html.push_str("</table>\n");

    match &summary.download_url {
        Some(url) => html.push_str(&format!(
            "<p><a href=\"{}\">Download backup</a> (link expires in 24 hours)</p>\n",
            escape_html(url)
        )),
        None => html.push_str("<p>The backup file could not be published for download.</p>\n"),
    }

    if !summary.errors.is_empty() {
        html.push_str("<h3>Errors</h3>\n<ul>\n");
        for error in &summary.errors {
            html.push_str(&format!("<li>{}</li>\n", escape_html(error)));
        }
        html.push_str("</ul>\n");
    }
    html
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}


#[cfg(test)]
mod tests {
    use super::memory::RecordingMailer;
    use super::*;

    fn summary(errors: Vec<String>) -> BackupSummary {
        BackupSummary {
            file_name: "backup-2026-10-15T02-30-00Z.json".to_string(),
            captured_at: Utc::now(),
            total_tables: 12,
            total_records: 3400,
            download_url: Some("http://localhost:3000/api/backup/files/x?expires=1&signature=a".to_string()),
            errors,
        }
    }

    #[tokio::test]
    async fn test_summary_is_delivered_to_recipient() {
        let mailer = Arc::new(RecordingMailer::default());
        let sender = NotificationSender::new(mailer.clone());

        sender.send_backup_summary("ops@example.com", &summary(vec![])).await.unwrap();

        let sent = mailer.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "ops@example.com");
        assert!(sent[0].html.contains("<td>3400</td>"));
        assert!(sent[0].html.contains("expires=1&amp;signature=a"));
    }

    #[tokio::test]
    async fn test_errors_are_escaped_and_counted() {
        let mailer = Arc::new(RecordingMailer::default());
        let sender = NotificationSender::new(mailer.clone());

        sender
            .send_backup_summary("ops@example.com", &summary(vec!["<assets> locked".to_string()]))
            .await
            .unwrap();

        let sent = mailer.sent.lock().unwrap();
        assert!(sent[0].subject.contains("1 error(s)"));
        assert!(sent[0].html.contains("<li>&lt;assets&gt; locked</li>"));
    }

    #[tokio::test]
    async fn test_disabled_mailer_reports_not_configured() {
        let sender = NotificationSender::new(Arc::new(DisabledMailer));
        assert!(matches!(
            sender.send_backup_summary("ops@example.com", &summary(vec![])).await,
            Err(MailError::NotConfigured)
        ));
    }
}
