//! Key lifecycle notifications
//!
//! Sent best-effort after a rotation or replenishment commits, so clients can
//! refresh their view of the user's published keys. Delivery failures are
//! logged by the caller and never undo the key change.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

const KEY_EVENTS_PATH: &str = "api/v1/notifications/key-events";

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Invalid notification endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Notification request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Notification rejected ({status}): {body}")]
    Rejected { status: u16, body: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyEventKind {
    SignedPreKeyRotated,
    OneTimePreKeysReplenished,
}

/// Payload posted to the notification service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyEvent {
    pub user_id: String,
    pub kind: KeyEventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keys_added: Option<u32>,
    pub occurred_at: DateTime<Utc>,
}

impl KeyEvent {
    pub fn signed_pre_key_rotated(user_id: &str, key_id: u32) -> Self {
        Self {
            user_id: user_id.to_string(),
            kind: KeyEventKind::SignedPreKeyRotated,
            key_id: Some(key_id),
            keys_added: None,
            occurred_at: Utc::now(),
        }
    }

    pub fn one_time_pre_keys_replenished(user_id: &str, keys_added: u32) -> Self {
        Self {
            user_id: user_id.to_string(),
            kind: KeyEventKind::OneTimePreKeysReplenished,
            key_id: None,
            keys_added: Some(keys_added),
            occurred_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &KeyEvent) -> Result<(), NotifyError>;
}

/// Used when no endpoint is configured
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: &KeyEvent) -> Result<(), NotifyError> {
        tracing::info!(
            user_id = %event.user_id,
            kind = ?event.kind,
            key_id = ?event.key_id,
            keys_added = ?event.keys_added,
            "Key lifecycle event"
        );
        Ok(())
    }
}

/// JSON POST to `{endpoint}/api/v1/notifications/key-events`
#[derive(Debug, Clone)]
pub struct HttpNotifier {
    client: Client,
    url: Url,
}

impl HttpNotifier {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, NotifyError> {
        let base = Url::parse(endpoint)
            .map_err(|e| NotifyError::InvalidEndpoint(format!("{}: {}", endpoint, e)))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(NotifyError::InvalidEndpoint(format!(
                "unsupported scheme: {}",
                base.scheme()
            )));
        }

        let url = Url::parse(&format!(
            "{}/{}",
            base.as_str().trim_end_matches('/'),
            KEY_EVENTS_PATH
        ))
        .map_err(|e| NotifyError::InvalidEndpoint(e.to_string()))?;

        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    async fn handle_response(&self, response: Response) -> Result<(), NotifyError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn notify(&self, event: &KeyEvent) -> Result<(), NotifyError> {
        let response = self.client.post(self.url.clone()).json(event).send().await?;
        self.handle_response(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Accept one request, capture it, answer with `status_line`
    async fn one_shot_server(
        status_line: &'static str,
    ) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request).to_string();
                if let Some(split) = text.find("\r\n\r\n") {
                    let length = text[..split]
                        .lines()
                        .find_map(|line| {
                            let lower = line.to_ascii_lowercase();
                            lower
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap())
                        })
                        .unwrap_or(0);
                    if request.len() >= split + 4 + length || n == 0 {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            let response = format!(
                "{}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
                status_line
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&request).to_string()
        });

        (format!("http://{}", addr), handle)
    }

    #[test]
    fn test_endpoint_validation() {
        let notifier =
            HttpNotifier::new("https://notify.internal/", Duration::from_secs(1)).unwrap();
        assert_eq!(
            notifier.url().as_str(),
            "https://notify.internal/api/v1/notifications/key-events"
        );

        assert!(matches!(
            HttpNotifier::new("not a url", Duration::from_secs(1)),
            Err(NotifyError::InvalidEndpoint(_))
        ));
        assert!(matches!(
            HttpNotifier::new("ftp://notify.internal", Duration::from_secs(1)),
            Err(NotifyError::InvalidEndpoint(_))
        ));
    }

    #[test]
    fn test_event_json_shape() {
        let event = KeyEvent::one_time_pre_keys_replenished("alice", 100);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["userId"], "alice");
        assert_eq!(json["kind"], "one_time_pre_keys_replenished");
        assert_eq!(json["keysAdded"], 100);
        assert!(json.get("keyId").is_none());
    }

    #[tokio::test]
    async fn test_posts_event() {
        let (endpoint, server) = one_shot_server("HTTP/1.1 204 No Content").await;
        let notifier = HttpNotifier::new(&endpoint, Duration::from_secs(5)).unwrap();

        notifier
            .notify(&KeyEvent::signed_pre_key_rotated("alice", 7))
            .await
            .unwrap();

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /api/v1/notifications/key-events"));
        assert!(request.contains("\"signed_pre_key_rotated\""));
    }

    #[tokio::test]
    async fn test_rejection_is_an_error() {
        let (endpoint, server) = one_shot_server("HTTP/1.1 503 Service Unavailable").await;
        let notifier = HttpNotifier::new(&endpoint, Duration::from_secs(5)).unwrap();

        let err = notifier
            .notify(&KeyEvent::signed_pre_key_rotated("alice", 7))
            .await
            .unwrap_err();
        assert!(matches!(err, NotifyError::Rejected { status: 503, .. }));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_log_notifier_always_succeeds() {
        assert!(LogNotifier
            .notify(&KeyEvent::signed_pre_key_rotated("alice", 1))
            .await
            .is_ok());
    }
}
