//! Telegram bot HTTP shim, an out-of-scope external collaborator (spec §1)
//! behind a narrow trait so the Runner never touches HTTP directly.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TelegramError {
    #[error("Telegram request failed")]
    Request(#[from] reqwest::Error),
    #[error("Telegram API returned an error: {0}")]
    Api(String),
}

#[async_trait]
pub trait TelegramTransport: Send + Sync {
    async fn send_message(
        &self,
        chat: i64,
        message: &str,
        silent: bool,
        message_thread_id: Option<i64>,
    ) -> Result<i64, TelegramError>;

    async fn edit_message(&self, chat: i64, message_id: i64, message: &str) -> Result<(), TelegramError>;

    async fn delete_message(&self, chat: i64, message_id: i64) -> Result<(), TelegramError>;
}

pub struct TelegramClient {
    http: reqwest::Client,
    token: String,
}

impl TelegramClient {
    pub fn new(token: String, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client configuration is always valid");
        Self { http, token }
    }

    fn url(&self, method: &str) -> String {
        format!("https://api.telegram.org/bot{}/{method}", self.token)
    }
}

#[derive(Deserialize)]
struct SendMessageResponse {
    ok: bool,
    result: Option<MessageResult>,
    description: Option<String>,
}

#[derive(Deserialize)]
struct MessageResult {
    message_id: i64,
}

#[async_trait]
impl TelegramTransport for TelegramClient {
    async fn send_message(
        &self,
        chat: i64,
        message: &str,
        silent: bool,
        message_thread_id: Option<i64>,
    ) -> Result<i64, TelegramError> {
        let mut body = serde_json::json!({
            "chat_id": chat,
            "text": message,
            "disable_notification": silent,
        });
        if let Some(thread_id) = message_thread_id {
            body["message_thread_id"] = serde_json::json!(thread_id);
        }

        let response: SendMessageResponse = self
            .http
            .post(self.url("sendMessage"))
            .json(&body)
            .send()
            .await?
            .json()
            .await?;

        if !response.ok {
            return Err(TelegramError::Api(
                response.description.unwrap_or_else(|| "unknown error".to_string()),
            ));
        }

        Ok(response.result.map(|r| r.message_id).unwrap_or_default())
    }

    async fn edit_message(&self, chat: i64, message_id: i64, message: &str) -> Result<(), TelegramError> {
        let body = serde_json::json!({
            "chat_id": chat,
            "message_id": message_id,
            "text": message,
        });
        self.http.post(self.url("editMessageText")).json(&body).send().await?;
        Ok(())
    }

    async fn delete_message(&self, chat: i64, message_id: i64) -> Result<(), TelegramError> {
        let body = serde_json::json!({
            "chat_id": chat,
            "message_id": message_id,
        });
        self.http.post(self.url("deleteMessage")).json(&body).send().await?;
        Ok(())
    }
}
