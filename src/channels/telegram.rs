use super::traits::{Channel, ChannelMessage};
use crate::providers::scrub_secret_patterns;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

/// Telegram's hard limit for one text message.
pub const TELEGRAM_MAX_MESSAGE_CHARS: usize = 4096;

const POLL_TIMEOUT_SECS: u64 = 30;
const POLL_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Telegram channel that long-polls the Bot API for updates
pub struct TelegramChannel {
    bot_token: String,
    allowed_users: Vec<String>,
    api_base: String,
    poll_retry_delay: Duration,
    client: reqwest::Client,
}

impl TelegramChannel {
    pub fn new(bot_token: String, allowed_users: Vec<String>) -> Self {
        Self {
            bot_token,
            allowed_users,
            api_base: TELEGRAM_API_BASE.to_string(),
            poll_retry_delay: POLL_RETRY_DELAY,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(POLL_TIMEOUT_SECS + 15))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }

    /// Point the channel at another Bot API server (self-hosted or a test stub).
    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }

    fn api_url(&self, method: &str) -> String {
        format!("{}/bot{}/{method}", self.api_base, self.bot_token)
    }

    fn is_user_allowed(&self, username: &str) -> bool {
        self.allowed_users.iter().any(|u| u == "*" || u == username)
    }

    fn is_any_user_allowed<'a, I>(&self, identities: I) -> bool
    where
        I: IntoIterator<Item = &'a str>,
    {
        identities.into_iter().any(|id| self.is_user_allowed(id))
    }

    /// POST a Bot API method and return its `result`. Errors never carry the token.
    async fn call(&self, method: &str, body: &Value) -> anyhow::Result<Value> {
        let resp = self
            .client
            .post(self.api_url(method))
            .json(body)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Telegram {method} failed: {}", scrub_secret_patterns(&e.to_string())))?;

        let status = resp.status();
        let data: Value = resp.json().await.map_err(|e| {
            anyhow::anyhow!(
                "Telegram {method} returned an unreadable body ({status}): {}",
                scrub_secret_patterns(&e.to_string())
            )
        })?;

        if !status.is_success() || data.get("ok").and_then(Value::as_bool) != Some(true) {
            let description = data
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or("no description");
            anyhow::bail!(
                "Telegram {method} failed ({status}): {}",
                scrub_secret_patterns(description)
            );
        }

        Ok(data.get("result").cloned().unwrap_or(Value::Null))
    }

    /// The bot's own `@username`, used to recognise `/cmd@botname`.
    pub async fn bot_username(&self) -> anyhow::Result<Option<String>> {
        let me = self.call("getMe", &serde_json::json!({})).await?;
        Ok(me
            .get("username")
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    /// Turn one update into a message, or `None` for anything the bot does not handle.
    fn parse_update(&self, update: &Value) -> Option<ChannelMessage> {
        let message = update.get("message")?;

        let chat_id = message
            .get("chat")
            .and_then(|c| c.get("id"))
            .and_then(Value::as_i64)?
            .to_string();

        let from = message.get("from")?;
        let user_id = from.get("id").and_then(Value::as_i64)?.to_string();
        let username = from.get("username").and_then(Value::as_str);

        let mut identities = vec![user_id.as_str()];
        if let Some(username) = username {
            identities.push(username);
        }

        if !self.is_any_user_allowed(identities.iter().copied()) {
            tracing::warn!(
                "Telegram: ignoring message from unauthorized user: username={}, user_id={user_id}. \
Allowlist the Telegram @username or numeric user ID in channels.telegram.allowed_users.",
                username.unwrap_or("unknown")
            );
            return None;
        }

        // Stickers, photos and the like carry no text.
        let text = message.get("text").and_then(Value::as_str)?;
        if text.trim().is_empty() {
            return None;
        }

        let timestamp = message
            .get("date")
            .and_then(Value::as_u64)
            .unwrap_or_else(|| u64::try_from(chrono::Utc::now().timestamp()).unwrap_or_default());

        Some(ChannelMessage {
            id: Uuid::new_v4().to_string(),
            sender: user_id,
            reply_target: chat_id,
            first_name: from
                .get("first_name")
                .and_then(Value::as_str)
                .map(str::to_string),
            content: text.to_string(),
            channel: "telegram".to_string(),
            timestamp,
        })
    }
}

/// Split a message into chunks that fit within Telegram's limit, preferring
/// paragraph, line, sentence and word boundaries in that order.
pub fn split_message(message: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut remaining = message;

    while !remaining.is_empty() {
        let Some((limit, _)) = remaining.char_indices().nth(max_chars) else {
            chunks.push(remaining.to_string());
            break;
        };

        // (split position, length of the separator dropped there)
        let window = &remaining[..limit];
        let (split_pos, separator_len) = window
            .rfind("\n\n")
            .map(|i| (i, 2))
            .or_else(|| window.rfind('\n').map(|i| (i, 1)))
            .or_else(|| window.rfind(". ").map(|i| (i + 1, 1)))
            .or_else(|| window.rfind(' ').map(|i| (i, 1)))
            .filter(|&(i, _)| i > 0)
            .unwrap_or((limit, 0));

        chunks.push(remaining[..split_pos].to_string());
        remaining = &remaining[split_pos + separator_len..];
    }

    chunks
}

#[async_trait]
impl Channel for TelegramChannel {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn send(&self, message: &str, chat_id: &str) -> anyhow::Result<()> {
        for chunk in split_message(message, TELEGRAM_MAX_MESSAGE_CHARS) {
            let body = serde_json::json!({
                "chat_id": chat_id,
                "text": chunk,
            });
            self.call("sendMessage", &body).await?;
        }
        Ok(())
    }

    async fn start_typing(&self, chat_id: &str) -> anyhow::Result<()> {
        let body = serde_json::json!({
            "chat_id": chat_id,
            "action": "typing",
        });
        self.call("sendChatAction", &body).await.map(|_| ())
    }

    async fn register_commands(&self, commands: &[(&str, &str)]) -> anyhow::Result<()> {
        let commands: Vec<Value> = commands
            .iter()
            .map(|(command, description)| {
                serde_json::json!({
                    "command": command.trim_start_matches('/'),
                    "description": description,
                })
            })
            .collect();
        self.call("setMyCommands", &serde_json::json!({ "commands": commands }))
            .await?;
        tracing::info!(count = commands.len(), "Telegram command menu registered");
        Ok(())
    }

    async fn listen(&self, tx: tokio::sync::mpsc::Sender<ChannelMessage>) -> anyhow::Result<()> {
        let mut offset: i64 = 0;

        tracing::info!("Telegram channel listening for messages...");

        loop {
            let body = serde_json::json!({
                "offset": offset,
                "timeout": POLL_TIMEOUT_SECS,
                "allowed_updates": ["message"]
            });

            let updates = match self.call("getUpdates", &body).await {
                Ok(result) => result,
                Err(e) => {
                    tracing::warn!("Telegram poll error: {e}");
                    tokio::time::sleep(self.poll_retry_delay).await;
                    continue;
                }
            };

            let Some(results) = updates.as_array() else {
                continue;
            };

            for update in results {
                // Advance offset past this update
                if let Some(uid) = update.get("update_id").and_then(Value::as_i64) {
                    offset = uid + 1;
                }

                let Some(msg) = self.parse_update(update) else {
                    continue;
                };

                if tx.send(msg).await.is_err() {
                    return Ok(());
                }
            }
        }
    }

    async fn health_check(&self) -> bool {
        self.client
            .get(self.api_url("getMe"))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}
