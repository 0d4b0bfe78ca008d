use async_trait::async_trait;

/// A message received from a channel
#[derive(Debug, Clone)]
pub struct ChannelMessage {
    pub id: String,
    /// Stable user identifier; the session key.
    pub sender: String,
    /// Where replies go (the chat id on Telegram).
    pub reply_target: String,
    /// Display name for greetings, when the platform provides one.
    pub first_name: Option<String>,
    pub content: String,
    pub channel: String,
    pub timestamp: u64,
}

/// Core channel trait, implemented once per messaging platform
#[async_trait]
pub trait Channel: Send + Sync {
    /// Human-readable channel name
    fn name(&self) -> &str;

    /// Send a message through this channel
    async fn send(&self, message: &str, recipient: &str) -> anyhow::Result<()>;

    /// Show a "working" indicator to the recipient
    async fn start_typing(&self, _recipient: &str) -> anyhow::Result<()> {
        Ok(())
    }

    /// Publish the command menu (name, description) to the platform
    async fn register_commands(&self, _commands: &[(&str, &str)]) -> anyhow::Result<()> {
        Ok(())
    }

    /// Start listening for incoming messages (long-running)
    async fn listen(&self, tx: tokio::sync::mpsc::Sender<ChannelMessage>) -> anyhow::Result<()>;

    /// Check if channel is healthy
    async fn health_check(&self) -> bool {
        true
    }
}
