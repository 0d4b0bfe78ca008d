use super::traits::{Channel, ChannelMessage};
use async_trait::async_trait;
use tokio::io::{self, AsyncBufReadExt, BufReader};
use uuid::Uuid;

/// Session key for the local terminal user.
pub const CLI_USER_ID: &str = "cli";

/// CLI channel over stdin and stdout.
pub struct CliChannel;

impl CliChannel {
    pub const fn new() -> Self {
        Self
    }

    /// `None` for blank lines and for `/quit` / `/exit`, which end the session.
    fn line_to_message(line: &str) -> Option<ChannelMessage> {
        let line = line.trim();
        if line.is_empty() || line == "/quit" || line == "/exit" {
            return None;
        }

        Some(ChannelMessage {
            id: Uuid::new_v4().to_string(),
            sender: CLI_USER_ID.to_string(),
            reply_target: CLI_USER_ID.to_string(),
            first_name: None,
            content: line.to_string(),
            channel: "cli".to_string(),
            timestamp: u64::try_from(chrono::Utc::now().timestamp()).unwrap_or_default(),
        })
    }
}

impl Default for CliChannel {
    fn default() -> Self {
        Self::new()
    }
}

fn is_exit(line: &str) -> bool {
    matches!(line.trim(), "/quit" | "/exit")
}

#[async_trait]
impl Channel for CliChannel {
    fn name(&self) -> &str {
        "cli"
    }

    async fn send(&self, message: &str, _recipient: &str) -> anyhow::Result<()> {
        println!("{message}\n");
        Ok(())
    }

    async fn listen(&self, tx: tokio::sync::mpsc::Sender<ChannelMessage>) -> anyhow::Result<()> {
        let reader = BufReader::new(io::stdin());
        let mut lines = reader.lines();

        while let Some(line) = lines.next_line().await? {
            if is_exit(&line) {
                break;
            }
            let Some(msg) = Self::line_to_message(&line) else {
                continue;
            };
            if tx.send(msg).await.is_err() {
                break;
            }
        }
        Ok(())
    }
}
