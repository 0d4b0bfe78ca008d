use anyhow::Result;
use async_trait::async_trait;

/// A slash command split out of an incoming message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    /// Lowercased command with its leading slash, e.g. `"/help"`.
    pub command: String,
    /// Bot named in `/cmd@botname`, without the `@`.
    pub addressee: Option<String>,
    /// Everything after the command token, trimmed.
    pub args: String,
}

#[derive(Debug, Clone)]
pub struct CommandContext {
    pub user_id: String,
    pub first_name: Option<String>,
    pub channel: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub output: String,
}

impl CommandResult {
    pub fn text(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
        }
    }
}

#[async_trait]
pub trait SlashCommandHandler: Send + Sync {
    fn command(&self) -> &str;
    fn description(&self) -> &str;
    /// Shorter text for the platform's command menu.
    fn menu_description(&self) -> &str {
        self.description()
    }
    async fn execute(&self, args: &str, context: &CommandContext) -> Result<CommandResult>;
}

/// What the transport should do with an incoming message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchResult {
    /// A command ran; send its output back.
    CommandHandled { output: String },
    /// Free text for the message pipeline.
    Forward { text: String },
    /// A command meant for another bot in the same chat.
    Ignored,
}
