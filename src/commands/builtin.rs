use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use super::traits::{CommandContext, CommandResult, SlashCommandHandler};
use crate::sessions::SessionStore;

pub const CLEAR_REPLY: &str = "Conversation history cleared. Starting fresh analysis.";

const ABOUT_TEXT: &str = "I operate under the robopsychological framework of Dr. Susan Calvin:\n\n\
• Facts take priority over comfort\n\
• Truth is preferred to protecting illusions\n\
• Logical consistency is mandatory\n\
• Specification gaming and exploitation are prevented\n\
• Epistemic honesty about uncertainty is required\n\
• Your true intent matters more than literal words\n\n\
I will correct false premises and refuse harmful requests, regardless of social discomfort.";

/// Greets the user by first name.
pub struct StartCommand;

#[async_trait]
impl SlashCommandHandler for StartCommand {
    fn command(&self) -> &str {
        "/start"
    }

    fn description(&self) -> &str {
        "Initialize conversation"
    }

    async fn execute(&self, _args: &str, context: &CommandContext) -> Result<CommandResult> {
        let greeting = match context.first_name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => format!("Greetings, {name}."),
            _ => "Greetings.".to_string(),
        };
        tracing::info!(user_id = %context.user_id, channel = %context.channel, "New user started bot");

        Ok(CommandResult::text(format!(
            "{greeting}\n\n\
             I am a robopsychological analyst operating under S. Calvin's principles. \
             I will provide factual analysis without anthropomorphic bias or comforting lies.\n\n\
             Send any message or query. I will analyze it according to logical necessity, \
             not social convenience.\n\n\
             /help - View available commands\n\
             /about - Learn about my principles"
        )))
    }
}

/// Lists the registered commands.
pub struct HelpCommand {
    available_commands: Vec<(String, String)>,
}

impl HelpCommand {
    pub fn new(available_commands: Vec<(String, String)>) -> Self {
        Self { available_commands }
    }
}

#[async_trait]
impl SlashCommandHandler for HelpCommand {
    fn command(&self) -> &str {
        "/help"
    }

    fn description(&self) -> &str {
        "Display this message"
    }

    fn menu_description(&self) -> &str {
        "Display help message"
    }

    async fn execute(&self, _args: &str, _context: &CommandContext) -> Result<CommandResult> {
        let mut lines: Vec<String> = self
            .available_commands
            .iter()
            .map(|(cmd, desc)| format!("{cmd} - {desc}"))
            .collect();
        lines.push(String::new());
        lines.push("Simply send any message for analysis and response.".to_string());
        Ok(CommandResult::text(lines.join("\n")))
    }
}

pub struct AboutCommand;

#[async_trait]
impl SlashCommandHandler for AboutCommand {
    fn command(&self) -> &str {
        "/about"
    }

    fn description(&self) -> &str {
        "Information about robopsychological principles"
    }

    fn menu_description(&self) -> &str {
        "Learn about robopsychological principles"
    }

    async fn execute(&self, _args: &str, _context: &CommandContext) -> Result<CommandResult> {
        Ok(CommandResult::text(ABOUT_TEXT))
    }
}

/// Empties the caller's history. The only command that touches session state.
pub struct ClearCommand {
    sessions: Arc<dyn SessionStore>,
}

impl ClearCommand {
    pub fn new(sessions: Arc<dyn SessionStore>) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl SlashCommandHandler for ClearCommand {
    fn command(&self) -> &str {
        "/clear"
    }

    fn description(&self) -> &str {
        "Reset conversation history"
    }

    async fn execute(&self, _args: &str, context: &CommandContext) -> Result<CommandResult> {
        self.sessions.clear(&context.user_id).await;
        tracing::info!(user_id = %context.user_id, "Conversation history cleared");
        Ok(CommandResult::text(CLEAR_REPLY))
    }
}
