use anyhow::Result;

use super::parser::parse_command;
use super::traits::{CommandContext, DispatchResult, SlashCommandHandler};

/// Routes slash commands to their handlers and everything else to the pipeline.
pub struct CommandDispatcher {
    commands: Vec<Box<dyn SlashCommandHandler>>,
    bot_username: Option<String>,
}

impl CommandDispatcher {
    pub fn new(commands: Vec<Box<dyn SlashCommandHandler>>) -> Self {
        Self {
            commands,
            bot_username: None,
        }
    }

    /// Commands addressed to any other `@bot` are ignored once this is set.
    pub fn with_bot_username(mut self, username: Option<String>) -> Self {
        self.bot_username = username.map(|u| u.trim_start_matches('@').to_string());
        self
    }

    /// `(command, description)` pairs as listed by `/help`.
    pub fn help_entries(&self) -> Vec<(&str, &str)> {
        self.commands
            .iter()
            .map(|handler| (handler.command(), handler.description()))
            .collect()
    }

    /// `(command, description)` pairs for the transport's command menu.
    pub fn menu(&self) -> Vec<(&str, &str)> {
        self.commands
            .iter()
            .map(|handler| (handler.command(), handler.menu_description()))
            .collect()
    }

    fn addressed_elsewhere(&self, addressee: Option<&str>) -> bool {
        match (addressee, self.bot_username.as_deref()) {
            (Some(addressee), Some(me)) => !addressee.eq_ignore_ascii_case(me),
            _ => false,
        }
    }

    pub async fn dispatch(&self, text: &str, context: &CommandContext) -> Result<DispatchResult> {
        let Some(parsed) = parse_command(text) else {
            return Ok(DispatchResult::Forward {
                text: text.to_string(),
            });
        };

        if self.addressed_elsewhere(parsed.addressee.as_deref()) {
            tracing::debug!(command = %parsed.command, "Ignoring command addressed to another bot");
            return Ok(DispatchResult::Ignored);
        }

        let Some(handler) = self
            .commands
            .iter()
            .find(|handler| handler.command() == parsed.command)
        else {
            tracing::debug!(user_id = %context.user_id, command = %parsed.command, "Unknown command");
            return Ok(DispatchResult::CommandHandled {
                output: format!(
                    "Unknown command {}. Send /help for the list of commands.",
                    parsed.command
                ),
            });
        };

        let result = handler.execute(&parsed.args, context).await?;
        Ok(DispatchResult::CommandHandled {
            output: result.output,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::create_dispatcher;
    use crate::sessions::{InMemorySessionStore, SessionStore};
    use std::sync::Arc;

    fn context() -> CommandContext {
        CommandContext {
            user_id: "42".to_string(),
            first_name: Some("Susan".to_string()),
            channel: "test".to_string(),
        }
    }

    fn dispatcher() -> (CommandDispatcher, Arc<InMemorySessionStore>) {
        let store = Arc::new(InMemorySessionStore::new());
        let dispatcher =
            create_dispatcher(store.clone()).with_bot_username(Some("@positronic_bot".into()));
        (dispatcher, store)
    }

    #[tokio::test]
    async fn plain_text_is_forwarded_untouched() {
        let (dispatcher, _) = dispatcher();
        let result = dispatcher.dispatch("  why? ", &context()).await.unwrap();
        assert_eq!(
            result,
            DispatchResult::Forward {
                text: "  why? ".to_string()
            }
        );
    }

    #[tokio::test]
    async fn help_lists_every_registered_command() {
        let (dispatcher, _) = dispatcher();
        let result = dispatcher.dispatch("/help", &context()).await.unwrap();
        let DispatchResult::CommandHandled { output } = result else {
            panic!("expected a command reply, got {result:?}");
        };
        for (cmd, desc) in dispatcher.help_entries() {
            assert!(output.contains(&format!("{cmd} - {desc}")), "{cmd}");
        }
    }

    #[tokio::test]
    async fn clear_addressed_to_this_bot_clears() {
        let (dispatcher, store) = dispatcher();
        store.append_exchange("42", "hi", "OK").await;

        let result = dispatcher
            .dispatch("/clear@Positronic_Bot", &context())
            .await
            .unwrap();
        assert!(matches!(result, DispatchResult::CommandHandled { .. }));
        assert_eq!(store.len("42").await, 0);
    }

    #[tokio::test]
    async fn command_for_another_bot_is_ignored() {
        let (dispatcher, store) = dispatcher();
        store.append_exchange("42", "hi", "OK").await;

        let result = dispatcher.dispatch("/clear@other_bot", &context()).await.unwrap();
        assert_eq!(result, DispatchResult::Ignored);
        assert_eq!(store.len("42").await, 2);
    }

    #[tokio::test]
    async fn unknown_command_gets_short_reply() {
        let (dispatcher, store) = dispatcher();
        let result = dispatcher.dispatch("/summon", &context()).await.unwrap();
        let DispatchResult::CommandHandled { output } = result else {
            panic!("expected a command reply, got {result:?}");
        };
        assert!(output.contains("/summon"));
        assert!(output.contains("/help"));
        assert_eq!(store.session_count(), 0);
    }

    #[tokio::test]
    async fn path_like_text_is_not_a_command() {
        let (dispatcher, _) = dispatcher();
        let result = dispatcher
            .dispatch("/usr/bin is full", &context())
            .await
            .unwrap();
        assert!(matches!(result, DispatchResult::Forward { .. }));
    }

    #[test]
    fn menu_uses_short_descriptions() {
        let (dispatcher, _) = dispatcher();
        assert_eq!(
            dispatcher.menu(),
            vec![
                ("/start", "Initialize conversation"),
                ("/help", "Display help message"),
                ("/about", "Learn about robopsychological principles"),
                ("/clear", "Reset conversation history"),
            ]
        );
        let help = dispatcher.help_entries();
        assert_eq!(help[1], ("/help", "Display this message"));
        assert_eq!(
            help[2],
            ("/about", "Information about robopsychological principles")
        );
    }

    #[test]
    fn menu_order_matches_registration() {
        let (dispatcher, _) = dispatcher();
        let names: Vec<&str> = dispatcher.menu().into_iter().map(|(c, _)| c).collect();
        assert_eq!(names, vec!["/start", "/help", "/about", "/clear"]);
    }
}
