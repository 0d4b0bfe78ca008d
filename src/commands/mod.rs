//! Slash commands handled before a message reaches the pipeline.

pub mod builtin;
pub mod dispatcher;
pub mod parser;
pub mod traits;

pub use builtin::{AboutCommand, ClearCommand, HelpCommand, StartCommand, CLEAR_REPLY};
pub use dispatcher::CommandDispatcher;
pub use parser::parse_command;
pub use traits::{
    CommandContext, CommandResult, DispatchResult, ParsedCommand, SlashCommandHandler,
};

use crate::sessions::SessionStore;
use std::sync::Arc;

/// The bot's command set: `/start`, `/help`, `/about`, `/clear`.
pub fn create_dispatcher(sessions: Arc<dyn SessionStore>) -> CommandDispatcher {
    let clear = ClearCommand::new(sessions);
    let help = HelpCommand::new(Vec::new());
    let help_entries = [
        (StartCommand.command(), StartCommand.description()),
        (help.command(), help.description()),
        (AboutCommand.command(), AboutCommand.description()),
        (clear.command(), clear.description()),
    ]
    .iter()
    .map(|(cmd, desc)| ((*cmd).to_string(), (*desc).to_string()))
    .collect();

    CommandDispatcher::new(vec![
        Box::new(StartCommand),
        Box::new(HelpCommand::new(help_entries)),
        Box::new(AboutCommand),
        Box::new(clear),
    ])
}
