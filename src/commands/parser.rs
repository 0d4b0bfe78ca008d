use super::traits::ParsedCommand;

/// Telegram caps command names at 32 characters of `[a-z0-9_]`.
const MAX_COMMAND_CHARS: usize = 32;

fn is_command_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Parse `/cmd`, `/cmd args` or `/cmd@botname args`.
///
/// Returns `None` for anything that is not a well-formed command, so text such
/// as `/etc/hosts is missing` or a lone `/` is treated as an ordinary message.
pub fn parse_command(text: &str) -> Option<ParsedCommand> {
    let trimmed = text.trim_start();
    let rest = trimmed.strip_prefix('/')?;

    let token_end = rest.find(char::is_whitespace).unwrap_or(rest.len());
    let (token, args) = rest.split_at(token_end);

    let (name, addressee) = match token.split_once('@') {
        Some((name, bot)) => {
            if bot.is_empty() || !bot.chars().all(is_command_char) {
                return None;
            }
            (name, Some(bot.to_string()))
        }
        None => (token, None),
    };

    if name.is_empty() || name.len() > MAX_COMMAND_CHARS || !name.chars().all(is_command_char) {
        return None;
    }

    Some(ParsedCommand {
        command: format!("/{}", name.to_ascii_lowercase()),
        addressee,
        args: args.trim().to_string(),
    })
}
