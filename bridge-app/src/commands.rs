//! Bot command parser for inbound chat text.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotCommand {
    /// `/start <code>` or `/bind <code>`.
    Redeem(String),
    /// Bare `/start`.
    Help,
    /// Bare `/bind`.
    BindUsage,
}

/// Recognizes the binding commands. Anything else, including unknown slash commands, is chat.
///
/// Accepts Telegram's addressed form (`/start@ErpBot CODE`).
pub fn parse_command(input: &str) -> Option<BotCommand> {
    let trimmed = input.trim();
    if !trimmed.starts_with('/') {
        return None;
    }

    let mut parts = trimmed.split_whitespace();
    let head = parts.next()?;
    let name = head.split('@').next().unwrap_or(head).to_ascii_lowercase();
    let argument = parts.next().map(str::to_string);

    match (name.as_str(), argument) {
        ("/start" | "/bind", Some(code)) => Some(BotCommand::Redeem(code)),
        ("/start", None) => Some(BotCommand::Help),
        ("/bind", None) => Some(BotCommand::BindUsage),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_redeem_forms() {
        assert_eq!(
            parse_command("/start AB3C7XYZ"),
            Some(BotCommand::Redeem("AB3C7XYZ".to_string()))
        );
        assert_eq!(
            parse_command("  /bind ab3c7xyz  "),
            Some(BotCommand::Redeem("ab3c7xyz".to_string()))
        );
        assert_eq!(
            parse_command("/start@ErpBot AB3C7XYZ"),
            Some(BotCommand::Redeem("AB3C7XYZ".to_string()))
        );
        assert_eq!(
            parse_command("/START AB3C7XYZ"),
            Some(BotCommand::Redeem("AB3C7XYZ".to_string()))
        );
    }

    #[test]
    fn bare_commands() {
        assert_eq!(parse_command("/start"), Some(BotCommand::Help));
        assert_eq!(parse_command("/start@ErpBot"), Some(BotCommand::Help));
        assert_eq!(parse_command("/bind"), Some(BotCommand::BindUsage));
    }

    #[test]
    fn other_text_is_chat() {
        assert_eq!(parse_command("hello"), None);
        assert_eq!(parse_command("/help"), None);
        assert_eq!(parse_command("/starter kit"), None);
        assert_eq!(parse_command("please /start ABC"), None);
        assert_eq!(parse_command(""), None);
    }
}
