//! Slash-command metadata and parsing.

/// Static slash command metadata used by parsing and `/help`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlashCommand {
    pub name: &'static str,
    pub description: &'static str,
}

/// Built-in slash commands for the chat loop.
pub const SLASH_COMMANDS: [SlashCommand; 7] = [
    SlashCommand {
        name: "/retry",
        description: "Re-send the last message.",
    },
    SlashCommand {
        name: "/clear",
        description: "Start a fresh conversation.",
    },
    SlashCommand {
        name: "/key",
        description: "API key: /key <key> [base-url] | /key clear | /key.",
    },
    SlashCommand {
        name: "/usage",
        description: "Guest quota: /usage | /usage reset.",
    },
    SlashCommand {
        name: "/help",
        description: "List available slash commands.",
    },
    SlashCommand {
        name: "/quit",
        description: "Exit the chat.",
    },
    SlashCommand {
        name: "/exit",
        description: "Exit the chat.",
    },
];

/// Parsed slash command actions consumed by the chat loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlashCommandAction {
    Quit,
    Help,
    Retry,
    Clear,
    KeyStatus,
    KeySet {
        key: String,
        base_url: Option<String>,
    },
    KeyClear,
    Usage,
    UsageReset,
    Unknown(String),
}

/// Parse a slash command from user input.
///
/// Returns `None` if the input is not a slash command.
pub fn parse_slash_command(input: &str) -> Option<SlashCommandAction> {
    let trimmed = input.trim();
    if !trimmed.starts_with('/') {
        return None;
    }

    let mut words = trimmed.split_whitespace();
    let token = words.next().unwrap_or("").to_ascii_lowercase();
    let first = words.next();
    let second = words.next();

    let action = match token.as_str() {
        "/" | "/help" => SlashCommandAction::Help,
        "/quit" | "/exit" | "/q" => SlashCommandAction::Quit,
        "/retry" => SlashCommandAction::Retry,
        "/clear" => SlashCommandAction::Clear,
        "/key" => match first {
            None => SlashCommandAction::KeyStatus,
            Some(word) if word.eq_ignore_ascii_case("clear") => SlashCommandAction::KeyClear,
            Some(key) => SlashCommandAction::KeySet {
                key: key.to_string(),
                base_url: second.map(str::to_string),
            },
        },
        "/usage" => match first {
            Some(word) if word.eq_ignore_ascii_case("reset") => SlashCommandAction::UsageReset,
            _ => SlashCommandAction::Usage,
        },
        other => SlashCommandAction::Unknown(other.to_string()),
    };

    Some(action)
}
