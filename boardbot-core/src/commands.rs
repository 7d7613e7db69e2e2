// ABOUTME: Parsing of bot commands from message text
// ABOUTME: First word after an optional bot-name mention selects the command; anything else asks for a card

/// A command addressed to the bot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Drop the org link and authorize again
    Reinit,
    Add(Vec<String>),
    Remove(Vec<String>),
    Help,
    Info,
    /// Anything else: show the provisioning card
    Provision,
}

impl Command {
    /// Parse message text. None when the message is not for the bot.
    ///
    /// `bot_first_name` is the first word of the bot's display name; clients
    /// render a mention as that word, so it is stripped when leading.
    pub fn parse(text: &str, bot_first_name: &str) -> Option<Self> {
        let mut words: Vec<&str> = text.split_whitespace().collect();
        let first = words.first().copied()?;
        // Messages addressed to everyone are not for the bot
        if first == "All" {
            return None;
        }
        if !bot_first_name.is_empty() && first.eq_ignore_ascii_case(bot_first_name) {
            words.remove(0);
        }

        let Some((head, rest)) = words.split_first() else {
            return Some(Self::Provision);
        };
        let args = || rest.iter().map(|s| s.to_string()).collect::<Vec<_>>();

        Some(match head.to_ascii_lowercase().as_str() {
            "reinit" | "reinitialize" => Self::Reinit,
            "add" => Self::Add(args()),
            "remove" => Self::Remove(args()),
            "help" => Self::Help,
            "info" => Self::Info,
            _ => Self::Provision,
        })
    }

    /// Label for logs and metrics
    pub fn name(&self) -> &'static str {
        match self {
            Self::Reinit => "reinit",
            Self::Add(_) => "add",
            Self::Remove(_) => "remove",
            Self::Help => "help",
            Self::Info => "info",
            Self::Provision => "provision",
        }
    }
}

/// First word of a display name, used to recognise mentions
pub fn first_name(display_name: &str) -> &str {
    display_name.split_whitespace().next().unwrap_or("")
}
