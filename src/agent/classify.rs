//! Incoming-request classification
//!
//! Safe-quick commands run synchronously in the agent's loop thread even
//! while an agentic turn is streaming. Disruptive commands would mutate
//! conversation or model state and are refused while a turn is in flight.
//! Everything else is agentic and goes through the single-slot executor.

/// How the agent loop routes one incoming input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandClass {
    SafeQuick,
    Disruptive,
    Agentic,
}

pub fn classify(input: &str) -> CommandClass {
    let trimmed = input.trim();
    if !trimmed.starts_with('/') {
        return CommandClass::Agentic;
    }

    let mut parts = trimmed.split_whitespace();
    let command = parts.next().unwrap_or("");
    let has_args = parts.next().is_some();

    match command {
        "/info" | "/context" | "/inspect" => CommandClass::SafeQuick,
        "/model" if !has_args => CommandClass::SafeQuick,
        "/model" => CommandClass::Disruptive,
        "/conv" | "/new" | "/condense" | "/plan" | "/code" => CommandClass::Disruptive,
        _ => CommandClass::Agentic,
    }
}

/// The two agentic sub-modes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnKind {
    /// `/task <prompt>`: one-shot turn in a fresh, isolated context
    Task(String),
    /// Everything else continues the agent's bound conversation
    Ask(String),
}

pub fn parse_turn(input: &str) -> TurnKind {
    let trimmed = input.trim();
    if let Some(rest) = trimmed.strip_prefix("/task ") {
        return TurnKind::Task(rest.trim().to_string());
    }
    if trimmed == "/task" {
        return TurnKind::Task(String::new());
    }
    TurnKind::Ask(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_quick_commands() {
        for input in ["/info", "/context", "/inspect", "/model", "  /info  "] {
            assert_eq!(classify(input), CommandClass::SafeQuick, "{}", input);
        }
    }

    #[test]
    fn test_model_with_argument_is_disruptive() {
        assert_eq!(classify("/model gpt4o"), CommandClass::Disruptive);
        assert_eq!(classify("/model"), CommandClass::SafeQuick);
    }

    #[test]
    fn test_disruptive_commands() {
        for input in ["/conv", "/new title", "/condense", "/plan", "/code"] {
            assert_eq!(classify(input), CommandClass::Disruptive, "{}", input);
        }
    }

    #[test]
    fn test_everything_else_is_agentic() {
        for input in ["hello there", "/task list files", "/cost", "/unknown", ""] {
            assert_eq!(classify(input), CommandClass::Agentic, "{:?}", input);
        }
    }

    #[test]
    fn test_parse_turn_modes() {
        assert_eq!(
            parse_turn("/task summarize the repo"),
            TurnKind::Task("summarize the repo".into())
        );
        assert_eq!(parse_turn("/task"), TurnKind::Task(String::new()));
        assert_eq!(
            parse_turn("what changed?"),
            TurnKind::Ask("what changed?".into())
        );
    }
}
