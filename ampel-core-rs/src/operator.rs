//! Operator console commands

use crate::error::CommandParseError;
use crate::types::{PriorityKind, Road};
use std::str::FromStr;

/// One line of operator input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleCommand {
    /// Issue a priority event from this node
    Priority(PriorityKind),
    /// Print the traffic summary
    Status,
    Quit,
}

pub const HELP: &str = "\
Commands:
  overload main|side   - Hold a road green (alias: hold)
  emergency            - All red at every intersection
  clear                - End the emergency
  status               - Show known traffic state
  quit                 - Exit";

impl FromStr for ConsoleCommand {
    type Err = CommandParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut parts = line.split_whitespace();
        let command = parts.next().ok_or(CommandParseError::Empty)?;

        match command.to_ascii_lowercase().as_str() {
            "overload" | "hold" => {
                let road = parts.next().ok_or(CommandParseError::MissingRoad)?;
                let kind = match road.parse::<Road>()? {
                    Road::Main => PriorityKind::OverloadMain,
                    Road::Side => PriorityKind::OverloadSide,
                };
                Ok(ConsoleCommand::Priority(kind))
            }
            "emergency" => Ok(ConsoleCommand::Priority(PriorityKind::Emergency)),
            "clear" => Ok(ConsoleCommand::Priority(PriorityKind::EmergencyClear)),
            "status" | "state" => Ok(ConsoleCommand::Status),
            "quit" | "exit" => Ok(ConsoleCommand::Quit),
            other => Err(CommandParseError::Unknown(other.to_string())),
        }
    }
}

impl FromStr for Road {
    type Err = CommandParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "main" => Ok(Road::Main),
            "side" => Ok(Road::Side),
            other => Err(CommandParseError::UnknownRoad(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_priority_commands() {
        assert_eq!(
            "overload main".parse(),
            Ok(ConsoleCommand::Priority(PriorityKind::OverloadMain))
        );
        assert_eq!(
            "  HOLD side ".parse(),
            Ok(ConsoleCommand::Priority(PriorityKind::OverloadSide))
        );
        assert_eq!(
            "emergency".parse(),
            Ok(ConsoleCommand::Priority(PriorityKind::Emergency))
        );
        assert_eq!(
            "clear".parse(),
            Ok(ConsoleCommand::Priority(PriorityKind::EmergencyClear))
        );
    }

    #[test]
    fn test_parse_console_commands() {
        assert_eq!("status".parse(), Ok(ConsoleCommand::Status));
        assert_eq!("exit".parse(), Ok(ConsoleCommand::Quit));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!("".parse::<ConsoleCommand>(), Err(CommandParseError::Empty));
        assert_eq!(
            "overload".parse::<ConsoleCommand>(),
            Err(CommandParseError::MissingRoad)
        );
        assert_eq!(
            "overload diagonal".parse::<ConsoleCommand>(),
            Err(CommandParseError::UnknownRoad("diagonal".to_string()))
        );
        assert_eq!(
            "propose x 1".parse::<ConsoleCommand>(),
            Err(CommandParseError::Unknown("propose".to_string()))
        );
    }
}
