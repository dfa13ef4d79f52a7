//! Control centre command parsing

use crate::registry::ServiceId;

/// Which services a command targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    One(ServiceId),
    All,
}

impl Target {
    fn parse(word: Option<&&str>) -> Option<Target> {
        match word {
            None => Some(Target::All),
            Some(w) if w.eq_ignore_ascii_case("all") => Some(Target::All),
            Some(w) => w.parse::<ServiceId>().ok().map(Target::One),
        }
    }

    pub fn services(&self) -> Vec<ServiceId> {
        match self {
            Target::One(id) => vec![*id],
            Target::All => ServiceId::ALL.to_vec(),
        }
    }
}

/// Commands accepted at the control prompt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Help,
    Status,
    Start(Target),
    Stop(Target),
    Restart(Target),
    Logs { service: ServiceId, lines: usize },
    Quit,
    Empty,
    Unknown { input: String },
}

impl ControlCommand {
    pub fn parse(input: &str) -> ControlCommand {
        let trimmed = input.trim();
        let trimmed = trimmed.strip_prefix('/').unwrap_or(trimmed);
        let parts: Vec<&str> = trimmed.split_whitespace().collect();
        let Some(verb) = parts.first() else {
            return ControlCommand::Empty;
        };

        let unknown = || ControlCommand::Unknown {
            input: input.trim().to_string(),
        };

        match verb.to_lowercase().as_str() {
            "help" | "h" | "?" => ControlCommand::Help,
            "status" | "st" | "ls" => ControlCommand::Status,
            "quit" | "exit" | "q" => ControlCommand::Quit,
            "start" => Target::parse(parts.get(1)).map(ControlCommand::Start).unwrap_or_else(unknown),
            "stop" => Target::parse(parts.get(1)).map(ControlCommand::Stop).unwrap_or_else(unknown),
            "restart" => Target::parse(parts.get(1)).map(ControlCommand::Restart).unwrap_or_else(unknown),
            "logs" | "log" => {
                let service = parts.get(1).and_then(|s| s.parse::<ServiceId>().ok());
                let lines = parts.get(2).and_then(|s| s.parse().ok()).unwrap_or(40);
                match service {
                    Some(service) => ControlCommand::Logs { service, lines },
                    None => unknown(),
                }
            }
            _ => unknown(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_start_targets() {
        assert_eq!(ControlCommand::parse("start gary"), ControlCommand::Start(Target::One(ServiceId::Gary)));
        assert_eq!(ControlCommand::parse("start"), ControlCommand::Start(Target::All));
        assert_eq!(ControlCommand::parse("/stop ALL"), ControlCommand::Stop(Target::All));
        assert_eq!(
            ControlCommand::parse("restart melodyflow"),
            ControlCommand::Restart(Target::One(ServiceId::Terry))
        );
    }

    #[test]
    fn test_parse_logs() {
        assert_eq!(
            ControlCommand::parse("logs jerry 10"),
            ControlCommand::Logs { service: ServiceId::Jerry, lines: 10 }
        );
        assert!(matches!(ControlCommand::parse("logs"), ControlCommand::Unknown { .. }));
    }

    #[test]
    fn test_parse_misc() {
        assert_eq!(ControlCommand::parse("   "), ControlCommand::Empty);
        assert_eq!(ControlCommand::parse("q"), ControlCommand::Quit);
        assert!(matches!(ControlCommand::parse("start redis"), ControlCommand::Unknown { .. }));
        assert_eq!(Target::All.services().len(), 3);
    }
}
