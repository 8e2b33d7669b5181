//! Operator commands read from stdin by the binaries

/// One console line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `q` or `quit`: orderly shutdown
    Quit,
    /// `add <key>`: accept tokens derived from `key`
    Add(String),
    /// `remove <key>`
    Remove(String),
    /// `list`: print registered keys
    List,
    /// Blank line
    Empty,
    Unknown(String),
}

impl Command {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };

        match (word, rest) {
            ("", _) => Command::Empty,
            ("q" | "quit", "") => Command::Quit,
            ("list", "") => Command::List,
            ("add", key) if !key.is_empty() => Command::Add(key.to_string()),
            ("remove", key) if !key.is_empty() => Command::Remove(key.to_string()),
            _ => Command::Unknown(line.to_string()),
        }
    }

    /// Whether the command only makes sense on the server
    pub fn is_key_management(&self) -> bool {
        matches!(self, Command::Add(_) | Command::Remove(_) | Command::List)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_quit() {
        assert_eq!(Command::parse("q"), Command::Quit);
        assert_eq!(Command::parse("  quit\n"), Command::Quit);
        assert_eq!(Command::parse("q now"), Command::Unknown("q now".to_string()));
    }

    #[test]
    fn test_parse_key_commands() {
        assert_eq!(Command::parse("add alpha"), Command::Add("alpha".to_string()));
        assert_eq!(Command::parse("remove  beta "), Command::Remove("beta".to_string()));
        assert_eq!(Command::parse("list"), Command::List);
        assert!(Command::parse("list").is_key_management());
        assert!(!Command::parse("q").is_key_management());
    }

    #[test]
    fn test_parse_incomplete_and_unknown() {
        assert_eq!(Command::parse(""), Command::Empty);
        assert_eq!(Command::parse("   "), Command::Empty);
        assert_eq!(Command::parse("add"), Command::Unknown("add".to_string()));
        assert_eq!(Command::parse("stop"), Command::Unknown("stop".to_string()));
    }
}
