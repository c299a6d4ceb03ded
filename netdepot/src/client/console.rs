//! The interactive prompt: command parsing and serialised output.
//!
//! Status lines from the synchronous commands and from detached transfer
//! tasks interleave on one terminal; [`Console`] hands each line out as a
//! single unit under one lock so they never shear. The lock is only ever
//! held across a synchronous print, never across a suspension point.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Mutex;

/// One line of user input, parsed.
#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    /// Probe the group for live servers.
    Discover,
    /// Query every catalog; the empty pattern matches everything.
    Search(String),
    /// Download a name from the server that last advertised it.
    Fetch(String),
    /// Offer a local file to the server with the most room.
    Upload(PathBuf),
    /// Order every holder to drop a name.
    Remove(String),
    /// Leave the prompt.
    Exit,
    /// Unknown verb or missing argument; the line is ignored.
    Invalid,
}

impl Command {
    /// Parses one prompt line. Verbs are case-insensitive. `search` accepts
    /// a missing or empty pattern; every other argument must be non-empty,
    /// and `discover`/`exit` take none at all.
    #[must_use]
    pub fn parse(line: &str) -> Self {
        let (verb, rest) = match line.split_once(' ') {
            Some((verb, rest)) => (verb, Some(rest)),
            None => (line, None),
        };
        match (verb.to_ascii_uppercase().as_str(), rest) {
            ("DISCOVER", None) => Self::Discover,
            ("SEARCH", rest) => Self::Search(rest.unwrap_or_default().to_owned()),
            ("FETCH", Some(name)) if !name.is_empty() => Self::Fetch(name.to_owned()),
            ("UPLOAD", Some(path)) if !path.is_empty() => Self::Upload(PathBuf::from(path)),
            ("REMOVE", Some(name)) if !name.is_empty() => Self::Remove(name.to_owned()),
            ("EXIT", None) => Self::Exit,
            _ => Self::Invalid,
        }
    }
}

/// Serialises user-facing output: every line is emitted as one unit.
#[derive(Debug, Default)]
pub struct Console {
    gate: Mutex<()>,
}

impl Console {
    /// Prints one status line to stdout.
    pub fn line(&self, message: fmt::Arguments<'_>) {
        let _gate = self.gate.lock().expect("console lock poisoned");
        println!("{message}");
    }

    /// Prints the protocol's notice for a datagram that failed validation.
    pub fn skip_package(&self, from: SocketAddr, reason: impl fmt::Display) {
        let _gate = self.gate.lock().expect("console lock poisoned");
        eprintln!(
            "[PCKG ERROR] Skipping invalid package from {}:{}. {reason}",
            from.ip(),
            from.port()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbs_are_case_insensitive() {
        assert_eq!(Command::parse("discover"), Command::Discover);
        assert_eq!(Command::parse("DiScOvEr"), Command::Discover);
        assert_eq!(Command::parse("EXIT"), Command::Exit);
    }

    #[test]
    fn search_accepts_missing_and_empty_patterns() {
        assert_eq!(Command::parse("search"), Command::Search(String::new()));
        assert_eq!(Command::parse("search "), Command::Search(String::new()));
        assert_eq!(
            Command::parse("search x"),
            Command::Search("x".to_owned())
        );
    }

    #[test]
    fn arguments_are_required_elsewhere() {
        assert_eq!(Command::parse("fetch"), Command::Invalid);
        assert_eq!(Command::parse("fetch "), Command::Invalid);
        assert_eq!(
            Command::parse("fetch hello.bin"),
            Command::Fetch("hello.bin".to_owned())
        );
        assert_eq!(Command::parse("upload"), Command::Invalid);
        assert_eq!(
            Command::parse("upload /tmp/a b"),
            Command::Upload(PathBuf::from("/tmp/a b"))
        );
        assert_eq!(Command::parse("remove"), Command::Invalid);
        assert_eq!(
            Command::parse("remove dup.txt"),
            Command::Remove("dup.txt".to_owned())
        );
    }

    #[test]
    fn bare_verbs_reject_trailing_arguments() {
        assert_eq!(Command::parse("discover now"), Command::Invalid);
        assert_eq!(Command::parse("exit now"), Command::Invalid);
        assert_eq!(Command::parse("quit"), Command::Invalid);
        assert_eq!(Command::parse(""), Command::Invalid);
    }
}
