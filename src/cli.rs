//! CLI utilities for sleet.
//!
//! The utilities present in this module back the `sleet_cli` binary: an
//! interactive prompt and a reader for script files.
//!
//! # Example
//! ```rust
//! use sleet::Command;
//!
//! let cmd: Command = ".timeout 250".try_into().unwrap();
//! assert_eq!(cmd, Command::Timeout(Some(std::time::Duration::from_millis(250))));
//! ```
use std::{
    fs, io,
    io::{BufRead, Write},
    path::Path,
    time::Duration,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("unrecognized command '{0}'")]
    UnrecognizedCommand(String),

    #[error("invalid '{command}' command, {reason}")]
    InvalidCommandArguments { command: String, reason: String },

    #[error("failed to read command: {0}")]
    Io(#[from] io::Error),
}

/// Possible commands from a user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Exit command `.exit`, also produced at end of input.
    Exit,
    /// `.timeout <ms>` overrides the wait bound of every query, `.timeout off`
    /// restores the adaptive timeout.
    Timeout(Option<Duration>),
    /// `.columns` describes the columns of the last result.
    Columns,
    /// Query text sent to the server as is.
    Statement(String),
}

impl TryFrom<&str> for Command {
    type Error = CommandError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let mut parts = value.split_whitespace();
        match parts.next() {
            Some(".exit") => Ok(Command::Exit),
            Some(".columns") => Ok(Command::Columns),
            Some(".timeout") => {
                let invalid = |reason: &str| CommandError::InvalidCommandArguments {
                    command: ".timeout".into(),
                    reason: reason.into(),
                };
                match (parts.next(), parts.next()) {
                    (Some("off"), None) => Ok(Command::Timeout(None)),
                    (Some(ms), None) => ms
                        .parse::<u64>()
                        .ok()
                        .filter(|ms| *ms > 0)
                        .map(|ms| Command::Timeout(Some(Duration::from_millis(ms))))
                        .ok_or_else(|| invalid("expected a positive number of milliseconds")),
                    _ => Err(invalid("usage: .timeout <ms>|off")),
                }
            }
            Some(s) if s.starts_with('.') => Err(CommandError::UnrecognizedCommand(s.to_string())),
            _ => Ok(Command::Statement(value.trim().trim_end_matches(';').to_string())),
        }
    }
}

/// Prompt user for a command.
pub fn prompt<R, W>(mut reader: R, mut writer: W) -> Result<Command, CommandError>
where
    R: BufRead,
    W: Write,
{
    let mut s = String::default();
    write!(&mut writer, "> ")?;
    writer.flush()?;

    if reader.read_line(&mut s)? == 0 {
        return Ok(Command::Exit);
    }
    s.as_str().try_into()
}

/// Reads the statements of a script file.
///
/// Statements are separated by `;` and `--` starts a comment running to the end of
/// the line.
pub fn read_script(path: impl AsRef<Path>) -> io::Result<Vec<String>> {
    let text = fs::read_to_string(path)?;
    let stripped: String = text
        .lines()
        .map(|line| line.split_once("--").map_or(line, |(code, _)| code))
        .collect::<Vec<_>>()
        .join("\n");

    Ok(stripped
        .split(';')
        .map(|s| s.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|s| !s.is_empty())
        .collect())
}

#[cfg(test)]
mod tests {
    use tempdir::TempDir;

    use super::*;

    #[test]
    fn prompt_prints_correctly() {
        let input = b".exit\n";
        let mut output = Vec::new();

        prompt(&input[..], &mut output).unwrap();

        let output = String::from_utf8(output).expect("not valid UTF-8");
        assert_eq!("> ", output);
    }

    #[test]
    fn prompt_handles_statements() {
        let input = b"select * from t;\n";
        let mut output = Vec::new();

        let res = prompt(&input[..], &mut output).unwrap();
        assert_eq!(Command::Statement("select * from t".into()), res);
    }

    #[test]
    fn end_of_input_exits() {
        let mut output = Vec::new();
        assert_eq!(prompt(&b""[..], &mut output).unwrap(), Command::Exit);
    }

    #[test]
    fn timeout_command() {
        let cases = vec![
            (".timeout 250", Some(Command::Timeout(Some(Duration::from_millis(250))))),
            (".timeout off", Some(Command::Timeout(None))),
            (".timeout", None),
            (".timeout 0", None),
            (".timeout soon", None),
            (".timeout 1 2", None),
        ];

        for (input, expected) in cases {
            let res: Result<Command, _> = input.try_into();
            match expected {
                Some(cmd) => assert_eq!(res.unwrap(), cmd, "{input}"),
                None => assert!(
                    matches!(res, Err(CommandError::InvalidCommandArguments { .. })),
                    "{input}"
                ),
            }
        }
    }

    #[test]
    fn prompt_unrecognized_command() {
        let input = b".something_wrong\n";
        let mut output = Vec::new();

        let err = prompt(&input[..], &mut output).unwrap_err();
        assert_eq!(err.to_string(), "unrecognized command '.something_wrong'");
    }

    #[test]
    fn script_statements_and_comments() {
        let dir = TempDir::new("sleet").unwrap();
        let path = dir.path().join("script.sql");
        fs::write(
            &path,
            "-- header\nselect *\n  from t; -- first\n\nselect 1;;\nselect 'a' -- trailing\n",
        )
        .unwrap();

        let statements = read_script(&path).unwrap();
        assert_eq!(
            statements,
            vec!["select * from t", "select 1", "select 'a'"]
        );
    }

    #[test]
    fn missing_script() {
        let dir = TempDir::new("sleet").unwrap();
        assert!(read_script(dir.path().join("nope.sql")).is_err());
    }
}
