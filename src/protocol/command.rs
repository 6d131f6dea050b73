//! Commands as sent over the wire.
//!
//! A [`Command`] is a verb plus ordered, typed arguments. Rendering follows
//! the MPD request grammar:
//!
//! * strings are double-quoted with `\` and `"` escaped, and embedded
//!   newlines removed so a single argument can never split a request
//! * integers and floats are rendered in decimal
//! * booleans are rendered as `1` or `0`
//!
//! # Example
//!
//! ```rust
//! use mpdhub::protocol::Command;
//!
//! let cmd = Command::new("find").arg("Artist").arg("Guns \"N\" Roses");
//! assert_eq!(cmd.to_string(), r#"find "Artist" "Guns \"N\" Roses""#);
//! ```

use std::fmt::{self, Write};

/// A single command argument.
#[derive(Clone, Debug, PartialEq)]
pub enum Arg {
    Str(String),
    Bool(bool),
    Int(i64),
    Float(f64),
}

impl From<&str> for Arg {
    fn from(v: &str) -> Self {
        Self::Str(v.to_owned())
    }
}

impl From<String> for Arg {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<&String> for Arg {
    fn from(v: &String) -> Self {
        Self::Str(v.clone())
    }
}

impl From<bool> for Arg {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Arg {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for Arg {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<u32> for Arg {
    fn from(v: u32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<usize> for Arg {
    fn from(v: usize) -> Self {
        Self::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<f64> for Arg {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl fmt::Display for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arg::Str(s) => {
                f.write_char('"')?;
                for chr in s.chars() {
                    match chr {
                        '\\' | '"' => {
                            f.write_char('\\')?;
                            f.write_char(chr)?;
                        }
                        '\n' | '\r' => {}
                        _ => f.write_char(chr)?,
                    }
                }
                f.write_char('"')
            }
            Arg::Bool(b) => f.write_char(if *b { '1' } else { '0' }),
            Arg::Int(i) => write!(f, "{i}"),
            Arg::Float(v) => write!(f, "{v}"),
        }
    }
}

/// A verb with its arguments.
#[derive(Clone, Debug, PartialEq)]
pub struct Command {
    verb: String,
    args: Vec<Arg>,
}

impl Command {
    #[must_use]
    pub fn new(verb: impl Into<String>) -> Self {
        Self {
            verb: verb.into(),
            args: Vec::new(),
        }
    }

    /// Appends an argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<Arg>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn verb(&self) -> &str {
        &self.verb
    }

    #[must_use]
    pub fn args(&self) -> &[Arg] {
        &self.args
    }
}

/// Renders the request line without the trailing newline.
impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The verb is never quoted; strip newlines so it cannot break framing.
        for chr in self.verb.chars().filter(|chr| *chr != '\n' && *chr != '\r') {
            f.write_char(chr)?;
        }
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_typed_arguments() {
        let cmd = Command::new("seekcur").arg(12.5);
        assert_eq!(cmd.to_string(), "seekcur 12.5");

        let cmd = Command::new("random").arg(true);
        assert_eq!(cmd.to_string(), "random 1");

        let cmd = Command::new("setvol").arg(-3);
        assert_eq!(cmd.to_string(), "setvol -3");
    }

    #[test]
    fn escapes_strings() {
        let cmd = Command::new("add").arg(r#"a\b"c"#);
        assert_eq!(cmd.to_string(), r#"add "a\\b\"c""#);
    }

    #[test]
    fn strips_newlines() {
        let cmd = Command::new("password").arg("secret\nkill");
        assert_eq!(cmd.to_string(), r#"password "secretkill""#);

        let cmd = Command::new("pi\nng");
        assert_eq!(cmd.to_string(), "ping");
    }
}
