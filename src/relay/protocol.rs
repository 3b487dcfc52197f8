//! Relay wire format and message grammar.
//!
//! Text travels as UTF-16LE code units. Inbound buffers are zero-padded up
//! to the receive size, so trailing NULs are dropped before decoding.
//!
//! Grammar:
//! - `identifier` alone toggles that client's registration.
//! - `identifier >> text` is a chat line. The sender is the `\w+` run
//!   directly before the first ` >>`; `text` may itself contain `>>`.

use regex::Regex;

use crate::{AppError, Result};

/// Separator between sender and text in a chat line.
pub const CHAT_SEPARATOR: &str = " >> ";

const CHAT_SENDER_PATTERN: &str = r"(\w+) >>";
const IDENTIFIER_PATTERN: &str = r"\A\w+\z";

/// Classified inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Registration toggle for the identifier.
    Toggle(String),
    /// Chat line to broadcast.
    Chat {
        /// Identifier extracted from the line.
        sender: String,
        /// Full original text, relayed unchanged.
        text: String,
    },
    /// Nothing but padding or whitespace.
    Empty,
}

/// Compiled message grammar.
#[derive(Debug, Clone)]
pub struct Grammar {
    chat_sender: Regex,
    identifier: Regex,
}

impl Grammar {
    /// Compile the grammar.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if a pattern fails to compile.
    pub fn new() -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern)
                .map_err(|err| AppError::Protocol(format!("invalid pattern {pattern}: {err}")))
        };
        Ok(Self {
            chat_sender: compile(CHAT_SENDER_PATTERN)?,
            identifier: compile(IDENTIFIER_PATTERN)?,
        })
    }

    /// Whether `candidate` is a valid client identifier.
    #[must_use]
    pub fn is_identifier(&self, candidate: &str) -> bool {
        self.identifier.is_match(candidate)
    }

    /// Sender of a chat line, if `text` is one.
    #[must_use]
    pub fn chat_sender<'t>(&self, text: &'t str) -> Option<&'t str> {
        self.chat_sender
            .captures(text)
            .and_then(|captures| captures.get(1))
            .map(|sender| sender.as_str())
    }

    /// Classify decoded text.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` when a non-chat line is not a valid
    /// identifier.
    pub fn classify(&self, text: &str) -> Result<Inbound> {
        if let Some(sender) = self.chat_sender(text) {
            return Ok(Inbound::Chat {
                sender: sender.to_owned(),
                text: text.to_owned(),
            });
        }

        let candidate = text.trim_matches(|c: char| c == '\0' || c.is_whitespace());
        if candidate.is_empty() {
            return Ok(Inbound::Empty);
        }
        if !self.is_identifier(candidate) {
            return Err(AppError::Protocol(format!(
                "'{}' is neither a chat line nor an identifier",
                candidate.escape_debug()
            )));
        }
        Ok(Inbound::Toggle(candidate.to_owned()))
    }
}

/// Encode text as UTF-16LE bytes.
#[must_use]
pub fn encode(text: &str) -> Vec<u8> {
    text.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

/// Decode UTF-16LE bytes, dropping trailing NUL padding.
///
/// An odd trailing byte cannot form a code unit and is ignored; invalid
/// surrogates decode to U+FFFD.
#[must_use]
pub fn decode(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16_lossy(&units)
        .trim_end_matches('\0')
        .to_owned()
}

/// Format a chat line for `sender`.
#[must_use]
pub fn chat_line(sender: &str, text: &str) -> String {
    format!("{sender}{CHAT_SEPARATOR}{text}")
}
