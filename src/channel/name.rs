//! Pipe naming convention.
//!
//! Endpoints are published as `\\.\pipe\<local-name>`. Only the local
//! machine (`.`) is addressable; remote hosts are rejected.

use std::fmt::{Display, Formatter};

use crate::{AppError, Result};

/// Prefix shared by every local pipe path.
pub const LOCAL_PIPE_PREFIX: &str = r"\\.\pipe\";

/// Longest accepted local name, matching the OS limit on pipe paths.
pub const MAX_LOCAL_NAME_LEN: usize = 247;

/// Validated name of a pipe endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PipeName {
    local: String,
}

impl PipeName {
    /// Build a name from its local part (the part after `\\.\pipe\`).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Argument` if the local name is empty, too long,
    /// or contains a path separator or NUL.
    pub fn new(local: impl Into<String>) -> Result<Self> {
        let local = local.into();
        if local.is_empty() {
            return Err(AppError::Argument("pipe name must not be empty".into()));
        }
        if local.chars().count() > MAX_LOCAL_NAME_LEN {
            return Err(AppError::Argument(format!(
                "pipe name exceeds {MAX_LOCAL_NAME_LEN} characters"
            )));
        }
        if local.contains(['\\', '/', '\0']) {
            return Err(AppError::Argument(format!(
                "pipe name '{}' contains a separator or NUL",
                local.escape_debug()
            )));
        }
        Ok(Self { local })
    }

    /// Parse either a full local pipe path or a bare local name.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Argument` for remote paths (`\\host\pipe\x`) and
    /// for any local name rejected by [`PipeName::new`].
    pub fn parse(raw: &str) -> Result<Self> {
        if let Some(local) = raw.strip_prefix(LOCAL_PIPE_PREFIX) {
            return Self::new(local);
        }
        if raw.starts_with(r"\\") {
            return Err(AppError::Argument(format!(
                "'{raw}' is not a local pipe path; only \\\\.\\pipe\\ is supported"
            )));
        }
        Self::new(raw)
    }

    /// Local part of the name.
    #[must_use]
    pub fn local_name(&self) -> &str {
        &self.local
    }

    /// Full published path, e.g. `\\.\pipe\ServerPipe`.
    #[must_use]
    pub fn path(&self) -> String {
        format!("{LOCAL_PIPE_PREFIX}{}", self.local)
    }
}

impl Display for PipeName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{LOCAL_PIPE_PREFIX}{}", self.local)
    }
}
