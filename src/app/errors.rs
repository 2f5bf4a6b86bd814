// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::fmt;

/// Stable machine-readable codes the RPC layer can switch on.
pub mod codes {
    pub const AUTHENTICATION_FAILURE: &str = "authentication_failure";
    pub const CONNECTION_FAILURE: &str = "connection_failure";
    pub const COMMAND_FAILURE: &str = "command_failure";
    pub const NOT_FOUND: &str = "not_found";
    pub const INVALID_ARGUMENT: &str = "invalid_argument";
    pub const MISSING_CREDENTIALS: &str = "missing_credentials";
    pub const INTERNAL_ERROR: &str = "internal_error";
    pub const REMOTE_ERROR: &str = "remote_error";
}

/// Broad failure classes per the launcher's contract: transport failures
/// (connect/auth), command failures (the remote command produced stderr or a
/// non-zero exit), not-found (empty accounting rows, no grep match), and
/// input validation rejected before any remote call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchErrorKind {
    Transport,
    Command,
    NotFound,
    InvalidArgument,
    Internal,
}

#[derive(Debug, Clone)]
pub struct LaunchError {
    kind: LaunchErrorKind,
    code: &'static str,
    message: String,
    context: Option<String>,
}

impl LaunchError {
    pub fn new(kind: LaunchErrorKind, code: &'static str) -> Self {
        Self {
            kind,
            code,
            message: code.to_string(),
            context: None,
        }
    }

    pub fn with_message(
        kind: LaunchErrorKind,
        code: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
            context: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn kind(&self) -> LaunchErrorKind {
        self.kind
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }
}

impl fmt::Display for LaunchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ctx) = &self.context {
            write!(f, "{} ({})", self.message, ctx)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl std::error::Error for LaunchError {}

pub type LaunchResult<T> = Result<T, LaunchError>;

pub(crate) fn invalid_argument(message: impl Into<String>) -> LaunchError {
    LaunchError::with_message(
        LaunchErrorKind::InvalidArgument,
        codes::INVALID_ARGUMENT,
        message,
    )
}

pub(crate) fn not_found(message: impl Into<String>) -> LaunchError {
    LaunchError::with_message(LaunchErrorKind::NotFound, codes::NOT_FOUND, message)
}
