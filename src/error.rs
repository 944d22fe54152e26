// Copyright 2025 Lablup Inc. and Jeongkyu Shin
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Error types shared by sessions, channels, SFTP and key material.
//!
//! Every error belongs to one of two domains. Transport errors come from the
//! underlying SSH library and keep its numeric codes; core errors are produced
//! by the session engine itself.

use std::fmt;
use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Origin of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorDomain {
    /// Errors reported by the SSH transport library.
    Transport,
    /// Errors produced by the session engine.
    Core,
}

impl ErrorDomain {
    /// Stable domain identifier.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorDomain::Transport => "SSHKit.libssh",
            ErrorDomain::Core => "SSHKit.Core",
        }
    }
}

impl fmt::Display for ErrorDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Numeric error codes. Transport codes start at zero, core codes at 1005.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(i32)]
pub enum ErrorCode {
    NoError = 0,
    RequestDenied = 1,
    Fatal = 2,
    Interrupted = 3,

    Timeout = 1005,
    HostKeyMismatch = 1006,
    AuthFailure = 1007,
    IdentityParseFailure = 1008,
    Stop = 1009,
    ConnectFailure = 1010,
    ChannelFailure = 1011,
}

impl ErrorCode {
    pub fn domain(&self) -> ErrorDomain {
        match self {
            ErrorCode::NoError
            | ErrorCode::RequestDenied
            | ErrorCode::Fatal
            | ErrorCode::Interrupted => ErrorDomain::Transport,
            _ => ErrorDomain::Core,
        }
    }

    pub fn value(&self) -> i32 {
        *self as i32
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.domain(), self.value())
    }
}

/// Failure kinds reported by the transport library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportErrorKind {
    /// The peer refused the request (channel open, global request, ...).
    RequestDenied,
    /// The connection is unusable.
    Fatal,
    /// A blocking call was interrupted.
    Interrupted,
}

impl TransportErrorKind {
    fn code(&self) -> ErrorCode {
        match self {
            TransportErrorKind::RequestDenied => ErrorCode::RequestDenied,
            TransportErrorKind::Fatal => ErrorCode::Fatal,
            TransportErrorKind::Interrupted => ErrorCode::Interrupted,
        }
    }
}

/// Errors surfaced by sessions, channels, SFTP entities and key loading.
///
/// Errors are cloneable so the same failure can be recorded as the session's
/// last error and delivered to a delegate.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    #[error("transport error: {message}")]
    Transport {
        kind: TransportErrorKind,
        message: String,
    },

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("host key for {host} was rejected")]
    HostKeyMismatch { host: String },

    #[error("authentication failed: {0}")]
    AuthFailure(String),

    #[error("failed to parse identity: {0}")]
    IdentityParseFailure(String),

    #[error("operation stopped: {0}")]
    Stop(String),

    #[error("failed to connect: {0}")]
    ConnectFailure(String),

    #[error("channel failure: {0}")]
    ChannelFailure(String),
}

impl Error {
    pub fn fatal(message: impl Into<String>) -> Self {
        Error::Transport {
            kind: TransportErrorKind::Fatal,
            message: message.into(),
        }
    }

    pub fn request_denied(message: impl Into<String>) -> Self {
        Error::Transport {
            kind: TransportErrorKind::RequestDenied,
            message: message.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Transport { kind, .. } => kind.code(),
            Error::Timeout(_) => ErrorCode::Timeout,
            Error::HostKeyMismatch { .. } => ErrorCode::HostKeyMismatch,
            Error::AuthFailure(_) => ErrorCode::AuthFailure,
            Error::IdentityParseFailure(_) => ErrorCode::IdentityParseFailure,
            Error::Stop(_) => ErrorCode::Stop,
            Error::ConnectFailure(_) => ErrorCode::ConnectFailure,
            Error::ChannelFailure(_) => ErrorCode::ChannelFailure,
        }
    }

    pub fn domain(&self) -> ErrorDomain {
        self.code().domain()
    }

    /// Whether the error leaves the connection unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Transport {
                kind: TransportErrorKind::Fatal,
                ..
            }
        )
    }
}

impl From<russh::Error> for Error {
    fn from(err: russh::Error) -> Self {
        match err {
            russh::Error::RequestDenied => Error::request_denied(err.to_string()),
            russh::Error::UnknownKey => Error::HostKeyMismatch {
                host: "remote host".to_string(),
            },
            russh::Error::ChannelOpenFailure(reason) => {
                Error::ChannelFailure(format!("channel open failed: {reason:?}"))
            }
            other => Error::fatal(other.to_string()),
        }
    }
}

impl From<russh_sftp::client::error::Error> for Error {
    fn from(err: russh_sftp::client::error::Error) -> Self {
        Error::ChannelFailure(format!("sftp: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_match_domains() {
        assert_eq!(ErrorCode::NoError.value(), 0);
        assert_eq!(ErrorCode::Interrupted.value(), 3);
        assert_eq!(ErrorCode::Timeout.value(), 1005);
        assert_eq!(ErrorCode::ChannelFailure.value(), 1011);

        assert_eq!(ErrorCode::Fatal.domain(), ErrorDomain::Transport);
        assert_eq!(ErrorCode::Stop.domain(), ErrorDomain::Core);
        assert_eq!(ErrorDomain::Core.as_str(), "SSHKit.Core");
    }

    #[test]
    fn test_error_code_mapping() {
        assert_eq!(Error::fatal("boom").code(), ErrorCode::Fatal);
        assert_eq!(
            Error::request_denied("no").domain(),
            ErrorDomain::Transport
        );
        assert_eq!(
            Error::AuthFailure("bad password".into()).code(),
            ErrorCode::AuthFailure
        );
        assert!(Error::fatal("gone").is_fatal());
        assert!(!Error::ChannelFailure("overflow".into()).is_fatal());
    }

    #[test]
    fn test_display_includes_context() {
        let err = Error::HostKeyMismatch {
            host: "example.com".to_string(),
        };
        assert_eq!(err.to_string(), "host key for example.com was rejected");
    }
}
