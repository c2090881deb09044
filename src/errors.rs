//! Typed error codes at protocol boundaries.
//!
//! Internal plumbing (file I/O, subprocess spawn, HTTP client calls) uses
//! `anyhow::Result`. These enums are for the boundaries that face a client
//! over the wire, where a stable string code matters more than a backtrace —
//! modeled on the teacher's `ChannelError`.

use std::fmt;

macro_rules! wire_error {
    ($name:ident { $($variant:ident => $code:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn code(self) -> &'static str {
                match self {
                    $(Self::$variant => $code),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.code())
            }
        }

        impl std::error::Error for $name {}
    };
}

wire_error!(SignalingError {
    InvalidSession => "INVALID_SESSION",
    AuthenticationFailed => "AUTHENTICATION_FAILED",
    RateLimited => "RATE_LIMITED",
    InvalidRequest => "INVALID_REQUEST",
    InternalError => "INTERNAL_ERROR",
});

wire_error!(AuthError {
    InvalidHmac => "INVALID_HMAC",
    InvalidNonce => "INVALID_NONCE",
    ProtocolError => "PROTOCOL_ERROR",
    Timeout => "TIMEOUT",
});

wire_error!(SessionError {
    SessionNotFound => "SESSION_NOT_FOUND",
    SessionGone => "SESSION_GONE",
    SessionKilling => "SESSION_KILLING",
    SessionExists => "SESSION_EXISTS",
    MaxSessionsReached => "MAX_SESSIONS_REACHED",
    InvalidName => "INVALID_NAME",
    InvalidSessionId => "INVALID_SESSION_ID",
    DirNotFound => "DIR_NOT_FOUND",
    DirNotAllowed => "DIR_NOT_ALLOWED",
    AgentNotFound => "AGENT_NOT_FOUND",
    TmuxError => "TMUX_ERROR",
    KillFailed => "KILL_FAILED",
    RateLimited => "RATE_LIMITED",
});

wire_error!(TerminalError {
    NotAttached => "NOT_ATTACHED",
    PipeSetupFailed => "PIPE_SETUP_FAILED",
});

wire_error!(ClipboardError {
    TransferInProgress => "TRANSFER_IN_PROGRESS",
    SizeExceeded => "SIZE_EXCEEDED",
    InvalidFormat => "INVALID_FORMAT",
    InvalidChunk => "INVALID_CHUNK",
    ChunkMissing => "CHUNK_MISSING",
    TransferTimeout => "TRANSFER_TIMEOUT",
    ClipboardFailed => "CLIPBOARD_FAILED",
    PasteFailed => "PASTE_FAILED",
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable_strings() {
        assert_eq!(SignalingError::RateLimited.code(), "RATE_LIMITED");
        assert_eq!(SessionError::MaxSessionsReached.code(), "MAX_SESSIONS_REACHED");
        assert_eq!(ClipboardError::SizeExceeded.code(), "SIZE_EXCEEDED");
        assert_eq!(AuthError::Timeout.to_string(), "TIMEOUT");
    }
}
