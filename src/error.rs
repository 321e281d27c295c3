//! The crate-wide error taxonomy.
//!
//! One enum covers every fallible seam in the wallet kit. Each variant maps
//! to one of the six kinds in the error-handling design: `Transport` and
//! `Protocol` failures are retried by the owning back-end and only ever
//! escalate to a caller as a `syncState` transition; `Validation`,
//! `Unsupported`, `State`, and `Cancelled` are returned synchronously.

use thiserror::Error;

/// Why an address string failed validation (C3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressError {
    /// Not 40 hex digits (after stripping an optional `0x`).
    Length,
    /// Contains a non-hex character.
    Hex,
    /// Mixed-case input whose EIP-55 checksum does not match.
    Checksum,
}

impl std::fmt::Display for AddressError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AddressError::Length => write!(f, "address must be 40 hex digits"),
            AddressError::Hex => write!(f, "address contains non-hex characters"),
            AddressError::Checksum => write!(f, "EIP-55 checksum mismatch"),
        }
    }
}

/// Why a peer was disconnected (§6 disconnect reason codes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Requested,
    TcpSubsystemError,
    BadProtocol,
    UselessPeer,
    TooManyPeers,
    AlreadyConnected,
    IncompatibleP2p,
    NullNodeId,
    ClientQuit,
    TimeOut,
    Other,
    Unknown(u8),
}

impl DisconnectReason {
    pub fn from_code(code: u8) -> Self {
        match code {
            0x00 => Self::Requested,
            0x01 => Self::TcpSubsystemError,
            0x02 => Self::BadProtocol,
            0x03 => Self::UselessPeer,
            0x04 => Self::TooManyPeers,
            0x05 => Self::AlreadyConnected,
            0x06 => Self::IncompatibleP2p,
            0x07 => Self::NullNodeId,
            0x08 => Self::ClientQuit,
            0x0a => Self::TimeOut,
            0x10 => Self::Other,
            other => Self::Unknown(other),
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            Self::Requested => 0x00,
            Self::TcpSubsystemError => 0x01,
            Self::BadProtocol => 0x02,
            Self::UselessPeer => 0x03,
            Self::TooManyPeers => 0x04,
            Self::AlreadyConnected => 0x05,
            Self::IncompatibleP2p => 0x06,
            Self::NullNodeId => 0x07,
            Self::ClientQuit => 0x08,
            Self::TimeOut => 0x0a,
            Self::Other => 0x10,
            Self::Unknown(code) => *code,
        }
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Requested => "requested by peer",
            Self::TcpSubsystemError => "TCP subsystem error",
            Self::BadProtocol => "bad protocol",
            Self::UselessPeer => "useless peer",
            Self::TooManyPeers => "too many peers",
            Self::AlreadyConnected => "already connected",
            Self::IncompatibleP2p => "incompatible p2p version",
            Self::NullNodeId => "null node id",
            Self::ClientQuit => "client quit",
            Self::TimeOut => "timeout",
            Self::Other => "other",
            Self::Unknown(code) => return write!(f, "unknown disconnect reason ({code:#04x})"),
        };
        write!(f, "{s}")
    }
}

/// Crate-wide error type.
#[derive(Debug, Error)]
pub enum WalletError {
    /// Underlying socket/HTTP failure. Retried by the owning back-end with
    /// capped exponential backoff; never surfaced as fatal on its own.
    #[error("transport error: {0}")]
    Transport(String),

    /// The remote peer violated the protocol (bad RLP, bad MAC, broken
    /// header chain, wrong genesis). Causes a disconnect + reconnect after
    /// backoff; only surfaced to the caller if failures persist.
    #[error("protocol violation: {0:?}: {1}")]
    Protocol(DisconnectReason, String),

    /// User input failed validation (bad address, bad hex, malformed
    /// amount). Returned synchronously, never retried.
    #[error("invalid input: {0}")]
    Validation(String),

    /// Operation unsupported by the active back-end (e.g. `call` in SPV
    /// mode). Returned synchronously.
    #[error("unsupported in current mode: {0}")]
    Unsupported(String),

    /// The local store is inconsistent with what verification requires
    /// (missing parent header, account proof fails against the state
    /// root). Fatal to the current sync cycle; the back-end resets to its
    /// checkpoint and restarts.
    #[error("inconsistent state: {0}")]
    State(String),

    /// `stop()`/`clear()` interrupted an in-flight operation. Surfaced once
    /// to the caller that issued it; never retried.
    #[error("operation cancelled")]
    Cancelled,
}

impl WalletError {
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn protocol(reason: DisconnectReason, msg: impl Into<String>) -> Self {
        Self::Protocol(reason, msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }

    /// `Transport` and (non-terminal) `Protocol` errors are the ones a
    /// back-end retries internally rather than surfacing to a caller.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

impl From<AddressError> for WalletError {
    fn from(e: AddressError) -> Self {
        Self::Validation(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, WalletError>;
