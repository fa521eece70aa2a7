//! Error types used across the library.

use thiserror::Error;

use crate::model::Snowflake;

pub type Result<T> = std::result::Result<T, ClientError>;

/// The error type returned by pretty much everything in the library.
///
/// Transport drops never show up here while a shard can still resume or
/// re-identify on its own. You'll see [`NotConnected`](ClientError::NotConnected)
/// when a command is emitted before any shard finished its handshake, and the
/// `Voice*` variants from [`VoiceSession`](crate::voice::VoiceSession) calls whose
/// confirmation events didn't line up.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Not for bad status codes like 403 or 404 -- those show up as
    /// [`Api`](ClientError::Api). This is for transport-level stuff like
    /// DNS failures, TLS errors, timeouts, etc.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("connection closed by server (code {code:?}): {reason}")]
    ConnectionClosed { code: Option<u16>, reason: String },

    /// The string contains the status and body, like
    /// `"HTTP 403: {\"message\": \"Missing Permissions\"}"`.
    #[error("API error: {0}")]
    Api(String),

    #[error("Voice error: {0}")]
    Voice(String),

    /// The gateway sent something out of order or undecodable.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("no shard has an active session")]
    NotConnected,

    #[error("client is already connecting")]
    AlreadyConnecting,

    #[error("client is already connected")]
    AlreadyConnected,

    /// Identify was rejected for good, e.g. a bad token or an invalid shard.
    #[error("shard {shard_id} handshake failed: {reason}")]
    HandshakeFailed { shard_id: u32, reason: String },

    /// Only logged; the shard falls back to a fresh identify.
    #[error("shard {shard_id} could not resume its session")]
    ResumeFailed { shard_id: u32 },

    #[error("shard {shard_id} gave up after {attempts} reconnect attempts")]
    ReconnectLimitExceeded { shard_id: u32, attempts: u32 },

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("operation cancelled")]
    Cancelled,

    #[error("voice confirmation for guild {guild_id} did not arrive in time")]
    VoiceTimeout { guild_id: Snowflake },

    #[error("voice connect in guild {guild_id} expected channel {expected}, got {actual:?}")]
    VoiceConnectFailed {
        guild_id: Snowflake,
        expected: Snowflake,
        actual: Option<Snowflake>,
    },

    #[error("voice move in guild {guild_id} from {from} to {to} ended in {actual:?}")]
    VoiceMoveFailed {
        guild_id: Snowflake,
        from: Snowflake,
        to: Snowflake,
        actual: Option<Snowflake>,
    },

    #[error("voice session in guild {guild_id} cannot do that while {state}")]
    InvalidVoiceState {
        guild_id: Snowflake,
        state: crate::voice::VoiceState,
    },

    #[error("a voice session is already active in guild {guild_id}")]
    VoiceSessionActive { guild_id: Snowflake },

    #[error("guild {guild_id} belongs to shard {shard_id}, which this client does not run")]
    ShardNotOwned { guild_id: Snowflake, shard_id: u32 },
}

impl ClientError {
    /// Whether a shard should try again after seeing this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::WebSocket(_)
            | Self::Timeout(_)
            | Self::Protocol(_)
            | Self::ResumeFailed { .. } => true,
            Self::ConnectionClosed { code, .. } => code
                .and_then(CloseCode::from_u16)
                .map_or(true, |c| !c.is_fatal()),
            _ => false,
        }
    }
}

/// Close codes the gateway uses to explain why it dropped us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    UnknownError = 4000,
    UnknownOpcode = 4001,
    DecodeError = 4002,
    NotAuthenticated = 4003,
    AuthenticationFailed = 4004,
    AlreadyAuthenticated = 4005,
    InvalidSequence = 4007,
    RateLimited = 4008,
    SessionTimedOut = 4009,
    InvalidShard = 4010,
    ShardingRequired = 4011,
    InvalidApiVersion = 4012,
    InvalidIntents = 4013,
    DisallowedIntents = 4014,
}

impl CloseCode {
    pub fn from_u16(code: u16) -> Option<Self> {
        Some(match code {
            4000 => Self::UnknownError,
            4001 => Self::UnknownOpcode,
            4002 => Self::DecodeError,
            4003 => Self::NotAuthenticated,
            4004 => Self::AuthenticationFailed,
            4005 => Self::AlreadyAuthenticated,
            4007 => Self::InvalidSequence,
            4008 => Self::RateLimited,
            4009 => Self::SessionTimedOut,
            4010 => Self::InvalidShard,
            4011 => Self::ShardingRequired,
            4012 => Self::InvalidApiVersion,
            4013 => Self::InvalidIntents,
            4014 => Self::DisallowedIntents,
            _ => return None,
        })
    }

    /// Reconnecting won't help with these.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            Self::AuthenticationFailed
                | Self::InvalidShard
                | Self::ShardingRequired
                | Self::InvalidApiVersion
                | Self::InvalidIntents
                | Self::DisallowedIntents
        )
    }

    /// The old session is gone; the next attempt has to identify from scratch.
    pub fn invalidates_session(self) -> bool {
        matches!(self, Self::InvalidSequence | Self::SessionTimedOut)
    }
}
