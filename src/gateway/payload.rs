//! Frames on the wire: `{"op": .., "d": .., "s": .., "t": ..}`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::model::{
    RequestGuildMembersPayload, UpdateStatusPayload, UpdateVoiceStatePayload,
};

pub const CLIENT_OS: &str = std::env::consts::OS;
pub const CLIENT_NAME: &str = "shardline";

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Dispatch = 0,
    Heartbeat = 1,
    Identify = 2,
    PresenceUpdate = 3,
    VoiceStateUpdate = 4,
    Resume = 6,
    Reconnect = 7,
    RequestGuildMembers = 8,
    InvalidSession = 9,
    Hello = 10,
    HeartbeatAck = 11,
}

impl Opcode {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::Dispatch,
            1 => Self::Heartbeat,
            2 => Self::Identify,
            3 => Self::PresenceUpdate,
            4 => Self::VoiceStateUpdate,
            6 => Self::Resume,
            7 => Self::Reconnect,
            8 => Self::RequestGuildMembers,
            9 => Self::InvalidSession,
            10 => Self::Hello,
            11 => Self::HeartbeatAck,
            _ => return None,
        })
    }
}

/// Anything the gateway sends us.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayFrame {
    pub op: u8,
    #[serde(default)]
    pub d: Value,
    pub s: Option<u64>,
    pub t: Option<String>,
}

impl GatewayFrame {
    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::from_u8(self.op)
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Hello {
    pub heartbeat_interval: u64,
}

/// Anything we send the gateway.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GatewayPayload {
    pub op: u8,
    pub d: Value,
}

impl GatewayPayload {
    pub fn heartbeat(sequence: Option<u64>) -> Self {
        Self {
            op: Opcode::Heartbeat as u8,
            d: json!(sequence),
        }
    }

    pub fn identify(
        token: &str,
        shard: [u32; 2],
        intents: u64,
        presence: Option<&UpdateStatusPayload>,
    ) -> Self {
        let mut d = json!({
            "token": token,
            "intents": intents,
            "shard": shard,
            "properties": {
                "os": CLIENT_OS,
                "browser": CLIENT_NAME,
                "device": CLIENT_NAME
            }
        });
        if let Some(presence) = presence {
            d["presence"] = json!(presence);
        }
        Self {
            op: Opcode::Identify as u8,
            d,
        }
    }

    pub fn resume(token: &str, session_id: &str, sequence: u64) -> Self {
        Self {
            op: Opcode::Resume as u8,
            d: json!({
                "token": token,
                "session_id": session_id,
                "seq": sequence
            }),
        }
    }

    pub fn presence(presence: &UpdateStatusPayload) -> Self {
        Self {
            op: Opcode::PresenceUpdate as u8,
            d: json!(presence),
        }
    }

    pub fn voice_state(state: &UpdateVoiceStatePayload) -> Self {
        Self {
            op: Opcode::VoiceStateUpdate as u8,
            d: json!(state),
        }
    }

    pub fn request_guild_members(request: &RequestGuildMembersPayload) -> Self {
        Self {
            op: Opcode::RequestGuildMembers as u8,
            d: json!(request),
        }
    }

    /// Short name for logs, so tokens never end up in them.
    pub fn describe(&self) -> &'static str {
        match Opcode::from_u8(self.op) {
            Some(Opcode::Heartbeat) => "heartbeat",
            Some(Opcode::Identify) => "identify",
            Some(Opcode::Resume) => "resume",
            Some(Opcode::PresenceUpdate) => "presence update",
            Some(Opcode::VoiceStateUpdate) => "voice state update",
            Some(Opcode::RequestGuildMembers) => "guild member request",
            _ => "payload",
        }
    }
}
