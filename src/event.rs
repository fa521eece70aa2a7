use async_trait::async_trait;
use serde_json::Value;

use crate::client::Context;
use crate::error::Result;
use crate::model::{
    Guild, Message, PresenceUpdate, Ready, VoiceServerUpdate, VoiceStateUpdate,
};

/// A decoded dispatch from the gateway.
#[derive(Debug, Clone)]
pub enum Event {
    Ready(Box<Ready>),
    Resumed,
    PresenceUpdate(Box<PresenceUpdate>),
    VoiceStateUpdate(Box<VoiceStateUpdate>),
    VoiceServerUpdate(Box<VoiceServerUpdate>),
    GuildCreate(Box<Guild>),
    MessageCreate(Box<Message>),
    /// Anything this crate doesn't model yet, left as raw JSON.
    Unknown { name: String, data: Value },
}

/// Tag used to register handlers for one kind of [`Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Ready,
    Resumed,
    PresenceUpdate,
    VoiceStateUpdate,
    VoiceServerUpdate,
    GuildCreate,
    MessageCreate,
    Unknown,
}

impl Event {
    /// Decodes the `d` field of a dispatch named `name` (the `t` field).
    pub fn decode(name: &str, data: Value) -> Result<Self> {
        Ok(match name {
            "READY" => Self::Ready(serde_json::from_value(data)?),
            "RESUMED" => Self::Resumed,
            "PRESENCE_UPDATE" => Self::PresenceUpdate(serde_json::from_value(data)?),
            "VOICE_STATE_UPDATE" => Self::VoiceStateUpdate(serde_json::from_value(data)?),
            "VOICE_SERVER_UPDATE" => Self::VoiceServerUpdate(serde_json::from_value(data)?),
            "GUILD_CREATE" => Self::GuildCreate(serde_json::from_value(data)?),
            "MESSAGE_CREATE" => Self::MessageCreate(serde_json::from_value(data)?),
            _ => Self::Unknown {
                name: name.to_string(),
                data,
            },
        })
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Self::Ready(_) => EventKind::Ready,
            Self::Resumed => EventKind::Resumed,
            Self::PresenceUpdate(_) => EventKind::PresenceUpdate,
            Self::VoiceStateUpdate(_) => EventKind::VoiceStateUpdate,
            Self::VoiceServerUpdate(_) => EventKind::VoiceServerUpdate,
            Self::GuildCreate(_) => EventKind::GuildCreate,
            Self::MessageCreate(_) => EventKind::MessageCreate,
            Self::Unknown { .. } => EventKind::Unknown,
        }
    }
}

/// Implement whichever of these you care about and hand it to
/// [`ClientBuilder::event_handler`](crate::client::ClientBuilder::event_handler).
///
/// Each call runs in its own task, so a slow handler doesn't hold up the rest.
/// For one-off closures, [`Client::on`](crate::client::Client::on) is usually
/// less typing.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_ready(&self, ctx: Context, ready: Ready) {
        let _ = (ctx, ready);
    }

    async fn on_resumed(&self, ctx: Context) {
        let _ = ctx;
    }

    async fn on_presence_update(&self, ctx: Context, presence: PresenceUpdate) {
        let _ = (ctx, presence);
    }

    async fn on_voice_state_update(&self, ctx: Context, state: VoiceStateUpdate) {
        let _ = (ctx, state);
    }

    async fn on_voice_server_update(&self, ctx: Context, server: VoiceServerUpdate) {
        let _ = (ctx, server);
    }

    async fn on_guild_create(&self, ctx: Context, guild: Guild) {
        let _ = (ctx, guild);
    }

    async fn on_message(&self, ctx: Context, msg: Message) {
        let _ = (ctx, msg);
    }

    async fn on_unknown(&self, ctx: Context, name: String, data: Value) {
        let _ = (ctx, name, data);
    }
}

/// Calls the matching [`EventHandler`] method for `event`.
pub(crate) async fn route(handler: &dyn EventHandler, ctx: Context, event: &Event) {
    match event {
        Event::Ready(ready) => handler.on_ready(ctx, (**ready).clone()).await,
        Event::Resumed => handler.on_resumed(ctx).await,
        Event::PresenceUpdate(p) => handler.on_presence_update(ctx, (**p).clone()).await,
        Event::VoiceStateUpdate(s) => handler.on_voice_state_update(ctx, (**s).clone()).await,
        Event::VoiceServerUpdate(s) => handler.on_voice_server_update(ctx, (**s).clone()).await,
        Event::GuildCreate(g) => handler.on_guild_create(ctx, (**g).clone()).await,
        Event::MessageCreate(m) => handler.on_message(ctx, (**m).clone()).await,
        Event::Unknown { name, data } => {
            handler.on_unknown(ctx, name.clone(), data.clone()).await
        }
    }
}
