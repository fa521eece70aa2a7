//! A sharded gateway client: supervised sessions per shard, typed events,
//! outbound commands and voice sessions confirmed by their gateway events.

pub mod cache;
pub mod client;
pub mod command;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod gateway;
pub mod http;
pub mod model;
pub mod voice;

pub mod prelude {
    pub use crate::client::{Client, ClientBuilder, Context};
    pub use crate::command::{Ack, GatewayCommand};
    pub use crate::config::Config;
    pub use crate::error::ClientError;
    pub use crate::event::{Event, EventHandler, EventKind};
    pub use crate::model::*;
    pub use crate::voice::{VoiceSession, VoiceState};
}
