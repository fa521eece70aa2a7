//! Outbound commands and the shard each one goes to.

use std::sync::{Arc, PoisonError, RwLock};

use futures::future::join_all;
use log::{debug, warn};

use crate::error::{ClientError, Result};
use crate::gateway::{GatewayPayload, ShardHandle, ShardRegistry};
use crate::model::{
    RequestGuildMembersPayload, Snowflake, UpdateStatusPayload, UpdateVoiceStatePayload,
};

/// Everything an application can send over the gateway.
#[derive(Debug, Clone)]
pub enum GatewayCommand {
    /// Goes to every shard, and becomes the presence of later identifies.
    UpdateStatus(UpdateStatusPayload),
    UpdateVoiceState(UpdateVoiceStatePayload),
    RequestGuildMembers(RequestGuildMembersPayload),
}

impl GatewayCommand {
    /// The guild whose shard must carry this command, if any.
    pub fn guild_id(&self) -> Option<Snowflake> {
        match self {
            Self::UpdateStatus(_) => None,
            Self::UpdateVoiceState(state) => Some(state.guild_id),
            Self::RequestGuildMembers(request) => Some(request.guild_id),
        }
    }

    fn payload(&self) -> GatewayPayload {
        match self {
            Self::UpdateStatus(presence) => GatewayPayload::presence(presence),
            Self::UpdateVoiceState(state) => GatewayPayload::voice_state(state),
            Self::RequestGuildMembers(request) => GatewayPayload::request_guild_members(request),
        }
    }
}

/// Which shards accepted a command.
///
/// Acceptance means the frame was written to the socket; whatever the
/// gateway does in response arrives later as events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub shards: Vec<u32>,
}

#[derive(Clone)]
pub struct CommandGateway {
    registry: ShardRegistry,
    presence: Arc<RwLock<Option<UpdateStatusPayload>>>,
}

impl CommandGateway {
    pub(crate) fn new(
        registry: ShardRegistry,
        presence: Arc<RwLock<Option<UpdateStatusPayload>>>,
    ) -> Self {
        Self { registry, presence }
    }

    /// Sends `command` to the shard(s) it belongs on.
    ///
    /// Fails with [`ClientError::NotConnected`] until at least one shard
    /// finished its handshake.
    pub async fn emit(&self, command: GatewayCommand) -> Result<Ack> {
        if !self.registry.any_connected() {
            return Err(ClientError::NotConnected);
        }

        match command.guild_id() {
            Some(guild_id) => self.send_to_guild(guild_id, &command).await,
            None => self.broadcast(&command).await,
        }
    }

    async fn send_to_guild(&self, guild_id: Snowflake, command: &GatewayCommand) -> Result<Ack> {
        let shard_id = guild_id.shard_for(self.registry.shard_count());
        let shard = self
            .registry
            .get(shard_id)
            .ok_or(ClientError::ShardNotOwned { guild_id, shard_id })?;

        shard.send(command.payload()).await?;
        debug!("guild {guild_id} command sent on shard {shard_id}");
        Ok(Ack {
            shards: vec![shard_id],
        })
    }

    async fn broadcast(&self, command: &GatewayCommand) -> Result<Ack> {
        if let GatewayCommand::UpdateStatus(presence) = command {
            *self.presence.write().unwrap_or_else(PoisonError::into_inner) = Some(presence.clone());
        }

        let payload = command.payload();
        let shards: Vec<ShardHandle> = self
            .registry
            .shards()
            .into_iter()
            .filter(ShardHandle::is_connected)
            .collect();
        let results = join_all(shards.iter().map(|shard| shard.send(payload.clone()))).await;

        let mut accepted = Vec::with_capacity(shards.len());
        let mut last_error = None;
        for (shard, result) in shards.iter().zip(results) {
            match result {
                Ok(()) => accepted.push(shard.id()),
                Err(e) => {
                    warn!("shard {} did not take {}: {e}", shard.id(), payload.describe());
                    last_error = Some(e);
                }
            }
        }

        if accepted.is_empty() {
            return Err(last_error.unwrap_or(ClientError::NotConnected));
        }
        Ok(Ack { shards: accepted })
    }
}
