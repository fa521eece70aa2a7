//! Voice sessions: joining, moving between and leaving voice channels.
//!
//! The gateway never answers a voice state update directly. Instead it sends
//! our own `VOICE_STATE_UPDATE` (and a `VOICE_SERVER_UPDATE` with
//! credentials) some time later. Each session keeps at most one pending
//! operation and resolves it from those events as the client routes them in.

mod state;

pub use state::VoiceState;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::oneshot;
use tokio::time::timeout;

use crate::command::{CommandGateway, GatewayCommand};
use crate::config::VoiceConfig;
use crate::error::{ClientError, Result};
use crate::event::Event;
use crate::model::{Snowflake, UpdateVoiceStatePayload, VoiceServerUpdate};
use state::{Resolution, VoiceInput, VoiceMachine};

struct Slot {
    guild_id: Snowflake,
    inner: Mutex<SlotInner>,
    /// Serializes operations on one session.
    op: tokio::sync::Mutex<()>,
}

struct SlotInner {
    machine: VoiceMachine,
    waiter: Option<oneshot::Sender<Result<()>>>,
}

impl Slot {
    fn new(guild_id: Snowflake) -> Self {
        Self {
            guild_id,
            inner: Mutex::new(SlotInner {
                machine: VoiceMachine::new(guild_id),
                waiter: None,
            }),
            op: tokio::sync::Mutex::new(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> VoiceState {
        self.lock().machine.state()
    }

    fn feed(&self, input: VoiceInput<'_>) -> VoiceState {
        let mut inner = self.lock();
        let before = inner.machine.state();
        let resolution = inner.machine.apply(input);
        let after = inner.machine.state();
        if before != after {
            debug!("voice {} {before} -> {after}", self.guild_id);
        }
        inner.resolve(resolution);
        after
    }

    /// Gives up on the pending operation. Returns its outcome, or `None` if
    /// an event resolved it first.
    fn expire(&self) -> Option<Result<()>> {
        let mut inner = self.lock();
        let outcome = match inner.machine.expire() {
            Resolution::Pending => return None,
            Resolution::Done => Ok(()),
            Resolution::Failed(e) => Err(e),
        };
        inner.waiter = None;
        Some(outcome)
    }
}

impl SlotInner {
    fn resolve(&mut self, resolution: Resolution) {
        let outcome = match resolution {
            Resolution::Pending => return,
            Resolution::Done => Ok(()),
            Resolution::Failed(e) => Err(e),
        };
        match self.waiter.take() {
            Some(waiter) => {
                let _ = waiter.send(outcome);
            }
            None => {
                if let Err(e) = outcome {
                    debug!("unawaited voice outcome: {e}");
                }
            }
        }
    }
}

/// Resets the session if the waiting future is dropped halfway.
struct ExpireOnDrop<'a> {
    slot: &'a Slot,
    armed: bool,
}

impl Drop for ExpireOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            debug!("voice {} operation abandoned", self.slot.guild_id);
            self.slot.expire();
        }
    }
}

/// Owns every voice session of one client.
#[derive(Clone)]
pub(crate) struct VoiceManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    commands: CommandGateway,
    config: VoiceConfig,
    self_id: RwLock<Option<Snowflake>>,
    sessions: Mutex<HashMap<Snowflake, Arc<Slot>>>,
}

impl VoiceManager {
    pub fn new(commands: CommandGateway, config: VoiceConfig) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                commands,
                config,
                self_id: RwLock::new(None),
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Voice events about other users are ignored once this is known.
    pub fn set_self_id(&self, user_id: Snowflake) {
        *self.inner.self_id.write().unwrap_or_else(PoisonError::into_inner) = Some(user_id);
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<Snowflake, Arc<Slot>>> {
        self.inner.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Feeds a voice event to the session of its guild, if there is one.
    pub fn correlate(&self, event: &Event) {
        let (guild_id, input) = match event {
            Event::VoiceStateUpdate(update) => {
                let self_id = *self.inner.self_id.read().unwrap_or_else(PoisonError::into_inner);
                if self_id != Some(update.user_id) {
                    return;
                }
                let Some(guild_id) = update.guild_id else {
                    return;
                };
                (guild_id, VoiceInput::State(update))
            }
            Event::VoiceServerUpdate(update) => (update.guild_id, VoiceInput::Server(update)),
            _ => return,
        };

        let Some(slot) = self.sessions().get(&guild_id).cloned() else {
            return;
        };
        if slot.feed(input) == VoiceState::Closed {
            self.forget(&slot);
        }
    }

    /// Joins `channel_id` and waits until the gateway confirmed it.
    pub async fn connect(&self, guild_id: Snowflake, channel_id: Snowflake) -> Result<VoiceSession> {
        let slot = {
            let mut sessions = self.sessions();
            if let Some(existing) = sessions.get(&guild_id) {
                if existing.state() != VoiceState::Closed {
                    return Err(ClientError::VoiceSessionActive { guild_id });
                }
            }
            let slot = Arc::new(Slot::new(guild_id));
            sessions.insert(guild_id, slot.clone());
            slot
        };

        let result = {
            let _op = slot.op.lock().await;
            self.run(
                &slot,
                |machine| machine.begin_connect(channel_id).map(Some),
                self.inner.config.connect_timeout,
            )
            .await
        };

        match result {
            Ok(()) => {
                info!("voice connected in guild {guild_id}, channel {channel_id}");
                Ok(VoiceSession {
                    slot,
                    manager: self.clone(),
                })
            }
            Err(e) => {
                self.forget(&slot);
                if leaves_us_in_a_channel(&e) {
                    let leave = UpdateVoiceStatePayload::leave(guild_id);
                    if let Err(leave_err) = self
                        .inner
                        .commands
                        .emit(GatewayCommand::UpdateVoiceState(leave))
                        .await
                    {
                        warn!("could not leave voice in guild {guild_id}: {leave_err}");
                    }
                }
                Err(e)
            }
        }
    }

    /// Starts the operation `begin` describes and waits for it to resolve.
    async fn run<F>(&self, slot: &Slot, begin: F, wait: Duration) -> Result<()>
    where
        F: FnOnce(&mut VoiceMachine) -> Result<Option<UpdateVoiceStatePayload>>,
    {
        let (tx, mut rx) = oneshot::channel();
        let payload = {
            let mut inner = slot.lock();
            let Some(payload) = begin(&mut inner.machine)? else {
                return Ok(());
            };
            inner.waiter = Some(tx);
            payload
        };

        let mut guard = ExpireOnDrop { slot, armed: true };

        if let Err(e) = self
            .inner
            .commands
            .emit(GatewayCommand::UpdateVoiceState(payload))
            .await
        {
            guard.armed = false;
            slot.expire();
            return Err(e);
        }

        let outcome = match timeout(wait, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ClientError::Voice(format!(
                "session in guild {} was shut down",
                slot.guild_id
            ))),
            Err(_) => match slot.expire() {
                Some(outcome) => outcome,
                // resolved right at the deadline
                None => rx.try_recv().unwrap_or(Err(ClientError::VoiceTimeout {
                    guild_id: slot.guild_id,
                })),
            },
        };
        guard.armed = false;
        outcome
    }

    fn forget(&self, slot: &Arc<Slot>) {
        let mut sessions = self.sessions();
        if sessions
            .get(&slot.guild_id)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
        {
            sessions.remove(&slot.guild_id);
        }
    }

    /// Closes every session locally. Used when the client disconnects.
    pub fn reset(&self) {
        let slots: Vec<Arc<Slot>> = self.sessions().drain().map(|(_, slot)| slot).collect();
        for slot in slots {
            let mut inner = slot.lock();
            inner.machine.abort();
            inner.waiter = None;
        }
    }
}

fn leaves_us_in_a_channel(error: &ClientError) -> bool {
    matches!(
        error,
        ClientError::VoiceTimeout { .. } | ClientError::VoiceConnectFailed { actual: Some(_), .. }
    )
}

/// A joined voice channel in one guild.
///
/// Operations on one session run one at a time; sessions in different guilds
/// don't wait on each other. Dropping the handle does not leave the channel,
/// call [`close`](VoiceSession::close) for that.
pub struct VoiceSession {
    slot: Arc<Slot>,
    manager: VoiceManager,
}

impl std::fmt::Debug for VoiceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceSession")
            .field("guild_id", &self.slot.guild_id)
            .field("state", &self.state())
            .field("channel_id", &self.channel_id())
            .finish()
    }
}

impl VoiceSession {
    pub fn guild_id(&self) -> Snowflake {
        self.slot.guild_id
    }

    pub fn state(&self) -> VoiceState {
        self.slot.state()
    }

    pub fn channel_id(&self) -> Option<Snowflake> {
        self.slot.lock().machine.channel_id()
    }

    pub fn session_id(&self) -> Option<String> {
        self.slot.lock().machine.session_id().map(str::to_string)
    }

    /// Endpoint and token for the media connection.
    pub fn server(&self) -> Option<VoiceServerUpdate> {
        self.slot.lock().machine.server().cloned()
    }

    /// Moves to `channel_id`. Only valid while [`VoiceState::Connected`].
    ///
    /// On [`ClientError::VoiceMoveFailed`] the session follows whatever
    /// channel the gateway reported, or closes if that was none.
    pub async fn move_to(&self, channel_id: Snowflake) -> Result<()> {
        let _op = self.slot.op.lock().await;
        let result = self
            .manager
            .run(
                &self.slot,
                |machine| machine.begin_move(channel_id).map(Some),
                self.manager.inner.config.move_timeout,
            )
            .await;
        if self.state() == VoiceState::Closed {
            self.manager.forget(&self.slot);
        }
        if result.is_ok() {
            info!("voice in guild {} moved to {channel_id}", self.slot.guild_id);
        }
        result
    }

    /// Leaves the channel. Completes on the gateway's confirmation, or once
    /// the grace period ran out. Closing twice is fine.
    pub async fn close(&self) -> Result<()> {
        let _op = self.slot.op.lock().await;
        let result = self
            .manager
            .run(
                &self.slot,
                |machine| Ok(machine.begin_close()),
                self.manager.inner.config.close_grace,
            )
            .await;
        self.manager.forget(&self.slot);
        if result.is_ok() {
            info!("voice in guild {} closed", self.slot.guild_id);
        }
        result
    }
}
