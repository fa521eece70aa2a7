//! The voice session state machine, free of any I/O.
//!
//! Every transition is either started by the owner of the session
//! (`begin_*`), driven by a correlated gateway event (`apply`), or forced by
//! a deadline (`expire`). The async side in [`super`] only decides *when*
//! to call these.

use std::fmt;

use crate::error::ClientError;
use crate::model::{Snowflake, UpdateVoiceStatePayload, VoiceServerUpdate, VoiceStateUpdate};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceState {
    Idle,
    /// Join requested; waiting for our own voice state to show the channel.
    AwaitingStateConfirm,
    /// In the channel; waiting for the voice server credentials.
    AwaitingServerInfo,
    Connected,
    AwaitingMoveConfirm,
    Closing,
    Closed,
}

impl fmt::Display for VoiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::AwaitingStateConfirm => "awaiting state confirmation",
            Self::AwaitingServerInfo => "awaiting server info",
            Self::Connected => "connected",
            Self::AwaitingMoveConfirm => "awaiting move confirmation",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// A gateway event already matched to this session's guild and user.
#[derive(Debug, Clone, Copy)]
pub(crate) enum VoiceInput<'a> {
    State(&'a VoiceStateUpdate),
    Server(&'a VoiceServerUpdate),
}

/// What a transition means for whoever waits on the pending operation.
#[derive(Debug)]
pub(crate) enum Resolution {
    Pending,
    Done,
    Failed(ClientError),
}

#[derive(Debug, Clone)]
pub(crate) struct VoiceMachine {
    guild_id: Snowflake,
    state: VoiceState,
    channel_id: Option<Snowflake>,
    target: Option<Snowflake>,
    session_id: Option<String>,
    server: Option<VoiceServerUpdate>,
}

impl VoiceMachine {
    pub fn new(guild_id: Snowflake) -> Self {
        Self {
            guild_id,
            state: VoiceState::Idle,
            channel_id: None,
            target: None,
            session_id: None,
            server: None,
        }
    }

    pub fn state(&self) -> VoiceState {
        self.state
    }

    pub fn channel_id(&self) -> Option<Snowflake> {
        self.channel_id
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn server(&self) -> Option<&VoiceServerUpdate> {
        self.server.as_ref()
    }

    pub fn begin_connect(&mut self, channel_id: Snowflake) -> Result<UpdateVoiceStatePayload, ClientError> {
        self.require(VoiceState::Idle)?;
        self.target = Some(channel_id);
        self.state = VoiceState::AwaitingStateConfirm;
        Ok(UpdateVoiceStatePayload::join(self.guild_id, channel_id))
    }

    pub fn begin_move(&mut self, channel_id: Snowflake) -> Result<UpdateVoiceStatePayload, ClientError> {
        self.require(VoiceState::Connected)?;
        self.target = Some(channel_id);
        self.state = VoiceState::AwaitingMoveConfirm;
        Ok(UpdateVoiceStatePayload::join(self.guild_id, channel_id))
    }

    /// `None` when there is nothing left to leave.
    pub fn begin_close(&mut self) -> Option<UpdateVoiceStatePayload> {
        match self.state {
            VoiceState::Closing | VoiceState::Closed => None,
            VoiceState::Idle => {
                self.state = VoiceState::Closed;
                None
            }
            _ => {
                self.target = None;
                self.state = VoiceState::Closing;
                Some(UpdateVoiceStatePayload::leave(self.guild_id))
            }
        }
    }

    pub fn apply(&mut self, input: VoiceInput<'_>) -> Resolution {
        match input {
            VoiceInput::State(update) => self.apply_state(update),
            VoiceInput::Server(update) => self.apply_server(update),
        }
    }

    fn apply_state(&mut self, update: &VoiceStateUpdate) -> Resolution {
        let reported = update.channel_id;
        match self.state {
            VoiceState::Idle | VoiceState::Closed => Resolution::Pending,
            VoiceState::AwaitingStateConfirm => {
                let expected = self.expected();
                if reported != Some(expected) {
                    self.state = VoiceState::Closed;
                    return Resolution::Failed(ClientError::VoiceConnectFailed {
                        guild_id: self.guild_id,
                        expected,
                        actual: reported,
                    });
                }
                self.channel_id = reported;
                self.session_id = Some(update.session_id.clone());
                if self.has_endpoint() {
                    self.state = VoiceState::Connected;
                    Resolution::Done
                } else {
                    self.state = VoiceState::AwaitingServerInfo;
                    Resolution::Pending
                }
            }
            VoiceState::AwaitingServerInfo => {
                if reported == self.channel_id {
                    self.session_id = Some(update.session_id.clone());
                    return Resolution::Pending;
                }
                self.state = VoiceState::Closed;
                Resolution::Failed(ClientError::VoiceConnectFailed {
                    guild_id: self.guild_id,
                    expected: self.expected(),
                    actual: reported,
                })
            }
            VoiceState::Connected => {
                // Nobody is waiting; just follow wherever we were put.
                self.session_id = Some(update.session_id.clone());
                self.channel_id = reported;
                if reported.is_none() {
                    self.state = VoiceState::Closed;
                }
                Resolution::Pending
            }
            VoiceState::AwaitingMoveConfirm => {
                let to = self.expected();
                if reported == Some(to) {
                    self.channel_id = reported;
                    self.session_id = Some(update.session_id.clone());
                    self.target = None;
                    self.state = VoiceState::Connected;
                    return Resolution::Done;
                }
                if reported.is_some() && reported == self.channel_id {
                    // an echo of where we still are
                    return Resolution::Pending;
                }

                let from = self.channel_id.unwrap_or(to);
                self.target = None;
                self.channel_id = reported;
                self.state = if reported.is_some() {
                    VoiceState::Connected
                } else {
                    VoiceState::Closed
                };
                Resolution::Failed(ClientError::VoiceMoveFailed {
                    guild_id: self.guild_id,
                    from,
                    to,
                    actual: reported,
                })
            }
            VoiceState::Closing => {
                if reported.is_none() {
                    self.channel_id = None;
                    self.state = VoiceState::Closed;
                    Resolution::Done
                } else {
                    Resolution::Pending
                }
            }
        }
    }

    fn apply_server(&mut self, update: &VoiceServerUpdate) -> Resolution {
        if matches!(self.state, VoiceState::Idle | VoiceState::Closed) {
            return Resolution::Pending;
        }
        self.server = Some(update.clone());
        if self.state == VoiceState::AwaitingServerInfo && update.endpoint.is_some() {
            self.target = None;
            self.state = VoiceState::Connected;
            return Resolution::Done;
        }
        Resolution::Pending
    }

    /// The deadline for the pending operation passed, or its caller gave up.
    ///
    /// Leaves the machine in a state it can be used from again: a failed
    /// connect is closed, a failed move stays where it was.
    pub fn expire(&mut self) -> Resolution {
        match self.state {
            VoiceState::AwaitingStateConfirm | VoiceState::AwaitingServerInfo => {
                self.state = VoiceState::Closed;
                Resolution::Failed(ClientError::VoiceTimeout {
                    guild_id: self.guild_id,
                })
            }
            VoiceState::AwaitingMoveConfirm => {
                self.target = None;
                self.state = VoiceState::Connected;
                Resolution::Failed(ClientError::VoiceTimeout {
                    guild_id: self.guild_id,
                })
            }
            VoiceState::Closing => {
                self.channel_id = None;
                self.state = VoiceState::Closed;
                Resolution::Done
            }
            _ => Resolution::Pending,
        }
    }

    /// Drops the session without talking to the gateway.
    pub fn abort(&mut self) {
        self.target = None;
        self.state = VoiceState::Closed;
    }

    fn require(&self, state: VoiceState) -> Result<(), ClientError> {
        if self.state == state {
            Ok(())
        } else {
            Err(ClientError::InvalidVoiceState {
                guild_id: self.guild_id,
                state: self.state,
            })
        }
    }

    fn expected(&self) -> Snowflake {
        self.target.or(self.channel_id).unwrap_or(Snowflake::new(0))
    }

    fn has_endpoint(&self) -> bool {
        self.server.as_ref().is_some_and(|s| s.endpoint.is_some())
    }
}
