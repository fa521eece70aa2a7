//! One shard: a single gateway session, kept alive across drops.
//!
//! A [`ShardDriver`] owns the socket and runs in its own task. Everybody else
//! talks to it through a [`ShardHandle`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use log::{debug, error, info, trace, warn};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::heartbeat::Heartbeat;
use super::limiter::IdentifyLimiter;
use super::payload::{GatewayFrame, GatewayPayload, Hello, Opcode};
use super::session::SessionInfo;
use super::transport::{Connector, Transport};
use crate::config::{ReconnectConfig, GATEWAY_VERSION};
use crate::error::{ClientError, CloseCode, Result};
use crate::event::Event;
use crate::model::UpdateStatusPayload;

const NO_LATENCY: u64 = u64::MAX;
const COMMAND_QUEUE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Identifying,
    Connected,
    Resuming,
    /// Stopped for good, either on request or after a fatal error.
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Identifying => "identifying",
            Self::Connected => "connected",
            Self::Resuming => "resuming",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// An event tagged with the shard it came in on.
#[derive(Debug)]
pub(crate) struct ShardEvent {
    pub shard_id: u32,
    pub event: Event,
}

pub(crate) type EventSender = mpsc::UnboundedSender<ShardEvent>;

struct ShardCommand {
    payload: GatewayPayload,
    ack: oneshot::Sender<Result<()>>,
}

/// Shared, read-only inputs of every shard in a client.
pub(crate) struct ShardSettings {
    pub token: String,
    pub intents: u64,
    pub gateway_url: String,
    pub reconnect: ReconnectConfig,
    /// Identify presence; updated whenever a presence command is emitted.
    pub presence: Arc<RwLock<Option<UpdateStatusPayload>>>,
    pub connector: Arc<dyn Connector>,
    pub limiter: Arc<dyn IdentifyLimiter>,
}

#[derive(Clone)]
pub struct ShardHandle {
    id: u32,
    count: u32,
    state: watch::Receiver<SessionState>,
    commands: mpsc::Sender<ShardCommand>,
    latency_ms: Arc<AtomicU64>,
    failure: Arc<Mutex<Option<ClientError>>>,
}

impl fmt::Debug for ShardHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardHandle")
            .field("id", &self.id)
            .field("count", &self.count)
            .field("state", &self.state())
            .finish()
    }
}

impl ShardHandle {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Round trip of the last acknowledged heartbeat.
    pub fn latency(&self) -> Option<Duration> {
        match self.latency_ms.load(Ordering::Relaxed) {
            NO_LATENCY => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    /// Hands `payload` to the socket. Returns once it was written, not once
    /// the gateway acted on it.
    pub async fn send(&self, payload: GatewayPayload) -> Result<()> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        let (ack, done) = oneshot::channel();
        self.commands
            .send(ShardCommand { payload, ack })
            .await
            .map_err(|_| ClientError::NotConnected)?;
        done.await.map_err(|_| ClientError::NotConnected)?
    }

    /// Waits until the handshake completed, or returns why it never will.
    pub(crate) async fn wait_connected(&self) -> Result<()> {
        let mut state = self.state.clone();
        let reached = state
            .wait_for(|s| matches!(s, SessionState::Connected | SessionState::Closed))
            .await
            .map(|s| *s);
        match reached {
            Ok(SessionState::Connected) => Ok(()),
            _ => Err(self.take_failure()),
        }
    }

    /// The error that stopped the shard, or a generic one if it was stopped on request.
    pub(crate) fn take_failure(&self) -> ClientError {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .unwrap_or(ClientError::HandshakeFailed {
                shard_id: self.id,
                reason: "shard stopped before its session was established".into(),
            })
    }
}

enum Outcome {
    Stopped,
    Reconnect,
}

enum Flow {
    Continue,
    Reconnect,
}

pub(crate) struct ShardDriver {
    id: u32,
    count: u32,
    settings: Arc<ShardSettings>,
    events: EventSender,
    state: watch::Sender<SessionState>,
    commands: mpsc::Receiver<ShardCommand>,
    latency_ms: Arc<AtomicU64>,
    failure: Arc<Mutex<Option<ClientError>>>,
    session: SessionInfo,
    cancel: CancellationToken,
    identified: Option<oneshot::Sender<()>>,
    reached_connected: bool,
}

impl ShardDriver {
    /// Also returns a receiver that fires once the first identify went out.
    pub(crate) fn new(
        id: u32,
        count: u32,
        settings: Arc<ShardSettings>,
        events: EventSender,
        cancel: CancellationToken,
    ) -> (Self, ShardHandle, oneshot::Receiver<()>) {
        let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
        let (identified_tx, identified_rx) = oneshot::channel();
        let latency_ms = Arc::new(AtomicU64::new(NO_LATENCY));
        let failure = Arc::new(Mutex::new(None));

        let handle = ShardHandle {
            id,
            count,
            state: state_rx,
            commands: command_tx,
            latency_ms: latency_ms.clone(),
            failure: failure.clone(),
        };
        let driver = Self {
            id,
            count,
            settings,
            events,
            state: state_tx,
            commands: command_rx,
            latency_ms,
            failure,
            session: SessionInfo::new(),
            cancel,
            identified: Some(identified_tx),
            reached_connected: false,
        };
        (driver, handle, identified_rx)
    }

    pub(crate) async fn run(mut self) {
        info!("shard {}/{} starting", self.id, self.count);
        match self.supervise().await {
            Ok(()) => info!("shard {} stopped", self.id),
            Err(e) => {
                error!("shard {} stopped: {e}", self.id);
                *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(e);
            }
        }
        self.set_state(SessionState::Closed);
    }

    async fn supervise(&mut self) -> Result<()> {
        let reconnect = self.settings.reconnect;
        let mut attempts = 0u32;

        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            let resuming = self.session.can_resume();
            let outcome = self.run_session(resuming).await;
            if std::mem::take(&mut self.reached_connected) {
                attempts = 0;
            }

            let error = match outcome {
                Ok(Outcome::Stopped) => return Ok(()),
                Ok(Outcome::Reconnect) => {
                    self.set_state(SessionState::Disconnected);
                    continue;
                }
                Err(e) => e,
            };
            self.set_state(SessionState::Disconnected);

            if let ClientError::ConnectionClosed {
                code: Some(code),
                reason,
            } = &error
            {
                if let Some(close) = CloseCode::from_u16(*code) {
                    if close.is_fatal() {
                        return Err(ClientError::HandshakeFailed {
                            shard_id: self.id,
                            reason: format!("gateway closed with {code} ({close:?}): {reason}"),
                        });
                    }
                    if close.invalidates_session() {
                        self.session.clear();
                    }
                }
            }
            if !error.is_retryable() {
                return Err(error);
            }
            // A resume cut off by the transport gets one more try; a stalled
            // one, or a second failure, starts over with identify.
            let resume_failed = matches!(error, ClientError::ResumeFailed { .. });
            if resuming && self.session.can_resume() && (resume_failed || attempts > 0) {
                warn!("{}", ClientError::ResumeFailed { shard_id: self.id });
                self.session.clear();
            }

            attempts += 1;
            if attempts >= reconnect.max_attempts {
                return Err(ClientError::ReconnectLimitExceeded {
                    shard_id: self.id,
                    attempts,
                });
            }

            let delay = reconnect.delay_for(attempts - 1);
            warn!(
                "shard {} lost its session ({error}), retrying in {delay:?} (attempt {attempts})",
                self.id
            );
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = sleep(delay) => {}
            }
        }
    }

    async fn run_session(&mut self, resuming: bool) -> Result<Outcome> {
        let reconnect = self.settings.reconnect;
        self.set_state(if resuming {
            SessionState::Resuming
        } else {
            SessionState::Identifying
        });

        // Wait for the identify slot before opening the socket; nothing
        // heartbeats while we wait.
        if !resuming {
            self.session.clear();
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(Outcome::Stopped),
                _ = self.settings.limiter.acquire(self.id) => {}
            }
        }

        let base = self
            .session
            .resume_gateway_url()
            .filter(|_| resuming)
            .unwrap_or(&self.settings.gateway_url);
        let url = gateway_url(base)?;

        let connect = timeout(
            reconnect.hello_timeout,
            self.settings.connector.connect(url.as_str()),
        );
        let mut transport = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(Outcome::Stopped),
            conn = connect => conn.map_err(|_| ClientError::Timeout("gateway connection"))??,
        };

        let hello = tokio::select! {
            _ = self.cancel.cancelled() => {
                let _ = transport.close(1000).await;
                return Ok(Outcome::Stopped);
            }
            hello = timeout(reconnect.hello_timeout, read_hello(transport.as_mut())) => {
                hello.map_err(|_| ClientError::Timeout("HELLO"))??
            }
        };
        let mut heartbeat = Heartbeat::new(Duration::from_millis(hello.heartbeat_interval));
        debug!(
            "shard {} got HELLO, heartbeating every {:?}",
            self.id,
            heartbeat.interval()
        );

        match (self.session.session_id(), self.session.sequence()) {
            (Some(session_id), Some(sequence)) if resuming => {
                let payload = GatewayPayload::resume(&self.settings.token, session_id, sequence);
                send(transport.as_mut(), &payload).await?;
                info!("shard {} resuming at sequence {sequence}", self.id);
            }
            _ => {
                let presence = self
                    .settings
                    .presence
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                let payload = GatewayPayload::identify(
                    &self.settings.token,
                    [self.id, self.count],
                    self.settings.intents,
                    presence.as_ref(),
                );
                send(transport.as_mut(), &payload).await?;
                info!("shard {} identified", self.id);
                if let Some(identified) = self.identified.take() {
                    let _ = identified.send(());
                }
            }
        }

        let handshake_deadline = Instant::now() + reconnect.handshake_timeout;
        loop {
            let connected = self.current_state() == SessionState::Connected;
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    let _ = transport.close(1000).await;
                    return Ok(Outcome::Stopped);
                }
                _ = sleep_until(handshake_deadline), if !connected => {
                    let _ = transport.close(4000).await;
                    return Err(if resuming {
                        ClientError::ResumeFailed { shard_id: self.id }
                    } else {
                        ClientError::Timeout("READY")
                    });
                }
                frame = transport.recv() => {
                    let flow = self
                        .handle_frame(frame?, transport.as_mut(), &mut heartbeat, resuming)
                        .await?;
                    if let Flow::Reconnect = flow {
                        let _ = transport.close(4000).await;
                        return Ok(Outcome::Reconnect);
                    }
                }
                _ = heartbeat.tick() => {
                    if heartbeat.is_zombie() {
                        warn!("shard {} missed a heartbeat ACK, reconnecting", self.id);
                        let _ = transport.close(4000).await;
                        return Ok(Outcome::Reconnect);
                    }
                    send(transport.as_mut(), &GatewayPayload::heartbeat(self.session.sequence()))
                        .await?;
                    heartbeat.record_sent();
                    trace!("shard {} sent heartbeat", self.id);
                }
                Some(command) = self.commands.recv() => {
                    if !connected {
                        let _ = command.ack.send(Err(ClientError::NotConnected));
                        continue;
                    }
                    debug!("shard {} sending {}", self.id, command.payload.describe());
                    match send(transport.as_mut(), &command.payload).await {
                        Ok(()) => {
                            let _ = command.ack.send(Ok(()));
                        }
                        Err(e) => {
                            let _ = command.ack.send(Err(ClientError::NotConnected));
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    async fn handle_frame(
        &mut self,
        text: String,
        transport: &mut dyn Transport,
        heartbeat: &mut Heartbeat,
        resuming: bool,
    ) -> Result<Flow> {
        let frame: GatewayFrame = match serde_json::from_str(&text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("shard {} dropped an undecodable frame: {e}", self.id);
                return Ok(Flow::Continue);
            }
        };

        let mut replayed = false;
        if let Some(sequence) = frame.s {
            if !self.session.observe_sequence(sequence) {
                warn!(
                    "shard {} got sequence {sequence} after {:?}, dropping it",
                    self.id,
                    self.session.sequence()
                );
                replayed = true;
            }
        }

        match frame.opcode() {
            Some(Opcode::Dispatch) if replayed => {}
            Some(Opcode::Dispatch) => self.handle_dispatch(frame),
            Some(Opcode::Heartbeat) => {
                send(transport, &GatewayPayload::heartbeat(self.session.sequence())).await?;
                heartbeat.record_sent();
            }
            Some(Opcode::HeartbeatAck) => {
                heartbeat.record_ack();
                if let Some(latency) = heartbeat.latency() {
                    let ms = u64::try_from(latency.as_millis()).unwrap_or(NO_LATENCY - 1);
                    self.latency_ms.store(ms, Ordering::Relaxed);
                }
            }
            Some(Opcode::Reconnect) => {
                info!("shard {} asked to reconnect", self.id);
                return Ok(Flow::Reconnect);
            }
            Some(Opcode::InvalidSession) => {
                let resumable = frame.d.as_bool().unwrap_or(false);
                let was_connected = self.current_state() == SessionState::Connected;
                warn!(
                    "shard {} session invalidated (resumable: {resumable})",
                    self.id
                );
                if !resumable {
                    self.session.clear();
                }
                let wait = Duration::from_millis(1000 + (rand::random::<f64>() * 4000.0) as u64);
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = sleep(wait) => {}
                }
                if !was_connected {
                    return Err(if resuming {
                        ClientError::ResumeFailed { shard_id: self.id }
                    } else {
                        ClientError::Protocol("identify answered with INVALID_SESSION".into())
                    });
                }
                return Ok(Flow::Reconnect);
            }
            other => trace!("shard {} ignoring opcode {:?}", self.id, other),
        }
        Ok(Flow::Continue)
    }

    fn handle_dispatch(&mut self, frame: GatewayFrame) {
        let GatewayFrame { d, t, .. } = frame;
        let Some(name) = t else {
            warn!("shard {} got a dispatch without a name", self.id);
            return;
        };

        let event = match Event::decode(&name, d) {
            Ok(event) => event,
            Err(e) => {
                warn!("shard {} could not decode {name}: {e}", self.id);
                return;
            }
        };
        trace!("shard {} dispatch {name}", self.id);

        match &event {
            Event::Ready(ready) => {
                self.session
                    .set_session(ready.session_id.clone(), ready.resume_gateway_url.clone());
                self.reached_connected = true;
                self.set_state(SessionState::Connected);
                info!(
                    "shard {} ready as {} in {} guilds",
                    self.id,
                    ready.user.username,
                    ready.guilds.len()
                );
            }
            Event::Resumed => {
                self.reached_connected = true;
                self.set_state(SessionState::Connected);
                info!("shard {} resumed", self.id);
            }
            _ => {}
        }

        if self
            .events
            .send(ShardEvent {
                shard_id: self.id,
                event,
            })
            .is_err()
        {
            debug!("shard {} has nobody left to dispatch to", self.id);
        }
    }

    fn current_state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("shard {} {previous} -> {state}", self.id);
        }
    }
}

async fn send(transport: &mut dyn Transport, payload: &GatewayPayload) -> Result<()> {
    transport.send(serde_json::to_string(payload)?).await
}

async fn read_hello(transport: &mut dyn Transport) -> Result<Hello> {
    let text = transport.recv().await?;
    let frame: GatewayFrame = serde_json::from_str(&text)?;
    if frame.opcode() != Some(Opcode::Hello) {
        return Err(ClientError::Protocol(format!(
            "expected HELLO, got opcode {}",
            frame.op
        )));
    }
    let hello: Hello = serde_json::from_value(frame.d)
        .map_err(|e| ClientError::Protocol(format!("malformed HELLO: {e}")))?;
    if hello.heartbeat_interval == 0 {
        return Err(ClientError::Protocol("HELLO with a zero heartbeat interval".into()));
    }
    Ok(hello)
}

/// Pins the API version and encoding onto whatever URL the gateway gave us.
pub(crate) fn gateway_url(base: &str) -> Result<Url> {
    let mut url = Url::parse(base)?;
    url.query_pairs_mut()
        .clear()
        .append_pair("v", &GATEWAY_VERSION.to_string())
        .append_pair("encoding", "json");
    Ok(url)
}
