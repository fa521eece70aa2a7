//! An in-process gateway that speaks just enough of the protocol to drive
//! a real `Client` through its connectors.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use shardline::client::{Client, ClientBuilder};
use shardline::error::{ClientError, Result};
use shardline::gateway::{Connector, Transport};
use shardline::http::EntityLookup;
use shardline::model::{Snowflake, User};

pub const BOT_ID: u64 = 140_000_000_000_000_001;
pub const GATEWAY_URL: &str = "wss://gateway.test/";

#[derive(Debug, Clone)]
pub struct Identify {
    pub shard: [u32; 2],
    pub at: Instant,
    /// When the connection carrying this identify was opened.
    pub opened: Instant,
    pub presence: Option<Value>,
}

#[derive(Debug)]
enum Reply {
    Frame(Value),
    Close(Option<u16>),
}

struct State {
    identifies: Vec<Identify>,
    commands: Vec<Value>,
    heartbeats: usize,
    hold_ready: bool,
    mirror_presence: bool,
    silent_voice: bool,
    voice_redirects: HashMap<u64, u64>,
    connections: usize,
    heartbeat_interval: u64,
    withhold_acks: bool,
    reject_resume: bool,
    close_identify: Option<u16>,
    refuse_connections: bool,
    duplicate_dispatches: bool,
    sequences: HashMap<String, u64>,
    live: Vec<mpsc::UnboundedSender<Reply>>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            identifies: Vec::new(),
            commands: Vec::new(),
            heartbeats: 0,
            hold_ready: false,
            mirror_presence: true,
            silent_voice: false,
            voice_redirects: HashMap::new(),
            connections: 0,
            heartbeat_interval: 45_000,
            withhold_acks: false,
            reject_resume: false,
            close_identify: None,
            refuse_connections: false,
            duplicate_dispatches: false,
            sequences: HashMap::new(),
            live: Vec::new(),
        }
    }
}

/// Shared between every connection (and every client) it hands out.
#[derive(Clone, Default)]
pub struct FakeGateway {
    state: Arc<Mutex<State>>,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn connector(&self) -> FakeConnector {
        FakeConnector {
            gateway: self.clone(),
        }
    }

    /// Never answer identify with READY.
    pub fn hold_ready(&self, hold: bool) {
        self.state().hold_ready = hold;
    }

    /// Ignore voice state updates entirely.
    pub fn silence_voice(&self, silent: bool) {
        self.state().silent_voice = silent;
    }

    /// Report `reported` whenever a join of `requested` comes in.
    pub fn redirect_voice(&self, requested: u64, reported: u64) {
        self.state().voice_redirects.insert(requested, reported);
    }

    /// Interval announced in HELLO for connections opened from now on.
    pub fn heartbeat_interval(&self, millis: u64) {
        self.state().heartbeat_interval = millis;
    }

    /// Stop answering heartbeats.
    pub fn withhold_acks(&self, withhold: bool) {
        self.state().withhold_acks = withhold;
    }

    /// Answer every resume with a non-resumable INVALID_SESSION.
    pub fn reject_resume(&self, reject: bool) {
        self.state().reject_resume = reject;
    }

    /// Answer identify by closing the socket with `code`.
    pub fn close_identify(&self, code: Option<u16>) {
        self.state().close_identify = code;
    }

    /// Fail every new connection attempt.
    pub fn refuse_connections(&self, refuse: bool) {
        self.state().refuse_connections = refuse;
    }

    /// Send every dispatch twice under the same sequence number.
    pub fn duplicate_dispatches(&self, duplicate: bool) {
        self.state().duplicate_dispatches = duplicate;
    }

    /// Cut every open connection, as if the network dropped it.
    pub fn drop_connections(&self, code: Option<u16>) {
        for live in self.state().live.drain(..) {
            let _ = live.send(Reply::Close(code));
        }
    }

    pub fn identifies(&self) -> Vec<Identify> {
        self.state().identifies.clone()
    }

    pub fn commands(&self, op: u64) -> Vec<Value> {
        self.state()
            .commands
            .iter()
            .filter(|c| c["op"] == op)
            .cloned()
            .collect()
    }

    pub fn connections(&self) -> usize {
        self.state().connections
    }

    pub fn heartbeats(&self) -> usize {
        self.state().heartbeats
    }

    /// Answers one frame from the client with whatever the server would send.
    fn respond(&self, session: &mut Option<String>, opened: Instant, frame: Value) -> Vec<Reply> {
        let mut state = self.state();
        let data = frame["d"].clone();
        let frames = match frame["op"].as_u64() {
            Some(1) => {
                state.heartbeats += 1;
                if state.withhold_acks {
                    return Vec::new();
                }
                vec![json!({"op": 11, "d": null})]
            }
            Some(2) => {
                let pair = [
                    data["shard"][0].as_u64().unwrap_or(0) as u32,
                    data["shard"][1].as_u64().unwrap_or(1) as u32,
                ];
                state.identifies.push(Identify {
                    shard: pair,
                    at: Instant::now(),
                    opened,
                    presence: data.get("presence").cloned(),
                });
                if let Some(code) = state.close_identify {
                    return vec![Reply::Close(Some(code))];
                }
                let session_id = format!("session-{}", pair[0]);
                state.sequences.insert(session_id.clone(), 0);
                *session = Some(session_id.clone());
                if state.hold_ready {
                    return Vec::new();
                }
                vec![dispatch(
                    "READY",
                    json!({
                        "v": 10,
                        "session_id": session_id,
                        "resume_gateway_url": GATEWAY_URL,
                        "user": {"id": BOT_ID.to_string(), "username": "shardline", "bot": true},
                        "guilds": [],
                        "shard": pair
                    }),
                )]
            }
            Some(6) => {
                state.commands.push(frame.clone());
                if state.reject_resume {
                    return vec![Reply::Frame(json!({"op": 9, "d": false}))];
                }
                *session = data["session_id"].as_str().map(str::to_string);
                vec![dispatch("RESUMED", Value::Null)]
            }
            Some(3) => {
                state.commands.push(frame.clone());
                if !state.mirror_presence {
                    return Vec::new();
                }
                vec![dispatch(
                    "PRESENCE_UPDATE",
                    json!({
                        "user": {"id": BOT_ID.to_string()},
                        "status": data["status"],
                        "activities": data["activities"]
                    }),
                )]
            }
            Some(4) => {
                state.commands.push(frame.clone());
                if state.silent_voice {
                    return Vec::new();
                }
                let guild_id = data["guild_id"].clone();
                let requested = data["channel_id"].as_str().and_then(|c| c.parse::<u64>().ok());
                let reported = requested.map(|c| *state.voice_redirects.get(&c).unwrap_or(&c));

                let mut frames = vec![dispatch(
                    "VOICE_STATE_UPDATE",
                    json!({
                        "guild_id": guild_id,
                        "channel_id": reported.map(|c| c.to_string()),
                        "user_id": BOT_ID.to_string(),
                        "session_id": "voice-session"
                    }),
                )];
                if reported.is_some() {
                    frames.push(dispatch(
                        "VOICE_SERVER_UPDATE",
                        json!({
                            "token": "voice-token",
                            "guild_id": guild_id,
                            "endpoint": "voice.gateway.test:443"
                        }),
                    ));
                }
                frames
            }
            Some(8) => {
                state.commands.push(frame);
                Vec::new()
            }
            _ => Vec::new(),
        };

        // dispatches are numbered per session, so a resume carries on counting
        let mut replies = Vec::new();
        for mut frame in frames {
            if frame["op"] == 0 {
                let key = session.clone().unwrap_or_default();
                let sequence = state.sequences.entry(key).or_insert(0);
                *sequence += 1;
                frame["s"] = json!(*sequence);
                if state.duplicate_dispatches {
                    replies.push(Reply::Frame(frame.clone()));
                }
            }
            replies.push(Reply::Frame(frame));
        }
        replies
    }
}

fn dispatch(name: &str, data: Value) -> Value {
    json!({"op": 0, "t": name, "d": data})
}

pub struct FakeConnector {
    gateway: FakeGateway,
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>> {
        assert!(url.contains("v=10"), "unexpected gateway url {url}");
        let mut state = self.gateway.state();
        state.connections += 1;
        if state.refuse_connections {
            return Err(ClientError::ConnectionClosed {
                code: None,
                reason: "connection refused".into(),
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let hello = json!({"op": 10, "d": {"heartbeat_interval": state.heartbeat_interval}});
        tx.send(Reply::Frame(hello)).unwrap();
        state.live.push(tx.clone());
        drop(state);

        Ok(Box::new(FakeTransport {
            gateway: self.gateway.clone(),
            tx,
            rx,
            session: None,
            opened: Instant::now(),
        }))
    }
}

struct FakeTransport {
    gateway: FakeGateway,
    tx: mpsc::UnboundedSender<Reply>,
    rx: mpsc::UnboundedReceiver<Reply>,
    session: Option<String>,
    opened: Instant,
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send(&mut self, text: String) -> Result<()> {
        let frame: Value = serde_json::from_str(&text)?;
        for reply in self.gateway.respond(&mut self.session, self.opened, frame) {
            let _ = self.tx.send(reply);
        }
        Ok(())
    }

    async fn recv(&mut self) -> Result<String> {
        match self.rx.recv().await {
            Some(Reply::Frame(frame)) => Ok(frame.to_string()),
            Some(Reply::Close(code)) => Err(ClientError::ConnectionClosed {
                code,
                reason: "fake gateway dropped the connection".into(),
            }),
            None => Err(ClientError::ConnectionClosed {
                code: None,
                reason: "fake gateway went away".into(),
            }),
        }
    }

    async fn close(&mut self, _code: u16) -> Result<()> {
        self.rx.close();
        Ok(())
    }
}

pub struct FakeLookup;

#[async_trait]
impl EntityLookup for FakeLookup {
    async fn current_user(&self) -> Result<User> {
        Ok(User {
            id: Snowflake::new(BOT_ID),
            username: "shardline".into(),
            discriminator: None,
            avatar: None,
            bot: Some(true),
            system: None,
        })
    }
}

/// A builder wired to `gateway`. Tests running in parallel must use
/// distinct tokens, since identify pacing is shared per token.
pub fn builder(gateway: &FakeGateway, token: &str) -> ClientBuilder {
    Client::builder(token)
        .gateway_url(GATEWAY_URL)
        .connector(gateway.connector())
        .entity_lookup(FakeLookup)
        .identify_interval(Duration::from_millis(50))
}

/// Polls `check` until it holds or `within` runs out.
pub async fn eventually(within: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + within;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
