use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::cache::Cache;
use crate::command::{Ack, CommandGateway, GatewayCommand};
use crate::config::{Config, ReconnectConfig, ShardConfig, VoiceConfig};
use crate::dispatch::Dispatcher;
use crate::error::{ClientError, Result};
use crate::event::{Event, EventHandler, EventKind};
use crate::gateway::shard::{ShardEvent, ShardSettings};
use crate::gateway::{
    Connector, IdentifyLimiter, LocalIdentifyLimiter, ReadyNotifier, SessionState,
    ShardRegistry, ShardSupervisor, WebSocketConnector,
};
use crate::http::{EntityLookup, Http};
use crate::model::{Snowflake, UpdateStatusPayload, User};
use crate::voice::{VoiceManager, VoiceSession};

/// Handed to every event handler.
#[derive(Clone)]
pub struct Context {
    pub http: Arc<Http>,
    /// The shard the event came in on.
    pub shard_id: u32,
    client: Client,
}

impl Context {
    pub(crate) fn new(client: Client, shard_id: u32) -> Self {
        Self {
            http: client.inner.http.clone(),
            shard_id,
            client,
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub async fn emit(&self, command: GatewayCommand) -> Result<Ack> {
        self.client.emit(command).await
    }

    pub async fn voice_connect(
        &self,
        guild_id: Snowflake,
        channel_id: Snowflake,
    ) -> Result<VoiceSession> {
        self.client.voice_connect(guild_id, channel_id).await
    }

    pub async fn current_user(&self) -> Result<User> {
        self.client.current_user().await
    }
}

pub struct ClientBuilder {
    config: Config,
    handlers: Vec<Arc<dyn EventHandler>>,
    connector: Option<Arc<dyn Connector>>,
    lookup: Option<Arc<dyn EntityLookup>>,
    limiter: Option<Arc<dyn IdentifyLimiter>>,
}

impl ClientBuilder {
    pub fn new(token: impl Into<String>) -> Self {
        Self::from_config(Config::new(token))
    }

    pub fn from_config(config: Config) -> Self {
        Self {
            config,
            handlers: Vec::new(),
            connector: None,
            lookup: None,
            limiter: None,
        }
    }

    pub fn event_handler(mut self, handler: impl EventHandler + 'static) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    pub fn api_url(mut self, url: impl Into<String>) -> Self {
        self.config.api_url = url.into();
        self
    }

    /// Connect here instead of asking the API for the gateway URL.
    pub fn gateway_url(mut self, url: impl Into<String>) -> Self {
        self.config.gateway_url = Some(url.into());
        self
    }

    pub fn intents(mut self, intents: u64) -> Self {
        self.config.intents = intents;
        self
    }

    /// Presence to identify with.
    pub fn presence(mut self, presence: UpdateStatusPayload) -> Self {
        self.config.presence = Some(presence);
        self
    }

    /// Run `shard_ids` out of `shard_count`. See [`ShardConfig`].
    pub fn shards(mut self, shard_ids: Vec<u32>, shard_count: u32) -> Self {
        self.config.shards = ShardConfig::new(shard_ids, shard_count);
        self
    }

    pub fn cache(mut self, enabled: bool) -> Self {
        self.config.cache = enabled;
        self
    }

    pub fn identify_interval(mut self, interval: Duration) -> Self {
        self.config.identify_interval = interval;
        self
    }

    pub fn voice_config(mut self, voice: VoiceConfig) -> Self {
        self.config.voice = voice;
        self
    }

    pub fn reconnect_config(mut self, reconnect: ReconnectConfig) -> Self {
        self.config.reconnect = reconnect;
        self
    }

    /// Don't hand events of this kind to handlers.
    pub fn ignore_event(mut self, kind: EventKind) -> Self {
        if !self.config.ignore_events.contains(&kind) {
            self.config.ignore_events.push(kind);
        }
        self
    }

    pub fn connector(mut self, connector: impl Connector + 'static) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    pub fn entity_lookup(mut self, lookup: impl EntityLookup + 'static) -> Self {
        self.lookup = Some(Arc::new(lookup));
        self
    }

    /// Defaults to a limiter shared by every client in the process with
    /// the same token.
    pub fn identify_limiter(mut self, limiter: Arc<dyn IdentifyLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn build(self) -> Result<Client> {
        let Self {
            config,
            handlers,
            connector,
            lookup,
            limiter,
        } = self;

        config.shards.resolve()?;

        let http = Arc::new(Http::new(&config.token, config.api_url.clone())?);
        let lookup: Arc<dyn EntityLookup> = match lookup {
            Some(lookup) => lookup,
            None => http.clone(),
        };
        let connector: Arc<dyn Connector> = match connector {
            Some(connector) => connector,
            None => Arc::new(WebSocketConnector::new()),
        };

        let registry = ShardRegistry::default();
        let presence = Arc::new(RwLock::new(config.presence.clone()));
        let commands = CommandGateway::new(registry.clone(), presence.clone());
        let voice = VoiceManager::new(commands.clone(), config.voice);

        let dispatcher = Dispatcher::new();
        for handler in handlers {
            dispatcher.add_event_handler(handler);
        }

        Ok(Client {
            inner: Arc::new(ClientInner {
                cache: Cache::new(lookup, config.cache),
                config,
                http,
                dispatcher,
                registry,
                ready: Arc::new(ReadyNotifier::default()),
                presence,
                commands,
                voice,
                connector,
                limiter,
                phase: Mutex::new(Phase::Idle),
                attempts: AtomicU64::new(0),
            }),
        })
    }
}

enum Phase {
    Idle,
    Connecting {
        attempt: u64,
        cancel: CancellationToken,
        supervisor: Option<Arc<ShardSupervisor>>,
    },
    Connected(Arc<ShardSupervisor>),
}

struct ClientInner {
    config: Config,
    http: Arc<Http>,
    cache: Cache,
    dispatcher: Dispatcher,
    registry: ShardRegistry,
    ready: Arc<ReadyNotifier>,
    presence: Arc<RwLock<Option<UpdateStatusPayload>>>,
    commands: CommandGateway,
    voice: VoiceManager,
    connector: Arc<dyn Connector>,
    limiter: Option<Arc<dyn IdentifyLimiter>>,
    phase: Mutex<Phase>,
    attempts: AtomicU64,
}

/// Cheap to clone; every clone drives the same shards.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn builder(token: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(token)
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn http(&self) -> Arc<Http> {
        self.inner.http.clone()
    }

    /// Starts every configured shard and returns once all of them are
    /// connected, or with the first error that stopped one.
    ///
    /// Wrap it in [`tokio::time::timeout`] for a deadline: dropping the
    /// future stops the shards started so far.
    pub async fn connect(&self) -> Result<()> {
        let attempt = self.inner.attempts.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = {
            let mut phase = self.phase();
            match &*phase {
                Phase::Connecting { .. } => return Err(ClientError::AlreadyConnecting),
                Phase::Connected(_) => return Err(ClientError::AlreadyConnected),
                Phase::Idle => {}
            }
            let cancel = CancellationToken::new();
            *phase = Phase::Connecting {
                attempt,
                cancel: cancel.clone(),
                supervisor: None,
            };
            cancel
        };

        let mut guard = AbandonOnDrop {
            client: self,
            attempt,
            armed: true,
        };
        let result = self.connect_attempt(attempt, &cancel).await;
        guard.armed = false;

        let mut phase = self.phase();
        let current = matches!(&*phase, Phase::Connecting { attempt: a, .. } if *a == attempt);
        if !current {
            // disconnected while we were busy
            if let Ok(supervisor) = result {
                supervisor.stop();
            }
            return Err(ClientError::Cancelled);
        }

        match result {
            Ok(supervisor) => {
                *phase = Phase::Connected(supervisor);
                info!("client connected");
                Ok(())
            }
            Err(e) => {
                if let Phase::Connecting {
                    supervisor: Some(supervisor),
                    ..
                } = std::mem::replace(&mut *phase, Phase::Idle)
                {
                    supervisor.stop();
                }
                Err(e)
            }
        }
    }

    async fn connect_attempt(
        &self,
        attempt: u64,
        cancel: &CancellationToken,
    ) -> Result<Arc<ShardSupervisor>> {
        let supervisor = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ClientError::Cancelled),
            supervisor = self.prepare() => supervisor?,
        };

        {
            let mut phase = self.phase();
            match &mut *phase {
                Phase::Connecting {
                    attempt: a,
                    supervisor: slot,
                    ..
                } if *a == attempt => *slot = Some(supervisor.clone()),
                _ => return Err(ClientError::Cancelled),
            }
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ClientError::Cancelled),
            connected = supervisor.connect_all() => connected.map(|()| supervisor.clone()),
        }
    }

    /// Resolves the gateway and shard layout and builds the supervisor.
    async fn prepare(&self) -> Result<Arc<ShardSupervisor>> {
        let config = &self.inner.config;
        let mut max_concurrency = 1;
        let mut recommended_shards = None;

        let gateway_url = match &config.gateway_url {
            Some(url) => url.clone(),
            None => {
                let bot = self.inner.http.get_gateway_bot().await?;
                if let Some(limit) = bot.session_start_limit {
                    if limit.remaining == 0 {
                        warn!(
                            "no identifies left for this token, the budget resets in {}ms",
                            limit.reset_after
                        );
                    }
                    max_concurrency = limit.max_concurrency.max(1);
                }
                recommended_shards = bot.shards;
                bot.url
            }
        };

        let shards = match recommended_shards {
            Some(count) if config.shards == ShardConfig::default() => {
                ShardConfig::new(Vec::new(), count)
            }
            _ => config.shards.clone(),
        };
        let (shard_ids, shard_count) = shards.resolve()?;

        let limiter: Arc<dyn IdentifyLimiter> = match &self.inner.limiter {
            Some(limiter) => limiter.clone(),
            None => LocalIdentifyLimiter::shared(
                &config.token,
                config.identify_interval,
                max_concurrency,
            ),
        };

        let settings = Arc::new(ShardSettings {
            token: config.token.clone(),
            intents: config.intents,
            gateway_url,
            reconnect: config.reconnect,
            presence: self.inner.presence.clone(),
            connector: self.inner.connector.clone(),
            limiter,
        });

        debug!("running shards {shard_ids:?} of {shard_count}");
        let (events, rx) = mpsc::unbounded_channel();
        spawn_event_pump(Arc::downgrade(&self.inner), rx);

        Ok(Arc::new(ShardSupervisor::new(
            shard_ids,
            shard_count,
            settings,
            events,
            self.inner.registry.clone(),
            self.inner.ready.clone(),
        )))
    }

    /// Stops every shard and drops all voice sessions.
    ///
    /// Safe to call at any time, any number of times, including while
    /// [`connect`](Self::connect) is still running (which then fails with
    /// [`ClientError::Cancelled`]).
    pub async fn disconnect(&self) -> Result<()> {
        let previous = std::mem::replace(&mut *self.phase(), Phase::Idle);
        let supervisor = match previous {
            Phase::Idle => None,
            Phase::Connecting {
                cancel, supervisor, ..
            } => {
                cancel.cancel();
                supervisor
            }
            Phase::Connected(supervisor) => Some(supervisor),
        };

        self.inner.voice.reset();
        if let Some(supervisor) = supervisor {
            supervisor.shutdown().await;
            info!("client disconnected");
        }
        Ok(())
    }

    /// Runs `callback` once every shard received its first READY.
    ///
    /// Fires at most once per client. Subscribing after that runs the
    /// callback right away.
    pub fn ready(&self, callback: impl FnOnce() + Send + 'static) {
        self.inner.ready.subscribe(callback);
    }

    pub fn is_ready(&self) -> bool {
        self.inner.ready.has_fired()
    }

    /// Registers `handler` for every event of `kind`.
    ///
    /// ```no_run
    /// # use shardline::prelude::*;
    /// # fn demo(client: &Client) {
    /// client.on(EventKind::PresenceUpdate, |_ctx, event| async move {
    ///     if let Event::PresenceUpdate(presence) = &*event {
    ///         println!("{} is now {:?}", presence.user.id, presence.status);
    ///     }
    /// });
    /// # }
    /// ```
    pub fn on<F, Fut>(&self, kind: EventKind, handler: F)
    where
        F: Fn(Context, Arc<Event>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.inner.dispatcher.on(kind, handler);
    }

    /// Sends a command. See [`CommandGateway::emit`].
    pub async fn emit(&self, command: GatewayCommand) -> Result<Ack> {
        self.inner.commands.emit(command).await
    }

    /// Joins a voice channel and waits for the gateway to confirm it.
    pub async fn voice_connect(
        &self,
        guild_id: Snowflake,
        channel_id: Snowflake,
    ) -> Result<VoiceSession> {
        self.inner.voice.connect(guild_id, channel_id).await
    }

    /// The bot's own user, from READY when cached.
    pub async fn current_user(&self) -> Result<User> {
        self.inner.cache.current_user().await
    }

    pub fn cache(&self) -> &Cache {
        &self.inner.cache
    }

    /// Total shards of this bot, across every process running it.
    pub fn shard_count(&self) -> u32 {
        self.inner.registry.shard_count()
    }

    pub fn shard_states(&self) -> Vec<(u32, SessionState)> {
        self.inner
            .registry
            .shards()
            .iter()
            .map(|shard| (shard.id(), shard.state()))
            .collect()
    }

    /// Heartbeat round trip per shard.
    pub fn latencies(&self) -> Vec<(u32, Option<Duration>)> {
        self.inner
            .registry
            .shards()
            .iter()
            .map(|shard| (shard.id(), shard.latency()))
            .collect()
    }

    fn phase(&self) -> MutexGuard<'_, Phase> {
        self.inner.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn handle_event(&self, shard_id: u32, event: Event) {
        if let Event::Ready(ready) = &event {
            self.inner.cache.set_current_user(ready.user.clone()).await;
            self.inner.voice.set_self_id(ready.user.id);
            self.inner.ready.shard_ready(shard_id);
        }
        self.inner.voice.correlate(&event);

        if self.inner.config.ignore_events.contains(&event.kind()) {
            return;
        }
        self.inner
            .dispatcher
            .dispatch(Context::new(self.clone(), shard_id), event);
    }
}

/// Puts the client back to idle if `connect` is dropped halfway.
struct AbandonOnDrop<'a> {
    client: &'a Client,
    attempt: u64,
    armed: bool,
}

impl Drop for AbandonOnDrop<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut phase = self.client.phase();
        if matches!(&*phase, Phase::Connecting { attempt, .. } if *attempt == self.attempt) {
            if let Phase::Connecting {
                cancel, supervisor, ..
            } = std::mem::replace(&mut *phase, Phase::Idle)
            {
                cancel.cancel();
                if let Some(supervisor) = supervisor {
                    supervisor.stop();
                }
            }
            debug!("connect abandoned");
        }
    }
}

fn spawn_event_pump(client: Weak<ClientInner>, mut events: mpsc::UnboundedReceiver<ShardEvent>) {
    tokio::spawn(async move {
        while let Some(ShardEvent { shard_id, event }) = events.recv().await {
            let Some(inner) = client.upgrade() else {
                break;
            };
            Client { inner }.handle_event(shard_id, event).await;
        }
        debug!("event pump stopped");
    });
}
