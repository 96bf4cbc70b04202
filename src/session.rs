//! Session core: state machine, heartbeat scheduler, reconnect/resume, and
//! the inbound dispatch pipeline.
//!
//! Session fields (`sequence`, `session_id`, `resume_gateway_url`,
//! `heartbeat_interval`, `last_ack`, `authenticated`) live behind a single
//! lock rather than scattered atomics, since several change together and a
//! partial update would be an observable inconsistency.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::cache::EntityCache;
use crate::commands::{CommandClient, CommandRouter};
use crate::error::{FatalSessionError, TransportError};
use crate::events::GatewayEvent;
use crate::registry::HandlerRegistry;
use crate::transport::Transport;
use crate::types::{GatewayPayload, Guild, Member};
use crate::workerpool::WorkerPool;

pub const DEFAULT_GATEWAY_URL: &str = "wss://gateway.discord.gg/?v=10&encoding=json";

const SEND_BUDGET_MAX: usize = 120;
const SEND_BUDGET_WINDOW: Duration = Duration::from_secs(60);
const MAX_RECONNECT_ATTEMPTS: u32 = 5;
const HEARTBEAT_ACK_TIMEOUT_MULTIPLIER: u32 = 2;
const HELLO_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub token: String,
    pub intents: u32,
    pub prefix: String,
}

/// Send-rate budget for outbound gateway frames. Distinct from the REST
/// rate limiter (component C, which gates REST calls only) — this guards
/// the gateway socket itself against the 120-per-60s send ceiling.
struct SendBudget {
    timestamps: VecDeque<Instant>,
}

impl SendBudget {
    fn new() -> Self {
        Self {
            timestamps: VecDeque::with_capacity(SEND_BUDGET_MAX),
        }
    }

    fn delay(&mut self) -> Duration {
        let now = Instant::now();
        while let Some(&oldest) = self.timestamps.front() {
            if now.duration_since(oldest) > SEND_BUDGET_WINDOW {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
        if self.timestamps.len() < SEND_BUDGET_MAX {
            return Duration::ZERO;
        }
        let oldest = *self.timestamps.front().unwrap();
        SEND_BUDGET_WINDOW.saturating_sub(now.duration_since(oldest))
    }

    fn record(&mut self) {
        self.timestamps.push_back(Instant::now());
    }
}

async fn send_gateway_frame(
    transport: &Arc<dyn Transport>,
    send_budget: &Mutex<SendBudget>,
    payload: Value,
) {
    let delay = send_budget.lock().await.delay();
    if delay > Duration::ZERO {
        tokio::time::sleep(delay).await;
    }
    send_budget.lock().await.record();
    match serde_json::to_vec(&payload) {
        Ok(bytes) => transport.send(bytes).await,
        Err(e) => error!(error = %e, "failed to serialize outbound frame"),
    }
}

#[derive(Default)]
struct SessionFields {
    session_id: Option<String>,
    resume_gateway_url: Option<String>,
    sequence: Option<u64>,
    heartbeat_interval: Option<u64>,
    last_ack: Option<Instant>,
    authenticated: bool,
}

enum DisconnectReason {
    ShouldResume,
    TransportError,
    Fatal(String),
}

/// Owns the coupled transport/session/worker-pool/handler/cache/command
/// subsystems and drives the connect → hello → identify/resume → ready →
/// reconnect lifecycle.
pub struct SessionCore {
    transport: Arc<dyn Transport>,
    pool: WorkerPool,
    registry: Arc<HandlerRegistry>,
    cache: Arc<EntityCache>,
    commands: Arc<CommandRouter>,
    command_client: Arc<dyn CommandClient>,
    config: GatewayConfig,
    fields: Arc<Mutex<SessionFields>>,
    send_budget: Arc<Mutex<SendBudget>>,
    reconnecting: AtomicBool,
    heartbeat_cancel: Mutex<Option<mpsc::Sender<()>>>,
    shutdown: Mutex<Option<mpsc::Sender<()>>>,
    fatal_tx: mpsc::UnboundedSender<FatalSessionError>,
}

impl SessionCore {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: Arc<dyn Transport>,
        pool: WorkerPool,
        registry: Arc<HandlerRegistry>,
        cache: Arc<EntityCache>,
        commands: Arc<CommandRouter>,
        command_client: Arc<dyn CommandClient>,
        config: GatewayConfig,
        fatal_tx: mpsc::UnboundedSender<FatalSessionError>,
    ) -> Self {
        Self {
            transport,
            pool,
            registry,
            cache,
            commands,
            command_client,
            config,
            fields: Arc::new(Mutex::new(SessionFields::default())),
            send_budget: Arc::new(Mutex::new(SendBudget::new())),
            reconnecting: AtomicBool::new(false),
            heartbeat_cancel: Mutex::new(None),
            shutdown: Mutex::new(None),
            fatal_tx,
        }
    }

    /// Drives the connect/hello/identify-resume/ready/reconnect loop until
    /// shut down or reconnect attempts are exhausted.
    pub async fn run(self: Arc<Self>) {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        *self.shutdown.lock().await = Some(shutdown_tx);

        loop {
            if let Err(e) = self.transport.connect().await {
                warn!(error = %e, "initial connect failed");
                if !self.reconnect_with_backoff().await {
                    return;
                }
                continue;
            }

            tokio::select! {
                _ = shutdown_rx.recv() => {
                    self.transport.close().await;
                    return;
                }
                reason = self.run_connected_session() => {
                    self.cancel_heartbeat().await;
                    match reason {
                        DisconnectReason::Fatal(msg) => {
                            let _ = self.fatal_tx.send(FatalSessionError(msg));
                            return;
                        }
                        DisconnectReason::ShouldResume | DisconnectReason::TransportError => {
                            if !self.reconnect_with_backoff().await {
                                return;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Request a graceful stop: closes the transport and exits the run loop.
    pub async fn stop(&self) {
        if let Some(tx) = self.shutdown.lock().await.take() {
            let _ = tx.send(()).await;
        }
        self.cancel_heartbeat().await;
    }

    /// Waits for Hello, authenticates, then runs the read loop until the
    /// socket errors or the gateway asks for reconnect/invalid-session.
    async fn run_connected_session(&self) -> DisconnectReason {
        let inbound = self.transport.receive();
        let errors = self.transport.errors();

        let interval = match self.wait_for_hello(&inbound, &errors).await {
            Ok(interval) => interval,
            Err(reason) => return reason,
        };

        {
            let mut fields = self.fields.lock().await;
            fields.heartbeat_interval = Some(interval);
            fields.last_ack = Some(Instant::now());
        }
        self.start_heartbeat(interval).await;
        self.authenticate().await;

        loop {
            tokio::select! {
                biased;
                frame = inbound.recv() => {
                    match frame {
                        Ok(bytes) => {
                            if let Some(reason) = self.handle_frame(bytes).await {
                                return reason;
                            }
                        }
                        Err(_) => return DisconnectReason::TransportError,
                    }
                }
                err = errors.recv() => {
                    match err {
                        Ok(e) if e.is_reconnectable() => return DisconnectReason::TransportError,
                        Ok(e) => error!(error = %e, "non-reconnectable transport error surfaced"),
                        Err(_) => return DisconnectReason::TransportError,
                    }
                }
            }
        }
    }

    async fn wait_for_hello(
        &self,
        inbound: &async_channel::Receiver<Vec<u8>>,
        errors: &async_channel::Receiver<TransportError>,
    ) -> Result<u64, DisconnectReason> {
        let deadline = tokio::time::sleep(HELLO_TIMEOUT);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                frame = inbound.recv() => {
                    let bytes = frame.map_err(|_| DisconnectReason::TransportError)?;
                    let payload: GatewayPayload = serde_json::from_slice(&bytes)
                        .map_err(|e| DisconnectReason::Fatal(format!("malformed hello: {e}")))?;
                    if payload.op != 10 {
                        continue;
                    }
                    let interval = payload
                        .d
                        .as_ref()
                        .and_then(|d| d.get("heartbeat_interval"))
                        .and_then(|v| v.as_u64())
                        .ok_or_else(|| DisconnectReason::Fatal("hello missing heartbeat_interval".into()))?;
                    return Ok(interval);
                }
                _ = errors.recv() => return Err(DisconnectReason::TransportError),
                _ = &mut deadline => return Err(DisconnectReason::TransportError),
            }
        }
    }

    /// Sends Identify, or Resume if a prior session is known. No-op if
    /// already authenticated (a resumed connection that never dropped
    /// session state).
    async fn authenticate(&self) {
        let (session_id, sequence, already_authenticated) = {
            let fields = self.fields.lock().await;
            (
                fields.session_id.clone(),
                fields.sequence,
                fields.authenticated,
            )
        };

        if already_authenticated {
            return;
        }

        let payload = match session_id {
            Some(session_id) => json!({
                "op": 6,
                "d": {
                    "token": self.config.token,
                    "session_id": session_id,
                    "seq": sequence,
                }
            }),
            None => json!({
                "op": 2,
                "d": {
                    "token": self.config.token,
                    "properties": {
                        "os": "linux",
                        "browser": "rust-gateway",
                        "device": "rust-gateway",
                    },
                    "intents": self.config.intents,
                }
            }),
        };
        self.send(payload).await;
    }

    async fn handle_frame(&self, bytes: Vec<u8>) -> Option<DisconnectReason> {
        let payload: GatewayPayload = match serde_json::from_slice(&bytes) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to parse gateway envelope");
                return None;
            }
        };

        if let Some(seq) = payload.s {
            let mut fields = self.fields.lock().await;
            fields.sequence = Some(fields.sequence.map_or(seq, |s| s.max(seq)));
        }

        match GatewayEvent::from_payload(payload) {
            GatewayEvent::HeartbeatAck => {
                self.fields.lock().await.last_ack = Some(Instant::now());
                None
            }
            GatewayEvent::HeartbeatRequest => {
                self.send_heartbeat().await;
                None
            }
            GatewayEvent::Reconnect => Some(DisconnectReason::ShouldResume),
            GatewayEvent::InvalidSession(resumable) => {
                if resumable {
                    Some(DisconnectReason::ShouldResume)
                } else {
                    {
                        let mut fields = self.fields.lock().await;
                        fields.session_id = None;
                        fields.sequence = None;
                        fields.authenticated = false;
                    }
                    let jitter_ms = rand::thread_rng().gen_range(1000..5000);
                    tokio::time::sleep(Duration::from_millis(jitter_ms)).await;
                    self.authenticate().await;
                    None
                }
            }
            GatewayEvent::Ready(ready) => {
                {
                    let mut fields = self.fields.lock().await;
                    fields.session_id = Some(ready.session_id.clone());
                    if let Some(url) = &ready.resume_gateway_url {
                        fields.resume_gateway_url = Some(url.clone());
                    }
                    fields.authenticated = true;
                }
                for guild in &ready.guilds {
                    self.cache.set_guild(Guild::unavailable(guild.id.clone()));
                }
                info!(session_id = %ready.session_id, guild_count = ready.guilds.len(), "session ready");
                let value = serde_json::to_value(&ready).unwrap_or(Value::Null);
                self.submit_dispatch("READY", value).await;
                None
            }
            other => {
                self.route_dispatch(other).await;
                None
            }
        }
    }

    /// Applies the built-in cache-sync behavior for the event and then
    /// forwards it to the handler registry (and, for MESSAGE_CREATE,
    /// the command router first).
    async fn route_dispatch(&self, event: GatewayEvent) {
        match event {
            GatewayEvent::GuildCreate(guild) => {
                let value = serde_json::to_value(&guild).unwrap_or(Value::Null);
                self.cache.set_guild(guild);
                self.submit_dispatch("GUILD_CREATE", value).await;
            }
            GatewayEvent::GuildUpdate(guild) => {
                let value = serde_json::to_value(&guild).unwrap_or(Value::Null);
                self.cache.set_guild(guild);
                self.submit_dispatch("GUILD_UPDATE", value).await;
            }
            GatewayEvent::GuildDelete(event) => {
                let value = serde_json::to_value(&event).unwrap_or(Value::Null);
                if event.unavailable {
                    self.cache.set_guild(Guild::unavailable(event.id));
                } else {
                    self.cache.del_guild(&event.id);
                }
                self.submit_dispatch("GUILD_DELETE", value).await;
            }
            GatewayEvent::ChannelCreate(channel) => {
                let value = serde_json::to_value(&channel).unwrap_or(Value::Null);
                self.cache.set_channel(channel);
                self.submit_dispatch("CHANNEL_CREATE", value).await;
            }
            GatewayEvent::ChannelUpdate(channel) => {
                let value = serde_json::to_value(&channel).unwrap_or(Value::Null);
                self.cache.set_channel(channel);
                self.submit_dispatch("CHANNEL_UPDATE", value).await;
            }
            GatewayEvent::ChannelDelete(event) => {
                self.cache.del_channel(&event.id);
                self.submit_dispatch("CHANNEL_DELETE", json!({"id": event.id})).await;
            }
            GatewayEvent::GuildMemberAdd(fields) => {
                let value = json!({"user": fields.user, "guild_id": fields.guild_id});
                let member: Member = fields.into();
                self.cache.set_member(member);
                self.submit_dispatch("GUILD_MEMBER_ADD", value).await;
            }
            GatewayEvent::GuildMemberUpdate(fields) => {
                let value = json!({"user": fields.user, "guild_id": fields.guild_id});
                let member: Member = fields.into();
                self.cache.set_member(member);
                self.submit_dispatch("GUILD_MEMBER_UPDATE", value).await;
            }
            GatewayEvent::GuildMemberRemove(event) => {
                self.cache.del_member(&event.user.id, &event.guild_id);
                let value = serde_json::to_value(&event).unwrap_or(Value::Null);
                self.submit_dispatch("GUILD_MEMBER_REMOVE", value).await;
            }
            GatewayEvent::MessageCreate(message) => {
                if !self.commands.try_route(self.command_client.clone(), &message) {
                    let value = serde_json::to_value(&message).unwrap_or(Value::Null);
                    self.submit_dispatch("MESSAGE_CREATE", value).await;
                }
            }
            GatewayEvent::Unknown {
                event_name: Some(name),
                data: Some(data),
                ..
            } => {
                self.submit_dispatch(&name, data).await;
            }
            _ => {}
        }
    }

    /// Queue handler-registry invocation onto the worker pool so a slow or
    /// awaiting handler never blocks the gateway read loop.
    async fn submit_dispatch(&self, event_name: &str, data: Value) {
        let registry = self.registry.clone();
        let name = event_name.to_string();
        self.pool
            .submit(Box::pin(async move {
                registry.dispatch(&name, data);
            }))
            .await;
    }

    async fn start_heartbeat(&self, interval_ms: u64) {
        let (cancel_tx, mut cancel_rx) = mpsc::channel::<()>(1);
        *self.heartbeat_cancel.lock().await = Some(cancel_tx);

        let interval = Duration::from_millis(interval_ms);
        let transport = self.transport.clone();
        let fields = self.fields.clone();
        let send_budget = self.send_budget.clone();

        tokio::spawn(async move {
            let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..interval_ms.max(1)));
            tokio::select! {
                _ = tokio::time::sleep(jitter) => {}
                _ = cancel_rx.recv() => return,
            }

            let tick = {
                let mut rng = rand::thread_rng();
                Duration::from_secs_f64(interval.as_secs_f64() * rng.gen_range(0.9..1.0))
            };
            let mut ticker = tokio::time::interval(tick);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let last_ack = fields.lock().await.last_ack;
                        if let Some(last_ack) = last_ack {
                            if last_ack.elapsed() > interval * HEARTBEAT_ACK_TIMEOUT_MULTIPLIER {
                                warn!("heartbeat ack watchdog expired, forcing reconnect");
                                transport.close().await;
                                return;
                            }
                        }
                        let seq = fields.lock().await.sequence;
                        send_gateway_frame(&transport, &send_budget, json!({"op": 1, "d": seq})).await;
                    }
                    _ = cancel_rx.recv() => return,
                }
            }
        });
    }

    async fn send_heartbeat(&self) {
        let seq = self.fields.lock().await.sequence;
        self.send(json!({"op": 1, "d": seq})).await;
    }

    async fn cancel_heartbeat(&self) {
        if let Some(tx) = self.heartbeat_cancel.lock().await.take() {
            let _ = tx.send(()).await;
        }
    }

    async fn send(&self, payload: Value) {
        send_gateway_frame(&self.transport, &self.send_budget, payload).await;
    }

    /// Exponential backoff with jitter: attempt `i` in `[0,5)`,
    /// `delay = base * 2^i + uniform(0, 0.3 * base * 2^i)`. After
    /// exhausting attempts, tries one fresh connect to the original
    /// gateway URL before surfacing a fatal error.
    async fn reconnect_with_backoff(&self) -> bool {
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            // Another reconnect already in flight; let it own this attempt.
            return true;
        }
        self.fields.lock().await.authenticated = false;

        let resume_url = self.fields.lock().await.resume_gateway_url.clone();
        let base_ms: u64 = 1000;

        for attempt in 0..MAX_RECONNECT_ATTEMPTS {
            let base = base_ms * 2u64.pow(attempt);
            let jitter_max = (base as f64 * 0.3) as u64;
            let jitter = if jitter_max > 0 {
                rand::thread_rng().gen_range(0..jitter_max)
            } else {
                0
            };
            tokio::time::sleep(Duration::from_millis(base + jitter)).await;

            if self.transport.reconnect(resume_url.clone()).await.is_ok() {
                self.reconnecting.store(false, Ordering::SeqCst);
                return true;
            }
            debug!(attempt, "reconnect attempt failed");
        }

        tokio::time::sleep(Duration::from_secs(5)).await;
        if self
            .transport
            .reconnect(Some(DEFAULT_GATEWAY_URL.to_string()))
            .await
            .is_ok()
        {
            self.reconnecting.store(false, Ordering::SeqCst);
            return true;
        }

        self.reconnecting.store(false, Ordering::SeqCst);
        let _ = self.fatal_tx.send(FatalSessionError(
            "reconnect and fresh connect both failed".to_string(),
        ));
        false
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::commands::CommandClient as CommandClientTrait;
    use crate::error::HttpError;
    use crate::types::{CreateMessage, Message as ChatMessage};

    struct NoopTransport {
        rx: async_channel::Receiver<Vec<u8>>,
        err_rx: async_channel::Receiver<TransportError>,
    }

    impl NoopTransport {
        fn new() -> Self {
            let (_tx, rx) = async_channel::bounded(1);
            let (_etx, err_rx) = async_channel::bounded(1);
            Self { rx, err_rx }
        }
    }

    #[async_trait]
    impl Transport for NoopTransport {
        async fn connect(&self) -> Result<(), TransportError> {
            Ok(())
        }
        async fn reconnect(&self, _url: Option<String>) -> Result<(), TransportError> {
            Ok(())
        }
        async fn close(&self) {}
        async fn send(&self, _msg: Vec<u8>) {}
        fn is_connected(&self) -> bool {
            true
        }
        fn receive(&self) -> async_channel::Receiver<Vec<u8>> {
            self.rx.clone()
        }
        fn errors(&self) -> async_channel::Receiver<TransportError> {
            self.err_rx.clone()
        }
    }

    struct NoopCommandClient;

    #[async_trait]
    impl CommandClientTrait for NoopCommandClient {
        async fn send_message(&self, _channel_id: &str, _body: CreateMessage) -> Result<ChatMessage, HttpError> {
            unimplemented!("not exercised by these tests")
        }
    }

    fn test_session() -> Arc<SessionCore> {
        let (fatal_tx, _fatal_rx) = mpsc::unbounded_channel();
        Arc::new(SessionCore::new(
            Arc::new(NoopTransport::new()),
            WorkerPool::new(1, 1),
            Arc::new(HandlerRegistry::new()),
            Arc::new(EntityCache::new()),
            Arc::new(CommandRouter::new(".")),
            Arc::new(NoopCommandClient),
            GatewayConfig {
                token: "test".into(),
                intents: 0,
                prefix: ".".into(),
            },
            fatal_tx,
        ))
    }

    #[tokio::test]
    async fn minimal_ready_frame_stores_session_state_and_caches_unavailable_guilds() {
        let session = test_session();
        let frame = json!({
            "op": 0,
            "t": "READY",
            "s": 1,
            "d": {
                "session_id": "test_session",
                "resume_gateway_url": "wss://test.gateway",
                "guilds": [{"id": "1", "unavailable": true}, {"id": "2", "unavailable": true}],
            }
        });
        let reason = session.handle_frame(frame.to_string().into_bytes()).await;
        assert!(reason.is_none());

        let fields = session.fields.lock().await;
        assert_eq!(fields.session_id.as_deref(), Some("test_session"));
        assert_eq!(fields.resume_gateway_url.as_deref(), Some("wss://test.gateway"));
        drop(fields);

        assert_eq!(session.cache.guilds_count(), 2);
    }
}
