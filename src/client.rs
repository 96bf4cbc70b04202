//! Public client facade: wires transport, session core, worker pool,
//! cache, REST, handler registry, and command router into one handle.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::cache::EntityCache;
use crate::commands::{Command, CommandClient, CommandRouter};
use crate::error::{ClientError, FatalSessionError, HttpError};
use crate::http::RestClient;
use crate::registry::HandlerRegistry;
use crate::session::{GatewayConfig, SessionCore, DEFAULT_GATEWAY_URL};
use crate::transport::{Transport, WsTransport};
use crate::types::{CreateMessage, Guild, Message};
use crate::workerpool::WorkerPool;

const DEFAULT_WORKER_COUNT: i64 = 4;
const MIN_WORKER_COUNT: i64 = 2;
const QUEUE_CAPACITY: usize = 256;
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

/// Configuration needed to start a client, independent of any one
/// transport/session wiring choice.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub token: String,
    pub intents: u32,
    pub prefix: String,
}

impl ClientConfig {
    /// Reads `DISCORD_TOKEN`, `COMMAND_PREFIX` (default `.`), and intents
    /// from the environment, loading a `.env` file first if present.
    pub fn from_env(intents: u32) -> Result<Self, ClientError> {
        dotenv::dotenv().ok();
        let token = std::env::var("DISCORD_TOKEN")
            .map_err(|_| ClientError::Config("DISCORD_TOKEN environment variable not set".into()))?;
        let prefix = std::env::var("COMMAND_PREFIX").unwrap_or_else(|_| ".".to_string());
        Ok(Self {
            token,
            intents,
            prefix,
        })
    }
}

/// The assembled gateway client. Cheap to clone — every field is an `Arc`
/// or a handle around one.
#[derive(Clone)]
pub struct Client {
    session: Arc<SessionCore>,
    rest: Arc<RestClient>,
    registry: Arc<HandlerRegistry>,
    cache: Arc<EntityCache>,
    commands: Arc<CommandRouter>,
    pool: WorkerPool,
    run_handle: Arc<std::sync::Mutex<Option<JoinHandle<()>>>>,
}

impl Client {
    /// Assembles a client around the given configuration. Errors before any
    /// I/O if the token is empty.
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        if config.token.trim().is_empty() {
            return Err(ClientError::Config("token cannot be empty".into()));
        }

        let transport: Arc<dyn Transport> = Arc::new(WsTransport::new(DEFAULT_GATEWAY_URL));
        let pool = WorkerPool::with_capacity(DEFAULT_WORKER_COUNT, MIN_WORKER_COUNT, QUEUE_CAPACITY);
        let registry = Arc::new(HandlerRegistry::new());
        let cache = Arc::new(EntityCache::new());
        let commands = Arc::new(CommandRouter::new(config.prefix.clone()));
        let rest = Arc::new(RestClient::new(config.token.clone()));
        let command_client: Arc<dyn CommandClient> = rest.clone();

        let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel::<FatalSessionError>();
        tokio::spawn(async move {
            if let Some(err) = fatal_rx.recv().await {
                error!(error = %err, "session core reported a fatal error");
            }
        });

        let gateway_config = GatewayConfig {
            token: config.token,
            intents: config.intents,
            prefix: config.prefix,
        };
        let session = Arc::new(SessionCore::new(
            transport,
            pool.clone(),
            registry.clone(),
            cache.clone(),
            commands.clone(),
            command_client,
            gateway_config,
            fatal_tx,
        ));

        Ok(Self {
            session,
            rest,
            registry,
            cache,
            commands,
            pool,
            run_handle: Arc::new(std::sync::Mutex::new(None)),
        })
    }

    /// Start the gateway connection. Returns an error if already running.
    pub fn start(&self) -> Result<(), ClientError> {
        let mut guard = self.run_handle.lock().unwrap();
        if guard.is_some() {
            return Err(ClientError::AlreadyStarted);
        }
        let session = self.session.clone();
        *guard = Some(tokio::spawn(async move {
            info!("gateway client starting");
            session.run().await;
        }));
        Ok(())
    }

    /// Gracefully stop the gateway connection and drain the worker pool.
    pub async fn stop(&self) -> Result<(), ClientError> {
        let handle = self.run_handle.lock().unwrap().take();
        let Some(handle) = handle else {
            return Err(ClientError::NotStarted);
        };
        self.session.stop().await;
        let _ = handle.await;
        self.pool.shutdown(SHUTDOWN_DEADLINE).await;
        Ok(())
    }

    /// Register a handler invoked every time `event_name` dispatches.
    pub fn on(&self, event_name: impl Into<String>, f: impl Fn(serde_json::Value) + Send + Sync + 'static) {
        self.registry.on(event_name, f);
    }

    /// Register a handler invoked at most once for `event_name`.
    pub fn once(&self, event_name: impl Into<String>, f: impl Fn(serde_json::Value) + Send + Sync + 'static) {
        self.registry.once(event_name, f);
    }

    /// Register a text command (default prefix `.`, see [`ClientConfig`]).
    pub fn add_command(&self, command: Command) {
        self.commands.add_command(command);
    }

    pub fn cache(&self) -> &EntityCache {
        &self.cache
    }

    /// `POST /channels/{channel_id}/messages`.
    pub async fn send_message(&self, channel_id: &str, body: CreateMessage) -> Result<Message, HttpError> {
        self.rest.send_message(channel_id, body).await
    }

    /// `GET /guilds/{guild_id}`.
    pub async fn get_guild(&self, guild_id: &str) -> Result<Guild, HttpError> {
        self.rest.get_guild(guild_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_from_env_requires_token() {
        std::env::remove_var("DISCORD_TOKEN");
        let result = ClientConfig::from_env(0);
        assert!(result.is_err());
    }

    #[test]
    fn config_from_env_defaults_prefix_to_dot() {
        std::env::set_var("DISCORD_TOKEN", "test-token");
        std::env::remove_var("COMMAND_PREFIX");
        let config = ClientConfig::from_env(0).unwrap();
        assert_eq!(config.prefix, ".");
        std::env::remove_var("DISCORD_TOKEN");
    }

    #[tokio::test]
    async fn client_start_twice_errors() {
        let client = Client::new(ClientConfig {
            token: "test".into(),
            intents: 0,
            prefix: ".".into(),
        })
        .unwrap();
        client.start().unwrap();
        assert!(client.start().is_err());
        client.stop().await.unwrap();
    }

    #[test]
    fn new_rejects_empty_token() {
        let result = Client::new(ClientConfig {
            token: "".into(),
            intents: 0,
            prefix: ".".into(),
        });
        assert!(result.is_err());
    }
}
