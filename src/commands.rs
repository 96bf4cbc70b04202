//! Command router: prefix-triggered text command dispatch.
//!
//! Prefix parsing strips only the configured prefix itself — not
//! whitespace or arguments — so `.ping foo` looks up the literal command
//! name `"ping foo"`, not `"ping"` with an argument. Argument parsing is
//! out of scope by design.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::error::HttpError;
use crate::types::{CreateMessage, Message, Snowflake};

/// Narrow capability a running command gets back into the client, so it can
/// reply without capturing (and depending on the type of) the whole client.
#[async_trait]
pub trait CommandClient: Send + Sync {
    async fn send_message(&self, channel_id: &str, body: CreateMessage) -> Result<Message, HttpError>;
}

/// Minimum context a command needs: where the triggering message came from.
#[derive(Debug, Clone)]
pub struct CommandContext {
    pub guild_id: Option<Snowflake>,
    pub channel_id: Snowflake,
}

impl CommandContext {
    pub fn from_message(message: &Message) -> Self {
        Self {
            guild_id: message.guild_id.clone(),
            channel_id: message.channel_id.clone(),
        }
    }
}

pub struct Command {
    pub name: String,
    pub aliases: Vec<String>,
    pub description: String,
    run: Arc<dyn Fn(Arc<dyn CommandClient>, &CommandContext) + Send + Sync>,
}

impl Command {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        run: impl Fn(Arc<dyn CommandClient>, &CommandContext) + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            aliases: Vec::new(),
            description: description.into(),
            run: Arc::new(run),
        }
    }

    pub fn with_aliases(mut self, aliases: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.aliases = aliases.into_iter().map(Into::into).collect();
        self
    }

    pub fn run(&self, client: Arc<dyn CommandClient>, ctx: &CommandContext) {
        (self.run)(client, ctx);
    }
}

/// Indexes commands by name and alias, last-writer-wins on collision.
pub struct CommandRouter {
    prefix: String,
    commands: RwLock<HashMap<String, Arc<Command>>>,
}

impl CommandRouter {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            commands: RwLock::new(HashMap::new()),
        }
    }

    pub fn add_command(&self, cmd: Command) {
        let cmd = Arc::new(cmd);
        let mut map = self.commands.write().unwrap();
        map.insert(cmd.name.clone(), cmd.clone());
        for alias in &cmd.aliases {
            map.insert(alias.clone(), cmd.clone());
        }
    }

    pub fn add_commands(&self, cmds: impl IntoIterator<Item = Command>) {
        for cmd in cmds {
            self.add_command(cmd);
        }
    }

    pub fn get_command(&self, name_or_alias: &str) -> Option<Arc<Command>> {
        self.commands.read().unwrap().get(name_or_alias).cloned()
    }

    /// Try to route a MESSAGE_CREATE to a registered command. Returns
    /// `true` if a command matched and ran.
    pub fn try_route(&self, client: Arc<dyn CommandClient>, message: &Message) -> bool {
        let Some(rest) = message.content.strip_prefix(self.prefix.as_str()) else {
            return false;
        };
        let Some(cmd) = self.get_command(rest) else {
            return false;
        };
        let ctx = CommandContext::from_message(message);
        cmd.run(client, &ctx);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc as StdArc;

    struct NullClient;

    #[async_trait]
    impl CommandClient for NullClient {
        async fn send_message(&self, _channel_id: &str, _body: CreateMessage) -> Result<Message, HttpError> {
            unimplemented!("not exercised by these tests")
        }
    }

    fn null_client() -> Arc<dyn CommandClient> {
        Arc::new(NullClient)
    }

    fn msg(content: &str) -> Message {
        Message {
            id: "1".into(),
            channel_id: "c1".into(),
            guild_id: Some("g1".into()),
            author: crate::types::User {
                id: "2".into(),
                username: "a".into(),
                discriminator: None,
                avatar: None,
                bot: false,
                global_name: None,
            },
            content: content.into(),
            timestamp: "now".into(),
            edited_timestamp: None,
            tts: false,
            mention_everyone: false,
            mentions: vec![],
            attachments: vec![],
            embeds: vec![],
            pinned: false,
            message_reference: None,
            member: None,
        }
    }

    #[test]
    fn exact_prefix_and_name_match_runs_command() {
        let router = CommandRouter::new(".");
        let ran = StdArc::new(AtomicBool::new(false));
        let r = ran.clone();
        router.add_command(Command::new("ping", "pong!", move |_client, _ctx| {
            r.store(true, Ordering::SeqCst);
        }));
        assert!(router.try_route(null_client(), &msg(".ping")));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn trailing_argument_text_is_not_stripped_and_so_does_not_match() {
        let router = CommandRouter::new(".");
        let ran = StdArc::new(AtomicBool::new(false));
        let r = ran.clone();
        router.add_command(Command::new("ping", "pong!", move |_client, _ctx| {
            r.store(true, Ordering::SeqCst);
        }));
        assert!(!router.try_route(null_client(), &msg(".ping foo")));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn alias_resolves_to_same_command() {
        let router = CommandRouter::new(".");
        router.add_command(Command::new("ping", "pong!", |_client, _ctx| {}).with_aliases(["p"]));
        assert!(router.get_command("p").is_some());
    }

    #[test]
    fn last_writer_wins_on_alias_collision() {
        let router = CommandRouter::new(".");
        router.add_command(Command::new("a", "", |_client, _ctx| {}).with_aliases(["x"]));
        router.add_command(Command::new("b", "", |_client, _ctx| {}).with_aliases(["x"]));
        assert_eq!(router.get_command("x").unwrap().name, "b");
    }

    #[test]
    fn context_carries_guild_and_channel_from_message() {
        let ctx = CommandContext::from_message(&msg(".ping"));
        assert_eq!(ctx.channel_id, "c1");
        assert_eq!(ctx.guild_id.as_deref(), Some("g1"));
    }
}
