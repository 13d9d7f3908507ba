//! Pluggable command handlers.
//!
//! Plugins are discovered at boot and stored in a registry keyed by
//! command name; the ingress pipeline invokes them through the
//! [`CommandHandler`] trait. Anti-plugins ([`MessageHook`]) inspect every
//! message before command routing and may consume it; a [`GameHandler`]
//! gets non-command text last.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::client::{ClientError, WaSocket};
use crate::message::InboundMessage;

/// Error type for plugin execution.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    /// The handler failed.
    #[error("plugin error: {0}")]
    Execution(String),

    /// A socket request inside the handler failed.
    #[error("client error: {0}")]
    Client(#[from] ClientError),
}

/// One command implementation.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// The command name users type (without prefix), lower-case.
    fn name(&self) -> &str;

    /// Commands that mutate shared game state; the dispatcher serializes
    /// these per chat through the game lock.
    fn game_scoped(&self) -> bool {
        false
    }

    /// Run the command.
    async fn execute(
        &self,
        sock: Arc<dyn WaSocket>,
        session_id: &str,
        args: &str,
        msg: &InboundMessage,
    ) -> Result<(), PluginError>;
}

/// Anti-plugin hook, run on every message before command routing.
#[async_trait]
pub trait MessageHook: Send + Sync {
    /// Hook name, for logs.
    fn name(&self) -> &str;

    /// Inspect the message. Returning `true` consumes it: no command
    /// dispatch, no game handling.
    async fn inspect(
        &self,
        sock: Arc<dyn WaSocket>,
        session_id: &str,
        msg: &InboundMessage,
    ) -> Result<bool, PluginError>;
}

/// Handler for non-command text that might belong to a running game.
#[async_trait]
pub trait GameHandler: Send + Sync {
    /// Handle the text. Returning `true` means a game consumed it.
    async fn handle_text(
        &self,
        sock: Arc<dyn WaSocket>,
        session_id: &str,
        msg: &InboundMessage,
    ) -> Result<bool, PluginError>;
}

/// Registry of commands, hooks, and the optional game handler.
#[derive(Default)]
pub struct CommandRegistry {
    commands: HashMap<String, Arc<dyn CommandHandler>>,
    hooks: Vec<Arc<dyn MessageHook>>,
    game: Option<Arc<dyn GameHandler>>,
}

impl CommandRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a command under its declared name. A later registration
    /// with the same name replaces the earlier one.
    pub fn register(&mut self, handler: Arc<dyn CommandHandler>) {
        self.commands
            .insert(handler.name().to_lowercase(), handler);
    }

    /// Register an anti-plugin hook. Hooks run in registration order.
    pub fn register_hook(&mut self, hook: Arc<dyn MessageHook>) {
        self.hooks.push(hook);
    }

    /// Install the game handler.
    pub fn set_game_handler(&mut self, handler: Arc<dyn GameHandler>) {
        self.game = Some(handler);
    }

    /// Look up a command by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn CommandHandler>> {
        self.commands.get(name).cloned()
    }

    /// Registered hooks, in order.
    pub fn hooks(&self) -> &[Arc<dyn MessageHook>] {
        &self.hooks
    }

    /// The game handler, when installed.
    pub fn game_handler(&self) -> Option<Arc<dyn GameHandler>> {
        self.game.clone()
    }

    /// All registered command names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.commands.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered commands.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// True when no commands are registered.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}
