//! Built-in WhatsApp command plugins.
//!
//! The command registry is populated at boot; deployments extend it with
//! their own handlers. Only the connectivity probe lives in-tree — it is
//! what the health monitor's self-ping exercises.

use std::sync::Arc;

use async_trait::async_trait;
use wamux_core::client::WaSocket;
use wamux_core::message::InboundMessage;
use wamux_core::plugin::{CommandHandler, CommandRegistry, PluginError};

/// `ping` — replies `pong`. Doubles as the self-ping target: the reply is
/// inbound traffic, which is exactly the evidence of life the health
/// monitor waits for.
pub struct PingCommand;

#[async_trait]
impl CommandHandler for PingCommand {
    fn name(&self) -> &str {
        "ping"
    }

    async fn execute(
        &self,
        sock: Arc<dyn WaSocket>,
        _session_id: &str,
        _args: &str,
        msg: &InboundMessage,
    ) -> Result<(), PluginError> {
        msg.reply(sock.as_ref(), "pong").await?;
        Ok(())
    }
}

/// Build the boot-time command registry.
pub fn build_registry() -> CommandRegistry {
    let mut registry = CommandRegistry::new();
    registry.register(Arc::new(PingCommand));
    registry
}
