//! Telegram slash-command handlers for fleet control.
//!
//! The chat-bot origination path: `/connect` creates a WhatsApp session
//! owned by the Telegram user, `/disconnect` and `/logout` tear it down at
//! two different depths, `/status` reads the combined live/persisted view,
//! `/prefix` manages the user's WhatsApp command prefix, and `/fleet`
//! gives the admin an overview.

use std::sync::Arc;

use teloxide::prelude::*;
use teloxide::types::Message as TgMessage;
use teloxide::utils::command::BotCommands;
use wamux_core::fleet::{CreateRequest, SessionCallbacks};
use wamux_core::session::{SessionSource, session_id_for};
use wamux_core::{Config, PrefixCache, SessionManager};

/// All slash commands supported by the fleet bot.
#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase", description = "Available commands:")]
pub enum Command {
    /// Show available commands.
    #[command(description = "Show available commands")]
    Help,
    /// Pair a WhatsApp session, optionally with a phone number for a
    /// pairing code.
    #[command(description = "Connect a WhatsApp session")]
    Connect(String),
    /// Disconnect the session but keep credentials for a quick return.
    #[command(description = "Disconnect your session")]
    Disconnect,
    /// Disconnect and erase the session completely.
    #[command(description = "Log out and erase your session")]
    Logout,
    /// Show the session's current state.
    #[command(description = "Show session status")]
    Status,
    /// Set the WhatsApp command prefix; "none" disables it.
    #[command(description = "Set your command prefix")]
    Prefix(String),
    /// Fleet overview (admin only).
    #[command(description = "Fleet overview")]
    Fleet,
}

/// Entry-point handler for all slash commands.
pub async fn handle_command(
    bot: Bot,
    msg: TgMessage,
    cmd: Command,
    config: Arc<Config>,
    manager: Arc<SessionManager>,
    prefixes: Arc<PrefixCache>,
) -> ResponseResult<()> {
    let Some(user) = msg.from.as_ref() else {
        return Ok(());
    };
    let user_id = user.id.0.to_string();

    match cmd {
        Command::Help => cmd_help(&bot, &msg).await,
        Command::Connect(phone) => cmd_connect(&bot, &msg, &user_id, phone, &manager).await,
        Command::Disconnect => cmd_disconnect(&bot, &msg, &user_id, &manager, false).await,
        Command::Logout => cmd_disconnect(&bot, &msg, &user_id, &manager, true).await,
        Command::Status => cmd_status(&bot, &msg, &user_id, &manager).await,
        Command::Prefix(prefix) => cmd_prefix(&bot, &msg, &user_id, prefix, &prefixes).await,
        Command::Fleet => cmd_fleet(&bot, &msg, &user_id, &config, &manager).await,
    }
}

/// Reply with the teloxide-generated command description string.
async fn cmd_help(bot: &Bot, msg: &TgMessage) -> ResponseResult<()> {
    bot.send_message(msg.chat.id, Command::descriptions().to_string())
        .await?;
    Ok(())
}

/// Create (or resume) the user's session and surface pairing material.
async fn cmd_connect(
    bot: &Bot,
    msg: &TgMessage,
    user_id: &str,
    phone: String,
    manager: &Arc<SessionManager>,
) -> ResponseResult<()> {
    let phone = phone.trim();
    let phone_number = if phone.is_empty() {
        None
    } else {
        Some(phone.to_string())
    };

    bot.send_message(msg.chat.id, "Connecting your WhatsApp session…")
        .await?;

    let chat_id = msg.chat.id;
    let qr_bot = bot.clone();
    let connected_bot = bot.clone();
    let callbacks = SessionCallbacks {
        on_qr: Some(Arc::new(move |_session: &str, qr: &str| {
            let bot = qr_bot.clone();
            let qr = qr.to_string();
            tokio::spawn(async move {
                let text = format!("Scan this code in WhatsApp → Linked devices:\n{qr}");
                if let Err(e) = bot.send_message(chat_id, text).await {
                    tracing::warn!(error = %e, "QR delivery failed");
                }
            });
        })),
        on_connected: Some(Arc::new(move |_session: &str| {
            let bot = connected_bot.clone();
            tokio::spawn(async move {
                if let Err(e) = bot
                    .send_message(chat_id, "WhatsApp session connected.")
                    .await
                {
                    tracing::warn!(error = %e, "connect confirmation failed");
                }
            });
        })),
        ..SessionCallbacks::default()
    };

    let result = manager
        .create(CreateRequest {
            user_id: user_id.to_string(),
            phone_number: phone_number.clone(),
            source: SessionSource::Telegram,
            is_reconnect: false,
            allow_pairing: true,
            callbacks,
        })
        .await;

    match result {
        Ok(socket) => {
            if let Some(phone) = phone_number {
                match socket.request_pairing_code(&phone).await {
                    Ok(code) => {
                        bot.send_message(
                            msg.chat.id,
                            format!("Pairing code for {phone}: {code}"),
                        )
                        .await?;
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "pairing code unavailable, QR flow applies");
                    }
                }
            }
        }
        Err(e) => {
            tracing::warn!(user = %user_id, error = %e, "connect failed");
            bot.send_message(msg.chat.id, format!("Could not connect: {e}"))
                .await?;
        }
    }
    Ok(())
}

/// Voluntary disconnect; `erase` runs the full cleanup.
async fn cmd_disconnect(
    bot: &Bot,
    msg: &TgMessage,
    user_id: &str,
    manager: &Arc<SessionManager>,
    erase: bool,
) -> ResponseResult<()> {
    let session_id = session_id_for(user_id);
    match manager.disconnect(&session_id, erase).await {
        Ok(()) => {
            let reply = if erase {
                "Session erased. Use /connect to pair again."
            } else {
                "Session disconnected. Use /connect to resume."
            };
            bot.send_message(msg.chat.id, reply).await?;
        }
        Err(e) => {
            tracing::warn!(session = %session_id, error = %e, "disconnect failed");
            bot.send_message(msg.chat.id, format!("Disconnect failed: {e}"))
                .await?;
        }
    }
    Ok(())
}

/// Show the combined live/persisted session view.
async fn cmd_status(
    bot: &Bot,
    msg: &TgMessage,
    user_id: &str,
    manager: &Arc<SessionManager>,
) -> ResponseResult<()> {
    let session_id = session_id_for(user_id);
    let reply = match manager.get_session_info(&session_id).await {
        Ok(info) => format!(
            "Session: {}\nStatus: {}\nLive socket: {}\nWire open: {}\nAttempts: {}",
            info.session_id,
            info.status.as_str(),
            if info.in_registry { "yes" } else { "no" },
            if info.ws_open { "yes" } else { "no" },
            info.reconnect_attempts,
        ),
        Err(_) => "No session found. Use /connect to pair one.".to_string(),
    };
    bot.send_message(msg.chat.id, reply).await?;
    Ok(())
}

/// Set the user's WhatsApp command prefix; `"none"` means every message
/// is a command.
async fn cmd_prefix(
    bot: &Bot,
    msg: &TgMessage,
    user_id: &str,
    prefix: String,
    prefixes: &Arc<PrefixCache>,
) -> ResponseResult<()> {
    let prefix = prefix.trim();
    if prefix.is_empty() {
        bot.send_message(msg.chat.id, "Usage: /prefix <symbol> (or \"none\")")
            .await?;
        return Ok(());
    }

    let effective = if prefix.eq_ignore_ascii_case("none") {
        ""
    } else {
        prefix
    };
    match prefixes.set_prefix(user_id, effective).await {
        Ok(()) => {
            let reply = if effective.is_empty() {
                "Prefix removed: every message is now a command.".to_string()
            } else {
                format!("Prefix set to {effective}")
            };
            bot.send_message(msg.chat.id, reply).await?;
        }
        Err(e) => {
            tracing::warn!(user = %user_id, error = %e, "prefix update failed");
            bot.send_message(msg.chat.id, "Could not update the prefix, try again.")
                .await?;
        }
    }
    Ok(())
}

/// Admin-only fleet overview.
async fn cmd_fleet(
    bot: &Bot,
    msg: &TgMessage,
    user_id: &str,
    config: &Arc<Config>,
    manager: &Arc<SessionManager>,
) -> ResponseResult<()> {
    if !is_admin(user_id, config) {
        return Ok(()); // Silent drop for non-admins.
    }

    let sessions = manager.get_all_sessions();
    let connected = sessions
        .iter()
        .filter(|id| manager.is_really_connected(id))
        .count();

    let mut reply = format!(
        "Fleet: {} sessions registered, {} fully connected.",
        sessions.len(),
        connected
    );
    for session_id in sessions.iter().take(25) {
        let live = if manager.is_really_connected(session_id) {
            "up"
        } else {
            "down"
        };
        reply.push_str(&format!("\n{session_id}: {live}"));
    }

    bot.send_message(msg.chat.id, reply).await?;
    Ok(())
}

/// Whether the Telegram user is the configured fleet admin.
pub fn is_admin(user_id: &str, config: &Config) -> bool {
    config
        .fleet
        .default_admin_id
        .as_deref()
        .is_some_and(|admin| admin == user_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_admin_matches_configured_id() {
        let mut config = Config::default();
        assert!(!is_admin("100", &config));

        config.fleet.default_admin_id = Some("100".to_string());
        assert!(is_admin("100", &config));
        assert!(!is_admin("200", &config));
    }
}
