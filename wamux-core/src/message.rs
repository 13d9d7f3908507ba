//! In-flight message model.
//!
//! Raw wire messages ([`WaMessage`]) carry an opaque content tree that
//! mirrors the wire protobuf. The ingress pipeline enriches them into
//! [`InboundMessage`]s with resolved identities, admin flags, and a parsed
//! command, which is what plugins receive.

use chrono::{DateTime, Utc};

use crate::client::{ClientError, OutboundContent, WaSocket};

/// Identity of one message on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageKey {
    /// The chat the message belongs to.
    pub remote_jid: String,
    /// Server-assigned message id, unique within the chat.
    pub id: String,
    /// Sent by this session.
    pub from_me: bool,
    /// The authoring participant, set in group chats.
    pub participant: Option<String>,
}

impl MessageKey {
    /// Key without a participant (private chats).
    pub fn new(remote_jid: impl Into<String>, id: impl Into<String>, from_me: bool) -> Self {
        Self {
            remote_jid: remote_jid.into(),
            id: id.into(),
            from_me,
            participant: None,
        }
    }

    /// Set the group participant.
    #[must_use]
    pub fn with_participant(mut self, participant: impl Into<String>) -> Self {
        self.participant = Some(participant.into());
        self
    }
}

/// A raw message as delivered by the client library.
#[derive(Debug, Clone, PartialEq)]
pub struct WaMessage {
    /// Wire identity.
    pub key: MessageKey,
    /// Decrypted content tree; `None` when decryption failed.
    pub content: Option<serde_json::Value>,
    /// Stub marker for undecryptable/system messages.
    pub message_stub_type: Option<u32>,
    /// Seconds since epoch, when the wire carried one.
    pub timestamp: Option<i64>,
    /// Sender's display name.
    pub push_name: Option<String>,
}

/// Stub type marking a ciphertext the library could not decrypt yet.
pub const STUB_CIPHERTEXT: u32 = 2;

impl WaMessage {
    /// A plain text message, mostly for tests and synthetic pings.
    pub fn text(key: MessageKey, body: impl Into<String>) -> Self {
        Self {
            key,
            content: Some(serde_json::json!({ "conversation": body.into() })),
            message_stub_type: None,
            timestamp: None,
            push_name: None,
        }
    }

    /// True for undecrypted ciphertext stubs, which are retried via a
    /// placeholder resend rather than processed.
    pub fn is_ciphertext_stub(&self) -> bool {
        self.content.is_none() && self.message_stub_type == Some(STUB_CIPHERTEXT)
    }

    /// Extract the text body from whichever content node carries it.
    pub fn body(&self) -> Option<String> {
        let content = self.content.as_ref()?;
        if let Some(text) = content["conversation"].as_str() {
            return Some(text.to_string());
        }
        if let Some(text) = content["extendedTextMessage"]["text"].as_str() {
            return Some(text.to_string());
        }
        for media in ["imageMessage", "videoMessage", "documentMessage"] {
            if let Some(caption) = content[media]["caption"].as_str() {
                return Some(caption.to_string());
            }
        }
        None
    }

    /// The first `contextInfo` node found under any content node.
    pub fn context_info(&self) -> Option<&serde_json::Value> {
        let content = self.content.as_ref()?.as_object()?;
        for (_, node) in content {
            let ctx = &node["contextInfo"];
            if ctx.is_object() {
                return Some(ctx);
            }
        }
        None
    }

    /// The quoted message reference, when this message replies to another.
    pub fn quoted(&self) -> Option<QuotedMessage> {
        let ctx = self.context_info()?;
        let content = ctx.get("quotedMessage").filter(|q| !q.is_null()).cloned();
        let stanza_id = ctx["stanzaId"].as_str().map(str::to_string);
        let participant = ctx["participant"].as_str().map(str::to_string);
        if content.is_none() && stanza_id.is_none() {
            return None;
        }
        Some(QuotedMessage {
            participant,
            stanza_id,
            content,
        })
    }

    /// Resolve interactive-response envelopes to the command text they carry.
    ///
    /// List selections, button replies, template button replies, and native
    /// flow replies each wrap a command id in a different envelope; the
    /// ingress pipeline treats the unwrapped id as if the user had typed it.
    pub fn interactive_response(&self) -> Option<String> {
        let content = self.content.as_ref()?;

        if let Some(row_id) =
            content["listResponseMessage"]["singleSelectReply"]["selectedRowId"].as_str()
        {
            return Some(row_id.to_string());
        }
        if let Some(button_id) = content["buttonsResponseMessage"]["selectedButtonId"].as_str() {
            return Some(button_id.to_string());
        }
        if let Some(selected) = content["templateButtonReplyMessage"]["selectedId"].as_str() {
            return Some(selected.to_string());
        }
        if let Some(params) =
            content["interactiveResponseMessage"]["nativeFlowResponseMessage"]["paramsJson"]
                .as_str()
            && let Ok(parsed) = serde_json::from_str::<serde_json::Value>(params)
            && let Some(id) = parsed["id"].as_str()
        {
            return Some(id.to_string());
        }
        None
    }
}

/// Reference to a quoted (replied-to) message.
#[derive(Debug, Clone, PartialEq)]
pub struct QuotedMessage {
    /// Author of the quoted message, normalized by the ingress pipeline.
    pub participant: Option<String>,
    /// Wire id of the quoted message.
    pub stanza_id: Option<String>,
    /// Content tree of the quoted message.
    pub content: Option<serde_json::Value>,
}

/// A parsed command: name plus the remaining argument string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Lower-cased command name.
    pub name: String,
    /// Everything after the name, trimmed.
    pub args: String,
}

/// Parse `body` against the user's command prefix.
///
/// An empty prefix means every non-empty message is a command. With a
/// prefix, the body must start with it exactly.
pub fn parse_command(body: &str, prefix: &str) -> Option<Command> {
    let stripped = if prefix.is_empty() {
        body
    } else {
        body.strip_prefix(prefix)?
    };
    let stripped = stripped.trim_start();
    let mut parts = stripped.splitn(2, char::is_whitespace);
    let name = parts.next().filter(|n| !n.is_empty())?;
    let args = parts.next().unwrap_or("").trim().to_string();
    Some(Command {
        name: name.to_lowercase(),
        args,
    })
}

/// A fully enriched inbound message, as handed to plugins.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// The normalized raw message (used for quoting on reply).
    pub raw: WaMessage,
    /// Chat JID, normalized.
    pub chat: String,
    /// Author JID, normalized and LID-resolved.
    pub sender: String,
    /// Chat is a group.
    pub is_group: bool,
    /// Sender is an admin of the chat. In private chats both sides count
    /// as admins.
    pub is_admin: bool,
    /// Sender is the session owner (own phone).
    pub is_creator: bool,
    /// Text body, empty when the message has no text.
    pub body: String,
    /// Parsed command, when the body matched the user's prefix.
    pub command: Option<Command>,
    /// Quoted message, when this is a reply.
    pub quoted: Option<QuotedMessage>,
    /// Corrected timestamp.
    pub timestamp: DateTime<Utc>,
    /// Sender display name.
    pub push_name: Option<String>,
}

impl InboundMessage {
    /// Reply in the same chat, quoting this message.
    pub async fn reply(&self, sock: &dyn WaSocket, text: &str) -> Result<(), ClientError> {
        sock.send_message(
            &self.chat,
            OutboundContent::Text(text.to_string()),
            Some(&self.raw),
        )
        .await
    }

    /// Reply with raw content, quoting this message.
    pub async fn reply_content(
        &self,
        sock: &dyn WaSocket,
        content: OutboundContent,
    ) -> Result<(), ClientError> {
        sock.send_message(&self.chat, content, Some(&self.raw)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::mock::MockSocket;

    fn key() -> MessageKey {
        MessageKey::new("123@s.whatsapp.net", "MSG1", false)
    }

    #[test]
    fn test_body_from_conversation() {
        let msg = WaMessage::text(key(), "hello world");
        assert_eq!(msg.body().as_deref(), Some("hello world"));
    }

    #[test]
    fn test_body_from_extended_text() {
        let msg = WaMessage {
            key: key(),
            content: Some(serde_json::json!({
                "extendedTextMessage": {"text": "linked text"}
            })),
            message_stub_type: None,
            timestamp: None,
            push_name: None,
        };
        assert_eq!(msg.body().as_deref(), Some("linked text"));
    }

    #[test]
    fn test_body_from_media_caption() {
        let msg = WaMessage {
            key: key(),
            content: Some(serde_json::json!({
                "imageMessage": {"caption": "look at this", "url": "..."}
            })),
            message_stub_type: None,
            timestamp: None,
            push_name: None,
        };
        assert_eq!(msg.body().as_deref(), Some("look at this"));
    }

    #[test]
    fn test_ciphertext_stub_detection() {
        let stub = WaMessage {
            key: key(),
            content: None,
            message_stub_type: Some(STUB_CIPHERTEXT),
            timestamp: None,
            push_name: None,
        };
        assert!(stub.is_ciphertext_stub());

        let with_content = WaMessage::text(key(), "x");
        assert!(!with_content.is_ciphertext_stub());

        let other_stub = WaMessage {
            key: key(),
            content: None,
            message_stub_type: Some(1),
            timestamp: None,
            push_name: None,
        };
        assert!(!other_stub.is_ciphertext_stub());
    }

    #[test]
    fn test_quoted_extraction() {
        let msg = WaMessage {
            key: key(),
            content: Some(serde_json::json!({
                "extendedTextMessage": {
                    "text": "replying",
                    "contextInfo": {
                        "participant": "987@s.whatsapp.net",
                        "stanzaId": "Q1",
                        "quotedMessage": {"conversation": "original"}
                    }
                }
            })),
            message_stub_type: None,
            timestamp: None,
            push_name: None,
        };
        let quoted = msg.quoted().unwrap();
        assert_eq!(quoted.participant.as_deref(), Some("987@s.whatsapp.net"));
        assert_eq!(quoted.stanza_id.as_deref(), Some("Q1"));
        assert_eq!(
            quoted.content.unwrap()["conversation"].as_str(),
            Some("original")
        );
    }

    #[test]
    fn test_interactive_list_response() {
        let msg = WaMessage {
            key: key(),
            content: Some(serde_json::json!({
                "listResponseMessage": {
                    "singleSelectReply": {"selectedRowId": "menu"}
                }
            })),
            message_stub_type: None,
            timestamp: None,
            push_name: None,
        };
        assert_eq!(msg.interactive_response().as_deref(), Some("menu"));
    }

    #[test]
    fn test_interactive_button_and_template() {
        let button = WaMessage {
            key: key(),
            content: Some(serde_json::json!({
                "buttonsResponseMessage": {"selectedButtonId": "ping"}
            })),
            message_stub_type: None,
            timestamp: None,
            push_name: None,
        };
        assert_eq!(button.interactive_response().as_deref(), Some("ping"));

        let template = WaMessage {
            key: key(),
            content: Some(serde_json::json!({
                "templateButtonReplyMessage": {"selectedId": "help"}
            })),
            message_stub_type: None,
            timestamp: None,
            push_name: None,
        };
        assert_eq!(template.interactive_response().as_deref(), Some("help"));
    }

    #[test]
    fn test_interactive_native_flow() {
        let msg = WaMessage {
            key: key(),
            content: Some(serde_json::json!({
                "interactiveResponseMessage": {
                    "nativeFlowResponseMessage": {
                        "paramsJson": "{\"id\":\"stats\"}"
                    }
                }
            })),
            message_stub_type: None,
            timestamp: None,
            push_name: None,
        };
        assert_eq!(msg.interactive_response().as_deref(), Some("stats"));
    }

    #[test]
    fn test_parse_command_with_prefix() {
        let cmd = parse_command("!ping now please", "!").unwrap();
        assert_eq!(cmd.name, "ping");
        assert_eq!(cmd.args, "now please");

        assert!(parse_command("ping", "!").is_none());
        assert!(parse_command("", "!").is_none());
    }

    #[test]
    fn test_parse_command_empty_prefix() {
        // Empty prefix: every non-empty message is a command.
        let cmd = parse_command("Ping arg1", "").unwrap();
        assert_eq!(cmd.name, "ping");
        assert_eq!(cmd.args, "arg1");

        assert!(parse_command("", "").is_none());
        assert!(parse_command("   ", "").is_none());
    }

    #[test]
    fn test_parse_command_name_lowercased() {
        let cmd = parse_command("!HELP", "!").unwrap();
        assert_eq!(cmd.name, "help");
        assert_eq!(cmd.args, "");
    }

    #[tokio::test]
    async fn test_reply_quotes_original() {
        let sock = MockSocket::connected("555@s.whatsapp.net");
        let raw = WaMessage::text(key(), "hi");
        let inbound = InboundMessage {
            raw: raw.clone(),
            chat: "123@s.whatsapp.net".to_string(),
            sender: "123@s.whatsapp.net".to_string(),
            is_group: false,
            is_admin: true,
            is_creator: false,
            body: "hi".to_string(),
            command: None,
            quoted: None,
            timestamp: Utc::now(),
            push_name: None,
        };

        inbound.reply(&sock, "hello back").await.unwrap();

        let sent = sock.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].jid, "123@s.whatsapp.net");
        assert!(sent[0].quoted);
    }
}
