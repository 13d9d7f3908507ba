//! WhatsApp identifier normalization.
//!
//! Wire identifiers arrive in several shapes: phone JIDs with device
//! suffixes (`2348...:12@s.whatsapp.net`), group JIDs (`...@g.us`),
//! lightweight per-group identifiers (`...@lid`), and broadcast pseudo-JIDs.
//! Everything here canonicalizes them for identity comparison and routing.

use crate::client::{ClientError, WaSocket};
use crate::message::WaMessage;

/// Server suffix for user (phone) JIDs.
pub const USER_SERVER: &str = "s.whatsapp.net";
/// Server suffix for group JIDs.
pub const GROUP_SERVER: &str = "g.us";
/// Server suffix for lightweight identifiers.
pub const LID_SERVER: &str = "lid";
/// Server suffix for broadcast lists.
pub const BROADCAST_SERVER: &str = "broadcast";
/// Server suffix for newsletters (channels).
pub const NEWSLETTER_SERVER: &str = "newsletter";
/// The status broadcast pseudo-chat.
pub const STATUS_BROADCAST: &str = "status@broadcast";

/// A parsed JID: `user[:device]@server`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Jid {
    /// The part left of `@`, with any device suffix removed.
    pub user: String,
    /// Device instance, when the wire form carried a `:N` suffix.
    pub device: Option<u16>,
    /// The server (domain) part.
    pub server: String,
}

impl Jid {
    /// Render the canonical (device-less) form.
    pub fn to_canonical(&self) -> String {
        format!("{}@{}", self.user, self.server)
    }
}

impl std::fmt::Display for Jid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.device {
            Some(d) => write!(f, "{}:{}@{}", self.user, d, self.server),
            None => write!(f, "{}@{}", self.user, self.server),
        }
    }
}

/// Parse a JID into its parts. Returns `None` when there is no `@`.
pub fn parse_jid(jid: &str) -> Option<Jid> {
    let (local, server) = jid.split_once('@')?;
    if local.is_empty() || server.is_empty() {
        return None;
    }
    let (user, device) = match local.split_once(':') {
        Some((user, suffix)) => match suffix.parse::<u16>() {
            Ok(d) => (user, Some(d)),
            // Non-numeric suffix is part of the identity, not a device tag.
            Err(_) => (local, None),
        },
        None => (local, None),
    };
    Some(Jid {
        user: user.to_string(),
        device,
        server: server.to_string(),
    })
}

/// Strip the device suffix, preserving the server part.
///
/// `2348...:0@s.whatsapp.net` becomes `2348...@s.whatsapp.net`; group and
/// LID JIDs keep their servers. Inputs without `@` pass through unchanged.
pub fn normalize_jid(jid: &str) -> String {
    match parse_jid(jid) {
        Some(parsed) => parsed.to_canonical(),
        None => jid.to_string(),
    }
}

/// True for group JIDs (`@g.us`).
pub fn is_group(jid: &str) -> bool {
    jid.ends_with(&format!("@{GROUP_SERVER}"))
}

/// True for user (phone) JIDs (`@s.whatsapp.net`).
pub fn is_user(jid: &str) -> bool {
    jid.ends_with(&format!("@{USER_SERVER}"))
}

/// True for lightweight identifiers (`@lid`).
pub fn is_lid(jid: &str) -> bool {
    jid.ends_with(&format!("@{LID_SERVER}"))
}

/// True for broadcast pseudo-JIDs, including `status@broadcast`.
pub fn is_broadcast(jid: &str) -> bool {
    jid.ends_with(&format!("@{BROADCAST_SERVER}"))
}

/// True for newsletter (channel) JIDs.
pub fn is_newsletter(jid: &str) -> bool {
    jid.ends_with(&format!("@{NEWSLETTER_SERVER}"))
}

/// Extract the bare phone number from a user JID.
///
/// Returns `None` for groups, LIDs, and anything unparsable.
pub fn extract_phone(jid: &str) -> Option<String> {
    let parsed = parse_jid(jid)?;
    if parsed.server != USER_SERVER {
        return None;
    }
    Some(parsed.user.trim_start_matches('+').to_string())
}

/// Compare two JIDs for identity, ignoring device suffixes.
pub fn is_same_jid(a: &str, b: &str) -> bool {
    normalize_jid(a) == normalize_jid(b)
}

/// Resolve a LID to its phone-form JID via the group participant list.
///
/// Consults the socket's group metadata and matches the LID against each
/// participant. Falls back to the input (normalized) when the group cannot
/// be fetched or no participant matches — downstream code then compares
/// LIDs directly, which is still stable within one group.
pub async fn resolve_lid_to_jid(sock: &dyn WaSocket, group_jid: &str, lid: &str) -> String {
    let normalized_lid = normalize_jid(lid);
    if !is_lid(&normalized_lid) {
        return normalized_lid;
    }

    let metadata = match sock.group_metadata(group_jid).await {
        Ok(meta) => meta,
        Err(ClientError::NotConnected) => return normalized_lid,
        Err(e) => {
            tracing::debug!(group = %group_jid, error = %e, "group metadata fetch failed during LID resolution");
            return normalized_lid;
        }
    };

    for participant in &metadata.participants {
        if let Some(participant_lid) = &participant.lid
            && is_same_jid(participant_lid, &normalized_lid)
        {
            return normalize_jid(&participant.jid);
        }
    }

    normalized_lid
}

/// Normalize every JID field of a raw message in place: the chat, the
/// participant, and any quoted-message participant buried in `contextInfo`.
pub fn normalize_message(message: &mut WaMessage) {
    message.key.remote_jid = normalize_jid(&message.key.remote_jid);
    if let Some(participant) = &message.key.participant {
        message.key.participant = Some(normalize_jid(participant));
    }
    if let Some(content) = &mut message.content {
        normalize_context_info(content);
    }
}

/// Recursively normalize `contextInfo.participant` fields inside message
/// content. The content tree mirrors the wire protobuf, so the field can
/// appear under any nested message node.
fn normalize_context_info(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            if let Some(serde_json::Value::String(participant)) = map.get_mut("participant") {
                *participant = normalize_jid(participant);
            }
            for (_, child) in map.iter_mut() {
                normalize_context_info(child);
            }
        }
        serde_json::Value::Array(items) => {
            for item in items.iter_mut() {
                normalize_context_info(item);
            }
        }
        _ => {}
    }
}
