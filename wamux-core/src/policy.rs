//! Disconnect policy table.
//!
//! Pure lookup from a wire disconnect status code to the routing decision:
//! whether to reconnect, how long to wait, whether credentials survive, and
//! what (if anything) the user is told.

use std::time::Duration;

/// Raw disconnect information extracted from a `connection.update` close event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DisconnectReason {
    /// The wire status code, if the close event carried one.
    pub status_code: Option<u16>,
    /// The error text attached to the close event.
    pub message: Option<String>,
}

impl DisconnectReason {
    /// Build a reason from a bare status code.
    pub fn from_code(code: u16) -> Self {
        Self {
            status_code: Some(code),
            message: None,
        }
    }

    /// Build a reason from a status code and the accompanying error text.
    pub fn with_message(code: u16, message: impl Into<String>) -> Self {
        Self {
            status_code: Some(code),
            message: Some(message.into()),
        }
    }

    /// Classify the reason into a policy kind.
    ///
    /// Code 500 is shared between two conditions; a bad-MAC hint in the error
    /// text selects the corrupted-session variant.
    pub fn kind(&self) -> DisconnectKind {
        match self.status_code {
            Some(401) => DisconnectKind::LoggedOut,
            Some(403) => DisconnectKind::Forbidden,
            Some(405) => DisconnectKind::MethodNotAllowed,
            Some(408) => DisconnectKind::TimedOut,
            Some(409) => DisconnectKind::Conflict,
            Some(428) => DisconnectKind::ConnectionClosed,
            Some(429) => DisconnectKind::TooManyRequests,
            Some(440) => DisconnectKind::ConnectionReplaced,
            Some(500) => {
                let bad_mac = self
                    .message
                    .as_deref()
                    .is_some_and(|m| m.to_ascii_lowercase().contains("bad mac"));
                if bad_mac {
                    DisconnectKind::BadSession
                } else {
                    DisconnectKind::InternalServerError
                }
            }
            Some(503) => DisconnectKind::Unavailable,
            Some(515) => DisconnectKind::RestartRequired,
            Some(516) => DisconnectKind::StreamError,
            _ => DisconnectKind::Unknown,
        }
    }

    /// Look up the full policy row for this reason.
    pub fn policy(&self) -> DisconnectPolicy {
        self.kind().policy()
    }
}

/// Classified disconnect condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectKind {
    /// 401 — device unlinked from the phone.
    LoggedOut,
    /// 403 — account banned.
    Forbidden,
    /// 405 — spurious close during pairing; ignored entirely.
    MethodNotAllowed,
    /// 408 — connection timed out at the server.
    TimedOut,
    /// 409 — another device stole the session slot.
    Conflict,
    /// 428 — server closed the connection.
    ConnectionClosed,
    /// 429 — rate limited.
    TooManyRequests,
    /// 440 — session replaced by a newer connection.
    ConnectionReplaced,
    /// 500 with a bad-MAC hint — corrupted key material.
    BadSession,
    /// 500 without the hint — transient server fault.
    InternalServerError,
    /// 503 — service unavailable.
    Unavailable,
    /// 515 — restart required after pairing.
    RestartRequired,
    /// 516 — stream error, same recovery as 515.
    StreamError,
    /// Any code not in the table, or a close without a code.
    Unknown,
}

/// One row of the disconnect policy table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DisconnectPolicy {
    /// Schedule a reconnection for this code.
    pub should_reconnect: bool,
    /// Terminal for the account; the session never reconnects without a
    /// fresh pairing.
    pub is_permanent: bool,
    /// Wipe non-credential auth blobs (signal key material) before the
    /// next attempt. `creds.json` always survives this.
    pub requires_auth_clear: bool,
    /// Run the full cleanup path (socket, auth, metadata).
    pub requires_cleanup: bool,
    /// Tell the owning user what happened.
    pub requires_notification: bool,
    /// Clear a stale voluntary-disconnect flag before routing.
    pub clears_voluntary_flag: bool,
    /// Participates in the post-pairing restart flow.
    pub supports_515_flow: bool,
    /// Base delay before the first reconnection attempt.
    pub reconnect_delay: Duration,
    /// Double the delay per attempt, capped at `max_delay`.
    pub use_exponential_backoff: bool,
    /// Backoff ceiling when exponential backoff is on.
    pub max_delay: Duration,
    /// Give up after this many attempts.
    pub max_attempts: u32,
    /// Operator-facing description, used in logs.
    pub message: &'static str,
    /// User-facing suggestion for permanent codes.
    pub user_action: Option<&'static str>,
}

impl DisconnectPolicy {
    const fn reconnectable(delay_ms: u64, max_attempts: u32, message: &'static str) -> Self {
        Self {
            should_reconnect: true,
            is_permanent: false,
            requires_auth_clear: false,
            requires_cleanup: false,
            requires_notification: false,
            clears_voluntary_flag: false,
            supports_515_flow: false,
            reconnect_delay: Duration::from_millis(delay_ms),
            use_exponential_backoff: false,
            max_delay: Duration::from_millis(delay_ms),
            max_attempts,
            message,
            user_action: None,
        }
    }

    const fn permanent(message: &'static str, user_action: &'static str) -> Self {
        Self {
            should_reconnect: false,
            is_permanent: true,
            requires_auth_clear: false,
            requires_cleanup: true,
            requires_notification: true,
            clears_voluntary_flag: false,
            supports_515_flow: false,
            reconnect_delay: Duration::ZERO,
            use_exponential_backoff: false,
            max_delay: Duration::ZERO,
            max_attempts: 0,
            message,
            user_action: Some(user_action),
        }
    }
}

impl DisconnectKind {
    /// The authoritative policy row for this kind.
    pub fn policy(self) -> DisconnectPolicy {
        match self {
            DisconnectKind::LoggedOut => {
                DisconnectPolicy::permanent("logged out from phone", "Pair again with /connect")
            }
            DisconnectKind::Forbidden => {
                DisconnectPolicy::permanent("account banned", "This account was banned by WhatsApp")
            }
            DisconnectKind::MethodNotAllowed => DisconnectPolicy {
                should_reconnect: false,
                is_permanent: false,
                requires_auth_clear: false,
                requires_cleanup: false,
                requires_notification: false,
                clears_voluntary_flag: false,
                supports_515_flow: false,
                reconnect_delay: Duration::ZERO,
                use_exponential_backoff: false,
                max_delay: Duration::ZERO,
                max_attempts: 0,
                message: "method not allowed, ignored",
                user_action: None,
            },
            DisconnectKind::TimedOut => DisconnectPolicy::permanent(
                "connection timed out",
                "Session expired. Reconnect with /connect",
            ),
            DisconnectKind::Conflict => {
                DisconnectPolicy::reconnectable(5_000, 5, "session conflict")
            }
            DisconnectKind::ConnectionClosed => {
                DisconnectPolicy::reconnectable(6_000, 6, "connection closed by server")
            }
            DisconnectKind::TooManyRequests => DisconnectPolicy {
                use_exponential_backoff: true,
                max_delay: Duration::from_millis(300_000),
                max_attempts: 10,
                ..DisconnectPolicy::reconnectable(5_000, 10, "rate limited")
            },
            DisconnectKind::ConnectionReplaced => DisconnectPolicy {
                requires_auth_clear: true,
                ..DisconnectPolicy::reconnectable(8_000, 5, "connection replaced")
            },
            DisconnectKind::BadSession => DisconnectPolicy {
                requires_auth_clear: true,
                ..DisconnectPolicy::reconnectable(2_000, 10, "bad session, key material wiped")
            },
            DisconnectKind::InternalServerError => DisconnectPolicy {
                requires_auth_clear: true,
                ..DisconnectPolicy::reconnectable(10_000, 5, "server internal error")
            },
            DisconnectKind::Unavailable => {
                DisconnectPolicy::reconnectable(15_000, 6, "service unavailable")
            }
            DisconnectKind::RestartRequired => DisconnectPolicy {
                supports_515_flow: true,
                clears_voluntary_flag: true,
                ..DisconnectPolicy::reconnectable(2_500, 10, "restart required after pairing")
            },
            DisconnectKind::StreamError => DisconnectPolicy {
                supports_515_flow: true,
                clears_voluntary_flag: true,
                ..DisconnectPolicy::reconnectable(2_500, 10, "stream error")
            },
            DisconnectKind::Unknown => DisconnectPolicy {
                requires_auth_clear: true,
                ..DisconnectPolicy::reconnectable(10_000, 3, "unknown disconnect code")
            },
        }
    }

    /// True when this kind is skipped entirely: no state change, no
    /// reconnect, no cleanup.
    pub const fn is_ignored(self) -> bool {
        matches!(self, DisconnectKind::MethodNotAllowed)
    }
}

/// Whether the code calls for a reconnection attempt.
pub fn should_reconnect(reason: &DisconnectReason) -> bool {
    reason.policy().should_reconnect
}

/// Whether the code is terminal for the account.
pub fn is_permanent_disconnect(reason: &DisconnectReason) -> bool {
    reason.policy().is_permanent
}

/// Whether non-credential auth blobs must be wiped before retrying.
pub fn requires_auth_clear(reason: &DisconnectReason) -> bool {
    reason.policy().requires_auth_clear
}

/// Whether the full cleanup path runs for this code.
pub fn requires_cleanup(reason: &DisconnectReason) -> bool {
    reason.policy().requires_cleanup
}

/// Whether the owning user is notified about this code.
pub fn requires_notification(reason: &DisconnectReason) -> bool {
    reason.policy().requires_notification
}

/// Whether a stale voluntary-disconnect flag is cleared before routing.
pub fn should_clear_voluntary_flag(reason: &DisconnectReason) -> bool {
    reason.policy().clears_voluntary_flag
}

/// Whether the code participates in the post-pairing restart flow.
pub fn supports_515_flow(reason: &DisconnectReason) -> bool {
    reason.policy().supports_515_flow
}

/// Delay before reconnection attempt number `attempt` (zero-based).
///
/// Fixed per row, or `delay * 2^attempt` capped at the row's `max_delay`
/// when exponential backoff is enabled.
pub fn reconnect_delay(reason: &DisconnectReason, attempt: u32) -> Duration {
    let policy = reason.policy();
    if !policy.use_exponential_backoff {
        return policy.reconnect_delay;
    }
    let factor = 2u32.saturating_pow(attempt.min(16));
    policy
        .reconnect_delay
        .saturating_mul(factor)
        .min(policy.max_delay)
}

/// Attempt ceiling for the code.
pub fn max_attempts(reason: &DisconnectReason) -> u32 {
    reason.policy().max_attempts
}

/// User-facing suggestion for permanent codes, if any.
pub fn user_action(reason: &DisconnectReason) -> Option<&'static str> {
    reason.policy().user_action
}
