//! Ticket model - single-use signed credentials.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use utoipa::ToSchema;
use uuid::Uuid;

/// Ticket kind codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TicketKind {
    Actor,
    SignIn,
    Generic,
}

impl TicketKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TicketKind::Actor => "actor",
            TicketKind::SignIn => "sign_in",
            TicketKind::Generic => "generic",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "actor" => Some(TicketKind::Actor),
            "sign_in" => Some(TicketKind::SignIn),
            "generic" => Some(TicketKind::Generic),
            _ => None,
        }
    }

    /// Human label used in error messages.
    pub fn label(&self) -> &'static str {
        match self {
            TicketKind::Actor => "Actor token",
            TicketKind::SignIn => "Sign in token",
            TicketKind::Generic => "Ticket",
        }
    }
}

/// Ticket status codes. `Accepted` and `Revoked` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Pending,
    Accepted,
    Revoked,
}

impl TicketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TicketStatus::Pending => "pending",
            TicketStatus::Accepted => "accepted",
            TicketStatus::Revoked => "revoked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TicketStatus::Pending),
            "accepted" | "used" => Some(TicketStatus::Accepted),
            "revoked" => Some(TicketStatus::Revoked),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TicketStatus::Pending)
    }
}

/// Kind-specific ticket payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TicketPayload {
    /// Describes who is impersonating the subject; must carry a non-empty `sub`.
    Actor { actor: Map<String, Value> },
    SignIn,
    Generic {
        #[serde(default)]
        data: Value,
    },
}

impl TicketPayload {
    pub fn kind(&self) -> TicketKind {
        match self {
            TicketPayload::Actor { .. } => TicketKind::Actor,
            TicketPayload::SignIn => TicketKind::SignIn,
            TicketPayload::Generic { .. } => TicketKind::Generic,
        }
    }

    /// The impersonating party's subject, if this is an actor payload with one.
    pub fn actor_subject(&self) -> Option<&str> {
        match self {
            TicketPayload::Actor { actor } => actor
                .get("sub")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty()),
            _ => None,
        }
    }
}

/// Ticket entity. Never deleted; only its status flips.
#[derive(Debug, Clone, PartialEq)]
pub struct Ticket {
    pub ticket_id: Uuid,
    pub instance_id: Uuid,
    pub subject_id: String,
    pub status: TicketStatus,
    pub payload: TicketPayload,
    pub issued_utc: DateTime<Utc>,
    pub expires_in_seconds: i64,
    pub status_changed_utc: Option<DateTime<Utc>>,
}

impl Ticket {
    /// Create a new pending ticket.
    pub fn new(
        instance_id: Uuid,
        subject_id: impl Into<String>,
        payload: TicketPayload,
        expires_in_seconds: i64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            ticket_id: Uuid::new_v4(),
            instance_id,
            subject_id: subject_id.into(),
            status: TicketStatus::Pending,
            payload,
            issued_utc: now,
            expires_in_seconds,
            status_changed_utc: None,
        }
    }

    pub fn kind(&self) -> TicketKind {
        self.payload.kind()
    }

    pub fn expires_utc(&self) -> DateTime<Utc> {
        self.issued_utc + Duration::seconds(self.expires_in_seconds)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_utc()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_actor_subject_requires_non_empty_sub() {
        let payload: TicketPayload =
            serde_json::from_value(json!({"kind": "actor", "actor": {"sub": "admin_1"}})).unwrap();
        assert_eq!(payload.actor_subject(), Some("admin_1"));
        assert_eq!(payload.kind(), TicketKind::Actor);

        let blank: TicketPayload =
            serde_json::from_value(json!({"kind": "actor", "actor": {"sub": "  "}})).unwrap();
        assert_eq!(blank.actor_subject(), None);

        assert_eq!(TicketPayload::SignIn.actor_subject(), None);
    }

    #[test]
    fn test_expiry_boundary() {
        let now = Utc::now();
        let ticket = Ticket::new(Uuid::new_v4(), "user_1", TicketPayload::SignIn, 60, now);
        assert_eq!(ticket.status, TicketStatus::Pending);
        assert!(!ticket.is_expired(now + Duration::seconds(59)));
        assert!(ticket.is_expired(now + Duration::seconds(60)));
    }

    #[test]
    fn test_status_parse_accepts_legacy_used() {
        assert_eq!(TicketStatus::parse("used"), Some(TicketStatus::Accepted));
        assert!(TicketStatus::Revoked.is_terminal());
        assert!(!TicketStatus::Pending.is_terminal());
    }
}
