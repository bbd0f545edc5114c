use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use validator::Validate;

use crate::models::{Ticket, TicketKind, TicketPayload, TicketStatus};
use crate::services::IssuedTicket;

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct CreateActorTokenRequest {
    #[validate(length(min = 1, message = "user_id is required"))]
    #[schema(example = "user_2abc")]
    pub user_id: String,

    /// Claims describing the impersonator. Must contain a non-empty `sub`.
    #[schema(value_type = Object, example = json!({"sub": "user_admin"}))]
    pub actor: serde_json::Map<String, serde_json::Value>,

    #[schema(example = 3600)]
    pub expires_in_seconds: Option<i64>,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct CreateSignInTokenRequest {
    #[validate(length(min = 1, message = "user_id is required"))]
    #[schema(example = "user_2abc")]
    pub user_id: String,

    #[schema(example = 2592000)]
    pub expires_in_seconds: Option<i64>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct TicketResponse {
    #[schema(example = "actor_token")]
    pub object: String,
    pub id: String,
    pub user_id: String,
    pub status: TicketStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub actor: Option<serde_json::Map<String, serde_json::Value>>,
    /// Signed token, only returned on creation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Acceptance URL, only returned on creation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

fn object_name(kind: TicketKind) -> &'static str {
    match kind {
        TicketKind::Actor => "actor_token",
        TicketKind::SignIn => "sign_in_token",
        TicketKind::Generic => "ticket",
    }
}

impl From<&Ticket> for TicketResponse {
    fn from(ticket: &Ticket) -> Self {
        let actor = match &ticket.payload {
            TicketPayload::Actor { actor } => Some(actor.clone()),
            _ => None,
        };
        Self {
            object: object_name(ticket.kind()).to_string(),
            id: ticket.ticket_id.to_string(),
            user_id: ticket.subject_id.clone(),
            status: ticket.status,
            actor,
            token: None,
            url: None,
            created_at: ticket.issued_utc.timestamp_millis(),
            updated_at: ticket
                .status_changed_utc
                .unwrap_or(ticket.issued_utc)
                .timestamp_millis(),
        }
    }
}

impl From<IssuedTicket> for TicketResponse {
    fn from(issued: IssuedTicket) -> Self {
        Self {
            token: Some(issued.token),
            url: Some(issued.accept_url),
            ..TicketResponse::from(&issued.ticket)
        }
    }
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct AcceptTicketQuery {
    /// Signed ticket token.
    pub ticket: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct TicketAcceptanceResponse {
    #[schema(example = "ticket_acceptance")]
    pub object: String,
    pub ticket_id: String,
    #[schema(example = "sign_in_token")]
    pub ticket_kind: String,
    pub user_id: String,
    /// Device token carrying the new session.
    pub client_token: String,
}

impl TicketAcceptanceResponse {
    pub fn new(ticket: &Ticket, client_token: String) -> Self {
        Self {
            object: "ticket_acceptance".to_string(),
            ticket_id: ticket.ticket_id.to_string(),
            ticket_kind: object_name(ticket.kind()).to_string(),
            user_id: ticket.subject_id.clone(),
            client_token,
        }
    }
}
