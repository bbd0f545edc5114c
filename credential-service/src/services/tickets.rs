//! Ticket engine: issuance, single consumption and revocation of one-time tokens.

use jsonwebtoken::{decode, encode, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use super::{
    clock::Clock,
    error::ServiceError,
    events::{CredentialEvent, EventSink},
    keys::KeyProvider,
};
use crate::models::{Instance, Ticket, TicketKind, TicketPayload, TicketStatus};
use crate::store::CredentialStore;

pub const ACCEPT_PATH: &str = "/v1/tickets/accept";

/// Upper bound for any ticket lifetime (ten years).
const MAX_TTL_SECONDS: i64 = 10 * 365 * 86_400;

/// Default and maximum lifetimes per ticket kind, in seconds.
#[derive(Debug, Clone)]
pub struct TicketPolicy {
    pub actor_default_ttl: i64,
    pub actor_max_ttl: i64,
    pub sign_in_default_ttl: i64,
    pub generic_default_ttl: i64,
}

impl Default for TicketPolicy {
    fn default() -> Self {
        Self {
            actor_default_ttl: 3600,
            actor_max_ttl: 86_400,
            sign_in_default_ttl: 30 * 86_400,
            generic_default_ttl: 7 * 86_400,
        }
    }
}

impl TicketPolicy {
    fn default_ttl(&self, kind: TicketKind) -> i64 {
        match kind {
            TicketKind::Actor => self.actor_default_ttl,
            TicketKind::SignIn => self.sign_in_default_ttl,
            TicketKind::Generic => self.generic_default_ttl,
        }
    }
}

/// Claims carried by a signed ticket token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketClaims {
    pub iss: String,
    /// Instance id
    pub iid: Uuid,
    pub kind: TicketKind,
    /// Ticket id
    pub rid: Uuid,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Clone)]
pub struct IssueTicket {
    pub subject_id: String,
    pub payload: TicketPayload,
    pub ttl_seconds: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct IssuedTicket {
    pub ticket: Ticket,
    pub token: String,
    pub accept_url: String,
}

#[derive(Debug, Clone)]
pub struct AcceptedTicket {
    pub ticket: Ticket,
    pub instance: Instance,
}

impl AcceptedTicket {
    pub fn subject_id(&self) -> &str {
        &self.ticket.subject_id
    }
}

#[derive(Clone)]
pub struct TicketEngine {
    store: Arc<dyn CredentialStore>,
    keys: Arc<dyn KeyProvider>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
    policy: TicketPolicy,
}

impl TicketEngine {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        keys: Arc<dyn KeyProvider>,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
        policy: TicketPolicy,
    ) -> Self {
        Self {
            store,
            keys,
            clock,
            events,
            policy,
        }
    }

    /// Persist a pending ticket and return its signed token and acceptance URL.
    #[tracing::instrument(skip(self, instance, request), fields(instance_id = %instance.instance_id, kind = request.payload.kind().as_str()))]
    pub async fn issue(
        &self,
        instance: &Instance,
        request: IssueTicket,
    ) -> Result<IssuedTicket, ServiceError> {
        let kind = request.payload.kind();
        let ttl = self.resolve_ttl(kind, request.ttl_seconds)?;

        let subject = self
            .store
            .find_subject(instance.instance_id, &request.subject_id)
            .await?;
        if subject.is_none() {
            return Err(ServiceError::SubjectNotFound);
        }

        if kind == TicketKind::Actor && request.payload.actor_subject().is_none() {
            return Err(ServiceError::MissingParameter("actor.sub".to_string()));
        }

        let now = self.clock.now();
        let ticket = Ticket::new(
            instance.instance_id,
            request.subject_id,
            request.payload,
            ttl,
            now,
        );

        let material = self.keys.instance_material(instance)?;
        let claims = TicketClaims {
            iss: instance.frontend_url(),
            iid: instance.instance_id,
            kind,
            rid: ticket.ticket_id,
            iat: now.timestamp(),
            exp: ticket.expires_utc().timestamp(),
        };
        let token = encode(&material.header(), &claims, &material.encoding)
            .map_err(|e| anyhow::anyhow!("Failed to sign ticket: {}", e))?;

        self.store.insert_ticket(&ticket).await?;

        let accept_url = accept_url(&instance.frontend_url(), &token)?;

        tracing::info!(ticket_id = %ticket.ticket_id, "Ticket issued");
        self.events.emit(CredentialEvent::TicketIssued {
            instance_id: instance.instance_id,
            ticket_id: ticket.ticket_id,
            kind,
        });

        Ok(IssuedTicket {
            ticket,
            token,
            accept_url,
        })
    }

    /// Consume a ticket of any kind.
    pub async fn accept(&self, token: &str) -> Result<AcceptedTicket, ServiceError> {
        self.consume(token, None, None).await
    }

    /// Consume a ticket presented to `instance`. Tickets issued by another instance are invalid.
    pub async fn accept_on(
        &self,
        instance: &Instance,
        token: &str,
    ) -> Result<AcceptedTicket, ServiceError> {
        self.consume(token, None, Some(instance.instance_id)).await
    }

    /// Consume a ticket only if it is of `expected` kind; other kinds are left untouched.
    pub async fn accept_for(
        &self,
        token: &str,
        expected: TicketKind,
    ) -> Result<AcceptedTicket, ServiceError> {
        self.consume(token, Some(expected), None).await
    }

    #[tracing::instrument(skip(self, token))]
    async fn consume(
        &self,
        token: &str,
        expected: Option<TicketKind>,
        scope: Option<Uuid>,
    ) -> Result<AcceptedTicket, ServiceError> {
        let (instance, claims) = self.verify(token).await?;
        if scope.is_some_and(|id| id != instance.instance_id) {
            return Err(ServiceError::TicketInvalid);
        }

        let now = self.clock.now();
        if now.timestamp() >= claims.exp {
            return Err(ServiceError::TicketExpired);
        }

        if let Some(expected) = expected {
            if claims.kind != expected {
                return Err(ServiceError::TicketNotInExpectedFlow { expected });
            }
        }

        let ticket = self
            .store
            .find_ticket(instance.instance_id, claims.rid)
            .await?
            .ok_or(ServiceError::TicketNotFound)?;
        if ticket.kind() != claims.kind {
            return Err(ServiceError::TicketInvalid);
        }
        if ticket.is_expired(now) {
            return Err(ServiceError::TicketExpired);
        }
        if let Some(err) = terminal_error(ticket.status) {
            return Err(err);
        }

        let won = self
            .store
            .transition_ticket(
                instance.instance_id,
                ticket.ticket_id,
                TicketStatus::Pending,
                TicketStatus::Accepted,
                now,
            )
            .await?;
        if !won {
            return Err(self.lost_race(&instance, ticket.ticket_id).await);
        }

        tracing::info!(ticket_id = %ticket.ticket_id, "Ticket accepted");
        self.events.emit(CredentialEvent::TicketAccepted {
            instance_id: instance.instance_id,
            ticket_id: ticket.ticket_id,
            kind: ticket.kind(),
        });

        Ok(AcceptedTicket {
            ticket: Ticket {
                status: TicketStatus::Accepted,
                status_changed_utc: Some(now),
                ..ticket
            },
            instance,
        })
    }

    /// Revoke a pending ticket of `kind`. Tickets of another kind read as not found.
    #[tracing::instrument(skip(self, instance), fields(instance_id = %instance.instance_id))]
    pub async fn revoke(
        &self,
        instance: &Instance,
        ticket_id: Uuid,
        kind: TicketKind,
    ) -> Result<Ticket, ServiceError> {
        let ticket = self
            .store
            .find_ticket(instance.instance_id, ticket_id)
            .await?
            .filter(|t| t.kind() == kind)
            .ok_or(ServiceError::TicketNotFound)?;

        if ticket.status != TicketStatus::Pending {
            return Err(ServiceError::TicketCannotBeRevoked {
                kind,
                status: ticket.status,
            });
        }

        let now = self.clock.now();
        let won = self
            .store
            .transition_ticket(
                instance.instance_id,
                ticket_id,
                TicketStatus::Pending,
                TicketStatus::Revoked,
                now,
            )
            .await?;
        if !won {
            let status = self
                .store
                .find_ticket(instance.instance_id, ticket_id)
                .await?
                .map(|t| t.status)
                .ok_or(ServiceError::TicketNotFound)?;
            return Err(ServiceError::TicketCannotBeRevoked { kind, status });
        }

        self.events.emit(CredentialEvent::TicketRevoked {
            instance_id: instance.instance_id,
            ticket_id,
            kind,
        });

        Ok(Ticket {
            status: TicketStatus::Revoked,
            status_changed_utc: Some(now),
            ..ticket
        })
    }

    /// Check signature and algorithm against the issuing instance's active key.
    async fn verify(&self, token: &str) -> Result<(Instance, TicketClaims), ServiceError> {
        let unverified = peek_claims(token).ok_or(ServiceError::TicketInvalid)?;

        let instance = self
            .store
            .find_instance(unverified.iid)
            .await?
            .ok_or(ServiceError::TicketInvalid)?;
        let material = self.keys.instance_material(&instance)?;
        let decoding = material.decoding_key()?;

        let data = decode::<TicketClaims>(token, decoding, &material.validation()).map_err(|e| {
            tracing::debug!(error = %e, "Ticket signature rejected");
            ServiceError::TicketInvalid
        })?;
        if data.claims.iid != instance.instance_id {
            return Err(ServiceError::TicketInvalid);
        }

        Ok((instance, data.claims))
    }

    async fn lost_race(&self, instance: &Instance, ticket_id: Uuid) -> ServiceError {
        match self.store.find_ticket(instance.instance_id, ticket_id).await {
            Ok(Some(ticket)) => {
                terminal_error(ticket.status).unwrap_or(ServiceError::TicketAlreadyUsed)
            }
            Ok(None) => ServiceError::TicketNotFound,
            Err(e) => ServiceError::Internal(e),
        }
    }

    fn resolve_ttl(&self, kind: TicketKind, requested: Option<i64>) -> Result<i64, ServiceError> {
        let ttl = requested.unwrap_or_else(|| self.policy.default_ttl(kind));
        if ttl <= 0 {
            return Err(ServiceError::InvalidExpiry(
                "expires_in_seconds must be greater than zero.".to_string(),
            ));
        }
        if kind == TicketKind::Actor && ttl > self.policy.actor_max_ttl {
            return Err(ServiceError::InvalidExpiry(format!(
                "expires_in_seconds must not exceed {}.",
                self.policy.actor_max_ttl
            )));
        }
        if ttl > MAX_TTL_SECONDS {
            return Err(ServiceError::InvalidExpiry(
                "expires_in_seconds is out of range.".to_string(),
            ));
        }
        Ok(ttl)
    }
}

fn terminal_error(status: TicketStatus) -> Option<ServiceError> {
    match status {
        TicketStatus::Pending => None,
        TicketStatus::Accepted => Some(ServiceError::TicketAlreadyUsed),
        TicketStatus::Revoked => Some(ServiceError::TicketRevoked),
    }
}

/// Read claims without checking the signature, only to find the issuing instance.
fn peek_claims(token: &str) -> Option<TicketClaims> {
    let mut validation = Validation::default();
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();
    decode::<TicketClaims>(token, &jsonwebtoken::DecodingKey::from_secret(&[]), &validation)
        .ok()
        .map(|data| data.claims)
}

fn accept_url(frontend_url: &str, token: &str) -> Result<String, ServiceError> {
    let mut url = url::Url::parse(&format!("{}{}", frontend_url, ACCEPT_PATH))
        .map_err(|e| anyhow::anyhow!("Invalid frontend URL {}: {}", frontend_url, e))?;
    url.query_pairs_mut().append_pair("ticket", token);
    Ok(url.to_string())
}
