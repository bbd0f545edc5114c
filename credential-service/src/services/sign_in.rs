//! Ticket sign-in: spend a ticket and attach its subject's session to the calling device.

use std::sync::Arc;
use uuid::Uuid;

use super::{
    error::ServiceError,
    events::{CredentialEvent, EventSink},
    handshake::DeviceService,
    tickets::{AcceptedTicket, TicketEngine},
};
use crate::models::{DeviceIdentity, DeviceKind, Instance};

/// Result of a successful ticket sign-in.
#[derive(Debug)]
pub struct SignedIn {
    pub accepted: AcceptedTicket,
    pub device: DeviceIdentity,
    /// Device token carrying the new session.
    pub token: String,
}

#[derive(Clone)]
pub struct TicketSignIn {
    tickets: TicketEngine,
    devices: DeviceService,
    events: Arc<dyn EventSink>,
}

impl TicketSignIn {
    pub fn new(tickets: TicketEngine, devices: DeviceService, events: Arc<dyn EventSink>) -> Self {
        Self {
            tickets,
            devices,
            events,
        }
    }

    /// The device exists before the ticket is consumed, so a failed device write never spends it.
    /// A session failure after acceptance is logged and emitted, then returned.
    #[tracing::instrument(skip_all, fields(instance_id = %instance.instance_id))]
    pub async fn sign_in(
        &self,
        instance: &Instance,
        device: Option<&DeviceIdentity>,
        ticket: &str,
        rotation_nonce: Option<String>,
    ) -> Result<SignedIn, ServiceError> {
        let device_id = match device {
            Some(device) => device.device_id,
            None => {
                let (device, _) = self
                    .devices
                    .create(instance, DeviceKind::for_instance(instance))
                    .await?;
                device.device_id
            }
        };

        let accepted = self.tickets.accept_on(instance, ticket).await?;

        match self
            .devices
            .establish_session(instance, device_id, accepted.subject_id(), rotation_nonce)
            .await
        {
            Ok((device, token)) => {
                tracing::info!(
                    ticket_id = %accepted.ticket.ticket_id,
                    device_id = %device_id,
                    "Ticket accepted"
                );
                Ok(SignedIn {
                    accepted,
                    device,
                    token,
                })
            }
            Err(err) => {
                self.session_failed(instance, &accepted, device_id, &err);
                Err(err)
            }
        }
    }

    fn session_failed(
        &self,
        instance: &Instance,
        accepted: &AcceptedTicket,
        device_id: Uuid,
        err: &ServiceError,
    ) {
        tracing::error!(
            ticket_id = %accepted.ticket.ticket_id,
            device_id = %device_id,
            error = %err,
            "Ticket accepted but no session was established"
        );
        self.events.emit(CredentialEvent::TicketSessionFailed {
            instance_id: instance.instance_id,
            ticket_id: accepted.ticket.ticket_id,
            device_id,
        });
    }
}
