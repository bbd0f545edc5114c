//! Security-relevant lifecycle events.

use std::sync::Mutex;
use uuid::Uuid;

use crate::models::{Strategy, TicketKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialEvent {
    TicketIssued {
        instance_id: Uuid,
        ticket_id: Uuid,
        kind: TicketKind,
    },
    TicketAccepted {
        instance_id: Uuid,
        ticket_id: Uuid,
        kind: TicketKind,
    },
    /// The ticket was spent but no session could be attached to the device.
    TicketSessionFailed {
        instance_id: Uuid,
        ticket_id: Uuid,
        device_id: Uuid,
    },
    TicketRevoked {
        instance_id: Uuid,
        ticket_id: Uuid,
        kind: TicketKind,
    },
    TemplateSaved {
        instance_id: Uuid,
        template_id: Uuid,
    },
    TemplateDeleted {
        instance_id: Uuid,
        template_id: Uuid,
    },
    VerificationPrepared {
        instance_id: Uuid,
        verification_id: Uuid,
        strategy: Strategy,
    },
    VerificationVerified {
        instance_id: Uuid,
        verification_id: Uuid,
    },
    VerificationFailed {
        instance_id: Uuid,
        verification_id: Uuid,
    },
    VerificationExpired {
        instance_id: Uuid,
        verification_id: Uuid,
    },
    DeviceCreated {
        instance_id: Uuid,
        device_id: Uuid,
    },
    DeviceRotated {
        instance_id: Uuid,
        device_id: Uuid,
    },
    DeviceTokenMismatch {
        instance_id: Uuid,
        device_id: Uuid,
    },
    InstancePromoted {
        instance_id: Uuid,
        removed_devices: u64,
    },
}

impl CredentialEvent {
    pub fn name(&self) -> &'static str {
        match self {
            CredentialEvent::TicketIssued { .. } => "ticket.issued",
            CredentialEvent::TicketAccepted { .. } => "ticket.accepted",
            CredentialEvent::TicketSessionFailed { .. } => "ticket.session_failed",
            CredentialEvent::TicketRevoked { .. } => "ticket.revoked",
            CredentialEvent::TemplateSaved { .. } => "jwt_template.saved",
            CredentialEvent::TemplateDeleted { .. } => "jwt_template.deleted",
            CredentialEvent::VerificationPrepared { .. } => "verification.prepared",
            CredentialEvent::VerificationVerified { .. } => "verification.verified",
            CredentialEvent::VerificationFailed { .. } => "verification.failed",
            CredentialEvent::VerificationExpired { .. } => "verification.expired",
            CredentialEvent::DeviceCreated { .. } => "device.created",
            CredentialEvent::DeviceRotated { .. } => "device.rotated",
            CredentialEvent::DeviceTokenMismatch { .. } => "device.token_mismatch",
            CredentialEvent::InstancePromoted { .. } => "instance.promoted",
        }
    }
}

/// Receives lifecycle events for downstream notification and telemetry.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: CredentialEvent);
}

/// Emits each event as a structured log line.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: CredentialEvent) {
        match &event {
            CredentialEvent::DeviceTokenMismatch {
                instance_id,
                device_id,
            } => {
                tracing::warn!(
                    event = event.name(),
                    instance_id = %instance_id,
                    device_id = %device_id,
                    "Rotating token mismatch, session cleared"
                );
            }
            CredentialEvent::TicketSessionFailed { .. } => {
                tracing::warn!(event = event.name(), details = ?event, "Ticket spent without a session");
            }
            _ => {
                tracing::info!(event = event.name(), details = ?event, "Credential event");
            }
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<CredentialEvent>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<CredentialEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events().iter().map(CredentialEvent::name).collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events().iter().filter(|e| e.name() == name).count()
    }
}

impl EventSink for RecordingEventSink {
    fn emit(&self, event: CredentialEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}
