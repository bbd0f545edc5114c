//! Persistence seams for the credential core.
//!
//! Every state transition that must have a single winner is expressed as a
//! conditional write returning whether it applied.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{
    DeviceIdentity, Instance, JwtTemplate, Subject, Ticket, TicketStatus, Verification,
    VerificationStatus,
};

#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn insert_instance(&self, instance: &Instance) -> Result<(), anyhow::Error>;

    async fn find_instance(&self, instance_id: Uuid) -> Result<Option<Instance>, anyhow::Error>;

    /// Look up the instance whose authentication domain is `host`.
    async fn find_instance_by_domain(&self, host: &str)
        -> Result<Option<Instance>, anyhow::Error>;

    /// Flip the instance to production and remove its dev browsers in one unit of work.
    /// Returns the number of removed devices, or `None` if the instance does not exist.
    async fn promote_to_production(&self, instance_id: Uuid)
        -> Result<Option<u64>, anyhow::Error>;
}

#[async_trait]
pub trait SubjectDirectory: Send + Sync {
    async fn insert_subject(&self, subject: &Subject) -> Result<(), anyhow::Error>;

    async fn find_subject(
        &self,
        instance_id: Uuid,
        subject_id: &str,
    ) -> Result<Option<Subject>, anyhow::Error>;
}

#[async_trait]
pub trait TicketStore: Send + Sync {
    async fn insert_ticket(&self, ticket: &Ticket) -> Result<(), anyhow::Error>;

    async fn find_ticket(
        &self,
        instance_id: Uuid,
        ticket_id: Uuid,
    ) -> Result<Option<Ticket>, anyhow::Error>;

    /// Move the ticket from `from` to `to` only if it is still in `from`.
    async fn transition_ticket(
        &self,
        instance_id: Uuid,
        ticket_id: Uuid,
        from: TicketStatus,
        to: TicketStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, anyhow::Error>;
}

/// What happens to the instance's session-token template pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPointer {
    Keep,
    Set(Uuid),
    Clear,
}

#[derive(Debug, Clone)]
pub enum TemplateChange {
    Upsert(JwtTemplate),
    Delete(Uuid),
}

/// One all-or-nothing template mutation.
#[derive(Debug, Clone)]
pub struct TemplateUnitOfWork {
    pub instance_id: Uuid,
    pub change: TemplateChange,
    pub session_pointer: SessionPointer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOfWorkOutcome {
    Applied,
    NameTaken,
    NotFound,
    /// The template to delete is the current session-token template.
    SessionTemplateInUse,
}

#[async_trait]
pub trait TemplateStore: Send + Sync {
    async fn list_templates(&self, instance_id: Uuid) -> Result<Vec<JwtTemplate>, anyhow::Error>;

    async fn find_template(
        &self,
        instance_id: Uuid,
        template_id: Uuid,
    ) -> Result<Option<JwtTemplate>, anyhow::Error>;

    async fn find_template_by_name(
        &self,
        instance_id: Uuid,
        name: &str,
    ) -> Result<Option<JwtTemplate>, anyhow::Error>;

    async fn apply_template_change(
        &self,
        unit: TemplateUnitOfWork,
    ) -> Result<UnitOfWorkOutcome, anyhow::Error>;
}

#[async_trait]
pub trait VerificationStore: Send + Sync {
    async fn insert_verification(&self, verification: &Verification)
        -> Result<(), anyhow::Error>;

    async fn find_verification(
        &self,
        instance_id: Uuid,
        verification_id: Uuid,
    ) -> Result<Option<Verification>, anyhow::Error>;

    /// Replace the mutable state of a verification only if its stored
    /// (status, attempts) still equal the expected pair.
    async fn update_verification_if(
        &self,
        expected_status: VerificationStatus,
        expected_attempts: u32,
        next: &Verification,
    ) -> Result<bool, anyhow::Error>;
}

/// Rotation of a device's rotating token.
#[derive(Debug, Clone)]
pub struct DeviceRotation {
    pub expected_token: String,
    pub new_token: String,
    pub rotation_nonce: Option<String>,
    pub session_subject: Option<String>,
    pub at: DateTime<Utc>,
}

#[async_trait]
pub trait DeviceStore: Send + Sync {
    async fn insert_device(&self, device: &DeviceIdentity) -> Result<(), anyhow::Error>;

    async fn find_device(
        &self,
        instance_id: Uuid,
        device_id: Uuid,
    ) -> Result<Option<DeviceIdentity>, anyhow::Error>;

    /// Swap in a new rotating token if the current one is still `expected_token`.
    /// The replaced token becomes `previous_token`.
    async fn rotate_device(
        &self,
        instance_id: Uuid,
        device_id: Uuid,
        rotation: DeviceRotation,
    ) -> Result<bool, anyhow::Error>;

    /// Clear the rotation nonce if it still equals `nonce`.
    async fn consume_rotation_nonce(
        &self,
        instance_id: Uuid,
        device_id: Uuid,
        nonce: &str,
    ) -> Result<bool, anyhow::Error>;

    /// Drop the device's session if its rotating token is still `expected_token`.
    async fn clear_device_session(
        &self,
        instance_id: Uuid,
        device_id: Uuid,
        expected_token: &str,
    ) -> Result<bool, anyhow::Error>;
}

/// Everything the credential core persists.
pub trait CredentialStore:
    InstanceStore + SubjectDirectory + TicketStore + TemplateStore + VerificationStore + DeviceStore
{
}

impl<T> CredentialStore for T where
    T: InstanceStore
        + SubjectDirectory
        + TicketStore
        + TemplateStore
        + VerificationStore
        + DeviceStore
{
}
