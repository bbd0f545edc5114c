//! In-process store for tests and local development.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Mutex;
use uuid::Uuid;

use super::{
    DeviceRotation, DeviceStore, InstanceStore, SessionPointer, SubjectDirectory, TemplateChange,
    TemplateStore, TemplateUnitOfWork, TicketStore, UnitOfWorkOutcome, VerificationStore,
};
use crate::models::{
    DeviceIdentity, DeviceKind, Instance, InstanceEnvironment, JwtTemplate, Subject, Ticket,
    TicketStatus, Verification, VerificationStatus,
};

/// Single-row conditional writes hold the row's shard lock; multi-row units of
/// work additionally serialize on `units`.
#[derive(Default)]
pub struct MemoryStore {
    instances: DashMap<Uuid, Instance>,
    subjects: DashMap<(Uuid, String), Subject>,
    tickets: DashMap<Uuid, Ticket>,
    templates: DashMap<Uuid, JwtTemplate>,
    verifications: DashMap<Uuid, Verification>,
    devices: DashMap<Uuid, DeviceIdentity>,
    units: Mutex<()>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn apply_template_change_locked(
        &self,
        unit: TemplateUnitOfWork,
    ) -> Result<UnitOfWorkOutcome, anyhow::Error> {
        let _guard = self
            .units
            .lock()
            .map_err(|e| anyhow::anyhow!("Memory store mutex poisoned: {}", e))?;

        let current_pointer = match self.instances.get(&unit.instance_id) {
            Some(instance) => instance.session_template_id,
            None => return Ok(UnitOfWorkOutcome::NotFound),
        };

        match unit.change {
            TemplateChange::Upsert(template) => {
                let name_taken = self.templates.iter().any(|t| {
                    t.instance_id == unit.instance_id
                        && t.name == template.name
                        && t.template_id != template.template_id
                });
                if name_taken {
                    return Ok(UnitOfWorkOutcome::NameTaken);
                }
                self.templates.insert(template.template_id, template);
            }
            TemplateChange::Delete(template_id) => {
                let exists = self
                    .templates
                    .get(&template_id)
                    .is_some_and(|t| t.instance_id == unit.instance_id);
                if !exists {
                    return Ok(UnitOfWorkOutcome::NotFound);
                }
                if current_pointer == Some(template_id) {
                    return Ok(UnitOfWorkOutcome::SessionTemplateInUse);
                }
                self.templates.remove(&template_id);
            }
        }

        if let Some(mut instance) = self.instances.get_mut(&unit.instance_id) {
            match unit.session_pointer {
                SessionPointer::Keep => {}
                SessionPointer::Set(template_id) => {
                    instance.session_template_id = Some(template_id)
                }
                SessionPointer::Clear => instance.session_template_id = None,
            }
        }

        Ok(UnitOfWorkOutcome::Applied)
    }

    fn promote_locked(&self, instance_id: Uuid) -> Result<Option<u64>, anyhow::Error> {
        let _guard = self
            .units
            .lock()
            .map_err(|e| anyhow::anyhow!("Memory store mutex poisoned: {}", e))?;

        match self.instances.get_mut(&instance_id) {
            Some(mut instance) => instance.environment = InstanceEnvironment::Production,
            None => return Ok(None),
        }

        let before = self.devices.len();
        self.devices
            .retain(|_, d| !(d.instance_id == instance_id && d.kind == DeviceKind::DevBrowser));
        Ok(Some((before - self.devices.len()) as u64))
    }
}

#[async_trait]
impl InstanceStore for MemoryStore {
    async fn insert_instance(&self, instance: &Instance) -> Result<(), anyhow::Error> {
        self.instances.insert(instance.instance_id, instance.clone());
        Ok(())
    }

    async fn find_instance(&self, instance_id: Uuid) -> Result<Option<Instance>, anyhow::Error> {
        Ok(self.instances.get(&instance_id).map(|i| i.clone()))
    }

    async fn find_instance_by_domain(
        &self,
        host: &str,
    ) -> Result<Option<Instance>, anyhow::Error> {
        Ok(self
            .instances
            .iter()
            .find(|i| i.auth_domain.eq_ignore_ascii_case(host))
            .map(|i| i.clone()))
    }

    async fn promote_to_production(
        &self,
        instance_id: Uuid,
    ) -> Result<Option<u64>, anyhow::Error> {
        self.promote_locked(instance_id)
    }
}

#[async_trait]
impl SubjectDirectory for MemoryStore {
    async fn insert_subject(&self, subject: &Subject) -> Result<(), anyhow::Error> {
        self.subjects.insert(
            (subject.instance_id, subject.subject_id.clone()),
            subject.clone(),
        );
        Ok(())
    }

    async fn find_subject(
        &self,
        instance_id: Uuid,
        subject_id: &str,
    ) -> Result<Option<Subject>, anyhow::Error> {
        Ok(self
            .subjects
            .get(&(instance_id, subject_id.to_string()))
            .map(|s| s.clone()))
    }
}

#[async_trait]
impl TicketStore for MemoryStore {
    async fn insert_ticket(&self, ticket: &Ticket) -> Result<(), anyhow::Error> {
        self.tickets.insert(ticket.ticket_id, ticket.clone());
        Ok(())
    }

    async fn find_ticket(
        &self,
        instance_id: Uuid,
        ticket_id: Uuid,
    ) -> Result<Option<Ticket>, anyhow::Error> {
        Ok(self
            .tickets
            .get(&ticket_id)
            .filter(|t| t.instance_id == instance_id)
            .map(|t| t.clone()))
    }

    async fn transition_ticket(
        &self,
        instance_id: Uuid,
        ticket_id: Uuid,
        from: TicketStatus,
        to: TicketStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, anyhow::Error> {
        match self.tickets.get_mut(&ticket_id) {
            Some(mut ticket) if ticket.instance_id == instance_id && ticket.status == from => {
                ticket.status = to;
                ticket.status_changed_utc = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl TemplateStore for MemoryStore {
    async fn list_templates(&self, instance_id: Uuid) -> Result<Vec<JwtTemplate>, anyhow::Error> {
        let mut templates: Vec<JwtTemplate> = self
            .templates
            .iter()
            .filter(|t| t.instance_id == instance_id)
            .map(|t| t.clone())
            .collect();
        templates.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(templates)
    }

    async fn find_template(
        &self,
        instance_id: Uuid,
        template_id: Uuid,
    ) -> Result<Option<JwtTemplate>, anyhow::Error> {
        Ok(self
            .templates
            .get(&template_id)
            .filter(|t| t.instance_id == instance_id)
            .map(|t| t.clone()))
    }

    async fn find_template_by_name(
        &self,
        instance_id: Uuid,
        name: &str,
    ) -> Result<Option<JwtTemplate>, anyhow::Error> {
        Ok(self
            .templates
            .iter()
            .find(|t| t.instance_id == instance_id && t.name == name)
            .map(|t| t.clone()))
    }

    async fn apply_template_change(
        &self,
        unit: TemplateUnitOfWork,
    ) -> Result<UnitOfWorkOutcome, anyhow::Error> {
        self.apply_template_change_locked(unit)
    }
}

#[async_trait]
impl VerificationStore for MemoryStore {
    async fn insert_verification(
        &self,
        verification: &Verification,
    ) -> Result<(), anyhow::Error> {
        self.verifications
            .insert(verification.verification_id, verification.clone());
        Ok(())
    }

    async fn find_verification(
        &self,
        instance_id: Uuid,
        verification_id: Uuid,
    ) -> Result<Option<Verification>, anyhow::Error> {
        Ok(self
            .verifications
            .get(&verification_id)
            .filter(|v| v.instance_id == instance_id)
            .map(|v| v.clone()))
    }

    async fn update_verification_if(
        &self,
        expected_status: VerificationStatus,
        expected_attempts: u32,
        next: &Verification,
    ) -> Result<bool, anyhow::Error> {
        match self.verifications.get_mut(&next.verification_id) {
            Some(mut current)
                if current.instance_id == next.instance_id
                    && current.status == expected_status
                    && current.attempts == expected_attempts =>
            {
                current.status = next.status;
                current.attempts = next.attempts;
                current.verified_utc = next.verified_utc;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl DeviceStore for MemoryStore {
    async fn insert_device(&self, device: &DeviceIdentity) -> Result<(), anyhow::Error> {
        self.devices.insert(device.device_id, device.clone());
        Ok(())
    }

    async fn find_device(
        &self,
        instance_id: Uuid,
        device_id: Uuid,
    ) -> Result<Option<DeviceIdentity>, anyhow::Error> {
        Ok(self
            .devices
            .get(&device_id)
            .filter(|d| d.instance_id == instance_id)
            .map(|d| d.clone()))
    }

    async fn rotate_device(
        &self,
        instance_id: Uuid,
        device_id: Uuid,
        rotation: DeviceRotation,
    ) -> Result<bool, anyhow::Error> {
        match self.devices.get_mut(&device_id) {
            Some(mut device)
                if device.instance_id == instance_id
                    && device.rotating_token == rotation.expected_token =>
            {
                let replaced = std::mem::replace(&mut device.rotating_token, rotation.new_token);
                device.previous_token = Some(replaced);
                device.rotation_nonce = rotation.rotation_nonce;
                device.session_subject = rotation.session_subject;
                device.rotated_utc = Some(rotation.at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn consume_rotation_nonce(
        &self,
        instance_id: Uuid,
        device_id: Uuid,
        nonce: &str,
    ) -> Result<bool, anyhow::Error> {
        match self.devices.get_mut(&device_id) {
            Some(mut device)
                if device.instance_id == instance_id
                    && device.rotation_nonce.as_deref() == Some(nonce) =>
            {
                device.rotation_nonce = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn clear_device_session(
        &self,
        instance_id: Uuid,
        device_id: Uuid,
        expected_token: &str,
    ) -> Result<bool, anyhow::Error> {
        match self.devices.get_mut(&device_id) {
            Some(mut device)
                if device.instance_id == instance_id && device.rotating_token == expected_token =>
            {
                device.session_subject = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{InstanceKeys, SigningAlgorithm, TicketPayload};
    use secrecy::Secret;
    use serde_json::Map;

    fn instance() -> Instance {
        Instance::new(
            InstanceEnvironment::Development,
            "clerk.example.com",
            InstanceKeys {
                key_id: "ins_1".to_string(),
                algorithm: SigningAlgorithm::HS256,
                private_key: Secret::new("secret".to_string()),
                public_key: String::new(),
            },
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_ticket_transition_applies_once() {
        let store = MemoryStore::new();
        let ticket = Ticket::new(Uuid::new_v4(), "user_1", TicketPayload::SignIn, 60, Utc::now());
        store.insert_ticket(&ticket).await.unwrap();

        let first = store
            .transition_ticket(
                ticket.instance_id,
                ticket.ticket_id,
                TicketStatus::Pending,
                TicketStatus::Accepted,
                Utc::now(),
            )
            .await
            .unwrap();
        let second = store
            .transition_ticket(
                ticket.instance_id,
                ticket.ticket_id,
                TicketStatus::Pending,
                TicketStatus::Revoked,
                Utc::now(),
            )
            .await
            .unwrap();

        assert!(first);
        assert!(!second);
        let stored = store
            .find_ticket(ticket.instance_id, ticket.ticket_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, TicketStatus::Accepted);
    }

    #[tokio::test]
    async fn test_tickets_are_scoped_to_instance() {
        let store = MemoryStore::new();
        let ticket = Ticket::new(Uuid::new_v4(), "user_1", TicketPayload::SignIn, 60, Utc::now());
        store.insert_ticket(&ticket).await.unwrap();

        let other = store.find_ticket(Uuid::new_v4(), ticket.ticket_id).await.unwrap();
        assert!(other.is_none());
    }

    #[tokio::test]
    async fn test_session_template_cannot_be_deleted() {
        let store = MemoryStore::new();
        let instance = instance();
        store.insert_instance(&instance).await.unwrap();

        let template = JwtTemplate::new(instance.instance_id, "session", Map::new(), Utc::now());
        let outcome = store
            .apply_template_change(TemplateUnitOfWork {
                instance_id: instance.instance_id,
                change: TemplateChange::Upsert(template.clone()),
                session_pointer: SessionPointer::Set(template.template_id),
            })
            .await
            .unwrap();
        assert_eq!(outcome, UnitOfWorkOutcome::Applied);

        let outcome = store
            .apply_template_change(TemplateUnitOfWork {
                instance_id: instance.instance_id,
                change: TemplateChange::Delete(template.template_id),
                session_pointer: SessionPointer::Keep,
            })
            .await
            .unwrap();
        assert_eq!(outcome, UnitOfWorkOutcome::SessionTemplateInUse);

        let stored = store.find_instance(instance.instance_id).await.unwrap().unwrap();
        assert_eq!(stored.session_template_id, Some(template.template_id));
    }

    #[tokio::test]
    async fn test_duplicate_name_is_rejected() {
        let store = MemoryStore::new();
        let instance = instance();
        store.insert_instance(&instance).await.unwrap();

        for expected in [UnitOfWorkOutcome::Applied, UnitOfWorkOutcome::NameTaken] {
            let template =
                JwtTemplate::new(instance.instance_id, "supabase", Map::new(), Utc::now());
            let outcome = store
                .apply_template_change(TemplateUnitOfWork {
                    instance_id: instance.instance_id,
                    change: TemplateChange::Upsert(template),
                    session_pointer: SessionPointer::Keep,
                })
                .await
                .unwrap();
            assert_eq!(outcome, expected);
        }
        assert_eq!(store.list_templates(instance.instance_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_promote_removes_only_dev_browsers() {
        let store = MemoryStore::new();
        let instance = instance();
        store.insert_instance(&instance).await.unwrap();

        let dev = DeviceIdentity::new(
            instance.instance_id,
            DeviceKind::DevBrowser,
            "tok_a".to_string(),
            Utc::now(),
        );
        let client = DeviceIdentity::new(
            instance.instance_id,
            DeviceKind::Client,
            "tok_b".to_string(),
            Utc::now(),
        );
        store.insert_device(&dev).await.unwrap();
        store.insert_device(&client).await.unwrap();

        let removed = store.promote_to_production(instance.instance_id).await.unwrap();
        assert_eq!(removed, Some(1));
        assert!(store
            .find_device(instance.instance_id, dev.device_id)
            .await
            .unwrap()
            .is_none());
        assert!(store
            .find_device(instance.instance_id, client.device_id)
            .await
            .unwrap()
            .is_some());

        let promoted = store.find_instance(instance.instance_id).await.unwrap().unwrap();
        assert!(promoted.is_production());
        assert_eq!(store.promote_to_production(Uuid::new_v4()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_rotation_keeps_previous_token() {
        let store = MemoryStore::new();
        let device = DeviceIdentity::new(
            Uuid::new_v4(),
            DeviceKind::DevBrowser,
            "tok_1".to_string(),
            Utc::now(),
        );
        store.insert_device(&device).await.unwrap();

        let rotated = store
            .rotate_device(
                device.instance_id,
                device.device_id,
                DeviceRotation {
                    expected_token: "tok_1".to_string(),
                    new_token: "tok_2".to_string(),
                    rotation_nonce: Some("nonce".to_string()),
                    session_subject: Some("user_1".to_string()),
                    at: Utc::now(),
                },
            )
            .await
            .unwrap();
        assert!(rotated);

        let stored = store
            .find_device(device.instance_id, device.device_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.rotating_token, "tok_2");
        assert_eq!(stored.previous_token.as_deref(), Some("tok_1"));

        assert!(store
            .consume_rotation_nonce(device.instance_id, device.device_id, "nonce")
            .await
            .unwrap());
        assert!(!store
            .consume_rotation_nonce(device.instance_id, device.device_id, "nonce")
            .await
            .unwrap());
    }
}
