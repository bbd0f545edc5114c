use std::sync::Arc;
use uuid::Uuid;

use super::{
    error::ServiceError,
    events::{CredentialEvent, EventSink},
};
use crate::models::Instance;
use crate::store::CredentialStore;

/// Instance lookup and environment changes.
#[derive(Clone)]
pub struct InstanceService {
    store: Arc<dyn CredentialStore>,
    events: Arc<dyn EventSink>,
}

impl InstanceService {
    pub fn new(store: Arc<dyn CredentialStore>, events: Arc<dyn EventSink>) -> Self {
        Self { store, events }
    }

    pub async fn get(&self, instance_id: Uuid) -> Result<Instance, ServiceError> {
        self.store
            .find_instance(instance_id)
            .await?
            .ok_or(ServiceError::InstanceNotFound)
    }

    /// Resolve the instance serving `host`, ignoring any port.
    pub async fn resolve_host(&self, host: &str) -> Result<Instance, ServiceError> {
        let host = host
            .rsplit_once(':')
            .filter(|(_, port)| port.chars().all(|c| c.is_ascii_digit()))
            .map_or(host, |(name, _)| name)
            .to_ascii_lowercase();

        self.store
            .find_instance_by_domain(&host)
            .await?
            .ok_or(ServiceError::InstanceNotFound)
    }

    /// Switch the instance to production and destroy its dev browsers.
    #[tracing::instrument(skip(self))]
    pub async fn promote_to_production(&self, instance_id: Uuid) -> Result<Instance, ServiceError> {
        let removed_devices = self
            .store
            .promote_to_production(instance_id)
            .await?
            .ok_or(ServiceError::InstanceNotFound)?;

        tracing::info!(removed_devices, "Instance promoted to production");
        self.events.emit(CredentialEvent::InstancePromoted {
            instance_id,
            removed_devices,
        });

        self.get(instance_id).await
    }
}
