//! Device identities and their signed, rotating tokens.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Duration;
use jsonwebtoken::{decode, encode};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::models::{DeviceIdentity, DeviceKind, Instance};
use crate::services::{
    clock::Clock,
    error::ServiceError,
    events::{CredentialEvent, EventSink},
    keys::KeyProvider,
};
use crate::store::{CredentialStore, DeviceRotation};

const MAX_ROTATION_RETRIES: usize = 3;

/// Claims carried by a signed device token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceClaims {
    pub iss: String,
    /// Instance id
    pub iid: Uuid,
    pub kind: DeviceKind,
    /// Device id
    pub rid: Uuid,
    /// Rotating token
    pub rot: String,
    pub iat: i64,
    pub exp: i64,
}

/// A device identity attributed to a request.
#[derive(Debug, Clone)]
pub struct ResolvedDevice {
    pub device: DeviceIdentity,
    pub session_subject: Option<String>,
    /// Freshly signed current token, present after a one-time stale-token exchange.
    pub refreshed_token: Option<String>,
}

fn rotating_token() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[derive(Clone)]
pub struct DeviceService {
    store: Arc<dyn CredentialStore>,
    keys: Arc<dyn KeyProvider>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
    token_lifetime: Duration,
}

impl DeviceService {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        keys: Arc<dyn KeyProvider>,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
        token_lifetime_days: i64,
    ) -> Self {
        Self {
            store,
            keys,
            clock,
            events,
            token_lifetime: Duration::days(token_lifetime_days.max(1)),
        }
    }

    /// Create a device identity and sign its first token.
    #[tracing::instrument(skip(self, instance), fields(instance_id = %instance.instance_id, kind = kind.as_str()))]
    pub async fn create(
        &self,
        instance: &Instance,
        kind: DeviceKind,
    ) -> Result<(DeviceIdentity, String), ServiceError> {
        let device = DeviceIdentity::new(
            instance.instance_id,
            kind,
            rotating_token(),
            self.clock.now(),
        );
        self.store.insert_device(&device).await?;
        let token = self.sign_token(instance, &device)?;

        tracing::info!(device_id = %device.device_id, "Device identity created");
        self.events.emit(CredentialEvent::DeviceCreated {
            instance_id: instance.instance_id,
            device_id: device.device_id,
        });
        Ok((device, token))
    }

    pub fn sign_token(
        &self,
        instance: &Instance,
        device: &DeviceIdentity,
    ) -> Result<String, ServiceError> {
        let material = self.keys.instance_material(instance)?;
        let now = self.clock.now();
        let claims = DeviceClaims {
            iss: instance.issuer(),
            iid: instance.instance_id,
            kind: device.kind,
            rid: device.device_id,
            rot: device.rotating_token.clone(),
            iat: now.timestamp(),
            exp: (now + self.token_lifetime).timestamp(),
        };
        encode(&material.header(), &claims, &material.encoding)
            .map_err(|e| ServiceError::Internal(anyhow::anyhow!("Failed to sign device token: {}", e)))
    }

    /// Verify signature, algorithm, instance and expiry. Any failure means "no device".
    pub fn verify_token(&self, instance: &Instance, token: &str) -> Option<DeviceClaims> {
        let material = match self.keys.instance_material(instance) {
            Ok(material) => material,
            Err(e) => {
                tracing::warn!(error = %e, "Instance signing material unavailable");
                return None;
            }
        };
        let decoding = material.decoding_key().ok()?;

        let claims = match decode::<DeviceClaims>(token, decoding, &material.validation()) {
            Ok(data) => data.claims,
            Err(e) => {
                tracing::debug!(error = %e, "Device token rejected");
                return None;
            }
        };

        if claims.iid != instance.instance_id || claims.exp <= self.clock.now().timestamp() {
            return None;
        }
        Some(claims)
    }

    /// Attribute a presented device token to a device and, if still valid, its session.
    ///
    /// `nonce` allows exactly one exchange of the token replaced by the last rotation.
    pub async fn resolve(
        &self,
        instance: &Instance,
        kind: DeviceKind,
        token: &str,
        nonce: Option<&str>,
    ) -> Result<Option<ResolvedDevice>, ServiceError> {
        let Some(claims) = self.verify_token(instance, token) else {
            return Ok(None);
        };
        if claims.kind != kind {
            return Ok(None);
        }
        let Some(device) = self
            .store
            .find_device(instance.instance_id, claims.rid)
            .await?
        else {
            return Ok(None);
        };
        if device.kind != kind {
            return Ok(None);
        }

        if claims.rot == device.rotating_token {
            let session_subject = device.session_subject.clone();
            return Ok(Some(ResolvedDevice {
                device,
                session_subject,
                refreshed_token: None,
            }));
        }

        let stale_exchange = device.previous_token.as_deref() == Some(claims.rot.as_str())
            && nonce.is_some()
            && device.rotation_nonce.as_deref() == nonce;
        if stale_exchange {
            if let Some(nonce) = nonce {
                if self
                    .store
                    .consume_rotation_nonce(instance.instance_id, device.device_id, nonce)
                    .await?
                {
                    tracing::info!(device_id = %device.device_id, "Stale device token exchanged");
                    let refreshed_token = self.sign_token(instance, &device)?;
                    let session_subject = device.session_subject.clone();
                    return Ok(Some(ResolvedDevice {
                        device: DeviceIdentity {
                            rotation_nonce: None,
                            ..device
                        },
                        session_subject,
                        refreshed_token: Some(refreshed_token),
                    }));
                }
            }
        }

        tracing::warn!(device_id = %device.device_id, "Rotating token mismatch, dropping session");
        self.store
            .clear_device_session(instance.instance_id, device.device_id, &device.rotating_token)
            .await?;
        self.events.emit(CredentialEvent::DeviceTokenMismatch {
            instance_id: instance.instance_id,
            device_id: device.device_id,
        });

        Ok(Some(ResolvedDevice {
            device: DeviceIdentity {
                session_subject: None,
                ..device
            },
            session_subject: None,
            refreshed_token: None,
        }))
    }

    /// Attach `subject`'s session to the device and rotate its token.
    #[tracing::instrument(skip(self, instance, subject_id, rotation_nonce), fields(instance_id = %instance.instance_id))]
    pub async fn establish_session(
        &self,
        instance: &Instance,
        device_id: Uuid,
        subject_id: &str,
        rotation_nonce: Option<String>,
    ) -> Result<(DeviceIdentity, String), ServiceError> {
        for _ in 0..MAX_ROTATION_RETRIES {
            let device = self
                .store
                .find_device(instance.instance_id, device_id)
                .await?
                .ok_or(ServiceError::DeviceMissing)?;

            let rotation = DeviceRotation {
                expected_token: device.rotating_token.clone(),
                new_token: rotating_token(),
                rotation_nonce: rotation_nonce.clone(),
                session_subject: Some(subject_id.to_string()),
                at: self.clock.now(),
            };
            if !self
                .store
                .rotate_device(instance.instance_id, device_id, rotation.clone())
                .await?
            {
                continue;
            }

            let rotated = DeviceIdentity {
                previous_token: Some(rotation.expected_token),
                rotating_token: rotation.new_token,
                rotation_nonce: rotation.rotation_nonce,
                session_subject: rotation.session_subject,
                rotated_utc: Some(rotation.at),
                ..device
            };
            let token = self.sign_token(instance, &rotated)?;

            tracing::info!(device_id = %device_id, "Device token rotated");
            self.events.emit(CredentialEvent::DeviceRotated {
                instance_id: instance.instance_id,
                device_id,
            });
            return Ok((rotated, token));
        }

        Err(ServiceError::Internal(anyhow::anyhow!(
            "Device {} rotation stayed contended",
            device_id
        )))
    }
}
