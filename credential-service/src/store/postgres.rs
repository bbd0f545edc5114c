//! PostgreSQL store.
//!
//! Status transitions are single `UPDATE ... WHERE <expected state>` statements;
//! `rows_affected()` decides the winner.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, Secret};
use serde_json::Value;
use sqlx::postgres::PgPool;
use sqlx::FromRow;
use uuid::Uuid;

use super::{
    DeviceRotation, DeviceStore, InstanceStore, SessionPointer, SubjectDirectory, TemplateChange,
    TemplateStore, TemplateUnitOfWork, TicketStore, UnitOfWorkOutcome, VerificationStore,
};
use crate::models::{
    CustomSigningKey, DeviceIdentity, DeviceKind, Instance, InstanceEnvironment, InstanceKeys,
    JwtTemplate, PlanFeature, PlanFeatures, SigningAlgorithm, Subject, Ticket, TicketPayload,
    TicketStatus, Verification, VerificationStatus, Strategy,
};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn decode_err(what: &str, value: &str) -> anyhow::Error {
    anyhow::anyhow!("Unknown {} code in database: {}", what, value)
}

#[derive(FromRow)]
struct InstanceRow {
    instance_id: Uuid,
    environment_code: String,
    auth_domain: String,
    proxy_url: Option<String>,
    satellite_domains: Vec<String>,
    allowed_origins: Vec<String>,
    key_id: String,
    algorithm_code: String,
    private_key: String,
    public_key: String,
    session_template_id: Option<Uuid>,
    plan_unrestricted: bool,
    plan_features: Vec<String>,
    created_utc: DateTime<Utc>,
}

impl TryFrom<InstanceRow> for Instance {
    type Error = anyhow::Error;

    fn try_from(row: InstanceRow) -> Result<Self, Self::Error> {
        Ok(Instance {
            instance_id: row.instance_id,
            environment: InstanceEnvironment::parse(&row.environment_code)
                .ok_or_else(|| decode_err("environment", &row.environment_code))?,
            auth_domain: row.auth_domain,
            proxy_url: row.proxy_url,
            satellite_domains: row.satellite_domains,
            allowed_origins: row.allowed_origins,
            keys: InstanceKeys {
                key_id: row.key_id,
                algorithm: SigningAlgorithm::parse(&row.algorithm_code)
                    .ok_or_else(|| decode_err("algorithm", &row.algorithm_code))?,
                private_key: Secret::new(row.private_key),
                public_key: row.public_key,
            },
            session_template_id: row.session_template_id,
            plan: PlanFeatures {
                unrestricted: row.plan_unrestricted,
                features: row
                    .plan_features
                    .iter()
                    .filter_map(|f| PlanFeature::parse(f))
                    .collect(),
            },
            created_utc: row.created_utc,
        })
    }
}

#[derive(FromRow)]
struct SubjectRow {
    instance_id: Uuid,
    subject_id: String,
    data: Value,
}

#[derive(FromRow)]
struct TicketRow {
    ticket_id: Uuid,
    instance_id: Uuid,
    subject_id: String,
    status_code: String,
    payload: Value,
    issued_utc: DateTime<Utc>,
    expires_in_seconds: i64,
    status_changed_utc: Option<DateTime<Utc>>,
}

impl TryFrom<TicketRow> for Ticket {
    type Error = anyhow::Error;

    fn try_from(row: TicketRow) -> Result<Self, Self::Error> {
        let payload: TicketPayload = serde_json::from_value(row.payload)
            .map_err(|e| anyhow::anyhow!("Corrupt ticket payload {}: {}", row.ticket_id, e))?;
        Ok(Ticket {
            ticket_id: row.ticket_id,
            instance_id: row.instance_id,
            subject_id: row.subject_id,
            status: TicketStatus::parse(&row.status_code)
                .ok_or_else(|| decode_err("ticket status", &row.status_code))?,
            payload,
            issued_utc: row.issued_utc,
            expires_in_seconds: row.expires_in_seconds,
            status_changed_utc: row.status_changed_utc,
        })
    }
}

#[derive(FromRow)]
struct TemplateRow {
    template_id: Uuid,
    instance_id: Uuid,
    name: String,
    claims: Value,
    lifetime_seconds: i64,
    allowed_clock_skew_seconds: i64,
    signing_algorithm_code: Option<String>,
    signing_key: Option<String>,
    signing_public_key: Option<String>,
    created_utc: DateTime<Utc>,
    updated_utc: DateTime<Utc>,
}

impl TryFrom<TemplateRow> for JwtTemplate {
    type Error = anyhow::Error;

    fn try_from(row: TemplateRow) -> Result<Self, Self::Error> {
        let claims = match row.claims {
            Value::Object(map) => map,
            _ => anyhow::bail!("Template {} claims are not an object", row.template_id),
        };
        let custom_signing_key = match (row.signing_algorithm_code, row.signing_key) {
            (Some(code), Some(key)) => Some(CustomSigningKey {
                algorithm: SigningAlgorithm::parse(&code)
                    .ok_or_else(|| decode_err("algorithm", &code))?,
                signing_key: Secret::new(key),
                public_key: row.signing_public_key,
            }),
            _ => None,
        };
        Ok(JwtTemplate {
            template_id: row.template_id,
            instance_id: row.instance_id,
            name: row.name,
            claims,
            lifetime_seconds: row.lifetime_seconds,
            allowed_clock_skew_seconds: row.allowed_clock_skew_seconds,
            custom_signing_key,
            created_utc: row.created_utc,
            updated_utc: row.updated_utc,
        })
    }
}

#[derive(FromRow)]
struct VerificationRow {
    verification_id: Uuid,
    instance_id: Uuid,
    strategy_code: String,
    identification: String,
    status_code: String,
    attempts: i32,
    max_attempts: i32,
    secret_hash: Option<String>,
    external_authorization_url: Option<String>,
    created_utc: DateTime<Utc>,
    expires_utc: DateTime<Utc>,
    verified_utc: Option<DateTime<Utc>>,
}

impl TryFrom<VerificationRow> for Verification {
    type Error = anyhow::Error;

    fn try_from(row: VerificationRow) -> Result<Self, Self::Error> {
        Ok(Verification {
            verification_id: row.verification_id,
            instance_id: row.instance_id,
            strategy: Strategy::parse(&row.strategy_code)
                .ok_or_else(|| decode_err("strategy", &row.strategy_code))?,
            identification: row.identification,
            status: VerificationStatus::parse(&row.status_code)
                .ok_or_else(|| decode_err("verification status", &row.status_code))?,
            attempts: u32::try_from(row.attempts)?,
            max_attempts: u32::try_from(row.max_attempts)?,
            secret_hash: row.secret_hash,
            external_authorization_url: row.external_authorization_url,
            created_utc: row.created_utc,
            expires_utc: row.expires_utc,
            verified_utc: row.verified_utc,
        })
    }
}

#[derive(FromRow)]
struct DeviceRow {
    device_id: Uuid,
    instance_id: Uuid,
    kind_code: String,
    rotating_token: String,
    previous_token: Option<String>,
    rotation_nonce: Option<String>,
    session_subject: Option<String>,
    created_utc: DateTime<Utc>,
    rotated_utc: Option<DateTime<Utc>>,
}

impl TryFrom<DeviceRow> for DeviceIdentity {
    type Error = anyhow::Error;

    fn try_from(row: DeviceRow) -> Result<Self, Self::Error> {
        Ok(DeviceIdentity {
            device_id: row.device_id,
            instance_id: row.instance_id,
            kind: DeviceKind::parse(&row.kind_code)
                .ok_or_else(|| decode_err("device kind", &row.kind_code))?,
            rotating_token: row.rotating_token,
            previous_token: row.previous_token,
            rotation_nonce: row.rotation_nonce,
            session_subject: row.session_subject,
            created_utc: row.created_utc,
            rotated_utc: row.rotated_utc,
        })
    }
}

#[async_trait]
impl InstanceStore for PgStore {
    async fn insert_instance(&self, instance: &Instance) -> Result<(), anyhow::Error> {
        sqlx::query(
            r#"
            INSERT INTO instances (instance_id, environment_code, auth_domain, proxy_url,
                satellite_domains, allowed_origins, key_id, algorithm_code, private_key,
                public_key, plan_unrestricted, plan_features, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(instance.instance_id)
        .bind(instance.environment.as_str())
        .bind(&instance.auth_domain)
        .bind(&instance.proxy_url)
        .bind(&instance.satellite_domains)
        .bind(&instance.allowed_origins)
        .bind(&instance.keys.key_id)
        .bind(instance.keys.algorithm.as_str())
        .bind(instance.keys.private_key.expose_secret())
        .bind(&instance.keys.public_key)
        .bind(instance.plan.unrestricted)
        .bind(
            instance
                .plan
                .features
                .iter()
                .map(|f| f.as_str().to_string())
                .collect::<Vec<_>>(),
        )
        .bind(instance.created_utc)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_instance(&self, instance_id: Uuid) -> Result<Option<Instance>, anyhow::Error> {
        sqlx::query_as::<_, InstanceRow>("SELECT * FROM instances WHERE instance_id = $1")
            .bind(instance_id)
            .fetch_optional(&self.pool)
            .await?
            .map(Instance::try_from)
            .transpose()
    }

    async fn find_instance_by_domain(
        &self,
        host: &str,
    ) -> Result<Option<Instance>, anyhow::Error> {
        sqlx::query_as::<_, InstanceRow>(
            "SELECT * FROM instances WHERE LOWER(auth_domain) = LOWER($1)",
        )
        .bind(host)
        .fetch_optional(&self.pool)
        .await?
        .map(Instance::try_from)
        .transpose()
    }

    async fn promote_to_production(
        &self,
        instance_id: Uuid,
    ) -> Result<Option<u64>, anyhow::Error> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE instances SET environment_code = 'production' WHERE instance_id = $1",
        )
        .bind(instance_id)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        let removed = sqlx::query("DELETE FROM devices WHERE instance_id = $1 AND kind_code = $2")
            .bind(instance_id)
            .bind(DeviceKind::DevBrowser.as_str())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Some(removed.rows_affected()))
    }
}

#[async_trait]
impl SubjectDirectory for PgStore {
    async fn insert_subject(&self, subject: &Subject) -> Result<(), anyhow::Error> {
        sqlx::query("INSERT INTO subjects (instance_id, subject_id, data) VALUES ($1, $2, $3)")
            .bind(subject.instance_id)
            .bind(&subject.subject_id)
            .bind(&subject.data)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_subject(
        &self,
        instance_id: Uuid,
        subject_id: &str,
    ) -> Result<Option<Subject>, anyhow::Error> {
        let row = sqlx::query_as::<_, SubjectRow>(
            "SELECT * FROM subjects WHERE instance_id = $1 AND subject_id = $2",
        )
        .bind(instance_id)
        .bind(subject_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| Subject::new(r.instance_id, r.subject_id, r.data)))
    }
}

#[async_trait]
impl TicketStore for PgStore {
    async fn insert_ticket(&self, ticket: &Ticket) -> Result<(), anyhow::Error> {
        sqlx::query(
            r#"
            INSERT INTO tickets (ticket_id, instance_id, subject_id, kind_code, status_code,
                payload, issued_utc, expires_in_seconds)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(ticket.ticket_id)
        .bind(ticket.instance_id)
        .bind(&ticket.subject_id)
        .bind(ticket.kind().as_str())
        .bind(ticket.status.as_str())
        .bind(serde_json::to_value(&ticket.payload)?)
        .bind(ticket.issued_utc)
        .bind(ticket.expires_in_seconds)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_ticket(
        &self,
        instance_id: Uuid,
        ticket_id: Uuid,
    ) -> Result<Option<Ticket>, anyhow::Error> {
        sqlx::query_as::<_, TicketRow>(
            "SELECT * FROM tickets WHERE instance_id = $1 AND ticket_id = $2",
        )
        .bind(instance_id)
        .bind(ticket_id)
        .fetch_optional(&self.pool)
        .await?
        .map(Ticket::try_from)
        .transpose()
    }

    async fn transition_ticket(
        &self,
        instance_id: Uuid,
        ticket_id: Uuid,
        from: TicketStatus,
        to: TicketStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, anyhow::Error> {
        let result = sqlx::query(
            r#"
            UPDATE tickets SET status_code = $1, status_changed_utc = $2
            WHERE instance_id = $3 AND ticket_id = $4 AND status_code = $5
            "#,
        )
        .bind(to.as_str())
        .bind(at)
        .bind(instance_id)
        .bind(ticket_id)
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl TemplateStore for PgStore {
    async fn list_templates(&self, instance_id: Uuid) -> Result<Vec<JwtTemplate>, anyhow::Error> {
        sqlx::query_as::<_, TemplateRow>(
            "SELECT * FROM jwt_templates WHERE instance_id = $1 ORDER BY name",
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(JwtTemplate::try_from)
        .collect()
    }

    async fn find_template(
        &self,
        instance_id: Uuid,
        template_id: Uuid,
    ) -> Result<Option<JwtTemplate>, anyhow::Error> {
        sqlx::query_as::<_, TemplateRow>(
            "SELECT * FROM jwt_templates WHERE instance_id = $1 AND template_id = $2",
        )
        .bind(instance_id)
        .bind(template_id)
        .fetch_optional(&self.pool)
        .await?
        .map(JwtTemplate::try_from)
        .transpose()
    }

    async fn find_template_by_name(
        &self,
        instance_id: Uuid,
        name: &str,
    ) -> Result<Option<JwtTemplate>, anyhow::Error> {
        sqlx::query_as::<_, TemplateRow>(
            "SELECT * FROM jwt_templates WHERE instance_id = $1 AND name = $2",
        )
        .bind(instance_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?
        .map(JwtTemplate::try_from)
        .transpose()
    }

    async fn apply_template_change(
        &self,
        unit: TemplateUnitOfWork,
    ) -> Result<UnitOfWorkOutcome, anyhow::Error> {
        let mut tx = self.pool.begin().await?;

        let pointer: Option<Option<Uuid>> = sqlx::query_scalar(
            "SELECT session_template_id FROM instances WHERE instance_id = $1 FOR UPDATE",
        )
        .bind(unit.instance_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(current_pointer) = pointer else {
            tx.rollback().await?;
            return Ok(UnitOfWorkOutcome::NotFound);
        };

        match &unit.change {
            TemplateChange::Upsert(template) => {
                let key = template.custom_signing_key.as_ref();
                let result = sqlx::query(
                    r#"
                    INSERT INTO jwt_templates (template_id, instance_id, name, claims,
                        lifetime_seconds, allowed_clock_skew_seconds, signing_algorithm_code,
                        signing_key, signing_public_key, created_utc, updated_utc)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                    ON CONFLICT (template_id) DO UPDATE SET
                        name = EXCLUDED.name,
                        claims = EXCLUDED.claims,
                        lifetime_seconds = EXCLUDED.lifetime_seconds,
                        allowed_clock_skew_seconds = EXCLUDED.allowed_clock_skew_seconds,
                        signing_algorithm_code = EXCLUDED.signing_algorithm_code,
                        signing_key = EXCLUDED.signing_key,
                        signing_public_key = EXCLUDED.signing_public_key,
                        updated_utc = EXCLUDED.updated_utc
                    "#,
                )
                .bind(template.template_id)
                .bind(template.instance_id)
                .bind(&template.name)
                .bind(Value::Object(template.claims.clone()))
                .bind(template.lifetime_seconds)
                .bind(template.allowed_clock_skew_seconds)
                .bind(key.map(|k| k.algorithm.as_str()))
                .bind(key.map(|k| k.signing_key.expose_secret().clone()))
                .bind(key.and_then(|k| k.public_key.clone()))
                .bind(template.created_utc)
                .bind(template.updated_utc)
                .execute(&mut *tx)
                .await;

                match result {
                    Ok(_) => {}
                    Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                        tx.rollback().await?;
                        return Ok(UnitOfWorkOutcome::NameTaken);
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            TemplateChange::Delete(template_id) => {
                if current_pointer == Some(*template_id) {
                    tx.rollback().await?;
                    return Ok(UnitOfWorkOutcome::SessionTemplateInUse);
                }
                let deleted = sqlx::query(
                    "DELETE FROM jwt_templates WHERE instance_id = $1 AND template_id = $2",
                )
                .bind(unit.instance_id)
                .bind(template_id)
                .execute(&mut *tx)
                .await?;
                if deleted.rows_affected() == 0 {
                    tx.rollback().await?;
                    return Ok(UnitOfWorkOutcome::NotFound);
                }
            }
        }

        let new_pointer = match unit.session_pointer {
            SessionPointer::Keep => None,
            SessionPointer::Set(id) => Some(Some(id)),
            SessionPointer::Clear => Some(None),
        };
        if let Some(pointer) = new_pointer {
            sqlx::query("UPDATE instances SET session_template_id = $1 WHERE instance_id = $2")
                .bind(pointer)
                .bind(unit.instance_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(UnitOfWorkOutcome::Applied)
    }
}

#[async_trait]
impl VerificationStore for PgStore {
    async fn insert_verification(
        &self,
        verification: &Verification,
    ) -> Result<(), anyhow::Error> {
        sqlx::query(
            r#"
            INSERT INTO verifications (verification_id, instance_id, strategy_code,
                identification, status_code, attempts, max_attempts, secret_hash,
                external_authorization_url, created_utc, expires_utc, verified_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(verification.verification_id)
        .bind(verification.instance_id)
        .bind(verification.strategy.as_str())
        .bind(&verification.identification)
        .bind(verification.status.as_str())
        .bind(i32::try_from(verification.attempts)?)
        .bind(i32::try_from(verification.max_attempts)?)
        .bind(&verification.secret_hash)
        .bind(&verification.external_authorization_url)
        .bind(verification.created_utc)
        .bind(verification.expires_utc)
        .bind(verification.verified_utc)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_verification(
        &self,
        instance_id: Uuid,
        verification_id: Uuid,
    ) -> Result<Option<Verification>, anyhow::Error> {
        sqlx::query_as::<_, VerificationRow>(
            "SELECT * FROM verifications WHERE instance_id = $1 AND verification_id = $2",
        )
        .bind(instance_id)
        .bind(verification_id)
        .fetch_optional(&self.pool)
        .await?
        .map(Verification::try_from)
        .transpose()
    }

    async fn update_verification_if(
        &self,
        expected_status: VerificationStatus,
        expected_attempts: u32,
        next: &Verification,
    ) -> Result<bool, anyhow::Error> {
        let result = sqlx::query(
            r#"
            UPDATE verifications SET status_code = $1, attempts = $2, verified_utc = $3
            WHERE instance_id = $4 AND verification_id = $5
                AND status_code = $6 AND attempts = $7
            "#,
        )
        .bind(next.status.as_str())
        .bind(i32::try_from(next.attempts)?)
        .bind(next.verified_utc)
        .bind(next.instance_id)
        .bind(next.verification_id)
        .bind(expected_status.as_str())
        .bind(i32::try_from(expected_attempts)?)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl DeviceStore for PgStore {
    async fn insert_device(&self, device: &DeviceIdentity) -> Result<(), anyhow::Error> {
        sqlx::query(
            r#"
            INSERT INTO devices (device_id, instance_id, kind_code, rotating_token,
                previous_token, rotation_nonce, session_subject, created_utc, rotated_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(device.device_id)
        .bind(device.instance_id)
        .bind(device.kind.as_str())
        .bind(&device.rotating_token)
        .bind(&device.previous_token)
        .bind(&device.rotation_nonce)
        .bind(&device.session_subject)
        .bind(device.created_utc)
        .bind(device.rotated_utc)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_device(
        &self,
        instance_id: Uuid,
        device_id: Uuid,
    ) -> Result<Option<DeviceIdentity>, anyhow::Error> {
        sqlx::query_as::<_, DeviceRow>(
            "SELECT * FROM devices WHERE instance_id = $1 AND device_id = $2",
        )
        .bind(instance_id)
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?
        .map(DeviceIdentity::try_from)
        .transpose()
    }

    async fn rotate_device(
        &self,
        instance_id: Uuid,
        device_id: Uuid,
        rotation: DeviceRotation,
    ) -> Result<bool, anyhow::Error> {
        let result = sqlx::query(
            r#"
            UPDATE devices SET previous_token = rotating_token, rotating_token = $1,
                rotation_nonce = $2, session_subject = $3, rotated_utc = $4
            WHERE instance_id = $5 AND device_id = $6 AND rotating_token = $7
            "#,
        )
        .bind(&rotation.new_token)
        .bind(&rotation.rotation_nonce)
        .bind(&rotation.session_subject)
        .bind(rotation.at)
        .bind(instance_id)
        .bind(device_id)
        .bind(&rotation.expected_token)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn consume_rotation_nonce(
        &self,
        instance_id: Uuid,
        device_id: Uuid,
        nonce: &str,
    ) -> Result<bool, anyhow::Error> {
        let result = sqlx::query(
            r#"
            UPDATE devices SET rotation_nonce = NULL
            WHERE instance_id = $1 AND device_id = $2 AND rotation_nonce = $3
            "#,
        )
        .bind(instance_id)
        .bind(device_id)
        .bind(nonce)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn clear_device_session(
        &self,
        instance_id: Uuid,
        device_id: Uuid,
        expected_token: &str,
    ) -> Result<bool, anyhow::Error> {
        let result = sqlx::query(
            r#"
            UPDATE devices SET session_subject = NULL
            WHERE instance_id = $1 AND device_id = $2 AND rotating_token = $3
            "#,
        )
        .bind(instance_id)
        .bind(device_id)
        .bind(expected_token)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}
