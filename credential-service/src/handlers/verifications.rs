use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use secrecy::Secret;
use service_core::error::AppError;
use uuid::Uuid;

use crate::{
    dtos::{
        verifications::{
            AttemptVerificationRequest, PrepareVerificationRequest, VerificationResponse,
        },
        ErrorResponse,
    },
    services::{PrepareVerification, Proof, RequestContext, ServiceError},
    store::SubjectDirectory,
    utils::ValidatedJson,
    AppState,
};

/// Subject profile field holding the argon2 password hash.
const PASSWORD_DIGEST_FIELD: &str = "password_digest";

/// Start a verification for an identification
#[utoipa::path(
    post,
    path = "/v1/client/verifications",
    request_body = PrepareVerificationRequest,
    responses(
        (status = 201, description = "Verification prepared", body = VerificationResponse),
        (status = 422, description = "Invalid request", body = ErrorResponse)
    ),
    tag = "Verifications"
)]
pub async fn prepare_verification(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    ValidatedJson(req): ValidatedJson<PrepareVerificationRequest>,
) -> Result<impl IntoResponse, AppError> {
    let prepared = state
        .verifications
        .prepare(
            &ctx.instance,
            PrepareVerification {
                strategy: req.strategy,
                identification: req.identification,
                provider_url: req.provider_url,
            },
        )
        .await?;

    let response = VerificationResponse {
        challenge: prepared.challenge,
        ..VerificationResponse::from(&prepared.verification)
    };
    Ok((StatusCode::CREATED, Json(response)))
}

/// Read a verification's current state
#[utoipa::path(
    get,
    path = "/v1/client/verifications/{verification_id}",
    params(("verification_id" = Uuid, Path, description = "Verification ID")),
    responses(
        (status = 200, description = "Verification", body = VerificationResponse),
        (status = 404, description = "Verification not found", body = ErrorResponse)
    ),
    tag = "Verifications"
)]
pub async fn get_verification(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(verification_id): Path<Uuid>,
) -> Result<Json<VerificationResponse>, AppError> {
    let verification = state
        .verifications
        .get(&ctx.instance, verification_id)
        .await?;
    Ok(Json(VerificationResponse::from(&verification)))
}

/// Submit a proof against a verification
#[utoipa::path(
    post,
    path = "/v1/client/verifications/{verification_id}/attempt",
    params(("verification_id" = Uuid, Path, description = "Verification ID")),
    request_body = AttemptVerificationRequest,
    responses(
        (status = 200, description = "Proof accepted", body = VerificationResponse),
        (status = 400, description = "Already verified or expired", body = ErrorResponse),
        (status = 404, description = "Verification not found", body = ErrorResponse),
        (status = 422, description = "Incorrect proof", body = ErrorResponse)
    ),
    tag = "Verifications"
)]
pub async fn attempt_verification(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(verification_id): Path<Uuid>,
    ValidatedJson(req): ValidatedJson<AttemptVerificationRequest>,
) -> Result<Json<VerificationResponse>, AppError> {
    let proof = match (req.code, req.nonce, req.password) {
        (Some(code), _, _) => Proof::Code(code),
        (None, Some(nonce), _) => Proof::Nonce(nonce),
        (None, None, Some(password)) => {
            let hash = password_digest(&state, &ctx, verification_id).await?;
            Proof::Password {
                candidate: Secret::new(password),
                hash,
            }
        }
        (None, None, None) => {
            return Err(ServiceError::MissingParameter("code".to_string()).into());
        }
    };

    let verification = state
        .verifications
        .attempt(&ctx.instance, verification_id, proof)
        .await?;
    Ok(Json(VerificationResponse::from(&verification)))
}

/// Stored password hash of the subject a password verification is about.
async fn password_digest(
    state: &AppState,
    ctx: &RequestContext,
    verification_id: Uuid,
) -> Result<String, ServiceError> {
    let verification = state.verifications.get(&ctx.instance, verification_id).await?;
    let subject = state
        .store
        .find_subject(ctx.instance.instance_id, &verification.identification)
        .await?
        .ok_or(ServiceError::SubjectNotFound)?;

    subject
        .data
        .get(PASSWORD_DIGEST_FIELD)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or(ServiceError::SubjectNotFound)
}
