use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use axum_extra::extract::cookie::CookieJar;
use service_core::error::AppError;
use uuid::Uuid;

use crate::{
    dtos::{
        tickets::{
            AcceptTicketQuery, CreateActorTokenRequest, CreateSignInTokenRequest,
            TicketAcceptanceResponse, TicketResponse,
        },
        ErrorResponse,
    },
    handlers::client::device_cookie,
    models::{TicketKind, TicketPayload},
    services::{IssueTicket, RequestContext, ServiceError},
    utils::ValidatedJson,
    AppState,
};

/// Issue an actor token letting `actor.sub` impersonate `user_id`
#[utoipa::path(
    post,
    path = "/v1/instances/{instance_id}/actor_tokens",
    params(("instance_id" = Uuid, Path, description = "Instance ID")),
    request_body = CreateActorTokenRequest,
    responses(
        (status = 201, description = "Actor token issued", body = TicketResponse),
        (status = 401, description = "Unauthorized", body = ErrorResponse),
        (status = 404, description = "Subject not found", body = ErrorResponse),
        (status = 422, description = "Invalid actor or expiry", body = ErrorResponse)
    ),
    tag = "Tickets",
    security(("admin_api_key" = []))
)]
pub async fn create_actor_token(
    State(state): State<AppState>,
    Path(instance_id): Path<Uuid>,
    ValidatedJson(req): ValidatedJson<CreateActorTokenRequest>,
) -> Result<impl IntoResponse, AppError> {
    let instance = state.instances.get(instance_id).await?;
    let issued = state
        .tickets
        .issue(
            &instance,
            IssueTicket {
                subject_id: req.user_id,
                payload: TicketPayload::Actor { actor: req.actor },
                ttl_seconds: req.expires_in_seconds,
            },
        )
        .await?;

    Ok((StatusCode::CREATED, Json(TicketResponse::from(issued))))
}

/// Revoke a pending actor token
#[utoipa::path(
    post,
    path = "/v1/instances/{instance_id}/actor_tokens/{ticket_id}/revoke",
    params(
        ("instance_id" = Uuid, Path, description = "Instance ID"),
        ("ticket_id" = Uuid, Path, description = "Actor token ID")
    ),
    responses(
        (status = 200, description = "Actor token revoked", body = TicketResponse),
        (status = 400, description = "Token is not pending", body = ErrorResponse),
        (status = 404, description = "Actor token not found", body = ErrorResponse)
    ),
    tag = "Tickets",
    security(("admin_api_key" = []))
)]
pub async fn revoke_actor_token(
    State(state): State<AppState>,
    Path((instance_id, ticket_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<TicketResponse>, AppError> {
    revoke(&state, instance_id, ticket_id, TicketKind::Actor).await
}

/// Issue a sign-in token for `user_id`
#[utoipa::path(
    post,
    path = "/v1/instances/{instance_id}/sign_in_tokens",
    params(("instance_id" = Uuid, Path, description = "Instance ID")),
    request_body = CreateSignInTokenRequest,
    responses(
        (status = 201, description = "Sign-in token issued", body = TicketResponse),
        (status = 401, description = "Unauthorized", body = ErrorResponse),
        (status = 404, description = "Subject not found", body = ErrorResponse),
        (status = 422, description = "Invalid expiry", body = ErrorResponse)
    ),
    tag = "Tickets",
    security(("admin_api_key" = []))
)]
pub async fn create_sign_in_token(
    State(state): State<AppState>,
    Path(instance_id): Path<Uuid>,
    ValidatedJson(req): ValidatedJson<CreateSignInTokenRequest>,
) -> Result<impl IntoResponse, AppError> {
    let instance = state.instances.get(instance_id).await?;
    let issued = state
        .tickets
        .issue(
            &instance,
            IssueTicket {
                subject_id: req.user_id,
                payload: TicketPayload::SignIn,
                ttl_seconds: req.expires_in_seconds,
            },
        )
        .await?;

    Ok((StatusCode::CREATED, Json(TicketResponse::from(issued))))
}

/// Revoke a pending sign-in token
#[utoipa::path(
    post,
    path = "/v1/instances/{instance_id}/sign_in_tokens/{ticket_id}/revoke",
    params(
        ("instance_id" = Uuid, Path, description = "Instance ID"),
        ("ticket_id" = Uuid, Path, description = "Sign-in token ID")
    ),
    responses(
        (status = 200, description = "Sign-in token revoked", body = TicketResponse),
        (status = 400, description = "Token is not pending", body = ErrorResponse),
        (status = 404, description = "Sign-in token not found", body = ErrorResponse)
    ),
    tag = "Tickets",
    security(("admin_api_key" = []))
)]
pub async fn revoke_sign_in_token(
    State(state): State<AppState>,
    Path((instance_id, ticket_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<TicketResponse>, AppError> {
    revoke(&state, instance_id, ticket_id, TicketKind::SignIn).await
}

async fn revoke(
    state: &AppState,
    instance_id: Uuid,
    ticket_id: Uuid,
    kind: TicketKind,
) -> Result<Json<TicketResponse>, AppError> {
    let instance = state.instances.get(instance_id).await?;
    let ticket = state.tickets.revoke(&instance, ticket_id, kind).await?;
    Ok(Json(TicketResponse::from(&ticket)))
}

/// Consume a ticket and sign its subject in on the calling device
#[utoipa::path(
    get,
    path = "/v1/tickets/accept",
    params(AcceptTicketQuery),
    responses(
        (status = 200, description = "Ticket accepted, session established", body = TicketAcceptanceResponse),
        (status = 400, description = "Ticket invalid, already used, revoked or expired", body = ErrorResponse),
        (status = 404, description = "Ticket not found", body = ErrorResponse)
    ),
    tag = "Tickets"
)]
pub async fn accept_ticket(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    jar: CookieJar,
    Query(query): Query<AcceptTicketQuery>,
) -> Result<impl IntoResponse, AppError> {
    let ticket = query.ticket.trim();
    if ticket.is_empty() {
        return Err(ServiceError::MissingParameter("ticket".to_string()).into());
    }

    let signed_in = state
        .sign_in
        .sign_in(
            &ctx.instance,
            ctx.device.as_ref(),
            ticket,
            ctx.rotating_token_nonce.clone(),
        )
        .await?;
    let token = signed_in.token;

    let jar = match device_cookie(&ctx, token.clone()) {
        Some(cookie) => jar.add(cookie),
        None => jar,
    };
    Ok((
        jar,
        Json(TicketAcceptanceResponse::new(&signed_in.accepted.ticket, token)),
    ))
}
