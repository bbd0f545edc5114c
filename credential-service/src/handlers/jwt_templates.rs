use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    Extension, Json,
};
use service_core::error::AppError;
use uuid::Uuid;

use crate::{
    dtos::{
        jwt_templates::{
            CreateJwtTemplateRequest, JwtTemplateResponse, TokenResponse,
            UpdateJwtTemplateRequest,
        },
        DeletedObject, ErrorResponse,
    },
    services::{RequestContext, ServiceError, TemplateParams, TemplatePatch},
    store::SubjectDirectory,
    utils::ValidatedJson,
    AppState,
};

/// List the instance's JWT templates
#[utoipa::path(
    get,
    path = "/v1/instances/{instance_id}/jwt_templates",
    params(("instance_id" = Uuid, Path, description = "Instance ID")),
    responses(
        (status = 200, description = "Templates", body = [JwtTemplateResponse]),
        (status = 401, description = "Unauthorized", body = ErrorResponse),
        (status = 404, description = "Instance not found", body = ErrorResponse)
    ),
    tag = "JWT Templates",
    security(("admin_api_key" = []))
)]
pub async fn list_templates(
    State(state): State<AppState>,
    Path(instance_id): Path<Uuid>,
) -> Result<Json<Vec<JwtTemplateResponse>>, AppError> {
    let instance = state.instances.get(instance_id).await?;
    let templates = state.templates.list(&instance).await?;
    Ok(Json(
        templates
            .iter()
            .map(|t| JwtTemplateResponse::new(t, &instance))
            .collect(),
    ))
}

/// Create a JWT template
#[utoipa::path(
    post,
    path = "/v1/instances/{instance_id}/jwt_templates",
    params(("instance_id" = Uuid, Path, description = "Instance ID")),
    request_body = CreateJwtTemplateRequest,
    responses(
        (status = 201, description = "Template created", body = JwtTemplateResponse),
        (status = 403, description = "Feature not supported by plan", body = ErrorResponse),
        (status = 422, description = "Invalid template", body = ErrorResponse)
    ),
    tag = "JWT Templates",
    security(("admin_api_key" = []))
)]
pub async fn create_template(
    State(state): State<AppState>,
    Path(instance_id): Path<Uuid>,
    ValidatedJson(req): ValidatedJson<CreateJwtTemplateRequest>,
) -> Result<impl IntoResponse, AppError> {
    let instance = state.instances.get(instance_id).await?;
    let params = TemplateParams::try_from(req)?;
    let template = state.templates.create(&instance, params).await?;

    // The session pointer may have moved.
    let instance = state.instances.get(instance_id).await?;
    Ok((
        StatusCode::CREATED,
        Json(JwtTemplateResponse::new(&template, &instance)),
    ))
}

/// Fetch one JWT template
#[utoipa::path(
    get,
    path = "/v1/instances/{instance_id}/jwt_templates/{template_id}",
    params(
        ("instance_id" = Uuid, Path, description = "Instance ID"),
        ("template_id" = Uuid, Path, description = "Template ID")
    ),
    responses(
        (status = 200, description = "Template", body = JwtTemplateResponse),
        (status = 404, description = "Template not found", body = ErrorResponse)
    ),
    tag = "JWT Templates",
    security(("admin_api_key" = []))
)]
pub async fn get_template(
    State(state): State<AppState>,
    Path((instance_id, template_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<JwtTemplateResponse>, AppError> {
    let instance = state.instances.get(instance_id).await?;
    let template = state.templates.get(&instance, template_id).await?;
    Ok(Json(JwtTemplateResponse::new(&template, &instance)))
}

/// Update a JWT template; omitted fields keep their value
#[utoipa::path(
    patch,
    path = "/v1/instances/{instance_id}/jwt_templates/{template_id}",
    params(
        ("instance_id" = Uuid, Path, description = "Instance ID"),
        ("template_id" = Uuid, Path, description = "Template ID")
    ),
    request_body = UpdateJwtTemplateRequest,
    responses(
        (status = 200, description = "Template updated", body = JwtTemplateResponse),
        (status = 404, description = "Template not found", body = ErrorResponse),
        (status = 422, description = "Invalid template", body = ErrorResponse)
    ),
    tag = "JWT Templates",
    security(("admin_api_key" = []))
)]
pub async fn update_template(
    State(state): State<AppState>,
    Path((instance_id, template_id)): Path<(Uuid, Uuid)>,
    ValidatedJson(req): ValidatedJson<UpdateJwtTemplateRequest>,
) -> Result<Json<JwtTemplateResponse>, AppError> {
    let instance = state.instances.get(instance_id).await?;
    let patch = TemplatePatch::try_from(req)?;
    let template = state.templates.update(&instance, template_id, patch).await?;

    let instance = state.instances.get(instance_id).await?;
    Ok(Json(JwtTemplateResponse::new(&template, &instance)))
}

/// Delete a JWT template
#[utoipa::path(
    delete,
    path = "/v1/instances/{instance_id}/jwt_templates/{template_id}",
    params(
        ("instance_id" = Uuid, Path, description = "Instance ID"),
        ("template_id" = Uuid, Path, description = "Template ID")
    ),
    responses(
        (status = 200, description = "Template deleted", body = DeletedObject),
        (status = 400, description = "Template is the session-token template", body = ErrorResponse),
        (status = 404, description = "Template not found", body = ErrorResponse)
    ),
    tag = "JWT Templates",
    security(("admin_api_key" = []))
)]
pub async fn delete_template(
    State(state): State<AppState>,
    Path((instance_id, template_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<DeletedObject>, AppError> {
    let instance = state.instances.get(instance_id).await?;
    state.templates.delete(&instance, template_id).await?;
    Ok(Json(DeletedObject {
        object: "jwt_template".to_string(),
        id: template_id.to_string(),
        deleted: true,
    }))
}

/// Mint a token from the named template for the signed-in subject
#[utoipa::path(
    post,
    path = "/v1/client/tokens/{template}",
    params(("template" = String, Path, description = "Template name")),
    responses(
        (status = 200, description = "Signed token", body = TokenResponse),
        (status = 401, description = "No active session", body = ErrorResponse),
        (status = 404, description = "Template not found", body = ErrorResponse)
    ),
    tag = "JWT Templates"
)]
pub async fn create_token(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(template_name): Path<String>,
    headers: HeaderMap,
) -> Result<Json<TokenResponse>, AppError> {
    let subject_id = ctx.session_subject.as_deref().ok_or(ServiceError::SignedOut)?;
    let template = state.templates.get_by_name(&ctx.instance, &template_name).await?;
    let subject = state
        .store
        .find_subject(ctx.instance.instance_id, subject_id)
        .await
        .map_err(ServiceError::from)?
        .ok_or(ServiceError::SubjectNotFound)?;

    let azp = headers
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty());
    let jwt = state.templates.mint(&template, &ctx.instance, &subject, azp)?;

    Ok(Json(TokenResponse {
        object: "token".to_string(),
        jwt,
    }))
}
