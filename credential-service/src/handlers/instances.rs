use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;
use service_core::error::AppError;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{dtos::ErrorResponse, AppState};

#[derive(Debug, Serialize, ToSchema)]
pub struct InstanceResponse {
    #[schema(example = "instance")]
    pub object: String,
    pub id: String,
    #[schema(example = "production")]
    pub environment_type: String,
    pub auth_domain: String,
}

/// Promote a development instance to production
///
/// Dev browsers of the instance are removed in the same unit of work.
#[utoipa::path(
    post,
    path = "/v1/instances/{instance_id}/promote",
    params(("instance_id" = Uuid, Path, description = "Instance ID")),
    responses(
        (status = 200, description = "Instance promoted", body = InstanceResponse),
        (status = 401, description = "Unauthorized", body = ErrorResponse),
        (status = 404, description = "Instance not found", body = ErrorResponse)
    ),
    tag = "Instances",
    security(("admin_api_key" = []))
)]
pub async fn promote_instance(
    State(state): State<AppState>,
    Path(instance_id): Path<Uuid>,
) -> Result<Json<InstanceResponse>, AppError> {
    let instance = state.instances.promote_to_production(instance_id).await?;
    Ok(Json(InstanceResponse {
        object: "instance".to_string(),
        id: instance.instance_id.to_string(),
        environment_type: instance.environment.as_str().to_string(),
        auth_domain: instance.auth_domain,
    }))
}
