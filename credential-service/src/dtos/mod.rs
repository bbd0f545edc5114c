pub mod client;
pub mod jwt_templates;
pub mod tickets;
pub mod verifications;

use serde::Serialize;
use utoipa::ToSchema;

/// One entry of an error response, as documented in the API schema.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorItem {
    #[schema(example = "is invalid")]
    pub message: String,
    #[schema(example = "Template name must match [A-Za-z0-9_-]{1,64}.")]
    pub long_message: String,
    #[schema(example = "invalid_template_name")]
    pub code: String,
    #[schema(value_type = Option<Object>)]
    pub meta: Option<serde_json::Value>,
}

/// Error envelope returned by every endpoint.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub errors: Vec<ErrorItem>,
    #[schema(example = "5f0c9a3e-1e0b-4c7e-9a55-0b9c7f2b8e11")]
    pub clerk_trace_id: String,
}

/// Object returned by delete endpoints.
#[derive(Debug, Serialize, ToSchema)]
pub struct DeletedObject {
    #[schema(example = "jwt_template")]
    pub object: String,
    pub id: String,
    pub deleted: bool,
}
