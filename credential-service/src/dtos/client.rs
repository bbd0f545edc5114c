use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::models::{DeviceIdentity, DeviceKind};

#[derive(Debug, Serialize, ToSchema)]
pub struct DeviceResponse {
    #[schema(example = "client")]
    pub object: DeviceKind,
    pub id: String,
    /// Signed device token. Native apps send it back as a bearer token.
    pub token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_user_id: Option<String>,
    pub created_at: i64,
}

impl DeviceResponse {
    pub fn new(device: &DeviceIdentity, token: String) -> Self {
        Self {
            object: device.kind,
            id: device.device_id.to_string(),
            token,
            session_user_id: device.session_subject.clone(),
            created_at: device.created_utc.timestamp_millis(),
        }
    }
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct RedirectQuery {
    /// Absolute http(s) URL to return to.
    pub redirect_url: String,
}
