//! Cross-domain handshake: device attribution for browsers and native clients.

pub mod allow_list;
pub mod client_type;
pub mod coordinator;
pub mod devices;
pub mod domain;
pub mod params;

pub use allow_list::BootstrapPaths;
pub use client_type::ClientType;
pub use coordinator::{
    storage_access_url, validate_origin, HandshakeCoordinator, HandshakeOutcome, InboundRequest,
    RequestContext, CLIENT_COOKIE, DEV_BROWSER_COOKIE, PROXY_URL_HEADERS,
};
pub use devices::{DeviceClaims, DeviceService, ResolvedDevice};
pub use params::HandshakeParams;
