pub mod admin;
pub mod cors;
pub mod handshake;

pub use admin::admin_auth_middleware;
pub use cors::frontend_cors_middleware;
pub use handshake::handshake_middleware;
