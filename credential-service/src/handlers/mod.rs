pub mod client;
pub mod dev_browser;
pub mod instances;
pub mod jwt_templates;
pub mod tickets;
pub mod verifications;

pub use client::create_client;
pub use dev_browser::{create_dev_browser, init_dev_browser, storage_access};
pub use instances::promote_instance;
pub use jwt_templates::{
    create_template, create_token, delete_template, get_template, list_templates,
    update_template,
};
pub use tickets::{
    accept_ticket, create_actor_token, create_sign_in_token, revoke_actor_token,
    revoke_sign_in_token,
};
pub use verifications::{attempt_verification, get_verification, prepare_verification};
