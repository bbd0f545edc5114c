pub mod device;
pub mod instance;
pub mod jwt_template;
pub mod signing_algorithm;
pub mod subject;
pub mod ticket;
pub mod verification;

pub use device::{DeviceIdentity, DeviceKind};
pub use instance::{Instance, InstanceEnvironment, InstanceKeys, PlanFeature, PlanFeatures};
pub use jwt_template::{CustomSigningKey, JwtTemplate};
pub use signing_algorithm::{KeyFamily, SigningAlgorithm};
pub use subject::Subject;
pub use ticket::{Ticket, TicketKind, TicketPayload, TicketStatus};
pub use verification::{Strategy, Verification, VerificationStatus};
