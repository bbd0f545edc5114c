//! Services layer for the credential core.
//!
//! Ticket issuance and consumption, JWT templates, the verification state
//! machine and the cross-domain handshake, all behind store and key seams.

pub mod clock;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod handshake;
pub mod instances;
pub mod jwt_templates;
pub mod keys;
pub mod sign_in;
pub mod tickets;
pub mod verification;

pub use clock::{Clock, FixedClock, SystemClock};
pub use dispatch::{CodeDispatcher, RecordingDispatcher, TracingDispatcher};
pub use error::ServiceError;
pub use events::{CredentialEvent, EventSink, RecordingEventSink, TracingEventSink};
pub use handshake::{
    BootstrapPaths, ClientType, DeviceService, HandshakeCoordinator, HandshakeOutcome,
    HandshakeParams, InboundRequest, RequestContext,
};
pub use instances::InstanceService;
pub use jwt_templates::{JwtTemplateService, SigningKeyParams, TemplateParams, TemplatePatch};
pub use keys::{InstanceKeyProvider, KeyProvider, SigningMaterial};
pub use sign_in::{SignedIn, TicketSignIn};
pub use tickets::{AcceptedTicket, IssueTicket, IssuedTicket, TicketEngine, TicketPolicy};
pub use verification::{
    PrepareVerification, PreparedVerification, Proof, StrategyLimits, VerificationPolicy,
    VerificationService,
};
