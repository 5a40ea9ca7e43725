//! Identity services: session tokens, federation state, provisioning and
//! the provider registry.

pub mod notification;
pub mod provisioning;
pub mod registry;
pub mod state;
pub mod token;

pub use notification::{SecurityEvent, SecurityNotifier, TracingNotifier, WebhookNotifier};
pub use provisioning::{
    FederatedIdentity, Provisioned, ProvisioningEngine, ProvisioningError, ProvisioningPolicy,
    ProvisioningScope,
};
pub use registry::{ProviderRegistry, RegistryError};
pub use state::{FederationStateSigner, StateError, StatePurpose};
pub use token::{IssuedToken, SessionClaims, TokenError, TokenService};
