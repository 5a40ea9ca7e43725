pub mod identity_provider;
pub mod organization;
pub mod user;

pub use identity_provider::{
    AttributeMapping, IdentityProvider, IdentityProviderRecord, OAuth2ProviderKind,
    OAuth2Settings, ProviderConfigError, ProviderSettings, ProviderType, SamlSettings,
};
pub use organization::Organization;
pub use user::{Role, User, FEDERATED_PASSWORD_SENTINEL};
