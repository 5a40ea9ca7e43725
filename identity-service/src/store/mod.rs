//! Persistence collaborators consumed by the identity flows.
//!
//! Two implementations share the same uniqueness semantics: PostgreSQL
//! ([`PgIdentityStore`]) and an in-process store ([`InMemoryIdentityStore`])
//! used in development and tests.

mod memory;
mod postgres;

pub use memory::InMemoryIdentityStore;
pub use postgres::PgIdentityStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{IdentityProviderRecord, Organization, User};

#[derive(Debug, Error)]
pub enum StoreError {
    /// The (email, organization) provisioning key is already taken.
    #[error("Duplicate user for email and organization")]
    Duplicate,

    #[error("Record not found")]
    NotFound,

    #[error("Database error: {0}")]
    Database(#[from] anyhow::Error),
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Duplicate => AppError::BadRequest(anyhow::anyhow!("Duplicate user")),
            StoreError::NotFound => AppError::NotFound(anyhow::anyhow!("Not found")),
            StoreError::Database(e) => AppError::DatabaseError(e),
        }
    }
}

/// Narrow update applied when a federated login links to an existing user.
/// Role and every other administrative field are left alone.
#[derive(Debug, Clone)]
pub struct FederationLink {
    pub sso_provider: String,
    pub external_subject_id: String,
    /// Written only when set; callers pass it when the stored name is a
    /// placeholder.
    pub display_name: Option<String>,
    /// Written only when set; callers pass it when policy allows moving the
    /// user into this organization.
    pub organization_id: Option<Uuid>,
}

#[async_trait]
pub trait UserStore: Send + Sync {
    /// Case-insensitive email lookup within one organization (`None` means
    /// users not yet assigned to any organization).
    async fn find_user_by_email(
        &self,
        organization_id: Option<Uuid>,
        email: &str,
    ) -> Result<Option<User>, StoreError>;

    /// Subject ids are only unique per provider, so both must match.
    async fn find_user_by_subject(
        &self,
        organization_id: Uuid,
        sso_provider: &str,
        external_subject_id: &str,
    ) -> Result<Option<User>, StoreError>;

    /// Lookup across organizations, used by global federation.
    async fn find_user_by_email_and_provider(
        &self,
        email: &str,
        sso_provider: &str,
    ) -> Result<Option<User>, StoreError>;

    async fn find_user_by_id(&self, user_id: Uuid) -> Result<Option<User>, StoreError>;

    /// Fails with [`StoreError::Duplicate`] when the (email, organization)
    /// key already exists.
    async fn insert_user(&self, user: &User) -> Result<(), StoreError>;

    /// Apply `link` and set `is_active`, returning the updated row.
    async fn update_federation_link(
        &self,
        user_id: Uuid,
        link: &FederationLink,
    ) -> Result<User, StoreError>;

    /// Count a failed password attempt. Reaching `max_attempts` resets the
    /// counter and sets `lockout_until`.
    async fn record_failed_login(
        &self,
        user_id: Uuid,
        max_attempts: i32,
        lockout_until: DateTime<Utc>,
    ) -> Result<User, StoreError>;

    async fn reset_failed_logins(&self, user_id: Uuid) -> Result<(), StoreError>;
}

#[async_trait]
pub trait IdentityProviderStore: Send + Sync {
    async fn find_identity_provider(
        &self,
        id: Uuid,
    ) -> Result<Option<IdentityProviderRecord>, StoreError>;
}

#[async_trait]
pub trait OrganizationStore: Send + Sync {
    async fn find_organization(&self, id: Uuid) -> Result<Option<Organization>, StoreError>;
}

#[async_trait]
pub trait AssertionReplayStore: Send + Sync {
    /// Record an accepted assertion id until `expires_at`. Returns `false`
    /// when the id was already consumed for this provider.
    async fn consume_assertion_id(
        &self,
        identity_provider_id: Uuid,
        assertion_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait IdentityStore:
    UserStore + IdentityProviderStore + OrganizationStore + AssertionReplayStore
{
    async fn health_check(&self) -> Result<(), StoreError>;
}
