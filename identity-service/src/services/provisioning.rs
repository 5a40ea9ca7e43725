//! Create-or-update of local users from federated identities.

use std::sync::Arc;
use thiserror::Error;
use tracing::instrument;
use uuid::Uuid;

use super::notification::{dispatch, SecurityEvent, SecurityNotifier};
use crate::models::user::email_local_part;
use crate::models::User;
use crate::store::{FederationLink, IdentityStore, StoreError, UserStore};

/// Canonical identity extracted from a SAML assertion or OAuth2 userinfo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FederatedIdentity {
    pub email: String,
    pub display_name: Option<String>,
    pub given_name: Option<String>,
    pub family_name: Option<String>,
    /// NameID for SAML, the provider's user id for OAuth2.
    pub external_subject_id: String,
    pub sso_provider: String,
}

impl FederatedIdentity {
    pub fn normalized_email(&self) -> String {
        self.email.trim().to_lowercase()
    }

    /// Explicit name, else given + family name, else the email local part.
    pub fn resolved_display_name(&self) -> String {
        let explicit = self
            .display_name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty());
        if let Some(name) = explicit {
            return name.to_string();
        }

        let parts: Vec<&str> = [self.given_name.as_deref(), self.family_name.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect();
        if !parts.is_empty() {
            return parts.join(" ");
        }

        email_local_part(self.email.trim()).to_string()
    }
}

/// Which users a federation flow may resolve to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisioningScope {
    Organization(Uuid),
    /// Cross-tenant login; new users land in `default_organization_id` when
    /// one is configured and stay unassigned otherwise.
    Global { default_organization_id: Option<Uuid> },
}

impl ProvisioningScope {
    fn target_organization(&self) -> Option<Uuid> {
        match self {
            ProvisioningScope::Organization(id) => Some(*id),
            ProvisioningScope::Global {
                default_organization_id,
            } => *default_organization_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProvisioningPolicy {
    pub auto_create: bool,
    pub allow_reassignment: bool,
}

#[derive(Debug, Clone)]
pub struct Provisioned {
    pub user: User,
    pub created: bool,
}

#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error("Automatic provisioning is disabled for this identity provider")]
    ProvisioningDenied,

    #[error("Registration through global sign-in is disabled")]
    RegistrationDisabled,

    #[error("User belongs to a different organization")]
    OrganizationMismatch,

    #[error("Federated identity has no usable email or subject")]
    InvalidIdentity,

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone)]
pub struct ProvisioningEngine {
    store: Arc<dyn IdentityStore>,
    notifier: Arc<dyn SecurityNotifier>,
}

impl ProvisioningEngine {
    pub fn new(store: Arc<dyn IdentityStore>, notifier: Arc<dyn SecurityNotifier>) -> Self {
        Self { store, notifier }
    }

    #[instrument(skip(self, identity), fields(sso_provider = %identity.sso_provider))]
    pub async fn resolve(
        &self,
        identity: &FederatedIdentity,
        scope: ProvisioningScope,
        policy: ProvisioningPolicy,
    ) -> Result<Provisioned, ProvisioningError> {
        let email = identity.normalized_email();
        if !email.contains('@') || identity.external_subject_id.trim().is_empty() {
            return Err(ProvisioningError::InvalidIdentity);
        }

        if let Some(existing) = self.lookup(identity, &email, scope).await? {
            let user = self.link(existing, identity, scope, policy).await?;
            return Ok(Provisioned {
                user,
                created: false,
            });
        }

        if !policy.auto_create {
            return Err(match scope {
                ProvisioningScope::Global { .. } => ProvisioningError::RegistrationDisabled,
                ProvisioningScope::Organization(_) => ProvisioningError::ProvisioningDenied,
            });
        }

        let organization_id = scope.target_organization();
        let user = User::federated(
            organization_id,
            &email,
            Some(identity.resolved_display_name()),
            &identity.sso_provider,
            &identity.external_subject_id,
        );

        match self.store.insert_user(&user).await {
            Ok(()) => {
                tracing::info!(user_id = %user.id, "Provisioned new federated user");
                dispatch(
                    &self.notifier,
                    SecurityEvent::UserProvisioned {
                        user_id: user.id,
                        organization_id: user.organization_id,
                        email: user.email.clone(),
                        sso_provider: identity.sso_provider.clone(),
                    },
                );
                Ok(Provisioned {
                    user,
                    created: true,
                })
            }
            Err(StoreError::Duplicate) => {
                // Lost a first-login race: the winner's row is now visible.
                tracing::debug!("Concurrent provisioning detected, retrying lookup");
                let winner = self
                    .store
                    .find_user_by_email(organization_id, &email)
                    .await?
                    .ok_or(StoreError::Duplicate)?;
                let user = self.link(winner, identity, scope, policy).await?;
                Ok(Provisioned {
                    user,
                    created: false,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn lookup(
        &self,
        identity: &FederatedIdentity,
        email: &str,
        scope: ProvisioningScope,
    ) -> Result<Option<User>, StoreError> {
        match scope {
            ProvisioningScope::Organization(org) => {
                if let Some(user) = self
                    .store
                    .find_user_by_subject(
                        org,
                        &identity.sso_provider,
                        &identity.external_subject_id,
                    )
                    .await?
                {
                    return Ok(Some(user));
                }
                if let Some(user) = self.store.find_user_by_email(Some(org), email).await? {
                    return Ok(Some(user));
                }
                // Same provider identity already living elsewhere, or a
                // global user not yet assigned to any organization.
                if let Some(user) = self
                    .store
                    .find_user_by_email_and_provider(email, &identity.sso_provider)
                    .await?
                {
                    return Ok(Some(user));
                }
                self.store.find_user_by_email(None, email).await
            }
            ProvisioningScope::Global { .. } => {
                self.store
                    .find_user_by_email_and_provider(email, &identity.sso_provider)
                    .await
            }
        }
    }

    async fn link(
        &self,
        user: User,
        identity: &FederatedIdentity,
        scope: ProvisioningScope,
        policy: ProvisioningPolicy,
    ) -> Result<User, ProvisioningError> {
        let organization_id = match (scope, user.organization_id) {
            (ProvisioningScope::Organization(target), Some(current)) if current != target => {
                if !policy.allow_reassignment {
                    tracing::warn!(
                        user_id = %user.id,
                        current_organization = %current,
                        target_organization = %target,
                        "Federated login matched a user in another organization"
                    );
                    return Err(ProvisioningError::OrganizationMismatch);
                }
                tracing::info!(user_id = %user.id, "Reassigning user to federating organization");
                Some(target)
            }
            (_, None) => scope.target_organization(),
            _ => None,
        };

        let display_name = user
            .has_placeholder_display_name()
            .then(|| identity.resolved_display_name())
            .filter(|name| user.display_name.as_deref() != Some(name.as_str()));

        let link = FederationLink {
            sso_provider: identity.sso_provider.clone(),
            external_subject_id: identity.external_subject_id.clone(),
            display_name,
            organization_id,
        };

        let updated = self.store.update_federation_link(user.id, &link).await?;
        tracing::debug!(user_id = %updated.id, "Linked federated identity to existing user");
        Ok(updated)
    }
}
