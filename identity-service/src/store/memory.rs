use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;

use super::{
    AssertionReplayStore, FederationLink, IdentityProviderStore, IdentityStore,
    OrganizationStore, StoreError, UserStore,
};
use crate::models::{IdentityProviderRecord, Organization, User};

type EmailKey = (Option<Uuid>, String);

/// In-process store with the same unique (email, organization) key as the
/// database schema.
#[derive(Clone, Default)]
pub struct InMemoryIdentityStore {
    users: Arc<DashMap<Uuid, User>>,
    email_index: Arc<DashMap<EmailKey, Uuid>>,
    providers: Arc<DashMap<Uuid, IdentityProviderRecord>>,
    organizations: Arc<DashMap<Uuid, Organization>>,
    consumed_assertions: Arc<DashMap<(Uuid, String), DateTime<Utc>>>,
}

impl InMemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_organization(&self, organization: Organization) {
        self.organizations.insert(organization.id, organization);
    }

    pub fn add_identity_provider(&self, record: IdentityProviderRecord) {
        self.providers.insert(record.id, record);
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    fn email_key(organization_id: Option<Uuid>, email: &str) -> EmailKey {
        (organization_id, email.to_lowercase())
    }

    fn update_user<F>(&self, user_id: Uuid, apply: F) -> Result<User, StoreError>
    where
        F: FnOnce(&mut User),
    {
        let mut entry = self.users.get_mut(&user_id).ok_or(StoreError::NotFound)?;
        apply(entry.value_mut());
        entry.updated_at = Utc::now();
        Ok(entry.clone())
    }
}

#[async_trait]
impl UserStore for InMemoryIdentityStore {
    async fn find_user_by_email(
        &self,
        organization_id: Option<Uuid>,
        email: &str,
    ) -> Result<Option<User>, StoreError> {
        let id = self
            .email_index
            .get(&Self::email_key(organization_id, email))
            .map(|id| *id);
        Ok(id.and_then(|id| self.users.get(&id).map(|u| u.clone())))
    }

    async fn find_user_by_subject(
        &self,
        organization_id: Uuid,
        sso_provider: &str,
        external_subject_id: &str,
    ) -> Result<Option<User>, StoreError> {
        Ok(self
            .users
            .iter()
            .filter(|u| {
                u.organization_id == Some(organization_id)
                    && u.sso_provider.as_deref() == Some(sso_provider)
                    && u.external_subject_id.as_deref() == Some(external_subject_id)
            })
            .min_by_key(|u| u.created_at)
            .map(|u| u.clone()))
    }

    async fn find_user_by_email_and_provider(
        &self,
        email: &str,
        sso_provider: &str,
    ) -> Result<Option<User>, StoreError> {
        Ok(self
            .users
            .iter()
            .filter(|u| {
                u.email.eq_ignore_ascii_case(email) && u.sso_provider.as_deref() == Some(sso_provider)
            })
            .min_by_key(|u| u.created_at)
            .map(|u| u.clone()))
    }

    async fn find_user_by_id(&self, user_id: Uuid) -> Result<Option<User>, StoreError> {
        Ok(self.users.get(&user_id).map(|u| u.clone()))
    }

    async fn insert_user(&self, user: &User) -> Result<(), StoreError> {
        match self
            .email_index
            .entry(Self::email_key(user.organization_id, &user.email))
        {
            Entry::Occupied(_) => Err(StoreError::Duplicate),
            Entry::Vacant(slot) => {
                self.users.insert(user.id, user.clone());
                slot.insert(user.id);
                Ok(())
            }
        }
    }

    async fn update_federation_link(
        &self,
        user_id: Uuid,
        link: &FederationLink,
    ) -> Result<User, StoreError> {
        let current = self
            .users
            .get(&user_id)
            .map(|u| (u.organization_id, u.email.clone()))
            .ok_or(StoreError::NotFound)?;

        if let Some(target) = link.organization_id.filter(|t| Some(*t) != current.0) {
            match self.email_index.entry(Self::email_key(Some(target), &current.1)) {
                Entry::Occupied(_) => return Err(StoreError::Duplicate),
                Entry::Vacant(slot) => {
                    slot.insert(user_id);
                }
            }
            self.email_index
                .remove(&Self::email_key(current.0, &current.1));
        }

        self.update_user(user_id, |user| {
            user.sso_provider = Some(link.sso_provider.clone());
            user.external_subject_id = Some(link.external_subject_id.clone());
            if let Some(name) = &link.display_name {
                user.display_name = Some(name.clone());
            }
            if let Some(org) = link.organization_id {
                user.organization_id = Some(org);
            }
            user.is_active = true;
        })
    }

    async fn record_failed_login(
        &self,
        user_id: Uuid,
        max_attempts: i32,
        lockout_until: DateTime<Utc>,
    ) -> Result<User, StoreError> {
        self.update_user(user_id, |user| {
            if user.failed_login_attempts + 1 >= max_attempts {
                user.failed_login_attempts = 0;
                user.lockout_until = Some(lockout_until);
            } else {
                user.failed_login_attempts += 1;
            }
        })
    }

    async fn reset_failed_logins(&self, user_id: Uuid) -> Result<(), StoreError> {
        self.update_user(user_id, |user| {
            user.failed_login_attempts = 0;
            user.lockout_until = None;
        })?;
        Ok(())
    }
}

#[async_trait]
impl IdentityProviderStore for InMemoryIdentityStore {
    async fn find_identity_provider(
        &self,
        id: Uuid,
    ) -> Result<Option<IdentityProviderRecord>, StoreError> {
        Ok(self.providers.get(&id).map(|p| p.clone()))
    }
}

#[async_trait]
impl OrganizationStore for InMemoryIdentityStore {
    async fn find_organization(&self, id: Uuid) -> Result<Option<Organization>, StoreError> {
        Ok(self.organizations.get(&id).map(|o| o.clone()))
    }
}

#[async_trait]
impl AssertionReplayStore for InMemoryIdentityStore {
    async fn consume_assertion_id(
        &self,
        identity_provider_id: Uuid,
        assertion_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let now = Utc::now();
        self.consumed_assertions.retain(|_, expiry| *expiry >= now);

        match self
            .consumed_assertions
            .entry((identity_provider_id, assertion_id.to_string()))
        {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(expires_at);
                Ok(true)
            }
        }
    }
}

#[async_trait]
impl IdentityStore for InMemoryIdentityStore {
    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
