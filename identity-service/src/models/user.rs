//! User model - organization-scoped accounts, local or federated.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

/// Stored in `password_hash` for accounts that can only sign in through an
/// identity provider. Not a PHC string, so it never verifies.
pub const FEDERATED_PASSWORD_SENTINEL: &str = "!federated";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum Role {
    Admin,
    Manager,
    User,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Manager => "manager",
            Role::User => "user",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub id: Uuid,
    pub organization_id: Option<Uuid>,
    pub email: String,
    pub display_name: Option<String>,
    pub password_hash: String,
    pub role: Role,
    pub is_active: bool,
    pub sso_provider: Option<String>,
    pub external_subject_id: Option<String>,
    pub failed_login_attempts: i32,
    pub lockout_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// A federation-only account as created on first login.
    pub fn federated(
        organization_id: Option<Uuid>,
        email: &str,
        display_name: Option<String>,
        sso_provider: &str,
        external_subject_id: &str,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            organization_id,
            email: email.to_string(),
            display_name,
            password_hash: FEDERATED_PASSWORD_SENTINEL.to_string(),
            role: Role::User,
            is_active: true,
            sso_provider: Some(sso_provider.to_string()),
            external_subject_id: Some(external_subject_id.to_string()),
            failed_login_attempts: 0,
            lockout_until: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// A local account with an argon2 password hash.
    pub fn with_password(
        organization_id: Option<Uuid>,
        email: &str,
        password_hash: String,
        role: Role,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            organization_id,
            email: email.to_string(),
            display_name: None,
            password_hash,
            role,
            is_active: true,
            sso_provider: None,
            external_subject_id: None,
            failed_login_attempts: 0,
            lockout_until: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_federation_only(&self) -> bool {
        self.password_hash == FEDERATED_PASSWORD_SENTINEL
    }

    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.lockout_until.is_some_and(|until| until > now)
    }

    /// True when the display name is absent or is the email local part we
    /// fill in when a provider supplies no name.
    pub fn has_placeholder_display_name(&self) -> bool {
        match self.display_name.as_deref().map(str::trim) {
            None | Some("") => true,
            Some(name) => name.eq_ignore_ascii_case(email_local_part(&self.email)),
        }
    }
}

pub fn email_local_part(email: &str) -> &str {
    email.split('@').next().unwrap_or(email)
}
