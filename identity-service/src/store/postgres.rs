use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{
    AssertionReplayStore, FederationLink, IdentityProviderStore, IdentityStore,
    OrganizationStore, StoreError, UserStore,
};
use crate::models::{IdentityProviderRecord, Organization, User};

const UNIQUE_VIOLATION: &str = "23505";

const USER_COLUMNS: &str = "id, organization_id, email, display_name, password_hash, role, \
     is_active, sso_provider, external_subject_id, failed_login_attempts, lockout_until, \
     created_at, updated_at";

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct PgIdentityStore {
    pool: PgPool,
}

impl PgIdentityStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn db_error(e: sqlx::Error) -> StoreError {
    StoreError::Database(anyhow::anyhow!(e))
}

fn write_error(e: sqlx::Error) -> StoreError {
    match &e {
        sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION) => {
            StoreError::Duplicate
        }
        _ => db_error(e),
    }
}

#[async_trait]
impl UserStore for PgIdentityStore {
    async fn find_user_by_email(
        &self,
        organization_id: Option<Uuid>,
        email: &str,
    ) -> Result<Option<User>, StoreError> {
        sqlx::query_as::<_, User>(&format!(
            "SELECT {} FROM users \
             WHERE LOWER(email) = LOWER($1) AND organization_id IS NOT DISTINCT FROM $2",
            USER_COLUMNS
        ))
        .bind(email)
        .bind(organization_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)
    }

    async fn find_user_by_subject(
        &self,
        organization_id: Uuid,
        sso_provider: &str,
        external_subject_id: &str,
    ) -> Result<Option<User>, StoreError> {
        sqlx::query_as::<_, User>(&format!(
            "SELECT {} FROM users \
             WHERE organization_id = $1 AND sso_provider = $2 AND external_subject_id = $3 \
             ORDER BY created_at LIMIT 1",
            USER_COLUMNS
        ))
        .bind(organization_id)
        .bind(sso_provider)
        .bind(external_subject_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)
    }

    async fn find_user_by_email_and_provider(
        &self,
        email: &str,
        sso_provider: &str,
    ) -> Result<Option<User>, StoreError> {
        sqlx::query_as::<_, User>(&format!(
            "SELECT {} FROM users \
             WHERE LOWER(email) = LOWER($1) AND sso_provider = $2 \
             ORDER BY created_at LIMIT 1",
            USER_COLUMNS
        ))
        .bind(email)
        .bind(sso_provider)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)
    }

    async fn find_user_by_id(&self, user_id: Uuid) -> Result<Option<User>, StoreError> {
        sqlx::query_as::<_, User>(&format!("SELECT {} FROM users WHERE id = $1", USER_COLUMNS))
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)
    }

    async fn insert_user(&self, user: &User) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO users (id, organization_id, email, display_name, password_hash, role,
                               is_active, sso_provider, external_subject_id,
                               failed_login_attempts, lockout_until, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(user.id)
        .bind(user.organization_id)
        .bind(&user.email)
        .bind(&user.display_name)
        .bind(&user.password_hash)
        .bind(user.role)
        .bind(user.is_active)
        .bind(&user.sso_provider)
        .bind(&user.external_subject_id)
        .bind(user.failed_login_attempts)
        .bind(user.lockout_until)
        .bind(user.created_at)
        .bind(user.updated_at)
        .execute(&self.pool)
        .await
        .map_err(write_error)?;
        Ok(())
    }

    async fn update_federation_link(
        &self,
        user_id: Uuid,
        link: &FederationLink,
    ) -> Result<User, StoreError> {
        sqlx::query_as::<_, User>(&format!(
            "UPDATE users SET \
                 sso_provider = $2, \
                 external_subject_id = $3, \
                 display_name = COALESCE($4, display_name), \
                 organization_id = COALESCE($5, organization_id), \
                 is_active = TRUE, \
                 updated_at = now() \
             WHERE id = $1 \
             RETURNING {}",
            USER_COLUMNS
        ))
        .bind(user_id)
        .bind(&link.sso_provider)
        .bind(&link.external_subject_id)
        .bind(&link.display_name)
        .bind(link.organization_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(write_error)?
        .ok_or(StoreError::NotFound)
    }

    async fn record_failed_login(
        &self,
        user_id: Uuid,
        max_attempts: i32,
        lockout_until: DateTime<Utc>,
    ) -> Result<User, StoreError> {
        sqlx::query_as::<_, User>(&format!(
            "UPDATE users SET \
                 lockout_until = CASE WHEN failed_login_attempts + 1 >= $2 \
                                      THEN $3 ELSE lockout_until END, \
                 failed_login_attempts = CASE WHEN failed_login_attempts + 1 >= $2 \
                                              THEN 0 ELSE failed_login_attempts + 1 END, \
                 updated_at = now() \
             WHERE id = $1 \
             RETURNING {}",
            USER_COLUMNS
        ))
        .bind(user_id)
        .bind(max_attempts)
        .bind(lockout_until)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?
        .ok_or(StoreError::NotFound)
    }

    async fn reset_failed_logins(&self, user_id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE users SET failed_login_attempts = 0, lockout_until = NULL, updated_at = now() \
             WHERE id = $1",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }
}

#[async_trait]
impl IdentityProviderStore for PgIdentityStore {
    async fn find_identity_provider(
        &self,
        id: Uuid,
    ) -> Result<Option<IdentityProviderRecord>, StoreError> {
        sqlx::query_as::<_, IdentityProviderRecord>(
            "SELECT id, organization_id, provider_type, is_active, configuration, \
                    attribute_mapping, created_at, updated_at \
             FROM identity_providers WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)
    }
}

#[async_trait]
impl OrganizationStore for PgIdentityStore {
    async fn find_organization(&self, id: Uuid) -> Result<Option<Organization>, StoreError> {
        sqlx::query_as::<_, Organization>(
            "SELECT id, name, created_at FROM organizations WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)
    }
}

#[async_trait]
impl AssertionReplayStore for PgIdentityStore {
    async fn consume_assertion_id(
        &self,
        identity_provider_id: Uuid,
        assertion_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        sqlx::query("DELETE FROM consumed_assertions WHERE expires_at < now()")
            .execute(&self.pool)
            .await
            .map_err(db_error)?;

        let result = sqlx::query(
            r#"
            INSERT INTO consumed_assertions (identity_provider_id, assertion_id, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (identity_provider_id, assertion_id) DO NOTHING
            "#,
        )
        .bind(identity_provider_id)
        .bind(assertion_id)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl IdentityStore for PgIdentityStore {
    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| {
                tracing::error!("Database health check failed: {}", e);
                db_error(e)
            })?;
        Ok(())
    }
}
