use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use secrecy::{ExposeSecret, Secret, SecretString};
use std::sync::OnceLock;

/// Argon2 hash of a throwaway value, checked when there is no account.
static DECOY_HASH: OnceLock<String> = OnceLock::new();

/// Hash a password with Argon2id and a random salt, returning a PHC string.
pub fn hash_password(password: &SecretString) -> Result<String, anyhow::Error> {
    let salt = SaltString::generate(&mut OsRng);

    Argon2::default()
        .hash_password(password.expose_secret().as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| anyhow::anyhow!("Failed to hash password: {}", e))
}

/// Check `password` against a stored hash.
///
/// Anything that is not a PHC string (including the federation-only
/// sentinel) never matches.
pub fn verify_password(password: &SecretString, stored_hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored_hash) else {
        return false;
    };

    Argon2::default()
        .verify_password(password.expose_secret().as_bytes(), &parsed)
        .is_ok()
}

/// Spend the cost of a real verification without an account to check
/// against, so unknown emails answer as slowly as wrong passwords. Never
/// matches.
pub fn verify_against_decoy(password: &SecretString) -> bool {
    let decoy = DECOY_HASH.get_or_init(|| {
        hash_password(&Secret::new("decoy-password".to_string())).unwrap_or_else(|e| {
            tracing::error!(error = %e, "Failed to prepare decoy password hash");
            String::new()
        })
    });
    verify_password(password, decoy);
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FEDERATED_PASSWORD_SENTINEL;
    use secrecy::Secret;

    fn secret(s: &str) -> SecretString {
        Secret::new(s.to_string())
    }

    #[test]
    fn hashes_verify_and_are_salted() {
        let password = secret("correct horse battery staple");
        let first = hash_password(&password).unwrap();
        let second = hash_password(&password).unwrap();

        assert!(first.starts_with("$argon2"));
        assert_ne!(first, second);
        assert!(verify_password(&password, &first));
        assert!(!verify_password(&secret("wrong"), &first));
    }

    #[test]
    fn decoy_runs_a_real_argon2_check_and_never_matches() {
        assert!(!verify_against_decoy(&secret("decoy-password")));
        assert!(!verify_against_decoy(&secret("anything")));

        let decoy = DECOY_HASH.get().unwrap();
        assert!(decoy.starts_with("$argon2id$"));
        assert!(PasswordHash::new(decoy).is_ok());
    }

    #[test]
    fn sentinel_never_verifies() {
        assert!(!verify_password(&secret(""), FEDERATED_PASSWORD_SENTINEL));
        assert!(!verify_password(&secret("!federated"), FEDERATED_PASSWORD_SENTINEL));
    }
}
