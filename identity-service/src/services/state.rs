//! Signed, time-bounded envelopes for values round-tripped through the
//! browser during federation (OAuth2 `state` cookie, SAML RelayState).
//!
//! Format: `base64url(json) "." base64url(hmac_sha256(json))`. The MAC key is
//! derived from the session signing secret with a fixed label so a state
//! envelope can never be confused with a session token.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

const KEY_LABEL: &[u8] = b"identity-service/federation-state/v1";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("State value is malformed")]
    Malformed,

    #[error("State signature does not match")]
    BadSignature,

    #[error("State has expired")]
    Expired,

    #[error("State was issued for a different flow")]
    WrongPurpose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatePurpose {
    OAuth2,
    SamlRelay,
}

#[derive(Serialize, Deserialize)]
struct Envelope<T> {
    purpose: StatePurpose,
    iat: i64,
    body: T,
}

#[derive(Clone)]
pub struct FederationStateSigner {
    keyed: HmacSha256,
    ttl_secs: i64,
}

impl FederationStateSigner {
    pub fn new(secret: &SecretString, ttl_secs: i64) -> anyhow::Result<Self> {
        let mut derive = HmacSha256::new_from_slice(secret.expose_secret().as_bytes())
            .map_err(|_| anyhow::anyhow!("Invalid key length"))?;
        derive.update(KEY_LABEL);
        let key = derive.finalize().into_bytes();

        let keyed = HmacSha256::new_from_slice(&key)
            .map_err(|_| anyhow::anyhow!("Invalid key length"))?;

        Ok(Self { keyed, ttl_secs })
    }

    pub fn ttl_secs(&self) -> i64 {
        self.ttl_secs
    }

    fn mac(&self) -> HmacSha256 {
        self.keyed.clone()
    }

    pub fn sign<T: Serialize>(&self, purpose: StatePurpose, body: &T) -> Result<String, StateError> {
        self.sign_at(purpose, body, Utc::now().timestamp())
    }

    fn sign_at<T: Serialize>(
        &self,
        purpose: StatePurpose,
        body: &T,
        iat: i64,
    ) -> Result<String, StateError> {
        let payload = serde_json::to_vec(&Envelope { purpose, iat, body })
            .map_err(|_| StateError::Malformed)?;

        let mut mac = self.mac();
        mac.update(&payload);
        let tag = mac.finalize().into_bytes();

        Ok(format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&payload),
            URL_SAFE_NO_PAD.encode(tag)
        ))
    }

    /// Check the MAC, purpose and age of `value` and return its body.
    pub fn verify<T: DeserializeOwned>(
        &self,
        purpose: StatePurpose,
        value: &str,
    ) -> Result<T, StateError> {
        let (payload, tag) = value.split_once('.').ok_or(StateError::Malformed)?;
        let payload = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| StateError::Malformed)?;
        let tag = URL_SAFE_NO_PAD.decode(tag).map_err(|_| StateError::Malformed)?;

        let mut mac = self.mac();
        mac.update(&payload);
        mac.verify_slice(&tag).map_err(|_| StateError::BadSignature)?;

        let envelope: Envelope<T> =
            serde_json::from_slice(&payload).map_err(|_| StateError::Malformed)?;

        if envelope.purpose != purpose {
            return Err(StateError::WrongPurpose);
        }

        let age = Utc::now().timestamp() - envelope.iat;
        if !(0..=self.ttl_secs).contains(&age) {
            return Err(StateError::Expired);
        }

        Ok(envelope.body)
    }
}

/// Accept only same-origin relative paths as post-login destinations.
pub fn sanitize_redirect(target: Option<&str>) -> Option<String> {
    let target = target?.trim();
    let safe = target.starts_with('/')
        && !target.starts_with("//")
        && !target.contains('\\')
        && !target.chars().any(|c| c.is_control());
    safe.then(|| target.to_string())
}
