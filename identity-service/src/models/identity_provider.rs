//! Identity provider configuration.
//!
//! Rows are stored with an opaque JSON configuration blob per provider type.
//! [`IdentityProvider::from_record`] parses the blob once into typed settings
//! so that handlers never look at raw JSON.

use chrono::{DateTime, Utc};
use rsa::RsaPublicKey;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

use crate::saml::dsig::parse_signing_key;

#[derive(Debug, Error)]
pub enum ProviderConfigError {
    #[error("Unknown provider type: {0}")]
    UnknownType(String),

    #[error("Invalid provider configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Invalid attribute mapping: {0}")]
    InvalidAttributeMapping(String),
}

/// Row as persisted in `identity_providers`.
#[derive(Debug, Clone, FromRow)]
pub struct IdentityProviderRecord {
    pub id: Uuid,
    pub organization_id: Option<Uuid>,
    pub provider_type: String,
    pub is_active: bool,
    pub configuration: Json<serde_json::Value>,
    pub attribute_mapping: Option<Json<serde_json::Value>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IdentityProviderRecord {
    pub fn new(
        organization_id: Option<Uuid>,
        provider_type: ProviderType,
        configuration: serde_json::Value,
        attribute_mapping: Option<serde_json::Value>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            organization_id,
            provider_type: provider_type.to_string(),
            is_active: true,
            configuration: Json(configuration),
            attribute_mapping: attribute_mapping.map(Json),
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OAuth2ProviderKind {
    Google,
    Github,
    Microsoft,
}

impl OAuth2ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OAuth2ProviderKind::Google => "google",
            OAuth2ProviderKind::Github => "github",
            OAuth2ProviderKind::Microsoft => "microsoft",
        }
    }
}

impl FromStr for OAuth2ProviderKind {
    type Err = ProviderConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "google" => Ok(OAuth2ProviderKind::Google),
            "github" => Ok(OAuth2ProviderKind::Github),
            "microsoft" => Ok(OAuth2ProviderKind::Microsoft),
            other => Err(ProviderConfigError::UnknownType(other.to_string())),
        }
    }
}

impl std::fmt::Display for OAuth2ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderType {
    Saml,
    OAuth2(OAuth2ProviderKind),
}

impl FromStr for ProviderType {
    type Err = ProviderConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "saml" {
            return Ok(ProviderType::Saml);
        }
        s.strip_prefix("oauth2_")
            .ok_or_else(|| ProviderConfigError::UnknownType(s.to_string()))?
            .parse()
            .map(ProviderType::OAuth2)
            .map_err(|_| ProviderConfigError::UnknownType(s.to_string()))
    }
}

impl std::fmt::Display for ProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderType::Saml => f.write_str("saml"),
            ProviderType::OAuth2(kind) => write!(f, "oauth2_{}", kind),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SamlSettings {
    pub idp_entity_id: String,
    pub sso_url: String,
    pub signing_key: RsaPublicKey,
    /// Overrides the default SP entity id (the metadata URL).
    pub sp_entity_id: Option<String>,
    pub name_id_format: Option<String>,
    pub auto_provision: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SamlSettingsBlob {
    idp_entity_id: String,
    sso_url: String,
    certificate: String,
    #[serde(default)]
    sp_entity_id: Option<String>,
    #[serde(default)]
    name_id_format: Option<String>,
    #[serde(default = "default_true")]
    auto_provision: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OAuth2Settings {
    pub client_id: String,
    pub client_secret: SecretString,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub authorization_url: Option<String>,
    #[serde(default)]
    pub token_url: Option<String>,
    #[serde(default)]
    pub userinfo_url: Option<String>,
    #[serde(default = "default_true")]
    pub auto_provision: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone)]
pub enum ProviderSettings {
    Saml(SamlSettings),
    OAuth2 {
        kind: OAuth2ProviderKind,
        settings: OAuth2Settings,
    },
}

/// Which assertion attributes feed the local user record. Unset fields fall
/// back to NameID (email) or are left empty (names).
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AttributeMapping {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
}

impl AttributeMapping {
    pub fn parse(value: &serde_json::Value) -> Result<Self, ProviderConfigError> {
        let mapping: AttributeMapping = serde_json::from_value(value.clone())
            .map_err(|e| ProviderConfigError::InvalidAttributeMapping(e.to_string()))?;

        for (field, attr) in [
            ("email", &mapping.email),
            ("display_name", &mapping.display_name),
            ("first_name", &mapping.first_name),
            ("last_name", &mapping.last_name),
        ] {
            if attr.as_deref().is_some_and(|a| a.trim().is_empty()) {
                return Err(ProviderConfigError::InvalidAttributeMapping(format!(
                    "{} must not be empty",
                    field
                )));
            }
        }

        Ok(mapping)
    }
}

/// Parsed, validated provider configuration.
#[derive(Debug, Clone)]
pub struct IdentityProvider {
    pub id: Uuid,
    pub organization_id: Option<Uuid>,
    pub is_active: bool,
    pub settings: ProviderSettings,
    pub attribute_mapping: AttributeMapping,
}

impl IdentityProvider {
    pub fn from_record(record: &IdentityProviderRecord) -> Result<Self, ProviderConfigError> {
        let provider_type: ProviderType = record.provider_type.parse()?;
        let blob = record.configuration.0.clone();

        let settings = match provider_type {
            ProviderType::Saml => {
                let raw: SamlSettingsBlob = serde_json::from_value(blob)
                    .map_err(|e| ProviderConfigError::InvalidConfiguration(e.to_string()))?;
                require_non_empty("idp_entity_id", &raw.idp_entity_id)?;
                require_url("sso_url", &raw.sso_url)?;
                if record.organization_id.is_none() {
                    return Err(ProviderConfigError::InvalidConfiguration(
                        "SAML providers must belong to an organization".to_string(),
                    ));
                }
                let signing_key = parse_signing_key(&raw.certificate)
                    .map_err(|e| ProviderConfigError::InvalidConfiguration(e.to_string()))?;

                ProviderSettings::Saml(SamlSettings {
                    idp_entity_id: raw.idp_entity_id,
                    sso_url: raw.sso_url,
                    signing_key,
                    sp_entity_id: raw.sp_entity_id.filter(|s| !s.trim().is_empty()),
                    name_id_format: raw.name_id_format,
                    auto_provision: raw.auto_provision,
                })
            }
            ProviderType::OAuth2(kind) => {
                let settings: OAuth2Settings = serde_json::from_value(blob)
                    .map_err(|e| ProviderConfigError::InvalidConfiguration(e.to_string()))?;
                require_non_empty("client_id", &settings.client_id)?;
                for (field, url) in [
                    ("authorization_url", &settings.authorization_url),
                    ("token_url", &settings.token_url),
                    ("userinfo_url", &settings.userinfo_url),
                ] {
                    if let Some(url) = url {
                        require_url(field, url)?;
                    }
                }
                ProviderSettings::OAuth2 { kind, settings }
            }
        };

        let attribute_mapping = match &record.attribute_mapping {
            Some(Json(value)) if !value.is_null() => AttributeMapping::parse(value)?,
            _ => AttributeMapping::default(),
        };

        Ok(Self {
            id: record.id,
            organization_id: record.organization_id,
            is_active: record.is_active,
            settings,
            attribute_mapping,
        })
    }
}

fn require_non_empty(field: &str, value: &str) -> Result<(), ProviderConfigError> {
    if value.trim().is_empty() {
        return Err(ProviderConfigError::InvalidConfiguration(format!(
            "{} must not be empty",
            field
        )));
    }
    Ok(())
}

fn require_url(field: &str, value: &str) -> Result<(), ProviderConfigError> {
    if !(value.starts_with("https://") || value.starts_with("http://")) {
        return Err(ProviderConfigError::InvalidConfiguration(format!(
            "{} must be an http(s) URL",
            field
        )));
    }
    Ok(())
}
