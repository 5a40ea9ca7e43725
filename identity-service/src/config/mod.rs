use secrecy::SecretString;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::str::FromStr;
use uuid::Uuid;

use crate::models::OAuth2Settings;

/// Longest accepted lifetime of an OAuth2 state cookie or SAML RelayState.
pub const MAX_FEDERATION_STATE_TTL_SECS: i64 = 600;

#[derive(Debug, Clone)]
pub struct IdentityConfig {
    pub common: core_config::Config,
    pub environment: Environment,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub token: TokenConfig,
    pub federation: FederationConfig,
    pub global_oauth2: GlobalOAuth2Config,
    pub provisioning: ProvisioningConfig,
    pub password: PasswordPolicyConfig,
    pub security: SecurityConfig,
    pub notification: NotificationConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Environment {
    Dev,
    Prod,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// `None` selects the in-memory store (dev only).
    pub url: Option<String>,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct TokenConfig {
    pub signing_secret: SecretString,
    pub issuer: String,
    pub expiration_hours: i64,
}

#[derive(Debug, Clone)]
pub struct FederationConfig {
    /// Public base URL of this service, used for ACS and callback URLs.
    pub app_root_url: String,
    /// Frontend page receiving `?token=...` after a federated login.
    pub frontend_callback_url: String,
    pub http_timeout_secs: u64,
    pub state_ttl_secs: i64,
    pub saml_clock_skew_secs: i64,
    pub secure_cookies: bool,
}

#[derive(Debug, Clone)]
pub struct GlobalOAuth2Config {
    pub google: Option<OAuth2Settings>,
    pub github: Option<OAuth2Settings>,
    pub microsoft: Option<OAuth2Settings>,
    pub allow_registration: bool,
    pub default_organization_id: Option<Uuid>,
}

#[derive(Debug, Clone)]
pub struct ProvisioningConfig {
    pub allow_reassignment: bool,
}

#[derive(Debug, Clone)]
pub struct PasswordPolicyConfig {
    pub max_failed_attempts: i32,
    pub lockout_minutes: i64,
}

#[derive(Debug, Clone)]
pub struct SecurityConfig {
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct NotificationConfig {
    pub webhook_url: Option<String>,
}

impl IdentityConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;

        let env_str = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string());
        let environment: Environment = env_str
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;

        let is_prod = environment == Environment::Prod;
        let allow_registration: bool = parse_env("GLOBAL_OAUTH2_ALLOW_REGISTRATION", "false")?;

        let config = IdentityConfig {
            common: common_config,
            environment: environment.clone(),
            service_name: get_env("SERVICE_NAME", Some("identity-service"), false)?,
            service_version: get_env("SERVICE_VERSION", Some(env!("CARGO_PKG_VERSION")), false)?,
            log_level: get_env("LOG_LEVEL", Some("info"), false)?,
            otlp_endpoint: get_optional_env("OTLP_ENDPOINT"),
            database: DatabaseConfig {
                url: if is_prod {
                    Some(get_env("DATABASE_URL", None, true)?)
                } else {
                    get_optional_env("DATABASE_URL")
                },
                max_connections: parse_env("DATABASE_MAX_CONNECTIONS", "10")?,
                min_connections: parse_env("DATABASE_MIN_CONNECTIONS", "1")?,
            },
            token: TokenConfig {
                signing_secret: SecretString::new(get_env("TOKEN_SIGNING_SECRET", None, true)?),
                issuer: get_env("TOKEN_ISSUER", Some("identity-service"), false)?,
                expiration_hours: parse_env("TOKEN_EXPIRATION_HOURS", "24")?,
            },
            federation: FederationConfig {
                app_root_url: get_env("APP_ROOT_URL", Some("http://localhost:8080"), is_prod)?
                    .trim_end_matches('/')
                    .to_string(),
                frontend_callback_url: get_env(
                    "FRONTEND_CALLBACK_URL",
                    Some("http://localhost:3000/auth/callback"),
                    is_prod,
                )?,
                http_timeout_secs: parse_env("FEDERATION_HTTP_TIMEOUT_SECS", "10")?,
                state_ttl_secs: parse_env("FEDERATION_STATE_TTL_SECS", "600")?,
                saml_clock_skew_secs: parse_env("SAML_CLOCK_SKEW_SECS", "60")?,
                secure_cookies: parse_env("SECURE_COOKIES", if is_prod { "true" } else { "false" })?,
            },
            global_oauth2: GlobalOAuth2Config {
                google: global_client("GOOGLE", allow_registration),
                github: global_client("GITHUB", allow_registration),
                microsoft: global_client("MICROSOFT", allow_registration),
                allow_registration,
                default_organization_id: get_optional_env("GLOBAL_OAUTH2_DEFAULT_ORGANIZATION_ID")
                    .map(|v| Uuid::parse_str(&v))
                    .transpose()
                    .map_err(|e| {
                        AppError::ConfigError(anyhow::anyhow!(
                            "GLOBAL_OAUTH2_DEFAULT_ORGANIZATION_ID is not a UUID: {}",
                            e
                        ))
                    })?,
            },
            provisioning: ProvisioningConfig {
                allow_reassignment: parse_env("PROVISIONING_ALLOW_REASSIGNMENT", "false")?,
            },
            password: PasswordPolicyConfig {
                max_failed_attempts: parse_env("PASSWORD_MAX_FAILED_ATTEMPTS", "5")?,
                lockout_minutes: parse_env("PASSWORD_LOCKOUT_MINUTES", "15")?,
            },
            security: SecurityConfig {
                allowed_origins: get_env("ALLOWED_ORIGINS", Some("http://localhost:3000"), is_prod)?
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            },
            notification: NotificationConfig {
                webhook_url: get_optional_env("NOTIFICATION_WEBHOOK_URL"),
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.common.port == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "PORT must be greater than 0"
            )));
        }

        if self.token.expiration_hours <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "TOKEN_EXPIRATION_HOURS must be positive"
            )));
        }

        if self.federation.state_ttl_secs <= 0
            || self.federation.state_ttl_secs > MAX_FEDERATION_STATE_TTL_SECS
        {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "FEDERATION_STATE_TTL_SECS must be between 1 and {}",
                MAX_FEDERATION_STATE_TTL_SECS
            )));
        }

        if self.federation.http_timeout_secs == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "FEDERATION_HTTP_TIMEOUT_SECS must be positive"
            )));
        }

        if self.federation.saml_clock_skew_secs < 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "SAML_CLOCK_SKEW_SECS must not be negative"
            )));
        }

        if self.password.max_failed_attempts <= 0 || self.password.lockout_minutes <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "Password lockout policy values must be positive"
            )));
        }

        if self.environment == Environment::Prod {
            if self.security.allowed_origins.iter().any(|o| o == "*") {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "Wildcard CORS origin not allowed in production"
                )));
            }

            if !self.federation.secure_cookies {
                tracing::warn!("SECURE_COOKIES is disabled in production");
            }
        }

        Ok(())
    }

    pub fn is_prod(&self) -> bool {
        self.environment == Environment::Prod
    }
}

fn get_env(key: &str, default: Option<&str>, required: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if required {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required but not set",
                    key
                ))))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required but not set",
                    key
                ))))
            }
        }
    }
}

fn get_optional_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_env<T>(key: &str, default: &str) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    get_env(key, Some(default), false)?
        .trim()
        .parse()
        .map_err(|e: T::Err| AppError::ConfigError(anyhow::anyhow!("{} is invalid: {}", key, e)))
}

/// Global provider client, present only when both id and secret are set.
/// Endpoints may be overridden the same way per-organization providers do.
fn global_client(provider: &str, allow_registration: bool) -> Option<OAuth2Settings> {
    let key = |suffix: &str| format!("GLOBAL_OAUTH2_{}_{}", provider, suffix);
    let client_id = get_optional_env(&key("CLIENT_ID"))?;
    let client_secret = get_optional_env(&key("CLIENT_SECRET"))?;
    Some(OAuth2Settings {
        client_id,
        client_secret: SecretString::new(client_secret),
        scopes: get_optional_env(&key("SCOPES"))
            .map(|v| v.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default(),
        authorization_url: get_optional_env(&key("AUTHORIZATION_URL")),
        token_url: get_optional_env(&key("TOKEN_URL")),
        userinfo_url: get_optional_env(&key("USERINFO_URL")),
        auto_provision: allow_registration,
    })
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "prod" => Ok(Environment::Prod),
            _ => Err(format!("Invalid environment: {}", s)),
        }
    }
}
