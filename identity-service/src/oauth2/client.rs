use secrecy::ExposeSecret;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::instrument;

use super::providers::ResolvedProvider;
use crate::models::OAuth2ProviderKind;

#[derive(Debug, Error)]
pub enum OAuth2Error {
    #[error("token exchange failed: {0}")]
    Exchange(String),

    #[error("userinfo request failed: {0}")]
    UserInfo(String),
}

/// Identity as reported by the provider's userinfo endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderUser {
    pub subject: String,
    /// `None` when absent or not verified by the provider.
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub given_name: Option<String>,
    pub family_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    expires_in: Option<i64>,
    error: Option<String>,
    error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OidcUserInfo {
    sub: String,
    email: Option<String>,
    email_verified: Option<bool>,
    /// Microsoft's "email domain owner verified" optional claim.
    xms_edov: Option<bool>,
    name: Option<String>,
    given_name: Option<String>,
    family_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GithubUser {
    id: i64,
    login: String,
    name: Option<String>,
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GithubEmail {
    email: String,
    primary: bool,
    verified: bool,
}

/// Outbound calls to OAuth2 providers, bounded by a per-request timeout.
#[derive(Clone)]
pub struct OAuth2Client {
    http: reqwest::Client,
}

impl OAuth2Client {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("identity-service/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { http })
    }

    /// Exchange an authorization code for a provider access token.
    #[instrument(skip_all, fields(provider = %provider.kind))]
    pub async fn exchange_code(
        &self,
        provider: &ResolvedProvider,
        code: &str,
        redirect_uri: &str,
        code_verifier: &str,
    ) -> Result<String, OAuth2Error> {
        let response = self
            .http
            .post(&provider.token_url)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", redirect_uri),
                ("client_id", provider.client_id.as_str()),
                ("client_secret", provider.client_secret.expose_secret().as_str()),
                ("code_verifier", code_verifier),
            ])
            .send()
            .await
            .map_err(|e| OAuth2Error::Exchange(format!("request error: {}", e)))?;

        let status = response.status();
        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| OAuth2Error::Exchange(format!("status {}: unreadable body: {}", status, e)))?;

        if let Some(error) = body.error {
            return Err(OAuth2Error::Exchange(format!(
                "status {}: {} {}",
                status,
                error,
                body.error_description.unwrap_or_default()
            )));
        }
        if !status.is_success() {
            return Err(OAuth2Error::Exchange(format!("status {}", status)));
        }
        if body.expires_in.is_some_and(|secs| secs <= 0) {
            return Err(OAuth2Error::Exchange("access token already expired".into()));
        }

        body.access_token
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| OAuth2Error::Exchange("no access token in response".into()))
    }

    #[instrument(skip_all, fields(provider = %provider.kind))]
    pub async fn fetch_user(
        &self,
        provider: &ResolvedProvider,
        access_token: &str,
    ) -> Result<ProviderUser, OAuth2Error> {
        match provider.kind {
            OAuth2ProviderKind::Github => self.fetch_github_user(provider, access_token).await,
            OAuth2ProviderKind::Google | OAuth2ProviderKind::Microsoft => {
                let info: OidcUserInfo = self.get_json(&provider.userinfo_url, access_token).await?;
                // Only an address the provider vouches for may be linked.
                let verified = info.email_verified.or(info.xms_edov) == Some(true);
                let email = info
                    .email
                    .filter(|_| verified)
                    .filter(|e| !e.trim().is_empty());
                Ok(ProviderUser {
                    subject: info.sub,
                    email,
                    display_name: info.name,
                    given_name: info.given_name,
                    family_name: info.family_name,
                })
            }
        }
    }

    async fn fetch_github_user(
        &self,
        provider: &ResolvedProvider,
        access_token: &str,
    ) -> Result<ProviderUser, OAuth2Error> {
        let user: GithubUser = self.get_json(&provider.userinfo_url, access_token).await?;

        let mut email = user.email.filter(|e| !e.trim().is_empty());
        if email.is_none() {
            if let Some(url) = provider.emails_url() {
                let emails: Vec<GithubEmail> = self.get_json(&url, access_token).await?;
                email = emails
                    .into_iter()
                    .find(|e| e.primary && e.verified)
                    .map(|e| e.email);
            }
        }

        Ok(ProviderUser {
            subject: user.id.to_string(),
            email,
            display_name: user.name.or(Some(user.login)),
            given_name: None,
            family_name: None,
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        access_token: &str,
    ) -> Result<T, OAuth2Error> {
        let response = self
            .http
            .get(url)
            .bearer_auth(access_token)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| OAuth2Error::UserInfo(format!("request error: {}", e)))?;

        if !response.status().is_success() {
            return Err(OAuth2Error::UserInfo(format!("status {}", response.status())));
        }

        response
            .json()
            .await
            .map_err(|e| OAuth2Error::UserInfo(format!("unreadable body: {}", e)))
    }
}
