use secrecy::SecretString;

use crate::models::{OAuth2ProviderKind, OAuth2Settings};

struct Defaults {
    authorization_url: &'static str,
    token_url: &'static str,
    userinfo_url: &'static str,
    scopes: &'static [&'static str],
}

fn defaults(kind: OAuth2ProviderKind) -> Defaults {
    match kind {
        OAuth2ProviderKind::Google => Defaults {
            authorization_url: "https://accounts.google.com/o/oauth2/v2/auth",
            token_url: "https://oauth2.googleapis.com/token",
            userinfo_url: "https://openidconnect.googleapis.com/v1/userinfo",
            scopes: &["openid", "email", "profile"],
        },
        OAuth2ProviderKind::Github => Defaults {
            authorization_url: "https://github.com/login/oauth/authorize",
            token_url: "https://github.com/login/oauth/access_token",
            userinfo_url: "https://api.github.com/user",
            scopes: &["read:user", "user:email"],
        },
        OAuth2ProviderKind::Microsoft => Defaults {
            authorization_url: "https://login.microsoftonline.com/common/oauth2/v2.0/authorize",
            token_url: "https://login.microsoftonline.com/common/oauth2/v2.0/token",
            userinfo_url: "https://graph.microsoft.com/oidc/userinfo",
            scopes: &["openid", "email", "profile"],
        },
    }
}

/// Provider client with every endpoint resolved.
#[derive(Debug, Clone)]
pub struct ResolvedProvider {
    pub kind: OAuth2ProviderKind,
    pub client_id: String,
    pub client_secret: SecretString,
    pub scopes: Vec<String>,
    pub authorization_url: String,
    pub token_url: String,
    pub userinfo_url: String,
    pub auto_provision: bool,
}

impl ResolvedProvider {
    pub fn new(kind: OAuth2ProviderKind, settings: &OAuth2Settings) -> Self {
        let d = defaults(kind);
        let scopes = if settings.scopes.is_empty() {
            d.scopes.iter().map(|s| s.to_string()).collect()
        } else {
            settings.scopes.clone()
        };

        Self {
            kind,
            client_id: settings.client_id.clone(),
            client_secret: settings.client_secret.clone(),
            scopes,
            authorization_url: settings
                .authorization_url
                .clone()
                .unwrap_or_else(|| d.authorization_url.to_string()),
            token_url: settings
                .token_url
                .clone()
                .unwrap_or_else(|| d.token_url.to_string()),
            userinfo_url: settings
                .userinfo_url
                .clone()
                .unwrap_or_else(|| d.userinfo_url.to_string()),
            auto_provision: settings.auto_provision,
        }
    }

    /// GitHub lists private addresses under `/user/emails`.
    pub fn emails_url(&self) -> Option<String> {
        (self.kind == OAuth2ProviderKind::Github)
            .then(|| format!("{}/emails", self.userinfo_url.trim_end_matches('/')))
    }

    pub fn authorization_redirect(
        &self,
        redirect_uri: &str,
        state: &str,
        code_challenge: &str,
    ) -> String {
        let separator = if self.authorization_url.contains('?') { '&' } else { '?' };
        let mut url = format!(
            "{}{}response_type=code&client_id={}&redirect_uri={}&scope={}&state={}&code_challenge={}&code_challenge_method=S256",
            self.authorization_url,
            separator,
            urlencoding::encode(&self.client_id),
            urlencoding::encode(redirect_uri),
            urlencoding::encode(&self.scopes.join(" ")),
            urlencoding::encode(state),
            urlencoding::encode(code_challenge),
        );
        if self.kind == OAuth2ProviderKind::Google {
            url.push_str("&prompt=select_account");
        }
        url
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::Secret;

    fn settings() -> OAuth2Settings {
        OAuth2Settings {
            client_id: "client 1".into(),
            client_secret: Secret::new("s".into()),
            scopes: vec![],
            authorization_url: None,
            token_url: None,
            userinfo_url: Some("http://127.0.0.1:9000/user/".into()),
            auto_provision: true,
        }
    }

    #[test]
    fn defaults_fill_missing_endpoints() {
        let provider = ResolvedProvider::new(OAuth2ProviderKind::Github, &settings());
        assert_eq!(provider.token_url, "https://github.com/login/oauth/access_token");
        assert_eq!(provider.scopes, vec!["read:user", "user:email"]);
        assert_eq!(
            provider.emails_url().as_deref(),
            Some("http://127.0.0.1:9000/user/emails")
        );
        assert!(ResolvedProvider::new(OAuth2ProviderKind::Google, &settings())
            .emails_url()
            .is_none());
    }

    #[test]
    fn authorization_redirect_carries_state_and_challenge() {
        let provider = ResolvedProvider::new(OAuth2ProviderKind::Google, &settings());
        let url = provider.authorization_redirect("https://app/cb", "st@te", "chal");

        assert!(url.starts_with("https://accounts.google.com/o/oauth2/v2/auth?response_type=code"));
        assert!(url.contains("client_id=client%201"));
        assert!(url.contains("redirect_uri=https%3A%2F%2Fapp%2Fcb"));
        assert!(url.contains("scope=openid%20email%20profile"));
        assert!(url.contains("state=st%40te"));
        assert!(url.contains("code_challenge=chal&code_challenge_method=S256"));
    }
}
