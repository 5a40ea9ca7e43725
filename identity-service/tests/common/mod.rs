//! Shared setup for identity-service integration tests.
//!
//! Every test runs the real router over the in-memory store. SAML
//! responses are signed with the fixture IdP key; OAuth2 providers are
//! `wiremock` servers.

#![allow(dead_code)]

use axum::{
    body::Body,
    http::{header, Request, Response, StatusCode},
    Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{Duration, SecondsFormat, Utc};
use flate2::read::DeflateDecoder;
use http_body_util::BodyExt;
use identity_service::{
    build_router,
    config::{
        DatabaseConfig, Environment, FederationConfig, GlobalOAuth2Config, IdentityConfig,
        NotificationConfig, PasswordPolicyConfig, ProvisioningConfig, SecurityConfig,
        TokenConfig,
    },
    models::{IdentityProviderRecord, OAuth2ProviderKind, Organization, ProviderType},
    saml::{
        acs_url, default_sp_entity_id,
        dsig::{DSIG_NS, ENVELOPED_SIGNATURE, EXC_C14N, RSA_SHA256, SHA256_DIGEST},
        xml::{canonicalize, parse},
        ASSERTION_NS, BEARER_METHOD, NAMEID_FORMAT_EMAIL, PROTOCOL_NS, STATUS_SUCCESS,
    },
    services::{SecurityEvent, SecurityNotifier},
    store::InMemoryIdentityStore,
    AppState,
};
use rsa::pkcs8::DecodePrivateKey;
use rsa::{Pkcs1v15Sign, RsaPrivateKey};
use secrecy::Secret;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::sync::{Arc, Mutex};
use tower::util::ServiceExt;
use uuid::Uuid;

pub const IDP_KEY: &str = include_str!("../fixtures/idp_key.pem");
pub const IDP_CERT: &str = include_str!("../fixtures/idp_cert.pem");
pub const ROGUE_KEY: &str = include_str!("../fixtures/rogue_key.pem");

pub const APP_ROOT: &str = "http://localhost:8080";
pub const FRONTEND_CALLBACK: &str = "http://localhost:3000/auth/callback";
pub const IDP_ENTITY_ID: &str = "https://idp.example.com/metadata";
pub const IDP_SSO_URL: &str = "https://idp.example.com/sso";
pub const TEST_SECRET: &str = "integration-test-signing-secret-0123456789";

/// Notifier that keeps every event for assertions.
#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<SecurityEvent>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<SecurityEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[axum::async_trait]
impl SecurityNotifier for RecordingNotifier {
    async fn notify(&self, event: SecurityEvent) -> anyhow::Result<()> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

pub fn test_config() -> IdentityConfig {
    IdentityConfig {
        common: service_core::config::Config {
            host: "127.0.0.1".to_string(),
            port: 8080,
            shutdown_grace_secs: 0,
        },
        environment: Environment::Dev,
        service_name: "identity-service".to_string(),
        service_version: "test".to_string(),
        log_level: "error".to_string(),
        otlp_endpoint: None,
        database: DatabaseConfig {
            url: None,
            max_connections: 1,
            min_connections: 1,
        },
        token: TokenConfig {
            signing_secret: Secret::new(TEST_SECRET.to_string()),
            issuer: "identity-service".to_string(),
            expiration_hours: 24,
        },
        federation: FederationConfig {
            app_root_url: APP_ROOT.to_string(),
            frontend_callback_url: FRONTEND_CALLBACK.to_string(),
            http_timeout_secs: 5,
            state_ttl_secs: 600,
            saml_clock_skew_secs: 60,
            secure_cookies: false,
        },
        global_oauth2: GlobalOAuth2Config {
            google: None,
            github: None,
            microsoft: None,
            allow_registration: false,
            default_organization_id: None,
        },
        provisioning: ProvisioningConfig {
            allow_reassignment: false,
        },
        password: PasswordPolicyConfig {
            max_failed_attempts: 3,
            lockout_minutes: 15,
        },
        security: SecurityConfig {
            allowed_origins: vec!["http://localhost:3000".to_string()],
        },
        notification: NotificationConfig { webhook_url: None },
    }
}

pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub store: InMemoryIdentityStore,
    pub notifier: Arc<RecordingNotifier>,
}

impl TestApp {
    pub fn spawn() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: IdentityConfig) -> Self {
        Self::with_store(config, InMemoryIdentityStore::new())
    }

    /// App over a store the caller has already seeded.
    pub fn with_store(config: IdentityConfig, store: InMemoryIdentityStore) -> Self {
        let notifier = Arc::new(RecordingNotifier::default());
        let state = AppState::new(
            config,
            Arc::new(store.clone()),
            notifier.clone() as Arc<dyn SecurityNotifier>,
        )
        .expect("Failed to build application state");

        Self {
            router: build_router(state.clone()),
            state,
            store,
            notifier,
        }
    }

    pub async fn request(&self, request: Request<Body>) -> Response<Body> {
        self.router.clone().oneshot(request).await.unwrap()
    }

    pub async fn get(&self, uri: &str) -> Response<Body> {
        self.request(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
    }

    pub fn add_organization(&self, name: &str) -> Uuid {
        let organization = Organization::new(name);
        let id = organization.id;
        self.store.add_organization(organization);
        id
    }

    /// SAML provider for `organization_id` trusting the fixture certificate.
    pub fn add_saml_provider(&self, organization_id: Uuid, auto_provision: bool) -> Uuid {
        let record = IdentityProviderRecord::new(
            Some(organization_id),
            ProviderType::Saml,
            json!({
                "idp_entity_id": IDP_ENTITY_ID,
                "sso_url": IDP_SSO_URL,
                "certificate": IDP_CERT,
                "name_id_format": NAMEID_FORMAT_EMAIL,
                "auto_provision": auto_provision,
            }),
            Some(json!({ "display_name": "displayName" })),
        );
        let id = record.id;
        self.store.add_identity_provider(record);
        id
    }

    /// Organization-scoped OAuth2 provider whose endpoints live on `server_uri`.
    pub fn add_oauth2_provider(
        &self,
        organization_id: Uuid,
        kind: OAuth2ProviderKind,
        server_uri: &str,
        auto_provision: bool,
    ) -> Uuid {
        let record = IdentityProviderRecord::new(
            Some(organization_id),
            ProviderType::OAuth2(kind),
            oauth2_settings_json(server_uri, auto_provision),
            None,
        );
        let id = record.id;
        self.store.add_identity_provider(record);
        id
    }

    /// Start SP-initiated SAML login and return (AuthnRequest ID, RelayState).
    pub async fn start_saml_login(&self, idp_id: Uuid) -> (String, String) {
        self.start_saml_login_to(idp_id, None).await
    }

    pub async fn start_saml_login_to(&self, idp_id: Uuid, redirect_to: Option<&str>) -> (String, String) {
        let mut uri = format!("/auth/saml/{}/login", idp_id);
        if let Some(path) = redirect_to {
            uri.push_str(&format!("?redirect_to={}", urlencoding::encode(path)));
        }
        let response = self.get(&uri).await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        let location = location(&response);
        assert!(location.starts_with(IDP_SSO_URL));

        let encoded = query_param(&location, "SAMLRequest").expect("SAMLRequest missing");
        let mut xml = String::new();
        DeflateDecoder::new(STANDARD.decode(encoded).unwrap().as_slice())
            .read_to_string(&mut xml)
            .unwrap();
        let request_id = parse(&xml).unwrap().attr("ID").unwrap().to_string();
        let relay_state = query_param(&location, "RelayState").expect("RelayState missing");
        (request_id, relay_state)
    }

    pub async fn post_acs(&self, idp_id: Uuid, saml_response: &str, relay_state: Option<&str>) -> Response<Body> {
        let mut form = format!("SAMLResponse={}", urlencoding::encode(saml_response));
        if let Some(relay) = relay_state {
            form.push_str(&format!("&RelayState={}", urlencoding::encode(relay)));
        }
        self.request(
            Request::builder()
                .method("POST")
                .uri(format!("/auth/saml/{}/acs", idp_id))
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from(form))
                .unwrap(),
        )
        .await
    }

    /// Start an OAuth2 login and return (state cookie header, state nonce).
    pub async fn start_oauth2_login(&self, provider: &str, idp: &str) -> (String, String) {
        let response = self
            .get(&format!("/auth/oauth2/{}/{}/login", provider, idp))
            .await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);

        let set_cookie = response
            .headers()
            .get(header::SET_COOKIE)
            .expect("state cookie missing")
            .to_str()
            .unwrap();
        let cookie = set_cookie.split(';').next().unwrap().to_string();
        let nonce = query_param(&location(&response), "state").expect("state missing");
        (cookie, nonce)
    }

    pub async fn oauth2_callback(
        &self,
        provider: &str,
        idp: &str,
        cookie: Option<&str>,
        query: &str,
    ) -> Response<Body> {
        let mut builder = Request::builder().uri(format!(
            "/auth/oauth2/{}/{}/callback?{}",
            provider, idp, query
        ));
        if let Some(cookie) = cookie {
            builder = builder.header(header::COOKIE, cookie);
        }
        self.request(builder.body(Body::empty()).unwrap()).await
    }
}

pub fn oauth2_settings_json(server_uri: &str, auto_provision: bool) -> serde_json::Value {
    json!({
        "client_id": "test-client",
        "client_secret": "test-client-secret",
        "authorization_url": format!("{}/authorize", server_uri),
        "token_url": format!("{}/token", server_uri),
        "userinfo_url": format!("{}/userinfo", server_uri),
        "auto_provision": auto_provision,
    })
}

pub fn location(response: &Response<Body>) -> String {
    response
        .headers()
        .get(header::LOCATION)
        .expect("Location header missing")
        .to_str()
        .unwrap()
        .to_string()
}

pub fn query_param(url: &str, name: &str) -> Option<String> {
    let (_, query) = url.split_once('?')?;
    query
        .split('&')
        .find_map(|pair| pair.strip_prefix(&format!("{}=", name)))
        .map(|raw| urlencoding::decode(raw).unwrap().into_owned())
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

/// Session token carried by a redirect to the frontend callback.
pub fn redirected_token(response: &Response<Body>) -> String {
    let location = location(response);
    assert!(
        location.starts_with(FRONTEND_CALLBACK),
        "unexpected redirect: {}",
        location
    );
    query_param(&location, "token").expect("token missing")
}

/// Inputs of a SAML Response as an IdP would issue it.
pub struct SamlResponse {
    pub idp_id: Uuid,
    pub in_response_to: String,
    pub name_id: String,
    pub display_name: Option<String>,
    pub assertion_id: String,
    pub audience: String,
    pub destination: String,
    pub recipient: String,
    /// Conditions window, relative to the time the XML is built.
    pub not_before: Duration,
    pub not_on_or_after: Duration,
    /// SubjectConfirmationData `NotOnOrAfter`, relative to the same instant.
    pub confirmation_expires: Duration,
    pub signing_key: &'static str,
}

impl SamlResponse {
    pub fn new(idp_id: Uuid, in_response_to: &str, name_id: &str) -> Self {
        Self {
            idp_id,
            in_response_to: in_response_to.to_string(),
            name_id: name_id.to_string(),
            display_name: None,
            assertion_id: format!("_{}", Uuid::new_v4().simple()),
            audience: default_sp_entity_id(APP_ROOT, idp_id),
            destination: acs_url(APP_ROOT, idp_id),
            recipient: acs_url(APP_ROOT, idp_id),
            not_before: Duration::minutes(-1),
            not_on_or_after: Duration::minutes(5),
            confirmation_expires: Duration::minutes(5),
            signing_key: IDP_KEY,
        }
    }

    pub fn valid_between(mut self, not_before: Duration, not_on_or_after: Duration) -> Self {
        self.not_before = not_before;
        self.not_on_or_after = not_on_or_after;
        self
    }

    pub fn confirmation_expires(mut self, offset: Duration) -> Self {
        self.confirmation_expires = offset;
        self
    }

    pub fn destination(mut self, url: &str) -> Self {
        self.destination = url.to_string();
        self
    }

    pub fn recipient(mut self, url: &str) -> Self {
        self.recipient = url.to_string();
        self
    }

    pub fn display_name(mut self, name: &str) -> Self {
        self.display_name = Some(name.to_string());
        self
    }

    pub fn signed_with(mut self, key_pem: &'static str) -> Self {
        self.signing_key = key_pem;
        self
    }

    pub fn assertion_id(mut self, id: &str) -> Self {
        self.assertion_id = id.to_string();
        self
    }

    /// Response XML with the Assertion signed, base64 encoded for the
    /// POST binding.
    pub fn encode(&self) -> String {
        STANDARD.encode(self.signed_xml())
    }

    pub fn signed_xml(&self) -> String {
        let unsigned = self.unsigned_xml();
        let response = parse(&unsigned).unwrap();
        let assertion = response.child(ASSERTION_NS, "Assertion").unwrap();
        let canonical_assertion = canonicalize(assertion, &[], None).unwrap();
        let digest = STANDARD.encode(Sha256::digest(canonical_assertion.as_bytes()));

        let signed_info = format!(
            concat!(
                r#"<ds:SignedInfo xmlns:ds="{dsig}">"#,
                r#"<ds:CanonicalizationMethod Algorithm="{c14n}"/>"#,
                r#"<ds:SignatureMethod Algorithm="{rsa}"/>"#,
                r##"<ds:Reference URI="#{id}"><ds:Transforms>"##,
                r#"<ds:Transform Algorithm="{env}"/><ds:Transform Algorithm="{c14n}"/>"#,
                r#"</ds:Transforms><ds:DigestMethod Algorithm="{sha}"/>"#,
                r#"<ds:DigestValue>{digest}</ds:DigestValue></ds:Reference></ds:SignedInfo>"#
            ),
            dsig = DSIG_NS,
            c14n = EXC_C14N,
            rsa = RSA_SHA256,
            id = self.assertion_id,
            env = ENVELOPED_SIGNATURE,
            sha = SHA256_DIGEST,
            digest = digest,
        );
        let canonical = canonicalize(&parse(&signed_info).unwrap(), &[], None).unwrap();
        let private_key = RsaPrivateKey::from_pkcs8_pem(self.signing_key).unwrap();
        let value = private_key
            .sign(
                Pkcs1v15Sign::new::<Sha256>(),
                &Sha256::digest(canonical.as_bytes()),
            )
            .unwrap();
        let signature = format!(
            r#"<ds:Signature xmlns:ds="{}">{}<ds:SignatureValue>{}</ds:SignatureValue></ds:Signature>"#,
            DSIG_NS,
            signed_info,
            STANDARD.encode(value)
        );

        unsigned.replacen("</saml:Issuer>", &format!("</saml:Issuer>{}", signature), 1)
    }

    fn unsigned_xml(&self) -> String {
        let now = Utc::now();
        let instant = |t: chrono::DateTime<Utc>| t.to_rfc3339_opts(SecondsFormat::Secs, true);
        let attributes = self
            .display_name
            .as_ref()
            .map(|name| {
                format!(
                    r#"<saml:AttributeStatement><saml:Attribute Name="displayName"><saml:AttributeValue>{}</saml:AttributeValue></saml:Attribute></saml:AttributeStatement>"#,
                    name
                )
            })
            .unwrap_or_default();

        format!(
            concat!(
                r#"<samlp:Response xmlns:samlp="{p}" xmlns:saml="{a}" ID="_resp{rid}" Version="2.0" "#,
                r#"IssueInstant="{now}" Destination="{destination}" InResponseTo="{req}">"#,
                r#"<samlp:Status><samlp:StatusCode Value="{ok}"/></samlp:Status>"#,
                r#"<saml:Assertion ID="{aid}" Version="2.0" IssueInstant="{now}">"#,
                r#"<saml:Issuer>{issuer}</saml:Issuer>"#,
                r#"<saml:Subject><saml:NameID Format="{fmt}">{name_id}</saml:NameID>"#,
                r#"<saml:SubjectConfirmation Method="{bearer}">"#,
                r#"<saml:SubjectConfirmationData Recipient="{recipient}" NotOnOrAfter="{confirmation_end}" InResponseTo="{req}"/>"#,
                r#"</saml:SubjectConfirmation></saml:Subject>"#,
                r#"<saml:Conditions NotBefore="{not_before}" NotOnOrAfter="{not_on_or_after}">"#,
                r#"<saml:AudienceRestriction><saml:Audience>{audience}</saml:Audience></saml:AudienceRestriction>"#,
                r#"</saml:Conditions>{attributes}</saml:Assertion></samlp:Response>"#
            ),
            p = PROTOCOL_NS,
            a = ASSERTION_NS,
            rid = Uuid::new_v4().simple(),
            now = instant(now),
            destination = self.destination,
            recipient = self.recipient,
            req = self.in_response_to,
            ok = STATUS_SUCCESS,
            aid = self.assertion_id,
            issuer = IDP_ENTITY_ID,
            fmt = NAMEID_FORMAT_EMAIL,
            name_id = self.name_id,
            bearer = BEARER_METHOD,
            confirmation_end = instant(now + self.confirmation_expires),
            not_before = instant(now + self.not_before),
            not_on_or_after = instant(now + self.not_on_or_after),
            audience = self.audience,
            attributes = attributes,
        )
    }
}
