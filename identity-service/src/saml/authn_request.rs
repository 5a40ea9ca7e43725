//! AuthnRequest construction for the HTTP-Redirect binding.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, SecondsFormat, Utc};
use flate2::{write::DeflateEncoder, Compression};
use quick_xml::escape::escape;
use std::io::Write;
use uuid::Uuid;

use super::{ASSERTION_NS, HTTP_POST_BINDING, PROTOCOL_NS};

#[derive(Debug, Clone)]
pub struct AuthnRequest {
    pub id: String,
    pub xml: String,
}

impl AuthnRequest {
    pub fn new(
        sp_entity_id: &str,
        acs_url: &str,
        destination: &str,
        name_id_format: Option<&str>,
        now: DateTime<Utc>,
    ) -> Self {
        // IDs must not start with a digit (xs:ID).
        let id = format!("_{}", Uuid::new_v4().simple());
        let name_id_policy = name_id_format
            .map(|format| {
                format!(
                    r#"<samlp:NameIDPolicy Format="{}" AllowCreate="true"/>"#,
                    escape(format)
                )
            })
            .unwrap_or_default();

        let xml = format!(
            concat!(
                r#"<samlp:AuthnRequest xmlns:samlp="{protocol}" xmlns:saml="{assertion}" "#,
                r#"ID="{id}" Version="2.0" IssueInstant="{instant}" Destination="{destination}" "#,
                r#"ProtocolBinding="{binding}" AssertionConsumerServiceURL="{acs}">"#,
                r#"<saml:Issuer>{issuer}</saml:Issuer>{policy}</samlp:AuthnRequest>"#
            ),
            protocol = PROTOCOL_NS,
            assertion = ASSERTION_NS,
            id = id,
            instant = now.to_rfc3339_opts(SecondsFormat::Secs, true),
            destination = escape(destination),
            binding = HTTP_POST_BINDING,
            acs = escape(acs_url),
            issuer = escape(sp_entity_id),
            policy = name_id_policy,
        );

        Self { id, xml }
    }

    /// URL that sends the browser to the IdP with this request and the
    /// given RelayState.
    pub fn redirect_url(&self, sso_url: &str, relay_state: &str) -> Result<String, std::io::Error> {
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(self.xml.as_bytes())?;
        let deflated = encoder.finish()?;
        let encoded = STANDARD.encode(deflated);

        let separator = if sso_url.contains('?') { '&' } else { '?' };
        Ok(format!(
            "{}{}SAMLRequest={}&RelayState={}",
            sso_url,
            separator,
            urlencoding::encode(&encoded),
            urlencoding::encode(relay_state)
        ))
    }
}
