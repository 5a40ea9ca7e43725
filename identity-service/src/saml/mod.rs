//! Service-provider side of SAML 2.0 Web Browser SSO.

pub mod assertion;
pub mod attributes;
pub mod authn_request;
pub mod dsig;
pub mod metadata;
pub mod xml;

pub const PROTOCOL_NS: &str = "urn:oasis:names:tc:SAML:2.0:protocol";
pub const ASSERTION_NS: &str = "urn:oasis:names:tc:SAML:2.0:assertion";
pub const METADATA_NS: &str = "urn:oasis:names:tc:SAML:2.0:metadata";
pub const STATUS_SUCCESS: &str = "urn:oasis:names:tc:SAML:2.0:status:Success";
pub const BEARER_METHOD: &str = "urn:oasis:names:tc:SAML:2.0:cm:bearer";
pub const HTTP_POST_BINDING: &str = "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST";
pub const NAMEID_FORMAT_EMAIL: &str = "urn:oasis:names:tc:SAML:1.1:nameid-format:emailAddress";

/// ACS URL for an IdP: `{root}/auth/saml/{idpId}/acs`.
pub fn acs_url(app_root_url: &str, idp_id: uuid::Uuid) -> String {
    format!("{}/auth/saml/{}/acs", app_root_url, idp_id)
}

/// Default SP entity id, which is also where the SP metadata is served.
pub fn default_sp_entity_id(app_root_url: &str, idp_id: uuid::Uuid) -> String {
    format!("{}/auth/saml/{}/metadata", app_root_url, idp_id)
}
