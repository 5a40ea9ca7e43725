//! Validation of SAML Responses received on the ACS endpoint (HTTP-POST
//! binding).

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Duration, Utc};
use rsa::RsaPublicKey;
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;

use super::dsig::{enveloped_signature, verify_enveloped, SignatureError};
use super::xml::{parse, Element, XmlError};
use super::{ASSERTION_NS, BEARER_METHOD, PROTOCOL_NS, STATUS_SUCCESS};

/// Upper bound on the base64 `SAMLResponse` form field.
const MAX_ENCODED_RESPONSE_BYTES: usize = 512 * 1024;

#[derive(Debug, Error)]
pub enum AssertionError {
    #[error("SAMLResponse encoding: {0}")]
    Encoding(String),

    #[error(transparent)]
    Xml(#[from] XmlError),

    #[error("Document is not a SAML 2.0 Response")]
    NotAResponse,

    #[error("IdP returned status {0}")]
    Status(String),

    #[error("Response Destination does not match the ACS URL")]
    Destination,

    #[error("InResponseTo does not match the outstanding request")]
    InResponseTo,

    #[error("Expected exactly one Assertion, found {0}")]
    AssertionCount(usize),

    #[error("Encrypted assertions are not supported")]
    Encrypted,

    #[error("Duplicate ID attribute: {0}")]
    DuplicateId(String),

    #[error("Neither the Response nor the Assertion is signed")]
    Unsigned,

    #[error("Signature: {0}")]
    Signature(#[from] SignatureError),

    #[error("Unexpected Issuer")]
    Issuer,

    #[error("Assertion is not yet valid")]
    NotYetValid,

    #[error("Assertion has expired")]
    Expired,

    #[error("SP is not in the audience")]
    Audience,

    #[error("No usable bearer SubjectConfirmation")]
    SubjectConfirmation,

    #[error("Assertion has no NameID")]
    MissingNameId,

    #[error("Malformed assertion: {0}")]
    Malformed(String),
}

/// What the SP expects of a Response to one particular AuthnRequest.
#[derive(Debug, Clone)]
pub struct AssertionExpectations<'a> {
    pub idp_entity_id: &'a str,
    pub sp_entity_id: &'a str,
    pub acs_url: &'a str,
    pub request_id: &'a str,
    pub clock_skew: Duration,
    pub now: DateTime<Utc>,
}

/// Facts taken from a verified assertion.
#[derive(Debug, Clone)]
pub struct ValidatedAssertion {
    pub assertion_id: String,
    pub name_id: String,
    pub name_id_format: Option<String>,
    /// Attribute values keyed by `Name` and, when present, `FriendlyName`.
    pub attributes: BTreeMap<String, Vec<String>>,
    /// End of the assertion's validity; replay entries live until then.
    pub expires_at: DateTime<Utc>,
}

impl ValidatedAssertion {
    pub fn first_attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .get(name)
            .and_then(|values| values.iter().find(|v| !v.is_empty()))
            .map(String::as_str)
    }
}

/// Decode the POST-binding form value into the Response XML.
pub fn decode_post_binding(encoded: &str) -> Result<String, AssertionError> {
    if encoded.len() > MAX_ENCODED_RESPONSE_BYTES {
        return Err(AssertionError::Encoding("SAMLResponse is too large".into()));
    }
    let compact: String = encoded.split_whitespace().collect();
    let bytes = STANDARD
        .decode(compact)
        .map_err(|e| AssertionError::Encoding(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| AssertionError::Encoding(e.to_string()))
}

pub fn validate_response(
    xml: &str,
    key: &RsaPublicKey,
    expect: &AssertionExpectations<'_>,
) -> Result<ValidatedAssertion, AssertionError> {
    let response = parse(xml)?;
    if !response.is(PROTOCOL_NS, "Response") || response.attr("Version") != Some("2.0") {
        return Err(AssertionError::NotAResponse);
    }

    reject_duplicate_ids(&response)?;

    let status = response
        .child(PROTOCOL_NS, "Status")
        .and_then(|s| s.child(PROTOCOL_NS, "StatusCode"))
        .and_then(|c| c.attr("Value"))
        .ok_or_else(|| AssertionError::Malformed("missing StatusCode".into()))?;
    if status != STATUS_SUCCESS {
        return Err(AssertionError::Status(status.to_string()));
    }

    if let Some(destination) = response.attr("Destination") {
        if destination != expect.acs_url {
            return Err(AssertionError::Destination);
        }
    }

    let response_in_response_to = response.attr("InResponseTo");
    if response_in_response_to.is_some_and(|v| v != expect.request_id) {
        return Err(AssertionError::InResponseTo);
    }

    if response
        .descendants()
        .iter()
        .any(|e| e.is(ASSERTION_NS, "EncryptedAssertion"))
    {
        return Err(AssertionError::Encrypted);
    }
    let all_assertions = response
        .descendants()
        .iter()
        .filter(|e| e.is(ASSERTION_NS, "Assertion"))
        .count();
    let assertion = match response.children_named(ASSERTION_NS, "Assertion").next() {
        Some(a) if all_assertions == 1 => a,
        _ => return Err(AssertionError::AssertionCount(all_assertions)),
    };

    let response_signed = enveloped_signature(&response).is_some();
    let assertion_signed = enveloped_signature(assertion).is_some();
    if !response_signed && !assertion_signed {
        return Err(AssertionError::Unsigned);
    }
    if response_signed {
        verify_enveloped(&response, key)?;
    }
    if assertion_signed {
        verify_enveloped(assertion, key)?;
    }

    if let Some(issuer) = response.child(ASSERTION_NS, "Issuer") {
        if issuer.text().trim() != expect.idp_entity_id {
            return Err(AssertionError::Issuer);
        }
    }
    let issuer = assertion
        .child(ASSERTION_NS, "Issuer")
        .ok_or(AssertionError::Issuer)?;
    if issuer.text().trim() != expect.idp_entity_id {
        return Err(AssertionError::Issuer);
    }

    let assertion_id = assertion
        .attr("ID")
        .filter(|id| !id.is_empty())
        .ok_or_else(|| AssertionError::Malformed("Assertion without ID".into()))?
        .to_string();

    let conditions = assertion
        .child(ASSERTION_NS, "Conditions")
        .ok_or_else(|| AssertionError::Malformed("missing Conditions".into()))?;
    let expires_at = check_conditions(conditions, expect)?;

    let subject = assertion
        .child(ASSERTION_NS, "Subject")
        .ok_or_else(|| AssertionError::Malformed("missing Subject".into()))?;
    let confirmation_expiry = check_subject_confirmation(subject, expect, response_in_response_to)?;

    let name_id_element = subject
        .child(ASSERTION_NS, "NameID")
        .ok_or(AssertionError::MissingNameId)?;
    let name_id = name_id_element.text().trim().to_string();
    if name_id.is_empty() {
        return Err(AssertionError::MissingNameId);
    }

    Ok(ValidatedAssertion {
        assertion_id,
        name_id,
        name_id_format: name_id_element.attr("Format").map(str::to_string),
        attributes: collect_attributes(assertion),
        expires_at: expires_at.min(confirmation_expiry),
    })
}

fn reject_duplicate_ids(root: &Element) -> Result<(), AssertionError> {
    let mut seen = HashSet::new();
    for element in root.descendants() {
        if let Some(id) = element.attr("ID") {
            if !seen.insert(id) {
                return Err(AssertionError::DuplicateId(id.to_string()));
            }
        }
    }
    Ok(())
}

fn check_conditions(
    conditions: &Element,
    expect: &AssertionExpectations<'_>,
) -> Result<DateTime<Utc>, AssertionError> {
    if let Some(not_before) = conditions.attr("NotBefore") {
        if parse_instant(not_before)? > expect.now + expect.clock_skew {
            return Err(AssertionError::NotYetValid);
        }
    }
    let not_on_or_after = conditions
        .attr("NotOnOrAfter")
        .ok_or_else(|| AssertionError::Malformed("Conditions without NotOnOrAfter".into()))
        .and_then(parse_instant)?;
    if expect.now - expect.clock_skew >= not_on_or_after {
        return Err(AssertionError::Expired);
    }

    let restrictions: Vec<&Element> = conditions
        .children_named(ASSERTION_NS, "AudienceRestriction")
        .collect();
    if restrictions.is_empty() {
        return Err(AssertionError::Audience);
    }
    for restriction in restrictions {
        let listed = restriction
            .children_named(ASSERTION_NS, "Audience")
            .any(|a| a.text().trim() == expect.sp_entity_id);
        if !listed {
            return Err(AssertionError::Audience);
        }
    }

    Ok(not_on_or_after)
}

fn check_subject_confirmation(
    subject: &Element,
    expect: &AssertionExpectations<'_>,
    response_in_response_to: Option<&str>,
) -> Result<DateTime<Utc>, AssertionError> {
    for confirmation in subject.children_named(ASSERTION_NS, "SubjectConfirmation") {
        if confirmation.attr("Method") != Some(BEARER_METHOD) {
            continue;
        }
        let Some(data) = confirmation.child(ASSERTION_NS, "SubjectConfirmationData") else {
            continue;
        };
        if data.attr("Recipient") != Some(expect.acs_url) {
            continue;
        }
        let in_response_to = data.attr("InResponseTo").or(response_in_response_to);
        if in_response_to != Some(expect.request_id) {
            return Err(AssertionError::InResponseTo);
        }
        if let Some(not_before) = data.attr("NotBefore") {
            if parse_instant(not_before)? > expect.now + expect.clock_skew {
                continue;
            }
        }
        let Some(not_on_or_after) = data.attr("NotOnOrAfter") else {
            continue;
        };
        let not_on_or_after = parse_instant(not_on_or_after)?;
        if expect.now - expect.clock_skew >= not_on_or_after {
            continue;
        }
        return Ok(not_on_or_after);
    }
    Err(AssertionError::SubjectConfirmation)
}

fn collect_attributes(assertion: &Element) -> BTreeMap<String, Vec<String>> {
    let mut attributes: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for statement in assertion.children_named(ASSERTION_NS, "AttributeStatement") {
        for attribute in statement.children_named(ASSERTION_NS, "Attribute") {
            let values: Vec<String> = attribute
                .children_named(ASSERTION_NS, "AttributeValue")
                .map(|v| v.text().trim().to_string())
                .collect();
            for key in [attribute.attr("Name"), attribute.attr("FriendlyName")]
                .into_iter()
                .flatten()
            {
                attributes
                    .entry(key.to_string())
                    .or_default()
                    .extend(values.iter().cloned());
            }
        }
    }
    attributes
}

fn parse_instant(value: &str) -> Result<DateTime<Utc>, AssertionError> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| AssertionError::Malformed(format!("invalid instant {:?}: {}", value, e)))
}
