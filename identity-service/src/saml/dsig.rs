//! Enveloped XML-DSig verification.
//!
//! Only RSA-SHA256 signatures over a single same-document reference, with
//! Exclusive C14N and SHA-256 digests, are accepted.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use rsa::pkcs8::DecodePublicKey;
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Sign, RsaPublicKey};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

use super::xml::{canonicalize, Element};

pub const DSIG_NS: &str = "http://www.w3.org/2000/09/xmldsig#";
pub const EXC_C14N: &str = "http://www.w3.org/2001/10/xml-exc-c14n#";
pub const ENVELOPED_SIGNATURE: &str = "http://www.w3.org/2000/09/xmldsig#enveloped-signature";
pub const RSA_SHA256: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256";
pub const SHA256_DIGEST: &str = "http://www.w3.org/2001/04/xmlenc#sha256";

const MIN_RSA_KEY_BYTES: usize = 256;

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("Element is not signed")]
    Missing,

    #[error("Malformed signature: {0}")]
    Malformed(String),

    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Signature reference does not point at the signed element")]
    ReferenceMismatch,

    #[error("Digest mismatch")]
    DigestMismatch,

    #[error("Signature value does not verify")]
    InvalidSignature,

    #[error("Invalid signing key: {0}")]
    InvalidKey(String),
}

/// Load an IdP verification key from an X.509 certificate (PEM or bare
/// base64 DER) or an SPKI `PUBLIC KEY` PEM.
pub fn parse_signing_key(material: &str) -> Result<RsaPublicKey, SignatureError> {
    let trimmed = material.trim();

    let key = if trimmed.starts_with("-----BEGIN PUBLIC KEY-----") {
        RsaPublicKey::from_public_key_pem(trimmed)
            .map_err(|e| SignatureError::InvalidKey(e.to_string()))?
    } else {
        let der = if trimmed.starts_with("-----BEGIN CERTIFICATE-----") {
            let (_, pem) = x509_parser::pem::parse_x509_pem(trimmed.as_bytes())
                .map_err(|e| SignatureError::InvalidKey(e.to_string()))?;
            pem.contents
        } else {
            let compact: String = trimmed.split_whitespace().collect();
            STANDARD
                .decode(compact)
                .map_err(|e| SignatureError::InvalidKey(e.to_string()))?
        };
        let (_, cert) = x509_parser::parse_x509_certificate(&der)
            .map_err(|e| SignatureError::InvalidKey(e.to_string()))?;
        RsaPublicKey::from_public_key_der(cert.public_key().raw)
            .map_err(|e| SignatureError::InvalidKey(e.to_string()))?
    };

    if key.size() < MIN_RSA_KEY_BYTES {
        return Err(SignatureError::InvalidKey(format!(
            "RSA key must be at least {} bits",
            MIN_RSA_KEY_BYTES * 8
        )));
    }
    Ok(key)
}

/// The `ds:Signature` that is a direct child of `element`, if any.
pub fn enveloped_signature(element: &Element) -> Option<&Element> {
    element.child(DSIG_NS, "Signature")
}

/// Verify the enveloped signature carried by `element` against `key`.
pub fn verify_enveloped(element: &Element, key: &RsaPublicKey) -> Result<(), SignatureError> {
    let mut signatures = element.children_named(DSIG_NS, "Signature");
    let signature = signatures.next().ok_or(SignatureError::Missing)?;
    if signatures.next().is_some() {
        return Err(SignatureError::Malformed("multiple Signature elements".into()));
    }

    let signed_info = required_child(signature, "SignedInfo")?;

    let c14n_method = required_child(signed_info, "CanonicalizationMethod")?;
    require_algorithm(c14n_method, EXC_C14N)?;
    let signed_info_prefixes = inclusive_prefixes(c14n_method);

    require_algorithm(required_child(signed_info, "SignatureMethod")?, RSA_SHA256)?;

    let mut references = signed_info.children_named(DSIG_NS, "Reference");
    let reference = references
        .next()
        .ok_or_else(|| SignatureError::Malformed("missing Reference".into()))?;
    if references.next().is_some() {
        return Err(SignatureError::Malformed("multiple Reference elements".into()));
    }

    let id = element
        .attr("ID")
        .filter(|id| !id.is_empty())
        .ok_or(SignatureError::ReferenceMismatch)?;
    match reference.attr("URI").and_then(|uri| uri.strip_prefix('#')) {
        Some(target) if target == id => {}
        _ => return Err(SignatureError::ReferenceMismatch),
    }

    let mut saw_enveloped = false;
    let mut saw_exc_c14n = false;
    let mut digest_prefixes = Vec::new();
    if let Some(transforms) = reference.child(DSIG_NS, "Transforms") {
        for transform in transforms.children_named(DSIG_NS, "Transform") {
            match transform.attr("Algorithm") {
                Some(ENVELOPED_SIGNATURE) => saw_enveloped = true,
                Some(EXC_C14N) => {
                    saw_exc_c14n = true;
                    digest_prefixes = inclusive_prefixes(transform);
                }
                Some(other) => return Err(SignatureError::UnsupportedAlgorithm(other.to_string())),
                None => return Err(SignatureError::Malformed("Transform without Algorithm".into())),
            }
        }
    }
    if !saw_enveloped || !saw_exc_c14n {
        return Err(SignatureError::Malformed(
            "expected enveloped-signature and exclusive c14n transforms".into(),
        ));
    }

    require_algorithm(required_child(reference, "DigestMethod")?, SHA256_DIGEST)?;
    let expected_digest = decode_base64(&required_child(reference, "DigestValue")?.text())?;

    let canonical = canonicalize(element, &digest_prefixes, Some(signature))
        .map_err(|e| SignatureError::Malformed(e.to_string()))?;
    let actual_digest = Sha256::digest(canonical.as_bytes());
    if !bool::from(actual_digest.as_slice().ct_eq(expected_digest.as_slice())) {
        return Err(SignatureError::DigestMismatch);
    }

    let signature_value = decode_base64(&required_child(signature, "SignatureValue")?.text())?;
    let canonical_signed_info = canonicalize(signed_info, &signed_info_prefixes, None)
        .map_err(|e| SignatureError::Malformed(e.to_string()))?;
    let hashed = Sha256::digest(canonical_signed_info.as_bytes());

    key.verify(Pkcs1v15Sign::new::<Sha256>(), &hashed, &signature_value)
        .map_err(|_| SignatureError::InvalidSignature)
}

fn required_child<'a>(parent: &'a Element, local: &str) -> Result<&'a Element, SignatureError> {
    parent
        .child(DSIG_NS, local)
        .ok_or_else(|| SignatureError::Malformed(format!("missing {}", local)))
}

fn require_algorithm(element: &Element, expected: &str) -> Result<(), SignatureError> {
    match element.attr("Algorithm") {
        Some(alg) if alg == expected => Ok(()),
        Some(alg) => Err(SignatureError::UnsupportedAlgorithm(alg.to_string())),
        None => Err(SignatureError::Malformed(format!(
            "{} without Algorithm",
            element.local
        ))),
    }
}

fn inclusive_prefixes(method: &Element) -> Vec<String> {
    method
        .child(EXC_C14N, "InclusiveNamespaces")
        .and_then(|e| e.attr("PrefixList"))
        .map(|list| list.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}

fn decode_base64(text: &str) -> Result<Vec<u8>, SignatureError> {
    let compact: String = text.split_whitespace().collect();
    STANDARD
        .decode(compact)
        .map_err(|e| SignatureError::Malformed(format!("invalid base64: {}", e)))
}
