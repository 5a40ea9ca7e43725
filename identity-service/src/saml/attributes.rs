use crate::models::AttributeMapping;
use crate::services::provisioning::FederatedIdentity;

use super::assertion::ValidatedAssertion;

/// Attribute names commonly used for the mail address when no mapping is
/// configured and NameID is not an address.
const EMAIL_FALLBACKS: &[&str] = &[
    "email",
    "mail",
    "emailAddress",
    "urn:oid:0.9.2342.19200300.100.1.3",
    "http://schemas.xmlsoap.org/ws/2005/05/identity/claims/emailaddress",
];

/// Build the identity tuple handed to provisioning. `None` when no email
/// can be found.
pub fn map_identity(
    assertion: &ValidatedAssertion,
    mapping: &AttributeMapping,
    sso_provider: &str,
) -> Option<FederatedIdentity> {
    let email = match &mapping.email {
        Some(name) => assertion.first_attribute(name).map(str::to_string),
        None if assertion.name_id.contains('@') => Some(assertion.name_id.clone()),
        None => EMAIL_FALLBACKS
            .iter()
            .find_map(|name| assertion.first_attribute(name))
            .map(str::to_string),
    }?;

    let lookup = |name: &Option<String>| {
        name.as_deref()
            .and_then(|n| assertion.first_attribute(n))
            .map(str::to_string)
    };

    Some(FederatedIdentity {
        email,
        display_name: lookup(&mapping.display_name),
        given_name: lookup(&mapping.first_name),
        family_name: lookup(&mapping.last_name),
        external_subject_id: assertion.name_id.clone(),
        sso_provider: sso_provider.to_string(),
    })
}
