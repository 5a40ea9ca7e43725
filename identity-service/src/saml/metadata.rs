//! SP metadata document.

use quick_xml::escape::escape;

use super::{HTTP_POST_BINDING, METADATA_NS, NAMEID_FORMAT_EMAIL, PROTOCOL_NS};

pub fn sp_metadata(sp_entity_id: &str, acs_url: &str, name_id_format: Option<&str>) -> String {
    format!(
        concat!(
            r#"<?xml version="1.0" encoding="UTF-8"?>"#,
            r#"<md:EntityDescriptor xmlns:md="{md}" entityID="{entity}">"#,
            r#"<md:SPSSODescriptor AuthnRequestsSigned="false" WantAssertionsSigned="true" "#,
            r#"protocolSupportEnumeration="{protocol}">"#,
            r#"<md:NameIDFormat>{format}</md:NameIDFormat>"#,
            r#"<md:AssertionConsumerService Binding="{binding}" Location="{acs}" index="0" isDefault="true"/>"#,
            r#"</md:SPSSODescriptor></md:EntityDescriptor>"#
        ),
        md = METADATA_NS,
        entity = escape(sp_entity_id),
        protocol = PROTOCOL_NS,
        format = escape(name_id_format.unwrap_or(NAMEID_FORMAT_EMAIL)),
        binding = HTTP_POST_BINDING,
        acs = escape(acs_url),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::saml::xml::parse;

    #[test]
    fn metadata_lists_the_post_acs() {
        let xml = sp_metadata("https://sp.example.com/m?a=1&b=2", "https://sp.example.com/acs", None);
        let root = parse(&xml).unwrap();
        assert_eq!(root.attr("entityID"), Some("https://sp.example.com/m?a=1&b=2"));

        let descriptor = root.child(METADATA_NS, "SPSSODescriptor").unwrap();
        let acs = descriptor
            .child(METADATA_NS, "AssertionConsumerService")
            .unwrap();
        assert_eq!(acs.attr("Binding"), Some(HTTP_POST_BINDING));
        assert_eq!(acs.attr("Location"), Some("https://sp.example.com/acs"));
        assert_eq!(
            descriptor.child(METADATA_NS, "NameIDFormat").unwrap().text(),
            NAMEID_FORMAT_EMAIL
        );
    }
}
