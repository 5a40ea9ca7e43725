//! Minimal namespace-aware XML tree for SAML messages, and canonical
//! serialization of subtrees for signature checks.
//!
//! The parser refuses DTDs, so entity expansion is limited to the five
//! predefined entities and character references. Comments and processing
//! instructions are dropped; they are not part of the canonical form.

use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::BTreeMap;
use thiserror::Error;
use xml_canonicalization::Canonicalizer;

const XMLNS_URI: &str = "http://www.w3.org/2000/xmlns/";
const XML_URI: &str = "http://www.w3.org/XML/1998/namespace";

/// Upper bound on element nesting.
const MAX_DEPTH: usize = 64;

#[derive(Debug, Error)]
pub enum XmlError {
    #[error("XML parse error: {0}")]
    Parse(String),

    #[error("Document type declarations are not allowed")]
    DoctypeNotAllowed,

    #[error("Undeclared namespace prefix: {0}")]
    UndeclaredPrefix(String),

    #[error("Document has no root element")]
    Empty,

    #[error("Document nesting exceeds {0} levels")]
    TooDeep(usize),

    #[error("Canonicalization failed: {0}")]
    Canonicalization(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub prefix: Option<String>,
    pub local: String,
    pub namespace: Option<String>,
    pub value: String,
}

#[derive(Debug, Clone)]
pub enum Node {
    Element(Element),
    Text(String),
}

#[derive(Debug, Clone)]
pub struct Element {
    pub prefix: Option<String>,
    pub local: String,
    pub namespace: Option<String>,
    pub attributes: Vec<Attribute>,
    /// Every namespace binding in scope at this element, keyed by prefix
    /// (`""` is the default namespace).
    pub in_scope: BTreeMap<String, String>,
    pub children: Vec<Node>,
}

impl Element {
    pub fn is(&self, namespace: &str, local: &str) -> bool {
        self.local == local && self.namespace.as_deref() == Some(namespace)
    }

    /// Value of an attribute without a namespace.
    pub fn attr(&self, local: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.namespace.is_none() && a.local == local)
            .map(|a| a.value.as_str())
    }

    pub fn child_elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|n| match n {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        })
    }

    pub fn children_named<'a, 'b>(
        &'a self,
        namespace: &'b str,
        local: &'b str,
    ) -> impl Iterator<Item = &'a Element> + 'b
    where
        'a: 'b,
    {
        self.child_elements().filter(move |e| e.is(namespace, local))
    }

    pub fn child<'a>(&'a self, namespace: &str, local: &str) -> Option<&'a Element> {
        self.children_named(namespace, local).next()
    }

    /// Concatenation of all direct text children.
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|n| match n {
                Node::Text(t) => Some(t.as_str()),
                Node::Element(_) => None,
            })
            .collect()
    }

    /// Depth-first walk over this element and all descendants.
    pub fn descendants(&self) -> Vec<&Element> {
        let mut out = vec![self];
        let mut i = 0;
        while i < out.len() {
            let current = out[i];
            out.extend(current.child_elements());
            i += 1;
        }
        out
    }

    fn qualified_name(&self) -> String {
        match &self.prefix {
            Some(p) => format!("{}:{}", p, self.local),
            None => self.local.clone(),
        }
    }
}

/// Parse a complete document and return its root element.
pub fn parse(xml: &str) -> Result<Element, XmlError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(false);
    reader.config_mut().expand_empty_elements = true;

    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) => {
                if root.is_some() {
                    return Err(XmlError::Parse("content after root element".into()));
                }
                if stack.len() >= MAX_DEPTH {
                    return Err(XmlError::TooDeep(MAX_DEPTH));
                }
                let parent_scope = stack.last().map(|e| &e.in_scope);
                stack.push(start_element(&start, parent_scope)?);
            }
            Ok(Event::End(_)) => {
                let finished = stack
                    .pop()
                    .ok_or_else(|| XmlError::Parse("unbalanced end tag".into()))?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(Node::Element(finished)),
                    None => root = Some(finished),
                }
            }
            Ok(Event::Text(text)) => {
                let raw = std::str::from_utf8(&text)
                    .map_err(|e| XmlError::Parse(e.to_string()))?;
                let value = quick_xml::escape::unescape(&normalize_line_endings(raw))
                    .map_err(|e| XmlError::Parse(e.to_string()))?
                    .into_owned();
                push_text(&mut stack, value)?;
            }
            Ok(Event::CData(data)) => {
                let raw = std::str::from_utf8(&data)
                    .map_err(|e| XmlError::Parse(e.to_string()))?;
                push_text(&mut stack, normalize_line_endings(raw))?;
            }
            Ok(Event::DocType(_)) => return Err(XmlError::DoctypeNotAllowed),
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(XmlError::Parse(e.to_string())),
        }
    }

    if !stack.is_empty() {
        return Err(XmlError::Parse("unclosed element".into()));
    }
    root.ok_or(XmlError::Empty)
}

fn push_text(stack: &mut [Element], value: String) -> Result<(), XmlError> {
    match stack.last_mut() {
        Some(parent) => {
            if let Some(Node::Text(prev)) = parent.children.last_mut() {
                prev.push_str(&value);
            } else {
                parent.children.push(Node::Text(value));
            }
            Ok(())
        }
        None if value.trim().is_empty() => Ok(()),
        None => Err(XmlError::Parse("text outside root element".into())),
    }
}

fn start_element(
    start: &BytesStart<'_>,
    parent_scope: Option<&BTreeMap<String, String>>,
) -> Result<Element, XmlError> {
    let mut in_scope = parent_scope.cloned().unwrap_or_default();
    let mut raw_attributes = Vec::new();

    for attr in start.attributes() {
        let attr = attr.map_err(|e| XmlError::Parse(e.to_string()))?;
        let key = std::str::from_utf8(attr.key.as_ref())
            .map_err(|e| XmlError::Parse(e.to_string()))?
            .to_string();
        let raw = std::str::from_utf8(&attr.value).map_err(|e| XmlError::Parse(e.to_string()))?;
        let value = quick_xml::escape::unescape(&normalize_attribute(raw))
            .map_err(|e| XmlError::Parse(e.to_string()))?
            .into_owned();

        if key == "xmlns" {
            in_scope.insert(String::new(), value);
        } else if let Some(prefix) = key.strip_prefix("xmlns:") {
            in_scope.insert(prefix.to_string(), value);
        } else {
            raw_attributes.push((key, value));
        }
    }
    // An empty default namespace undeclares it.
    if in_scope.get("").is_some_and(|v| v.is_empty()) {
        in_scope.remove("");
    }

    let name = std::str::from_utf8(start.name().as_ref())
        .map_err(|e| XmlError::Parse(e.to_string()))?
        .to_string();
    let (prefix, local) = split_qname(&name);
    let namespace = match &prefix {
        Some(p) => Some(resolve_prefix(&in_scope, p)?),
        None => in_scope.get("").cloned(),
    };

    let mut attributes = Vec::with_capacity(raw_attributes.len());
    for (key, value) in raw_attributes {
        let (prefix, local) = split_qname(&key);
        let namespace = match &prefix {
            Some(p) => Some(resolve_prefix(&in_scope, p)?),
            None => None,
        };
        attributes.push(Attribute {
            prefix,
            local,
            namespace,
            value,
        });
    }

    Ok(Element {
        prefix,
        local,
        namespace,
        attributes,
        in_scope,
        children: Vec::new(),
    })
}

fn resolve_prefix(scope: &BTreeMap<String, String>, prefix: &str) -> Result<String, XmlError> {
    if prefix == "xml" {
        return Ok(XML_URI.to_string());
    }
    if prefix == "xmlns" {
        return Ok(XMLNS_URI.to_string());
    }
    scope
        .get(prefix)
        .cloned()
        .ok_or_else(|| XmlError::UndeclaredPrefix(prefix.to_string()))
}

fn split_qname(name: &str) -> (Option<String>, String) {
    match name.split_once(':') {
        Some((prefix, local)) => (Some(prefix.to_string()), local.to_string()),
        None => (None, name.to_string()),
    }
}

fn normalize_line_endings(raw: &str) -> String {
    raw.replace("\r\n", "\n").replace('\r', "\n")
}

fn normalize_attribute(raw: &str) -> String {
    normalize_line_endings(raw).replace(['\t', '\n'], " ")
}

/// Exclusive XML Canonicalization (omit comments) of `element` and its
/// subtree.
///
/// The subtree is first written out as a standalone document: each
/// namespace binding is declared on the element that first uses it, the
/// InclusiveNamespaces `PrefixList` (`#default` names the default namespace)
/// is declared on the apex, and `exclude` (the enveloped signature) is left
/// out. The canonical form itself comes from `xml_canonicalization`.
pub fn canonicalize(
    element: &Element,
    inclusive_prefixes: &[String],
    exclude: Option<&Element>,
) -> Result<String, XmlError> {
    let mut fragment = String::new();
    write_fragment(
        element,
        &BTreeMap::new(),
        Some(inclusive_prefixes),
        exclude,
        &mut fragment,
    );

    let mut output = Vec::new();
    Canonicalizer::read_from_str(&fragment)
        .write_to_writer(&mut output)
        .canonicalize(false)
        .map_err(|e| XmlError::Canonicalization(e.to_string()))?;
    String::from_utf8(output).map_err(|e| XmlError::Canonicalization(e.to_string()))
}

fn write_fragment(
    element: &Element,
    declared: &BTreeMap<String, String>,
    inclusive_prefixes: Option<&[String]>,
    exclude: Option<&Element>,
    out: &mut String,
) {
    let mut used: Vec<String> = vec![element.prefix.clone().unwrap_or_default()];
    for attr in &element.attributes {
        if let Some(p) = &attr.prefix {
            if p != "xml" && !used.contains(p) {
                used.push(p.clone());
            }
        }
    }
    for p in inclusive_prefixes.unwrap_or_default() {
        let key = if p == "#default" { String::new() } else { p.clone() };
        if element.in_scope.contains_key(&key) && !used.contains(&key) {
            used.push(key);
        }
    }

    let mut now_declared = declared.clone();
    let name = element.qualified_name();
    out.push('<');
    out.push_str(&name);
    for prefix in used {
        let uri = element.in_scope.get(&prefix).cloned().unwrap_or_default();
        if declared.get(&prefix).cloned().unwrap_or_default() == uri {
            continue;
        }
        if prefix.is_empty() {
            out.push_str(" xmlns=\"");
        } else {
            out.push_str(" xmlns:");
            out.push_str(&prefix);
            out.push_str("=\"");
        }
        push_escaped(&uri, out);
        out.push('"');
        now_declared.insert(prefix, uri);
    }
    for attr in &element.attributes {
        out.push(' ');
        if let Some(p) = &attr.prefix {
            out.push_str(p);
            out.push(':');
        }
        out.push_str(&attr.local);
        out.push_str("=\"");
        push_escaped(&attr.value, out);
        out.push('"');
    }
    out.push('>');

    for child in &element.children {
        match child {
            Node::Text(text) => push_escaped(text, out),
            Node::Element(e) => {
                if exclude.is_some_and(|x| std::ptr::eq(x, e)) {
                    continue;
                }
                write_fragment(e, &now_declared, None, exclude, out);
            }
        }
    }

    out.push_str("</");
    out.push_str(&name);
    out.push('>');
}

/// Escapes markup plus the whitespace characters a parser would otherwise
/// normalize away.
fn push_escaped(value: &str, out: &mut String) {
    for c in escape(value).chars() {
        match c {
            '\t' => out.push_str("&#x9;"),
            '\n' => out.push_str("&#xA;"),
            '\r' => out.push_str("&#xD;"),
            _ => out.push(c),
        }
    }
}
