//! `<stream:features/>` as advertised by the server.

use std::collections::BTreeMap;

use minidom::Element;

use crate::error::XmppError;
use crate::parser::ns;

/// What the server offers on the current stream.
///
/// A fresh value is built for every stream header; restarting the stream
/// replaces it with the default.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamFeatures {
    /// STARTTLS is offered
    pub tls_supported: bool,
    /// STARTTLS is mandatory before anything else
    pub tls_required: bool,
    /// SASL mechanisms in server order, without duplicates
    pub sasl_mechanisms: Vec<String>,
    /// Resource binding is offered
    pub binding_supported: bool,
    /// Legacy session establishment is offered
    pub session_supported: bool,
    /// Session establishment may be skipped (RFC 3921 bis `<optional/>`)
    pub session_optional: bool,
    /// Every other feature keyed by namespace, with its element
    pub other_features: BTreeMap<String, Option<Element>>,
}

impl StreamFeatures {
    /// Parse a `<stream:features/>` element.
    pub fn from_element(element: &Element) -> Result<Self, XmppError> {
        if !element.is("features", ns::STREAM) {
            return Err(XmppError::unexpected_element(
                "where stream features were expected",
                element.name(),
                &element.ns(),
            ));
        }

        let mut features = StreamFeatures::default();
        for child in element.children() {
            let child_ns = child.ns();
            match (child.name(), child_ns.as_str()) {
                ("starttls", ns::TLS) => {
                    features.tls_supported = true;
                    features.tls_required = child.get_child("required", ns::TLS).is_some();
                }
                ("mechanisms", ns::SASL) => {
                    for mechanism in child.children().filter(|m| m.is("mechanism", ns::SASL)) {
                        let name = mechanism.text().trim().to_string();
                        if !name.is_empty() && !features.sasl_mechanisms.contains(&name) {
                            features.sasl_mechanisms.push(name);
                        }
                    }
                }
                ("bind", ns::BIND) => features.binding_supported = true,
                ("session", ns::SESSION) => {
                    features.session_supported = true;
                    features.session_optional = child.get_child("optional", ns::SESSION).is_some();
                }
                _ => {
                    features
                        .other_features
                        .insert(child_ns.clone(), Some(child.clone()));
                }
            }
        }

        Ok(features)
    }

    /// Whether `mechanism` was advertised.
    pub fn offers_mechanism(&self, mechanism: &str) -> bool {
        self.sasl_mechanisms.iter().any(|m| m == mechanism)
    }

    /// Whether a feature in `namespace` was advertised.
    pub fn has_feature(&self, namespace: &str) -> bool {
        match namespace {
            ns::TLS => self.tls_supported,
            ns::SASL => !self.sasl_mechanisms.is_empty(),
            ns::BIND => self.binding_supported,
            ns::SESSION => self.session_supported,
            other => self.other_features.contains_key(other),
        }
    }
}
