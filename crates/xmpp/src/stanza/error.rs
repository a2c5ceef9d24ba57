//! The `<error/>` payload carried by stanzas of type `error`.

use std::fmt;

use minidom::Element;

use crate::error::{StanzaErrorCondition, StanzaErrorType};
use crate::parser::ns;

/// A decoded stanza error (RFC 6120 Section 8.3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StanzaErrorInfo {
    /// Defined condition
    pub condition: StanzaErrorCondition,
    /// Error type
    pub error_type: StanzaErrorType,
    /// Application-specific condition as `(name, namespace)`
    pub application_condition: Option<(String, String)>,
    /// Descriptive text
    pub text: Option<String>,
    /// Language of `text`
    pub text_lang: Option<String>,
}

impl StanzaErrorInfo {
    /// Create an error with just a condition and type.
    pub fn new(condition: StanzaErrorCondition, error_type: StanzaErrorType) -> Self {
        Self {
            condition,
            error_type,
            application_condition: None,
            text: None,
            text_lang: None,
        }
    }

    /// Attach descriptive text.
    pub fn with_text(mut self, text: impl Into<String>, lang: Option<&str>) -> Self {
        self.text = Some(text.into());
        self.text_lang = lang.map(str::to_string);
        self
    }

    /// Decode an `<error/>` element.
    ///
    /// Missing or unknown pieces degrade to `undefined-condition` and
    /// `cancel` rather than failing, so a sloppy server error is still
    /// reported as an error.
    pub fn from_element(element: &Element) -> Self {
        let error_type = element
            .attr("type")
            .and_then(StanzaErrorType::from_name)
            .unwrap_or(StanzaErrorType::Cancel);

        let mut info = Self::new(StanzaErrorCondition::UndefinedCondition, error_type);
        let mut condition_seen = false;

        for child in element.children() {
            if child.ns() == ns::STANZAS {
                if child.name() == "text" {
                    info.text = Some(child.text());
                    info.text_lang = child.attr("xml:lang").map(str::to_string);
                } else if !condition_seen {
                    info.condition = StanzaErrorCondition::from_name(child.name());
                    condition_seen = true;
                }
            } else if info.application_condition.is_none() {
                info.application_condition = Some((child.name().to_string(), child.ns()));
            }
        }

        info
    }

    /// Encode as an `<error/>` element in the given stanza namespace.
    pub fn to_element(&self, stanza_ns: &str) -> Element {
        let mut error = Element::builder("error", stanza_ns)
            .attr("type", self.error_type.as_str())
            .append(Element::builder(self.condition.as_str(), ns::STANZAS).build())
            .build();

        if let Some(text) = &self.text {
            let mut text_element = Element::builder("text", ns::STANZAS).append(text.clone());
            if let Some(lang) = &self.text_lang {
                text_element = text_element.attr("xml:lang", lang.as_str());
            }
            error.append_child(text_element.build());
        }

        if let Some((name, namespace)) = &self.application_condition {
            error.append_child(Element::builder(name.as_str(), namespace.as_str()).build());
        }

        error
    }
}

impl fmt::Display for StanzaErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.condition, self.error_type)?;
        if let Some(text) = &self.text {
            write!(f, ": {}", text)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_condition_text_and_application_condition() {
        let element: Element = "<error xmlns='jabber:client' type='modify'>\
            <bad-request xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/>\
            <text xmlns='urn:ietf:params:xml:ns:xmpp-stanzas' xml:lang='en'>Missing payload</text>\
            <too-many-subscriptions xmlns='http://jabber.org/protocol/pubsub#errors'/>\
            </error>"
            .parse()
            .unwrap();

        let info = StanzaErrorInfo::from_element(&element);
        assert_eq!(info.condition, StanzaErrorCondition::BadRequest);
        assert_eq!(info.error_type, StanzaErrorType::Modify);
        assert_eq!(info.text.as_deref(), Some("Missing payload"));
        assert_eq!(info.text_lang.as_deref(), Some("en"));
        assert_eq!(
            info.application_condition,
            Some((
                "too-many-subscriptions".to_string(),
                "http://jabber.org/protocol/pubsub#errors".to_string()
            ))
        );
    }

    #[test]
    fn missing_pieces_fall_back_to_undefined_cancel() {
        let element: Element = "<error xmlns='jabber:client'/>".parse().unwrap();
        let info = StanzaErrorInfo::from_element(&element);
        assert_eq!(info.condition, StanzaErrorCondition::UndefinedCondition);
        assert_eq!(info.error_type, StanzaErrorType::Cancel);
    }

    #[test]
    fn encoded_error_decodes_to_same_value() {
        let info = StanzaErrorInfo::new(
            StanzaErrorCondition::ItemNotFound,
            StanzaErrorType::Cancel,
        )
        .with_text("no such node", None);

        let element = info.to_element(ns::JABBER_CLIENT);
        assert_eq!(element.attr("type"), Some("cancel"));
        assert!(element.get_child("item-not-found", ns::STANZAS).is_some());
        assert_eq!(StanzaErrorInfo::from_element(&element), info);
    }

    #[test]
    fn display_names_condition_and_type() {
        let info = StanzaErrorInfo::new(StanzaErrorCondition::Conflict, StanzaErrorType::Cancel)
            .with_text("resource in use", Some("en"));
        assert_eq!(info.to_string(), "conflict (cancel): resource in use");
    }
}
