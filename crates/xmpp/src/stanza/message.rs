use std::collections::BTreeMap;

use minidom::Element;

use super::{StanzaBase, is_error_child};
use crate::error::XmppError;
use crate::jid::Jid;
use crate::parser::ns;

/// A `<message/>` stanza.
///
/// Bodies and subjects are keyed by `xml:lang`; the empty key holds the text
/// in the stream's default language.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    /// Shared stanza fields
    pub base: StanzaBase,
    /// Message bodies by language
    pub bodies: BTreeMap<String, String>,
    /// Message subjects by language
    pub subjects: BTreeMap<String, String>,
    /// Conversation thread identifier
    pub thread: Option<String>,
}

impl Message {
    /// An empty message with a generated id.
    pub fn new() -> Self {
        Self {
            base: StanzaBase::with_generated_id(),
            ..Self::default()
        }
    }

    /// A `chat` message to `to` with a default-language body.
    pub fn chat(to: Jid, body: impl Into<String>) -> Self {
        let mut message = Self::new();
        message.base.to = Some(to);
        message.base.set_type(Some("chat"));
        message.bodies.insert(String::new(), body.into());
        message
    }

    /// The default-language body.
    pub fn body(&self) -> Option<&str> {
        self.bodies.get("").map(String::as_str)
    }

    /// The default-language subject.
    pub fn subject(&self) -> Option<&str> {
        self.subjects.get("").map(String::as_str)
    }

    pub(super) fn decode(element: &Element, lenient: bool) -> Result<Self, XmppError> {
        let mut message = Self {
            base: StanzaBase::decode(element, lenient)?,
            ..Self::default()
        };

        for child in element.children() {
            if is_error_child(element, child) {
                continue;
            }
            if child.ns() != element.ns() {
                message.base.extensions.push(child.clone());
                continue;
            }
            let lang = child.attr("xml:lang").unwrap_or_default().to_string();
            match child.name() {
                "body" => {
                    message.bodies.insert(lang, child.text());
                }
                "subject" => {
                    message.subjects.insert(lang, child.text());
                }
                "thread" => message.thread = Some(child.text()),
                _ => message.base.extensions.push(child.clone()),
            }
        }

        Ok(message)
    }

    /// Encode as a `<message/>` element.
    pub fn to_element(&self) -> Element {
        let mut payload = Vec::new();
        payload.extend(localized("subject", &self.subjects));
        payload.extend(localized("body", &self.bodies));
        if let Some(thread) = &self.thread {
            payload.push(
                Element::builder("thread", ns::JABBER_CLIENT)
                    .append(thread.clone())
                    .build(),
            );
        }
        self.base.encode("message", payload)
    }
}

/// One element per language, with `xml:lang` set on all but the default.
pub(super) fn localized<'a>(
    name: &'a str,
    texts: &'a BTreeMap<String, String>,
) -> impl Iterator<Item = Element> + 'a {
    texts.iter().map(move |(lang, text)| {
        let mut builder = Element::builder(name, ns::JABBER_CLIENT).append(text.clone());
        if !lang.is_empty() {
            builder = builder.attr("xml:lang", lang.as_str());
        }
        builder.build()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bodies_are_keyed_by_language() {
        let element: Element = "<message xmlns='jabber:client' type='chat' id='m1'>\
            <body>Hello</body><body xml:lang='de'>Hallo</body>\
            <subject>Greeting</subject><thread>t-42</thread></message>"
            .parse()
            .unwrap();

        let message = Message::decode(&element, false).unwrap();
        assert_eq!(message.body(), Some("Hello"));
        assert_eq!(message.bodies.get("de").map(String::as_str), Some("Hallo"));
        assert_eq!(message.subject(), Some("Greeting"));
        assert_eq!(message.thread.as_deref(), Some("t-42"));
        assert!(message.base.extensions.is_empty());
    }

    #[test]
    fn foreign_children_become_extensions() {
        let element: Element = "<message xmlns='jabber:client' id='m2'>\
            <request xmlns='urn:xmpp:receipts'/></message>"
            .parse()
            .unwrap();

        let message = Message::decode(&element, false).unwrap();
        assert!(message.base.extension("urn:xmpp:receipts").is_some());
    }

    #[test]
    fn chat_message_encodes_body_and_type() {
        let message = Message::chat(Jid::parse("juliet@capulet.com").unwrap(), "O Romeo");
        let element = message.to_element();

        assert_eq!(element.attr("type"), Some("chat"));
        assert_eq!(element.attr("to"), Some("juliet@capulet.com"));
        assert!(element.attr("id").is_some());
        assert_eq!(
            element.get_child("body", ns::JABBER_CLIENT).map(Element::text),
            Some("O Romeo".to_string())
        );

        let decoded = Message::decode(&element, false).unwrap();
        assert_eq!(decoded, message);
    }
}
