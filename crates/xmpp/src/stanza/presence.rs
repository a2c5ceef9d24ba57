use std::collections::BTreeMap;

use minidom::Element;

use super::message::localized;
use super::{StanzaBase, is_error_child};
use crate::error::XmppError;
use crate::parser::ns;

/// Availability sub-state carried in `<show/>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Show {
    /// Temporarily away
    Away,
    /// Actively interested in chatting
    Chat,
    /// Do not disturb
    Dnd,
    /// Extended away
    Xa,
}

impl Show {
    /// Element text.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Away => "away",
            Self::Chat => "chat",
            Self::Dnd => "dnd",
            Self::Xa => "xa",
        }
    }

    /// Parse element text.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "away" => Some(Self::Away),
            "chat" => Some(Self::Chat),
            "dnd" => Some(Self::Dnd),
            "xa" => Some(Self::Xa),
            _ => None,
        }
    }
}

/// A `<presence/>` stanza.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Presence {
    /// Shared stanza fields
    pub base: StanzaBase,
    /// Status texts by language
    pub statuses: BTreeMap<String, String>,
    /// Availability sub-state
    pub show: Option<Show>,
    /// Resource priority (-128..=127)
    pub priority: Option<i8>,
}

impl Presence {
    /// An available presence with no addressing.
    pub fn available() -> Self {
        Self::default()
    }

    /// An unavailable presence.
    pub fn unavailable() -> Self {
        let mut presence = Self::default();
        presence.base.set_type(Some("unavailable"));
        presence
    }

    /// The default-language status.
    pub fn status(&self) -> Option<&str> {
        self.statuses.get("").map(String::as_str)
    }

    /// Strict decoding rejects unknown `<show/>` values and out-of-range
    /// priorities; lenient decoding drops them.
    pub(super) fn decode(element: &Element, lenient: bool) -> Result<Self, XmppError> {
        let mut presence = Self {
            base: StanzaBase::decode(element, lenient)?,
            ..Self::default()
        };

        for child in element.children() {
            if is_error_child(element, child) {
                continue;
            }
            if child.ns() != element.ns() {
                presence.base.extensions.push(child.clone());
                continue;
            }
            match child.name() {
                "status" => {
                    let lang = child.attr("xml:lang").unwrap_or_default().to_string();
                    presence.statuses.insert(lang, child.text());
                }
                "show" => {
                    let text = child.text();
                    presence.show = Show::from_name(text.trim());
                    if presence.show.is_none() && !lenient {
                        return Err(XmppError::xml_parse(format!("invalid show value '{}'", text)));
                    }
                }
                "priority" => {
                    let text = child.text();
                    presence.priority = text.trim().parse::<i8>().ok();
                    if presence.priority.is_none() && !lenient {
                        return Err(XmppError::xml_parse(format!(
                            "invalid priority value '{}'",
                            text
                        )));
                    }
                }
                _ => presence.base.extensions.push(child.clone()),
            }
        }

        Ok(presence)
    }

    /// Encode as a `<presence/>` element.
    pub fn to_element(&self) -> Element {
        let mut payload = Vec::new();
        if let Some(show) = self.show {
            payload.push(
                Element::builder("show", ns::JABBER_CLIENT)
                    .append(show.as_str().to_string())
                    .build(),
            );
        }
        payload.extend(localized("status", &self.statuses));
        if let Some(priority) = self.priority {
            payload.push(
                Element::builder("priority", ns::JABBER_CLIENT)
                    .append(priority.to_string())
                    .build(),
            );
        }
        self.base.encode("presence", payload)
    }
}
