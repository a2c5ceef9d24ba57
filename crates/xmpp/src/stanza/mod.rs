//! Stanza model and codec.
//!
//! Stanzas are decoded from minidom elements into [`Iq`], [`Message`] and
//! [`Presence`]. Anything that cannot be decoded strictly is kept as a
//! [`GenericStanza`] so nothing read off the wire is ever dropped.

mod error;
mod iq;
mod message;
mod presence;

use std::fmt;

use minidom::Element;
use tracing::debug;

use crate::error::XmppError;
use crate::jid::Jid;
use crate::parser::ns;

pub use error::StanzaErrorInfo;
pub use iq::{Iq, IqType};
pub use message::Message;
pub use presence::{Presence, Show};

/// Fields shared by every stanza.
///
/// `type` and `error` are coupled: attaching an error forces the type to
/// `error`, and removing it clears both.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StanzaBase {
    /// Recipient address
    pub to: Option<Jid>,
    /// Sender address
    pub from: Option<Jid>,
    /// Stanza id used to correlate replies
    pub id: Option<String>,
    type_: Option<String>,
    error: Option<StanzaErrorInfo>,
    /// Payload elements not understood by the base model, in document order
    pub extensions: Vec<Element>,
}

impl StanzaBase {
    /// Create an empty base.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a base carrying a freshly generated id.
    pub fn with_generated_id() -> Self {
        Self {
            id: Some(generate_id()),
            ..Self::default()
        }
    }

    /// The `type` attribute.
    pub fn type_(&self) -> Option<&str> {
        self.type_.as_deref()
    }

    /// Set the `type` attribute.
    ///
    /// Changing the type away from `error` drops any attached error.
    pub fn set_type(&mut self, type_: Option<impl Into<String>>) {
        self.type_ = type_.map(Into::into);
        if self.type_.as_deref() != Some("error") {
            self.error = None;
        }
    }

    /// The attached error, if any.
    pub fn error(&self) -> Option<&StanzaErrorInfo> {
        self.error.as_ref()
    }

    /// Attach or remove the error payload.
    pub fn set_error(&mut self, error: Option<StanzaErrorInfo>) {
        self.type_ = error.as_ref().map(|_| "error".to_string());
        self.error = error;
    }

    /// First extension payload in the given namespace.
    pub fn extension(&self, namespace: &str) -> Option<&Element> {
        self.extensions.iter().find(|e| e.ns() == namespace)
    }

    /// Append an extension payload.
    pub fn add_extension(&mut self, payload: Element) {
        self.extensions.push(payload);
    }

    /// Read the common attributes and error child off a stanza element.
    ///
    /// In lenient mode malformed addresses are dropped instead of failing.
    fn decode(element: &Element, lenient: bool) -> Result<Self, XmppError> {
        let address = |name: &str| -> Result<Option<Jid>, XmppError> {
            match element.attr(name).map(Jid::parse) {
                Some(Ok(jid)) => Ok(Some(jid)),
                Some(Err(_)) if lenient => Ok(None),
                Some(Err(e)) => Err(e),
                None => Ok(None),
            }
        };

        let mut base = Self {
            to: address("to")?,
            from: address("from")?,
            id: element.attr("id").map(str::to_string),
            type_: element.attr("type").map(str::to_string),
            error: None,
            extensions: Vec::new(),
        };
        if base.type_.as_deref() == Some("error") {
            base.error = element
                .children()
                .find(|child| is_error_child(element, child))
                .map(StanzaErrorInfo::from_element);
        }
        Ok(base)
    }

    /// Build the stanza element: attributes, then `payload`, then extensions,
    /// then the error.
    fn encode(&self, name: &str, payload: Vec<Element>) -> Element {
        let mut element = Element::builder(name, ns::JABBER_CLIENT)
            .attr("to", self.to.as_ref().map(Jid::to_string))
            .attr("from", self.from.as_ref().map(Jid::to_string))
            .attr("id", self.id.clone())
            .attr("type", self.type_.clone())
            .append_all(payload)
            .build();

        for extension in &self.extensions {
            element.append_child(extension.clone());
        }
        if let Some(error) = &self.error {
            element.append_child(error.to_element(ns::JABBER_CLIENT));
        }
        element
    }
}

fn is_error_child(stanza: &Element, child: &Element) -> bool {
    child.name() == "error" && child.ns() == stanza.ns()
}

/// Generate a fresh stanza id.
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// A top-level stanza recognised by name that could not be decoded strictly.
#[derive(Debug, Clone, PartialEq)]
pub struct GenericStanza {
    /// Element name (`iq`, `message`, `presence`, or something else)
    pub name: String,
    /// Whatever base fields could be read
    pub base: StanzaBase,
    element: Element,
}

impl GenericStanza {
    /// Wrap a raw element.
    pub fn from_element(element: Element) -> Self {
        let mut base = StanzaBase::decode(&element, true).unwrap_or_default();
        base.extensions = element
            .children()
            .filter(|child| !is_error_child(&element, child))
            .cloned()
            .collect();
        Self {
            name: element.name().to_string(),
            base,
            element,
        }
    }

    /// The element as received.
    pub fn element(&self) -> &Element {
        &self.element
    }
}

/// Kind of a stanza, used to steer the lenient re-decode of replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StanzaKind {
    /// `<iq/>`
    Iq,
    /// `<message/>`
    Message,
    /// `<presence/>`
    Presence,
    /// Anything kept raw
    Generic,
}

impl StanzaKind {
    /// Element name for this kind, if it has a fixed one.
    pub fn element_name(&self) -> Option<&'static str> {
        match self {
            Self::Iq => Some("iq"),
            Self::Message => Some("message"),
            Self::Presence => Some("presence"),
            Self::Generic => None,
        }
    }
}

impl fmt::Display for StanzaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.element_name().unwrap_or("generic"))
    }
}

/// A decoded stanza.
#[derive(Debug, Clone, PartialEq)]
pub enum Stanza {
    /// Info/query
    Iq(Box<Iq>),
    /// Message
    Message(Box<Message>),
    /// Presence
    Presence(Box<Presence>),
    /// Anything that did not decode strictly
    Generic(Box<GenericStanza>),
}

impl Stanza {
    /// Decode an element, falling back to [`GenericStanza`] when strict
    /// decoding fails.
    pub fn decode(element: Element) -> Stanza {
        let decoded = match element.name() {
            "iq" => Iq::decode(&element, false).map(|iq| Stanza::Iq(Box::new(iq))),
            "message" => {
                Message::decode(&element, false).map(|message| Stanza::Message(Box::new(message)))
            }
            "presence" => Presence::decode(&element, false)
                .map(|presence| Stanza::Presence(Box::new(presence))),
            other => Err(XmppError::xml_parse(format!("unknown stanza <{}/>", other))),
        };

        decoded.unwrap_or_else(|e| {
            debug!(name = %element.name(), error = %e, "Keeping stanza as generic");
            Stanza::Generic(Box::new(GenericStanza::from_element(element)))
        })
    }

    /// Re-decode a generic stanza as `kind`, tolerating the defects that made
    /// strict decoding fail (e.g. an `iq` without a `type` becomes a result).
    ///
    /// Anything that still does not fit, or is already typed, is returned
    /// unchanged.
    pub fn upcast(self, kind: StanzaKind) -> Stanza {
        let generic = match self {
            Stanza::Generic(generic) => generic,
            typed => return typed,
        };
        if kind.element_name() != Some(generic.name.as_str()) {
            return Stanza::Generic(generic);
        }

        let upcast = match kind {
            StanzaKind::Iq => Iq::decode(&generic.element, true).map(|iq| Stanza::Iq(Box::new(iq))),
            StanzaKind::Message => Message::decode(&generic.element, true)
                .map(|message| Stanza::Message(Box::new(message))),
            StanzaKind::Presence => Presence::decode(&generic.element, true)
                .map(|presence| Stanza::Presence(Box::new(presence))),
            StanzaKind::Generic => return Stanza::Generic(generic),
        };
        upcast.unwrap_or(Stanza::Generic(generic))
    }

    /// The kind of this stanza.
    pub fn kind(&self) -> StanzaKind {
        match self {
            Stanza::Iq(_) => StanzaKind::Iq,
            Stanza::Message(_) => StanzaKind::Message,
            Stanza::Presence(_) => StanzaKind::Presence,
            Stanza::Generic(_) => StanzaKind::Generic,
        }
    }

    /// Shared base fields.
    pub fn base(&self) -> &StanzaBase {
        match self {
            Stanza::Iq(iq) => &iq.base,
            Stanza::Message(message) => &message.base,
            Stanza::Presence(presence) => &presence.base,
            Stanza::Generic(generic) => &generic.base,
        }
    }

    /// Stanza id, if any.
    pub fn id(&self) -> Option<&str> {
        self.base().id.as_deref()
    }

    /// Element name as it appears on the wire.
    pub fn name(&self) -> &str {
        match self {
            Stanza::Generic(generic) => &generic.name,
            typed => typed.kind().element_name().unwrap_or("generic"),
        }
    }

    /// The attached error, if this is an error stanza.
    pub fn error(&self) -> Option<&StanzaErrorInfo> {
        self.base().error()
    }
}

impl From<&Stanza> for Element {
    fn from(stanza: &Stanza) -> Self {
        match stanza {
            Stanza::Iq(iq) => iq.to_element(),
            Stanza::Message(message) => message.to_element(),
            Stanza::Presence(presence) => presence.to_element(),
            Stanza::Generic(generic) => generic.element.clone(),
        }
    }
}

impl From<Stanza> for Element {
    fn from(stanza: Stanza) -> Self {
        Element::from(&stanza)
    }
}

impl From<Iq> for Stanza {
    fn from(iq: Iq) -> Self {
        Stanza::Iq(Box::new(iq))
    }
}

impl From<Message> for Stanza {
    fn from(message: Message) -> Self {
        Stanza::Message(Box::new(message))
    }
}

impl From<Presence> for Stanza {
    fn from(presence: Presence) -> Self {
        Stanza::Presence(Box::new(presence))
    }
}
