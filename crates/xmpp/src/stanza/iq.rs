use std::fmt;

use minidom::Element;

use super::{StanzaBase, StanzaErrorInfo, generate_id, is_error_child};
use crate::error::XmppError;
use crate::jid::Jid;

/// The `type` of an `<iq/>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IqType {
    /// Request for information
    Get,
    /// Request that changes state
    Set,
    /// Successful response
    Result,
    /// Failed response
    Error,
}

impl IqType {
    /// Attribute value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Set => "set",
            Self::Result => "result",
            Self::Error => "error",
        }
    }

    /// Parse an attribute value.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "get" => Some(Self::Get),
            "set" => Some(Self::Set),
            "result" => Some(Self::Result),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    /// Whether this type is a request that must be answered.
    pub fn is_request(&self) -> bool {
        matches!(self, Self::Get | Self::Set)
    }
}

impl fmt::Display for IqType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An info/query stanza.
///
/// The payload is the single child element; requests carry exactly one,
/// responses at most one.
#[derive(Debug, Clone, PartialEq)]
pub struct Iq {
    /// Shared stanza fields; `extensions` holds the payload
    pub base: StanzaBase,
}

impl Iq {
    fn with_type(iq_type: IqType, id: Option<String>, payload: Option<Element>) -> Self {
        let mut base = StanzaBase::new();
        base.id = Some(id.unwrap_or_else(generate_id));
        base.set_type(Some(iq_type.as_str()));
        base.extensions.extend(payload);
        Self { base }
    }

    /// A `get` request with a generated id.
    pub fn get(payload: Element) -> Self {
        Self::with_type(IqType::Get, None, Some(payload))
    }

    /// A `set` request with a generated id.
    pub fn set(payload: Element) -> Self {
        Self::with_type(IqType::Set, None, Some(payload))
    }

    /// A `result` response carrying `id`.
    pub fn result(id: impl Into<String>, payload: Option<Element>) -> Self {
        Self::with_type(IqType::Result, Some(id.into()), payload)
    }

    /// Use a caller-chosen id instead of the generated one.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.base.id = Some(id.into());
        self
    }

    /// Address the iq.
    pub fn with_to(mut self, to: Jid) -> Self {
        self.base.to = Some(to);
        self
    }

    /// The result answering this request: same id, addresses swapped.
    pub fn reply(&self, payload: Option<Element>) -> Iq {
        let mut reply = Iq::result(self.base.id.clone().unwrap_or_default(), payload);
        reply.base.to = self.base.from.clone();
        reply.base.from = self.base.to.clone();
        reply
    }

    /// The error answering this request: same id, addresses swapped.
    pub fn error_reply(&self, error: StanzaErrorInfo) -> Iq {
        let mut reply = self.reply(None);
        reply.base.set_error(Some(error));
        reply
    }

    /// The iq type. A missing or unknown type reads as `result`.
    pub fn iq_type(&self) -> IqType {
        self.base
            .type_()
            .and_then(IqType::from_name)
            .unwrap_or(IqType::Result)
    }

    /// The payload element, if any.
    pub fn payload(&self) -> Option<&Element> {
        self.base.extensions.first()
    }

    /// Decode an `<iq/>` element.
    ///
    /// Strict decoding requires a known type and the right number of
    /// payloads. Lenient decoding treats a missing type as `error` when an
    /// error child is present and `result` otherwise, and accepts any
    /// payload count.
    pub(super) fn decode(element: &Element, lenient: bool) -> Result<Self, XmppError> {
        let mut base = StanzaBase::decode(element, lenient)?;
        base.extensions = element
            .children()
            .filter(|child| !is_error_child(element, child))
            .cloned()
            .collect();

        let iq_type = match base.type_().and_then(IqType::from_name) {
            Some(iq_type) => iq_type,
            None if lenient => {
                let error = element
                    .children()
                    .find(|child| is_error_child(element, child))
                    .map(StanzaErrorInfo::from_element);
                match error {
                    Some(error) => {
                        base.set_error(Some(error));
                        IqType::Error
                    }
                    None => {
                        base.set_type(Some(IqType::Result.as_str()));
                        IqType::Result
                    }
                }
            }
            None => {
                return Err(XmppError::xml_parse(format!(
                    "iq has missing or invalid type {:?}",
                    base.type_()
                )));
            }
        };

        if !lenient {
            let payloads = base.extensions.len();
            let valid = match iq_type {
                IqType::Get | IqType::Set => payloads == 1,
                IqType::Result | IqType::Error => payloads <= 1,
            };
            if !valid {
                return Err(XmppError::xml_parse(format!(
                    "iq of type {} carries {} payloads",
                    iq_type, payloads
                )));
            }
        }

        Ok(Self { base })
    }

    /// Encode as an `<iq/>` element.
    pub fn to_element(&self) -> Element {
        self.base.encode("iq", Vec::new())
    }
}
