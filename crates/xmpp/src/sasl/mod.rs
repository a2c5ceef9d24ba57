//! SASL authentication (RFC 6120 Section 6).
//!
//! Mechanisms are tried in the configured order; the first one the server
//! advertises is used. After a successful exchange the session is reset and
//! the stream restarted on the same transport.

mod digest_md5;
mod plain;

use std::fmt;

use base64::prelude::*;
use minidom::Element;
use tracing::{debug, instrument};

use crate::error::XmppError;
use crate::parser::ns;
use crate::session::{Credentials, SessionContext};
use crate::stream::StreamContext;

pub use digest_md5::{DigestChallenge, compute_response};
pub use plain::initial_response as plain_initial_response;

/// Mechanism order used when none is configured.
pub const DEFAULT_MECHANISMS: &[Mechanism] = &[Mechanism::DigestMd5, Mechanism::Plain];

/// A supported SASL mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mechanism {
    /// RFC 2831 DIGEST-MD5
    DigestMd5,
    /// RFC 4616 PLAIN
    Plain,
}

impl Mechanism {
    /// The mechanism name as advertised in stream features.
    pub fn name(&self) -> &'static str {
        match self {
            Mechanism::DigestMd5 => "DIGEST-MD5",
            Mechanism::Plain => "PLAIN",
        }
    }

    /// Look up a mechanism by name, ignoring case.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "DIGEST-MD5" => Some(Mechanism::DigestMd5),
            "PLAIN" => Some(Mechanism::Plain),
            _ => None,
        }
    }

    /// Whether the server offers this mechanism on the current stream.
    pub fn can_authenticate(&self, _session: &SessionContext, stream: &StreamContext) -> bool {
        stream.features.offers_mechanism(self.name())
    }

    /// Run the full exchange, then reset the session and restart the stream.
    #[instrument(skip(self, session, stream), fields(mechanism = %self), name = "xmpp.sasl.authenticate")]
    pub async fn authenticate(
        &self,
        session: &mut SessionContext,
        stream: &mut StreamContext,
    ) -> Result<(), XmppError> {
        let credentials = stream
            .credentials
            .clone()
            .ok_or_else(|| XmppError::internal("no credentials available for authentication"))?;

        match self {
            Mechanism::Plain => plain::authenticate(session, stream, &credentials).await?,
            Mechanism::DigestMd5 => {
                digest_md5::authenticate(session, stream, &credentials).await?
            }
        }

        debug!("SASL authentication succeeded");
        complete_authentication(session, stream);
        Ok(())
    }
}

impl fmt::Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Pick the first configured mechanism the server offers.
pub fn select_mechanism(
    mechanisms: &[Mechanism],
    session: &SessionContext,
    stream: &StreamContext,
) -> Result<Mechanism, XmppError> {
    mechanisms
        .iter()
        .find(|mechanism| mechanism.can_authenticate(session, stream))
        .copied()
        .ok_or_else(|| XmppError::NoAuthenticatorAvailable {
            offered: stream.features.sasl_mechanisms.clone(),
        })
}

/// Post-authentication bookkeeping shared by all mechanisms.
fn complete_authentication(session: &mut SessionContext, stream: &mut StreamContext) {
    let (username, resource) = match stream.credentials.take() {
        Some(Credentials {
            username, resource, ..
        }) => (Some(username), resource),
        None => (session.username.take(), session.resource.take()),
    };

    session.reset();
    session.username = username;
    session.resource = resource;
    stream.restart();
}

/// Server replies during a SASL exchange.
#[derive(Debug)]
enum SaslReply {
    Challenge(Vec<u8>),
    Success(Vec<u8>),
}

fn sasl_element(name: &str, data: Option<&[u8]>) -> Element {
    let builder = Element::builder(name, ns::SASL);
    match data {
        Some(data) if !data.is_empty() => builder.append(BASE64_STANDARD.encode(data)).build(),
        _ => builder.build(),
    }
}

/// Read the next SASL element; `<failure/>` becomes an error.
async fn read_reply(stream: &mut StreamContext) -> Result<SaslReply, XmppError> {
    let element = stream.next_element().await?;
    if element.ns() != ns::SASL {
        return Err(XmppError::unexpected_element(
            "during SASL negotiation",
            element.name(),
            &element.ns(),
        ));
    }

    match element.name() {
        "challenge" => Ok(SaslReply::Challenge(decode_payload(&element)?)),
        "success" => Ok(SaslReply::Success(decode_payload(&element)?)),
        "failure" => Err(failure(&element)),
        other => Err(XmppError::unexpected_element(
            "during SASL negotiation",
            other,
            ns::SASL,
        )),
    }
}

fn decode_payload(element: &Element) -> Result<Vec<u8>, XmppError> {
    let text = element.text();
    let text = text.trim();
    if text.is_empty() || text == "=" {
        return Ok(Vec::new());
    }
    BASE64_STANDARD
        .decode(text)
        .map_err(|e| XmppError::protocol_violation(format!("invalid base64 in <{}/>: {}", element.name(), e)))
}

fn failure(element: &Element) -> XmppError {
    let mut condition = "not-authorized".to_string();
    let mut text = None;
    for child in element.children() {
        if child.name() == "text" {
            text = Some(child.text());
        } else {
            condition = child.name().to_string();
        }
    }
    debug!(condition = %condition, "SASL authentication failed");
    XmppError::AuthenticationFailure { condition, text }
}
