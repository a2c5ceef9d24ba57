//! Client stream negotiation (RFC 6120 Sections 4-7).
//!
//! Drives a fresh transport from the opening header to a bound session:
//! version check, optional STARTTLS, SASL, resource binding and the legacy
//! session request. Steps the server does not advertise are skipped without
//! any network traffic.

use std::fmt;

use minidom::Element;
use tracing::{debug, info, instrument, warn};
use xmpp_parsers::bind::{BindQuery, BindResponse};

use crate::error::{StanzaErrorCondition, StanzaErrorType, XmppError};
use crate::features::StreamFeatures;
use crate::jid::Jid;
use crate::parser::ns;
use crate::sasl::{self, DEFAULT_MECHANISMS, Mechanism};
use crate::session::SessionContext;
use crate::stanza::{Iq, IqType, Stanza, StanzaErrorInfo};
use crate::stream::StreamContext;
use crate::transport::Connector;

const BIND_REQUEST_ID: &str = "bind_1";
const SESSION_REQUEST_ID: &str = "sess_1";

/// Negotiation progress, in the order the states are entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NegotiationState {
    /// Nothing sent yet
    Init,
    /// Stream headers exchanged and features read
    VersionChecked,
    /// TLS is in place (or was not offered)
    TlsReady,
    /// SASL completed and the stream restarted
    Authenticated,
    /// Resource bound
    Bound,
    /// Legacy session established
    SessionEstablished,
    /// Ready for stanza traffic
    Ready,
}

impl NegotiationState {
    /// Lowercase name used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::VersionChecked => "version-checked",
            Self::TlsReady => "tls-ready",
            Self::Authenticated => "authenticated",
            Self::Bound => "bound",
            Self::SessionEstablished => "session-established",
            Self::Ready => "ready",
        }
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Knobs that shape negotiation.
#[derive(Debug, Clone)]
pub struct NegotiationOptions {
    /// Upgrade with STARTTLS when offered
    pub starttls: bool,
    /// SASL mechanisms in order of preference
    pub mechanisms: Vec<Mechanism>,
    /// Language announced in the stream header
    pub language: Option<String>,
}

impl Default for NegotiationOptions {
    fn default() -> Self {
        Self {
            starttls: true,
            mechanisms: DEFAULT_MECHANISMS.to_vec(),
            language: None,
        }
    }
}

/// Runs the negotiation state machine over a [`StreamContext`].
pub struct Negotiator<'a, C: Connector> {
    connector: &'a C,
    options: &'a NegotiationOptions,
    state: NegotiationState,
}

impl<'a, C: Connector> Negotiator<'a, C> {
    pub fn new(connector: &'a C, options: &'a NegotiationOptions) -> Self {
        Self {
            connector,
            options,
            state: NegotiationState::Init,
        }
    }

    /// The last state reached.
    pub fn state(&self) -> NegotiationState {
        self.state
    }

    /// Negotiate until the stream is ready for stanzas.
    ///
    /// Failures are wrapped in [`XmppError::Negotiation`] naming the state
    /// that could not be reached.
    #[instrument(skip_all, fields(host = %session.host_name), name = "xmpp.negotiate")]
    pub async fn negotiate(
        &mut self,
        session: &mut SessionContext,
        stream: &mut StreamContext,
    ) -> Result<(), XmppError> {
        // Certificates are checked against the configured host, not the echo.
        let tls_domain = session.host_name.clone();
        let mut authenticated = false;

        loop {
            self.open_stream(session, stream)
                .await
                .map_err(|e| wrap(NegotiationState::VersionChecked, e))?;
            self.advance(NegotiationState::VersionChecked);

            if stream.features.tls_supported && !stream.is_encrypted() {
                if self.options.starttls {
                    self.starttls(session, stream, &tls_domain)
                        .await
                        .map_err(|e| wrap(NegotiationState::TlsReady, e))?;
                    self.advance(NegotiationState::TlsReady);
                    continue;
                }
                if stream.features.tls_required {
                    return Err(wrap(
                        NegotiationState::TlsReady,
                        XmppError::tls("server requires STARTTLS but it is disabled"),
                    ));
                }
                debug!("Server offers STARTTLS; upgrade disabled by configuration");
            }
            self.advance(NegotiationState::TlsReady);

            if !authenticated && !stream.features.sasl_mechanisms.is_empty() {
                self.authenticate(session, stream)
                    .await
                    .map_err(|e| wrap(NegotiationState::Authenticated, e))?;
                authenticated = true;
                self.advance(NegotiationState::Authenticated);
                continue;
            }
            break;
        }

        if stream.features.binding_supported {
            bind_resource(session, stream)
                .await
                .map_err(|e| wrap(NegotiationState::Bound, e))?;
            self.advance(NegotiationState::Bound);
        }

        if stream.features.session_supported {
            establish_session(stream)
                .await
                .map_err(|e| wrap(NegotiationState::SessionEstablished, e))?;
            self.advance(NegotiationState::SessionEstablished);
        }

        self.advance(NegotiationState::Ready);
        info!(
            jid = ?session.bound_jid.as_ref().map(Jid::to_string),
            encrypted = stream.is_encrypted(),
            "Stream negotiation complete"
        );
        Ok(())
    }

    fn advance(&mut self, state: NegotiationState) {
        if state != self.state {
            debug!(from = %self.state, to = %state, "Negotiation state changed");
            self.state = state;
        }
    }

    /// Exchange headers and read the features of a (re)started stream.
    async fn open_stream(
        &self,
        session: &mut SessionContext,
        stream: &mut StreamContext,
    ) -> Result<(), XmppError> {
        stream
            .open(&session.host_name, self.options.language.as_deref())
            .await?;

        let header = stream.read_header().await?;
        header.validate()?;

        session.stream_id = header.id;
        session.locale = header.lang;
        if let Some(from) = header.from {
            if from != session.host_name {
                debug!(configured = %session.host_name, announced = %from, "Server announced a different host");
                session.host_name = from;
            }
        }

        let element = stream.next_element().await?;
        stream.features = StreamFeatures::from_element(&element)?;
        debug!(
            tls = stream.features.tls_supported,
            mechanisms = ?stream.features.sasl_mechanisms,
            bind = stream.features.binding_supported,
            session = stream.features.session_supported,
            "Received stream features"
        );
        Ok(())
    }

    #[instrument(skip_all, name = "xmpp.negotiate.starttls")]
    async fn starttls(
        &self,
        session: &mut SessionContext,
        stream: &mut StreamContext,
        domain: &str,
    ) -> Result<(), XmppError> {
        stream
            .send_element(&Element::builder("starttls", ns::TLS).build())
            .await?;

        let reply = stream.next_element().await?;
        match (reply.name(), reply.ns().as_str()) {
            ("proceed", ns::TLS) => {}
            ("failure", ns::TLS) => {
                warn!("Server refused STARTTLS");
                return Err(XmppError::tls("server answered STARTTLS with <failure/>"));
            }
            (name, namespace) => {
                return Err(XmppError::unexpected_element(
                    "in reply to STARTTLS",
                    name,
                    namespace,
                ));
            }
        }

        stream.upgrade_tls(self.connector, domain).await?;
        session.stream_id = None;
        info!("Transport upgraded to TLS");
        Ok(())
    }

    async fn authenticate(
        &self,
        session: &mut SessionContext,
        stream: &mut StreamContext,
    ) -> Result<(), XmppError> {
        let mechanism = sasl::select_mechanism(&self.options.mechanisms, session, stream)?;
        debug!(mechanism = %mechanism, "Selected SASL mechanism");
        mechanism.authenticate(session, stream).await?;
        info!(mechanism = %mechanism, username = ?session.username, "Authenticated");
        Ok(())
    }
}

fn wrap(state: NegotiationState, source: XmppError) -> XmppError {
    match source {
        already @ XmppError::Negotiation { .. } => already,
        source => XmppError::Negotiation {
            state,
            source: Box::new(source),
        },
    }
}

/// Send an IQ during negotiation and read its reply.
///
/// Nothing else may arrive while the request is outstanding.
async fn negotiation_request(stream: &mut StreamContext, iq: Iq) -> Result<Iq, XmppError> {
    let id = iq.base.id.clone().unwrap_or_default();
    stream.send_element(&iq.to_element()).await?;

    let element = stream.next_element().await?;
    let reply = match Stanza::decode(element) {
        Stanza::Iq(reply) if reply.base.id.as_deref() == Some(id.as_str()) => *reply,
        other => {
            return Err(XmppError::protocol_violation(format!(
                "expected reply to '{}', got <{}/> with id {:?}",
                id,
                other.name(),
                other.id()
            )));
        }
    };

    match reply.iq_type() {
        IqType::Result => Ok(reply),
        IqType::Error => Err(XmppError::Stanza(reply.base.error().cloned().unwrap_or_else(
            || {
                StanzaErrorInfo::new(
                    StanzaErrorCondition::UndefinedCondition,
                    StanzaErrorType::Cancel,
                )
            },
        ))),
        other => Err(XmppError::protocol_violation(format!(
            "iq of type {} in reply to '{}'",
            other, id
        ))),
    }
}

#[instrument(skip_all, name = "xmpp.negotiate.bind")]
async fn bind_resource(
    session: &mut SessionContext,
    stream: &mut StreamContext,
) -> Result<(), XmppError> {
    let request = Iq::set(BindQuery::new(session.resource.clone()).into()).with_id(BIND_REQUEST_ID);
    let reply = negotiation_request(stream, request).await?;

    let payload = reply
        .payload()
        .cloned()
        .ok_or_else(|| XmppError::protocol_violation("bind result carries no payload"))?;
    let bound = BindResponse::try_from(payload)
        .map_err(|e| XmppError::protocol_violation(format!("invalid bind result: {}", e)))?;
    let full: xmpp_parsers::jid::FullJid = bound.into();
    let jid = Jid::parse(&full.to_string())?;

    session.resource = jid.resource().map(str::to_string);
    info!(jid = %jid, "Resource bound");
    session.bound_jid = Some(jid);
    Ok(())
}

#[instrument(skip_all, name = "xmpp.negotiate.session")]
async fn establish_session(stream: &mut StreamContext) -> Result<(), XmppError> {
    let request =
        Iq::set(Element::builder("session", ns::SESSION).build()).with_id(SESSION_REQUEST_ID);
    negotiation_request(stream, request).await?;
    debug!("Session established");
    Ok(())
}
