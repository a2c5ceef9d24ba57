//! Error types for the XMPP client session engine.

use thiserror::Error;

use crate::config::ConfigError;
use crate::negotiation::NegotiationState;
use crate::stanza::StanzaErrorInfo;

/// Errors raised by addressing, stream negotiation, SASL and the packet queue.
#[derive(Debug, Error)]
pub enum XmppError {
    /// A string did not match the `[node@]host[/resource]` grammar.
    #[error("malformed address: {0}")]
    AddressFormat(String),

    /// An element arrived that is not one of the documented alternatives for
    /// the current negotiation step.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The server refused or aborted STARTTLS, or the upgrade itself failed.
    #[error("TLS negotiation failed: {0}")]
    TlsNegotiationFailed(String),

    /// None of the configured SASL mechanisms is offered by the server.
    #[error("no supported SASL mechanism found; server offers: {}", offered.join(", "))]
    NoAuthenticatorAvailable {
        /// Mechanisms advertised by the server
        offered: Vec<String>,
    },

    /// The server answered the SASL exchange with a `<failure/>`.
    #[error("authentication failed: {condition}{}", text.as_deref().map(|t| format!(" ({t})")).unwrap_or_default())]
    AuthenticationFailure {
        /// SASL failure sub-condition element name (e.g. `not-authorized`)
        condition: String,
        /// Optional human readable text sent with the failure
        text: Option<String>,
    },

    /// A stanza came back with an `<error/>` child.
    #[error("stanza error: {0}")]
    Stanza(StanzaErrorInfo),

    /// The server sent a `<stream:error/>`; the stream is unusable.
    #[error("stream error: {condition}{}", text.as_deref().map(|t| format!(" ({t})")).unwrap_or_default())]
    Stream {
        /// Stream error condition element name (e.g. `unsupported-version`)
        condition: String,
        /// Optional human readable text
        text: Option<String>,
    },

    /// A synchronous send expired before its reply arrived.
    #[error("timed out waiting for reply to '{id}'")]
    Timeout {
        /// Id of the request that expired
        id: String,
    },

    /// A send was attempted after the packet queue shut down.
    #[error("packet queue is closed")]
    QueueClosed,

    /// A reply was requested for a stanza that carries no id.
    #[error("stanza has no id; cannot wait for a reply")]
    MissingStanzaId,

    /// A reply is already being awaited for this id.
    #[error("a reply is already pending for id '{0}'")]
    DuplicateStanzaId(String),

    /// Stream negotiation failed while entering `state`.
    #[error("stream negotiation failed entering {state}: {source}")]
    Negotiation {
        /// The state the negotiation was trying to reach
        state: NegotiationState,
        /// What went wrong
        #[source]
        source: Box<XmppError>,
    },

    /// XML could not be framed or parsed.
    #[error("XML parse error: {0}")]
    XmlParse(String),

    /// IO error on the underlying transport.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the stream.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Configuration could not be loaded or is invalid.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Internal invariant broken (e.g. lifecycle misuse).
    #[error("internal error: {0}")]
    Internal(String),
}

impl XmppError {
    /// Create a new address format error.
    pub fn address_format(msg: impl Into<String>) -> Self {
        Self::AddressFormat(msg.into())
    }

    /// Create a new protocol violation error.
    pub fn protocol_violation(msg: impl Into<String>) -> Self {
        Self::ProtocolViolation(msg.into())
    }

    /// Create a new TLS negotiation error.
    pub fn tls(msg: impl Into<String>) -> Self {
        Self::TlsNegotiationFailed(msg.into())
    }

    /// Create a new XML parse error.
    pub fn xml_parse(msg: impl Into<String>) -> Self {
        Self::XmlParse(msg.into())
    }

    /// Create a new connection closed error.
    pub fn connection_closed(msg: impl Into<String>) -> Self {
        Self::ConnectionClosed(msg.into())
    }

    /// Create a new internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Build a protocol violation describing an unexpected element.
    pub fn unexpected_element(context: &str, name: &str, ns: &str) -> Self {
        Self::ProtocolViolation(format!("unexpected <{name} xmlns='{ns}'/> {context}"))
    }

    /// Strip negotiation wrappers and return the underlying failure.
    pub fn root_cause(&self) -> &XmppError {
        match self {
            Self::Negotiation { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Whether reconnecting from scratch could plausibly succeed.
    ///
    /// Credential, protocol and configuration problems will fail the same way
    /// on every attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self.root_cause(),
            XmppError::AuthenticationFailure { .. }
                | XmppError::NoAuthenticatorAvailable { .. }
                | XmppError::ProtocolViolation(_)
                | XmppError::AddressFormat(_)
                | XmppError::Config(_)
                | XmppError::Stanza(_)
        )
    }
}

/// XMPP stanza error conditions (RFC 6120 Section 8.3.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StanzaErrorCondition {
    /// Bad request (malformed XML, etc.)
    BadRequest,
    /// Conflict (e.g., resource already bound)
    Conflict,
    /// Feature not implemented
    FeatureNotImplemented,
    /// Forbidden (permission denied)
    Forbidden,
    /// Gone (entity no longer available)
    Gone,
    /// Internal server error
    InternalServerError,
    /// Item not found
    ItemNotFound,
    /// JID malformed
    JidMalformed,
    /// Not acceptable
    NotAcceptable,
    /// Not allowed
    NotAllowed,
    /// Not authorized
    NotAuthorized,
    /// Policy violation
    PolicyViolation,
    /// Recipient unavailable
    RecipientUnavailable,
    /// Redirect
    Redirect,
    /// Registration required
    RegistrationRequired,
    /// Remote server not found
    RemoteServerNotFound,
    /// Remote server timeout
    RemoteServerTimeout,
    /// Resource constraint
    ResourceConstraint,
    /// Service unavailable
    ServiceUnavailable,
    /// Subscription required
    SubscriptionRequired,
    /// Undefined condition
    UndefinedCondition,
    /// Unexpected request
    UnexpectedRequest,
}

impl StanzaErrorCondition {
    const ALL: [StanzaErrorCondition; 22] = [
        Self::BadRequest,
        Self::Conflict,
        Self::FeatureNotImplemented,
        Self::Forbidden,
        Self::Gone,
        Self::InternalServerError,
        Self::ItemNotFound,
        Self::JidMalformed,
        Self::NotAcceptable,
        Self::NotAllowed,
        Self::NotAuthorized,
        Self::PolicyViolation,
        Self::RecipientUnavailable,
        Self::Redirect,
        Self::RegistrationRequired,
        Self::RemoteServerNotFound,
        Self::RemoteServerTimeout,
        Self::ResourceConstraint,
        Self::ServiceUnavailable,
        Self::SubscriptionRequired,
        Self::UndefinedCondition,
        Self::UnexpectedRequest,
    ];

    /// Get the element name for this condition.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadRequest => "bad-request",
            Self::Conflict => "conflict",
            Self::FeatureNotImplemented => "feature-not-implemented",
            Self::Forbidden => "forbidden",
            Self::Gone => "gone",
            Self::InternalServerError => "internal-server-error",
            Self::ItemNotFound => "item-not-found",
            Self::JidMalformed => "jid-malformed",
            Self::NotAcceptable => "not-acceptable",
            Self::NotAllowed => "not-allowed",
            Self::NotAuthorized => "not-authorized",
            Self::PolicyViolation => "policy-violation",
            Self::RecipientUnavailable => "recipient-unavailable",
            Self::Redirect => "redirect",
            Self::RegistrationRequired => "registration-required",
            Self::RemoteServerNotFound => "remote-server-not-found",
            Self::RemoteServerTimeout => "remote-server-timeout",
            Self::ResourceConstraint => "resource-constraint",
            Self::ServiceUnavailable => "service-unavailable",
            Self::SubscriptionRequired => "subscription-required",
            Self::UndefinedCondition => "undefined-condition",
            Self::UnexpectedRequest => "unexpected-request",
        }
    }

    /// Look up a condition by element name.
    ///
    /// Unknown names map to `undefined-condition`, which RFC 6120 reserves
    /// for exactly that purpose.
    pub fn from_name(name: &str) -> Self {
        Self::ALL
            .into_iter()
            .find(|condition| condition.as_str() == name)
            .unwrap_or(Self::UndefinedCondition)
    }
}

impl std::fmt::Display for StanzaErrorCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// XMPP stanza error types (RFC 6120 Section 8.3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StanzaErrorType {
    /// Retry after providing credentials
    Auth,
    /// Do not retry (unrecoverable error)
    Cancel,
    /// Proceed (the condition was only a warning)
    Continue,
    /// Retry after changing the data sent
    Modify,
    /// Retry after waiting (temporary error)
    Wait,
}

impl StanzaErrorType {
    /// Get the type attribute value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Cancel => "cancel",
            Self::Continue => "continue",
            Self::Modify => "modify",
            Self::Wait => "wait",
        }
    }

    /// Parse a `type` attribute value.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "auth" => Some(Self::Auth),
            "cancel" => Some(Self::Cancel),
            "continue" => Some(Self::Continue),
            "modify" => Some(Self::Modify),
            "wait" => Some(Self::Wait),
            _ => None,
        }
    }
}

impl std::fmt::Display for StanzaErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Common stream error conditions (RFC 6120 Section 4.9.3).
pub mod stream_errors {
    /// Stream error: bad format
    pub const BAD_FORMAT: &str = "bad-format";
    /// Stream error: host unknown
    pub const HOST_UNKNOWN: &str = "host-unknown";
    /// Stream error: invalid namespace
    pub const INVALID_NAMESPACE: &str = "invalid-namespace";
    /// Stream error: not authorized
    pub const NOT_AUTHORIZED: &str = "not-authorized";
    /// Stream error: policy violation
    pub const POLICY_VIOLATION: &str = "policy-violation";
    /// Stream error: system shutdown
    pub const SYSTEM_SHUTDOWN: &str = "system-shutdown";
    /// Stream error: undefined condition
    pub const UNDEFINED_CONDITION: &str = "undefined-condition";
    /// Stream error: unsupported version
    pub const UNSUPPORTED_VERSION: &str = "unsupported-version";
}
