pub mod config;
pub mod connection;
pub mod error;
pub mod features;
pub mod jid;
pub mod negotiation;
pub mod parser;
pub mod queue;
pub mod sasl;
pub mod session;
pub mod stanza;
pub mod stream;
pub mod transport;

pub use config::{ConfigError, ConnectionConfig, load_config_from, load_config_from_str};
pub use connection::{Connection, ConnectionListener, ConnectionState};
pub use error::{StanzaErrorCondition, StanzaErrorType, XmppError};
pub use features::StreamFeatures;
pub use jid::Jid;
pub use negotiation::{NegotiationOptions, NegotiationState, Negotiator};
pub use queue::{Incoming, PacketQueue, PacketSink, ReplyMode, RunState};
pub use sasl::Mechanism;
pub use session::{Credentials, SessionContext};
pub use stanza::{
    GenericStanza, Iq, IqType, Message, Presence, Show, Stanza, StanzaBase, StanzaErrorInfo,
    StanzaKind,
};
pub use stream::{BoxedStream, InboundStream, OutboundStream, StreamContext};
pub use transport::{Connector, TcpConnector};
