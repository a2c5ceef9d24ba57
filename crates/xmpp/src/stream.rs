//! XML stream handling for the client side of an XMPP connection.
//!
//! [`StreamContext`] owns the socket during negotiation. Once the session is
//! ready it is split into an [`InboundStream`] for the dispatcher and an
//! [`OutboundStream`] for the packet queue worker.

use minidom::Element;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::{debug, instrument, trace};

use crate::error::XmppError;
use crate::features::StreamFeatures;
use crate::parser::{StreamEvent, StreamHeader, XmlParser, element_to_string, escape_attribute, ns};
use crate::queue::PacketSink;
use crate::session::Credentials;
use crate::stanza::Stanza;
use crate::transport::Connector;

const READ_BUFFER_SIZE: usize = 4096;

/// Byte stream the XML stream runs over (plain TCP, TLS, or a test pipe).
pub trait AsyncReadWrite: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncReadWrite for T {}

/// Boxed transport stream.
pub type BoxedStream = Box<dyn AsyncReadWrite>;

/// Serialises outbound stream framing.
#[derive(Debug, Default)]
pub struct XmlWriter {
    header_sent: bool,
}

impl XmlWriter {
    /// A writer for a stream whose header has not been sent yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the opening tag has been written.
    pub fn header_sent(&self) -> bool {
        self.header_sent
    }

    /// The client stream opening tag.
    pub fn header(&mut self, to: &str, lang: Option<&str>) -> String {
        self.header_sent = true;
        let lang = lang
            .map(|lang| format!(" xml:lang='{}'", escape_attribute(lang)))
            .unwrap_or_default();
        format!(
            "<?xml version='1.0'?>\
            <stream:stream xmlns='{}' \
            xmlns:stream='{}' \
            to='{}' version='1.0'{}>",
            ns::JABBER_CLIENT,
            ns::STREAM,
            escape_attribute(to),
            lang
        )
    }

    /// A serialised top-level element.
    pub fn element(&self, element: &Element) -> Result<String, XmppError> {
        if !self.header_sent {
            return Err(XmppError::internal("element written before stream header"));
        }
        element_to_string(element)
    }

    /// The stream closing tag.
    pub fn close(&mut self) -> &'static str {
        self.header_sent = false;
        "</stream:stream>"
    }
}

/// Everything negotiation needs about the live stream.
pub struct StreamContext {
    socket: Option<BoxedStream>,
    reader: XmlParser,
    writer: XmlWriter,
    /// Features advertised on the current stream
    pub features: StreamFeatures,
    /// Credentials, discarded once authentication succeeds
    pub credentials: Option<Credentials>,
    encrypted: bool,
}

impl std::fmt::Debug for StreamContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamContext")
            .field("connected", &self.socket.is_some())
            .field("features", &self.features)
            .field("credentials", &self.credentials)
            .field("encrypted", &self.encrypted)
            .finish()
    }
}

impl StreamContext {
    /// Wrap a freshly connected socket.
    pub fn new(socket: BoxedStream, credentials: Option<Credentials>) -> Self {
        Self {
            socket: Some(socket),
            reader: XmlParser::new(),
            writer: XmlWriter::new(),
            features: StreamFeatures::default(),
            credentials,
            encrypted: false,
        }
    }

    /// Whether the transport has been upgraded to TLS.
    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    fn socket(&mut self) -> Result<&mut BoxedStream, XmppError> {
        self.socket
            .as_mut()
            .ok_or_else(|| XmppError::internal("Stream not initialized"))
    }

    async fn write_str(&mut self, data: &str) -> Result<(), XmppError> {
        trace!(bytes = data.len(), "Writing to stream");
        let socket = self.socket()?;
        socket.write_all(data.as_bytes()).await?;
        socket.flush().await?;
        Ok(())
    }

    /// Send the client stream header.
    pub async fn open(&mut self, to: &str, lang: Option<&str>) -> Result<(), XmppError> {
        let header = self.writer.header(to, lang);
        self.write_str(&header).await?;
        debug!(to = %to, "Sent stream header");
        Ok(())
    }

    /// Send one top-level element.
    pub async fn send_element(&mut self, element: &Element) -> Result<(), XmppError> {
        let xml = self.writer.element(element)?;
        self.write_str(&xml).await?;
        debug!(element = %element.name(), "Sent element");
        Ok(())
    }

    async fn next_event(&mut self) -> Result<StreamEvent, XmppError> {
        let socket = self
            .socket
            .as_mut()
            .ok_or_else(|| XmppError::internal("Stream not initialized"))?;
        read_event(socket, &mut self.reader)
            .await?
            .ok_or_else(|| XmppError::connection_closed("transport closed during negotiation"))
    }

    /// Read the server stream header.
    #[instrument(skip(self), name = "xmpp.stream.read_header")]
    pub async fn read_header(&mut self) -> Result<StreamHeader, XmppError> {
        match self.next_event().await? {
            StreamEvent::Header(header) => {
                debug!(
                    id = ?header.id,
                    from = ?header.from,
                    version = ?header.version,
                    "Received stream header"
                );
                Ok(header)
            }
            StreamEvent::Element(element) => Err(XmppError::unexpected_element(
                "before the stream header",
                element.name(),
                &element.ns(),
            )),
            StreamEvent::End => Err(XmppError::connection_closed(
                "server closed the stream before opening it",
            )),
        }
    }

    /// Read the next top-level element.
    ///
    /// Elements already buffered are returned before the socket is touched.
    /// A `<stream:error/>` is turned into [`XmppError::Stream`].
    pub async fn next_element(&mut self) -> Result<Element, XmppError> {
        match self.next_event().await? {
            StreamEvent::Element(element) => {
                if element.is("error", ns::STREAM) {
                    return Err(stream_error(&element));
                }
                debug!(element = %element.name(), "Received element");
                Ok(element)
            }
            StreamEvent::Header(_) => Err(XmppError::protocol_violation(
                "unexpected second stream header",
            )),
            StreamEvent::End => Err(XmppError::connection_closed("server closed the stream")),
        }
    }

    /// Start a new stream on the same transport.
    ///
    /// The reader and writer are replaced; bytes the old reader had buffered
    /// but not framed are carried over.
    pub fn restart(&mut self) {
        let leftover = self.reader.take_buffered();
        self.reader = XmlParser::new();
        self.reader.feed(&leftover);
        self.writer = XmlWriter::new();
        self.features = StreamFeatures::default();
    }

    /// Swap the transport for a TLS session over it.
    #[instrument(skip(self, connector), name = "xmpp.stream.upgrade_tls")]
    pub async fn upgrade_tls<C: Connector>(
        &mut self,
        connector: &C,
        domain: &str,
    ) -> Result<(), XmppError> {
        let plain = self
            .socket
            .take()
            .ok_or_else(|| XmppError::internal("Stream already taken"))?;
        let tls = connector.upgrade_to_tls(plain, domain).await?;

        self.socket = Some(tls);
        self.reader = XmlParser::new();
        self.writer = XmlWriter::new();
        self.features = StreamFeatures::default();
        self.encrypted = true;

        debug!("TLS upgrade complete");
        Ok(())
    }

    /// Split into independently owned read and write sides.
    pub fn into_halves(mut self) -> Result<(InboundStream, OutboundStream), XmppError> {
        let socket = self
            .socket
            .take()
            .ok_or_else(|| XmppError::internal("Stream already taken"))?;
        let (read, write) = tokio::io::split(socket);
        Ok((
            InboundStream {
                io: read,
                parser: self.reader,
            },
            OutboundStream {
                io: write,
                writer: self.writer,
            },
        ))
    }
}

async fn read_event<R: AsyncRead + Unpin>(
    io: &mut R,
    parser: &mut XmlParser,
) -> Result<Option<StreamEvent>, XmppError> {
    let mut buf = [0u8; READ_BUFFER_SIZE];
    loop {
        if let Some(event) = parser.next_event()? {
            return Ok(Some(event));
        }

        let n = io.read(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        trace!(bytes = n, "Read from stream");
        parser.feed(&buf[..n]);
    }
}

/// Convert a `<stream:error/>` element into an error value.
pub fn stream_error(element: &Element) -> XmppError {
    let mut condition = crate::error::stream_errors::UNDEFINED_CONDITION.to_string();
    let mut text = None;
    for child in element.children().filter(|c| c.ns() == ns::STREAMS) {
        if child.name() == "text" {
            text = Some(child.text());
        } else {
            condition = child.name().to_string();
        }
    }
    XmppError::Stream { condition, text }
}

/// Read side of a negotiated stream.
pub struct InboundStream {
    io: ReadHalf<BoxedStream>,
    parser: XmlParser,
}

impl InboundStream {
    /// Read the next stanza.
    ///
    /// Returns `Ok(None)` when the server closes the stream or the transport.
    pub async fn next_stanza(&mut self) -> Result<Option<Stanza>, XmppError> {
        match read_event(&mut self.io, &mut self.parser).await? {
            Some(StreamEvent::Element(element)) => {
                if element.is("error", ns::STREAM) {
                    return Err(stream_error(&element));
                }
                Ok(Some(Stanza::decode(element)))
            }
            Some(StreamEvent::Header(_)) => Err(XmppError::protocol_violation(
                "unexpected stream header on an established stream",
            )),
            Some(StreamEvent::End) | None => Ok(None),
        }
    }

    /// Rejoin with the write side.
    pub fn unsplit(self, outbound: OutboundStream) -> BoxedStream {
        self.io.unsplit(outbound.io)
    }
}

/// Write side of a negotiated stream.
pub struct OutboundStream {
    io: WriteHalf<BoxedStream>,
    writer: XmlWriter,
}

impl OutboundStream {
    /// Send one top-level element.
    pub async fn send_element(&mut self, element: &Element) -> Result<(), XmppError> {
        let xml = self.writer.element(element)?;
        self.io.write_all(xml.as_bytes()).await?;
        self.io.flush().await?;
        Ok(())
    }

    /// Close the stream and shut the transport down for writing.
    pub async fn close(&mut self) -> Result<(), XmppError> {
        if !self.writer.header_sent() {
            return Ok(());
        }
        let closing = self.writer.close();
        self.io.write_all(closing.as_bytes()).await?;
        self.io.shutdown().await?;
        debug!("Closed stream");
        Ok(())
    }
}

impl PacketSink for OutboundStream {
    async fn transmit(&mut self, stanza: &Stanza) -> Result<(), XmppError> {
        let element = Element::from(stanza);
        self.send_element(&element).await?;
        trace!(kind = %stanza.kind(), id = ?stanza.id(), "Transmitted stanza");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    const SERVER_HEADER: &str = "<stream:stream xmlns='jabber:client' \
        xmlns:stream='http://etherx.jabber.org/streams' id='s1' from='example.com' version='1.0'>";

    #[tokio::test]
    async fn writes_header_then_elements() {
        let (client, mut server) = duplex(4096);
        let mut stream = StreamContext::new(Box::new(client), None);

        stream.open("example.com", Some("en")).await.unwrap();
        stream
            .send_element(&Element::builder("starttls", ns::TLS).build())
            .await
            .unwrap();
        drop(stream);

        let mut written = String::new();
        server.read_to_string(&mut written).await.unwrap();
        assert!(written.starts_with("<?xml version='1.0'?><stream:stream"));
        assert!(written.contains("to='example.com'"));
        assert!(written.contains("xml:lang='en'"));
        assert!(written.contains("starttls"));
    }

    #[tokio::test]
    async fn element_before_header_is_rejected() {
        let (client, _server) = duplex(4096);
        let mut stream = StreamContext::new(Box::new(client), None);
        let result = stream
            .send_element(&Element::builder("presence", ns::JABBER_CLIENT).build())
            .await;
        assert!(matches!(result, Err(XmppError::Internal(_))));
    }

    #[tokio::test]
    async fn stream_error_is_surfaced() {
        let (client, mut server) = duplex(4096);
        let mut stream = StreamContext::new(Box::new(client), None);

        server
            .write_all(
                format!(
                    "{}<stream:error><host-unknown xmlns='urn:ietf:params:xml:ns:xmpp-streams'/>\
                     <text xmlns='urn:ietf:params:xml:ns:xmpp-streams'>no such host</text></stream:error>",
                    SERVER_HEADER
                )
                .as_bytes(),
            )
            .await
            .unwrap();

        stream.read_header().await.unwrap();
        match stream.next_element().await {
            Err(XmppError::Stream { condition, text }) => {
                assert_eq!(condition, "host-unknown");
                assert_eq!(text.as_deref(), Some("no such host"));
            }
            other => panic!("expected stream error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn eof_during_negotiation_is_connection_closed() {
        let (client, server) = duplex(4096);
        let mut stream = StreamContext::new(Box::new(client), None);
        drop(server);

        assert!(matches!(
            stream.read_header().await,
            Err(XmppError::ConnectionClosed(_))
        ));
    }

    #[tokio::test]
    async fn restart_resets_features_and_writer() {
        let (client, _server) = duplex(4096);
        let mut stream = StreamContext::new(Box::new(client), None);
        stream.open("example.com", None).await.unwrap();
        stream.features.binding_supported = true;

        stream.restart();

        assert_eq!(stream.features, StreamFeatures::default());
        assert!(!stream.writer.header_sent());
    }

    #[tokio::test]
    async fn halves_exchange_stanzas() {
        let (client, mut server) = duplex(4096);
        let mut stream = StreamContext::new(Box::new(client), None);
        server.write_all(SERVER_HEADER.as_bytes()).await.unwrap();
        stream.open("example.com", None).await.unwrap();
        stream.read_header().await.unwrap();

        let (mut inbound, mut outbound) = stream.into_halves().unwrap();

        server
            .write_all(b"<message id='m1' from='juliet@example.com'><body>hi</body></message>")
            .await
            .unwrap();
        let stanza = inbound.next_stanza().await.unwrap().unwrap();
        assert_eq!(stanza.id(), Some("m1"));

        outbound.close().await.unwrap();
        let mut written = String::new();
        server.read_to_string(&mut written).await.unwrap();
        assert!(written.ends_with("</stream:stream>"));

        server.write_all(b"</stream:stream>").await.unwrap();
        assert!(inbound.next_stanza().await.unwrap().is_none());
    }
}
