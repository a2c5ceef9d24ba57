//! Incremental framing of the XMPP XML stream.
//!
//! An XMPP session is one long-lived XML document: the `<stream:stream>`
//! opening tag arrives first and is only closed when the session ends. The
//! parser here accumulates bytes from the socket and cuts them into
//! [`StreamEvent`]s: the stream header, each complete top-level element, and
//! the stream close. Top-level elements are handed to minidom inside a copy
//! of the stream opening tag so they inherit its namespace declarations.

use minidom::Element;

use crate::error::{XmppError, stream_errors};

/// Namespace URIs used in XMPP
pub mod ns {
    /// XMPP client namespace
    pub const JABBER_CLIENT: &str = "jabber:client";
    /// XMPP streams namespace
    pub const STREAM: &str = "http://etherx.jabber.org/streams";
    /// STARTTLS namespace
    pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
    /// SASL namespace
    pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
    /// Resource binding namespace
    pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
    /// Session namespace
    pub const SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";
    /// Stanza error namespace
    pub const STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
    /// Stream error namespace
    pub const STREAMS: &str = "urn:ietf:params:xml:ns:xmpp-streams";
}

/// Parsed stream header information.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamHeader {
    /// The 'to' attribute
    pub to: Option<String>,
    /// The 'from' attribute (the server host echo)
    pub from: Option<String>,
    /// The 'id' attribute (stream ID, set by server)
    pub id: Option<String>,
    /// The 'version' attribute
    pub version: Option<String>,
    /// The 'xml:lang' attribute
    pub lang: Option<String>,
}

impl StreamHeader {
    /// Parse a stream header from its opening tag.
    ///
    /// The tag is intentionally unclosed, so attributes are read directly off
    /// the tag text instead of going through minidom.
    pub fn parse(tag: &str) -> Result<Self, XmppError> {
        let attributes = parse_attributes(tag)?;
        let find = |name: &str| {
            attributes
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.clone())
        };

        Ok(StreamHeader {
            to: find("to"),
            from: find("from"),
            id: find("id"),
            version: find("version"),
            lang: find("xml:lang"),
        })
    }

    /// Reject servers that do not speak version 1.x of the protocol.
    ///
    /// A header without a version attribute announces a pre-1.0 server, which
    /// cannot advertise stream features.
    pub fn validate(&self) -> Result<(), XmppError> {
        let major = self
            .version
            .as_deref()
            .and_then(|version| version.split('.').next())
            .and_then(|major| major.trim().parse::<u32>().ok());

        match major {
            Some(1) => Ok(()),
            _ => Err(XmppError::Stream {
                condition: stream_errors::UNSUPPORTED_VERSION.to_string(),
                text: Some(format!(
                    "server announced version {}",
                    self.version.as_deref().unwrap_or("<none>")
                )),
            }),
        }
    }
}

/// One unit cut from the inbound byte stream.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// The peer opened (or re-opened) the stream.
    Header(StreamHeader),
    /// A complete top-level element.
    Element(Element),
    /// The peer closed the stream with `</stream:stream>`.
    End,
}

/// Incremental XML parser for an XMPP stream.
///
/// Bytes are fed in as they arrive; [`XmlParser::next_event`] yields complete
/// events and leaves partial data buffered until more bytes arrive.
#[derive(Debug, Default)]
pub struct XmlParser {
    /// Bytes received but not yet consumed
    buffer: Vec<u8>,
    /// The peer's stream opening tag, once seen
    stream_tag: Option<String>,
    /// Qualified name of the stream element (usually `stream:stream`)
    stream_qname: String,
}

impl XmlParser {
    /// Create a new XML parser.
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(8192),
            stream_tag: None,
            stream_qname: String::new(),
        }
    }

    /// Feed data into the parser.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Clear the parser state and buffer.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.stream_tag = None;
        self.stream_qname.clear();
    }

    /// Whether the peer's stream header has been seen.
    pub fn stream_open(&self) -> bool {
        self.stream_tag.is_some()
    }

    /// Whether bytes are waiting to be framed.
    pub fn has_buffered_data(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Remove and return any bytes that have not been framed yet.
    pub fn take_buffered(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }

    /// Cut the next complete event off the buffer.
    ///
    /// Returns `Ok(None)` when more bytes are needed.
    pub fn next_event(&mut self) -> Result<Option<StreamEvent>, XmppError> {
        let start = match skip_ignorable(&self.buffer) {
            Some(start) => start,
            None => return Ok(None),
        };
        if start > 0 {
            self.buffer.drain(..start);
        }

        if self.stream_tag.is_none() {
            return self.take_stream_header();
        }

        if self.buffer.starts_with(b"</") {
            return match find_tag_end(&self.buffer) {
                Some(end) => {
                    self.buffer.drain(..=end);
                    self.stream_tag = None;
                    Ok(Some(StreamEvent::End))
                }
                None => Ok(None),
            };
        }

        let end = match find_element_end(&self.buffer)? {
            Some(end) => end,
            None => return Ok(None),
        };

        let chunk: Vec<u8> = self.buffer.drain(..end).collect();
        let chunk = std::str::from_utf8(&chunk)
            .map_err(|e| XmppError::xml_parse(format!("Invalid UTF-8 in element: {}", e)))?;
        self.parse_child(chunk).map(|element| Some(StreamEvent::Element(element)))
    }

    fn take_stream_header(&mut self) -> Result<Option<StreamEvent>, XmppError> {
        let end = match find_tag_end(&self.buffer) {
            Some(end) => end,
            None => return Ok(None),
        };

        let raw: Vec<u8> = self.buffer.drain(..=end).collect();
        let tag = String::from_utf8(raw)
            .map_err(|e| XmppError::xml_parse(format!("Invalid UTF-8 in stream header: {}", e)))?;

        let qname = tag_name(&tag)
            .ok_or_else(|| XmppError::xml_parse("Stream header has no element name"))?
            .to_string();
        if qname != "stream" && !qname.ends_with(":stream") {
            return Err(XmppError::xml_parse(format!(
                "Expected stream header, found <{}>",
                qname
            )));
        }

        let header = StreamHeader::parse(&tag)?;
        // A self-closed header opens and closes the stream in one go.
        let open_tag = match tag.strip_suffix("/>") {
            Some(open) => format!("{}>", open),
            None => tag,
        };
        self.stream_tag = Some(open_tag);
        self.stream_qname = qname;
        Ok(Some(StreamEvent::Header(header)))
    }

    fn parse_child(&self, chunk: &str) -> Result<Element, XmppError> {
        let open_tag = self
            .stream_tag
            .as_deref()
            .ok_or_else(|| XmppError::xml_parse("Element received before stream header"))?;
        let document = format!("{}{}</{}>", open_tag, chunk, self.stream_qname);
        let root = parse_element(&document)?;
        root.children()
            .next()
            .cloned()
            .ok_or_else(|| XmppError::xml_parse(format!("No element in chunk: {}", chunk)))
    }
}

/// Skip whitespace keepalives, text, comments and processing instructions
/// between top-level elements.
///
/// Returns the offset of the next tag, or `None` if the buffer ends first.
fn skip_ignorable(buf: &[u8]) -> Option<usize> {
    let mut i = 0;
    while i < buf.len() {
        if buf[i] != b'<' {
            i += 1;
            continue;
        }
        let rest = &buf[i..];
        if rest.starts_with(b"<?") {
            i += find(rest, b"?>")? + 2;
        } else if rest.starts_with(b"<!--") {
            i += find(rest, b"-->")? + 3;
        } else if rest.len() < 4 && b"<!--".starts_with(rest) {
            return None;
        } else {
            return Some(i);
        }
    }
    None
}

/// Find the offset just past the end of the element starting at `buf[0]`.
fn find_element_end(buf: &[u8]) -> Result<Option<usize>, XmppError> {
    let mut depth = 0usize;
    let mut i = 0;

    while i < buf.len() {
        if buf[i] != b'<' {
            i += 1;
            continue;
        }
        let rest = &buf[i..];

        if rest.starts_with(b"<!--") {
            match find(rest, b"-->") {
                Some(pos) => i += pos + 3,
                None => return Ok(None),
            }
            continue;
        }
        if rest.starts_with(b"<![CDATA[") {
            match find(rest, b"]]>") {
                Some(pos) => i += pos + 3,
                None => return Ok(None),
            }
            continue;
        }
        if rest.starts_with(b"<?") {
            match find(rest, b"?>") {
                Some(pos) => i += pos + 2,
                None => return Ok(None),
            }
            continue;
        }

        let tag_end = match find_tag_end(rest) {
            Some(end) => end,
            None => return Ok(None),
        };

        if rest.get(1) == Some(&b'/') {
            depth = depth
                .checked_sub(1)
                .ok_or_else(|| XmppError::xml_parse("Unbalanced closing tag"))?;
        } else if rest[tag_end - 1] != b'/' {
            depth += 1;
        }

        i += tag_end + 1;
        if depth == 0 {
            return Ok(Some(i));
        }
    }

    Ok(None)
}

/// Offset of the `>` closing the tag that starts at `buf[0]`, skipping quoted
/// attribute values.
fn find_tag_end(buf: &[u8]) -> Option<usize> {
    let mut quote: Option<u8> = None;
    for (i, &byte) in buf.iter().enumerate().skip(1) {
        match quote {
            Some(q) if byte == q => quote = None,
            Some(_) => {}
            None if byte == b'"' || byte == b'\'' => quote = Some(byte),
            None if byte == b'>' => return Some(i),
            None => {}
        }
    }
    None
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}

/// Qualified name of the tag starting at `tag[0]`.
fn tag_name(tag: &str) -> Option<&str> {
    let inner = tag.strip_prefix('<')?;
    let end = inner
        .find(|c: char| c.is_whitespace() || c == '>' || c == '/')
        .unwrap_or(inner.len());
    let name = &inner[..end];
    (!name.is_empty()).then_some(name)
}

/// Read `name='value'` pairs off an opening tag.
fn parse_attributes(tag: &str) -> Result<Vec<(String, String)>, XmppError> {
    let name = tag_name(tag).ok_or_else(|| XmppError::xml_parse("Tag has no element name"))?;
    let mut rest = tag[1 + name.len()..]
        .trim_end_matches('>')
        .trim_end_matches('/');
    let mut attributes = Vec::new();

    loop {
        rest = rest.trim_start();
        if rest.is_empty() {
            break;
        }
        let eq = rest
            .find('=')
            .ok_or_else(|| XmppError::xml_parse(format!("Malformed attribute in: {}", tag)))?;
        let key = rest[..eq].trim().to_string();
        let after = rest[eq + 1..].trim_start();
        let quote = after
            .chars()
            .next()
            .filter(|c| *c == '"' || *c == '\'')
            .ok_or_else(|| XmppError::xml_parse(format!("Unquoted attribute '{}'", key)))?;
        let close = after[1..]
            .find(quote)
            .ok_or_else(|| XmppError::xml_parse(format!("Unterminated attribute '{}'", key)))?;
        attributes.push((key, unescape(&after[1..1 + close])));
        rest = &after[close + 2..];
    }

    Ok(attributes)
}

/// Escape text for use inside a quoted attribute value.
pub fn escape_attribute(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            other => out.push(other),
        }
    }
    out
}

fn unescape(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&apos;", "'")
        .replace("&quot;", "\"")
        .replace("&amp;", "&")
}

/// Parse a string into a minidom Element.
pub fn parse_element(data: &str) -> Result<Element, XmppError> {
    data.parse::<Element>()
        .map_err(|e| XmppError::xml_parse(format!("Failed to parse element: {}", e)))
}

/// Convert a minidom Element back to an XML string.
pub fn element_to_string(element: &Element) -> Result<String, XmppError> {
    let mut output = Vec::new();
    element
        .write_to(&mut output)
        .map_err(|e| XmppError::xml_parse(format!("Failed to serialize element: {}", e)))?;
    String::from_utf8(output).map_err(|e| XmppError::xml_parse(format!("Invalid UTF-8: {}", e)))
}
