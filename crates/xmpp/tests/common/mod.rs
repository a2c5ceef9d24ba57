//! Test utilities: a scripted XMPP server on one end of an in-memory pipe
//! and a connector that hands out the other end.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex};
use tokio::time::timeout;
use waddle_xmpp_client::{BoxedStream, Connector, XmppError};

/// Default timeout for a single scripted read.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

pub const SASL_NS: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
pub const TLS_NS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
pub const BIND_NS: &str = "urn:ietf:params:xml:ns:xmpp-bind";
pub const SESSION_NS: &str = "urn:ietf:params:xml:ns:xmpp-session";

/// Connected client and server ends.
pub fn pipe() -> (DuplexStream, ScriptedServer) {
    let (client, server) = duplex(16 * 1024);
    (client, ScriptedServer::new(server))
}

/// Server side of a negotiation, driven step by step by the test.
pub struct ScriptedServer {
    io: DuplexStream,
    buffer: String,
}

impl ScriptedServer {
    pub fn new(io: DuplexStream) -> Self {
        Self {
            io,
            buffer: String::new(),
        }
    }

    pub async fn send(&mut self, data: &str) {
        self.io
            .write_all(data.as_bytes())
            .await
            .expect("server write failed");
    }

    /// Read until `pattern` appears; returns and consumes everything up to
    /// and including it.
    pub async fn read_until(&mut self, pattern: &str) -> String {
        loop {
            if let Some(pos) = self.buffer.find(pattern) {
                let end = pos + pattern.len();
                let consumed: String = self.buffer.drain(..end).collect();
                return consumed;
            }

            let mut buf = [0u8; 4096];
            let n = timeout(DEFAULT_TIMEOUT, self.io.read(&mut buf))
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for {pattern:?}; have {:?}", self.buffer))
                .expect("server read failed");
            assert!(n > 0, "client closed while waiting for {pattern:?}; have {:?}", self.buffer);
            self.buffer.push_str(&String::from_utf8_lossy(&buf[..n]));
        }
    }

    /// Everything the client writes until it closes its end.
    pub async fn read_to_end(&mut self) -> String {
        let mut rest = Vec::new();
        timeout(DEFAULT_TIMEOUT, self.io.read_to_end(&mut rest))
            .await
            .expect("timed out waiting for client to close")
            .expect("server read failed");
        let mut all = std::mem::take(&mut self.buffer);
        all.push_str(&String::from_utf8_lossy(&rest));
        all
    }

    /// Consume the client's stream header.
    pub async fn expect_stream_header(&mut self) -> String {
        let mut header = self.read_until("<stream:stream").await;
        header.push_str(&self.read_until(">").await);
        header
    }

    /// Open the server side of the stream.
    pub async fn send_stream_header(&mut self, id: &str) {
        self.send(&stream_header(id, "example.com", "1.0")).await;
    }

    pub async fn send_features(&mut self, features: &str) {
        self.send(&format!("<stream:features>{features}</stream:features>"))
            .await;
    }

    /// Answer a client header with ours plus a feature set.
    pub async fn open_stream(&mut self, id: &str, features: &str) -> String {
        let header = self.expect_stream_header().await;
        self.send_stream_header(id).await;
        self.send_features(features).await;
        header
    }

    /// Read the next complete `<name>` element from the client, whether
    /// self-closed or not.
    pub async fn expect_element(&mut self, name: &str) -> String {
        let mut element = self.read_until(&format!("<{name}")).await;
        element.push_str(&self.read_until(">").await);
        if !element.ends_with("/>") {
            element.push_str(&self.read_until(&format!("</{name}>")).await);
        }
        element
    }
}

pub fn stream_header(id: &str, from: &str, version: &str) -> String {
    format!(
        "<?xml version='1.0'?><stream:stream xmlns='jabber:client' \
         xmlns:stream='http://etherx.jabber.org/streams' id='{id}' from='{from}' \
         version='{version}' xml:lang='en'>"
    )
}

pub fn mechanisms(names: &[&str]) -> String {
    let inner: String = names
        .iter()
        .map(|name| format!("<mechanism>{name}</mechanism>"))
        .collect();
    format!("<mechanisms xmlns='{SASL_NS}'>{inner}</mechanisms>")
}

pub fn starttls(required: bool) -> String {
    if required {
        format!("<starttls xmlns='{TLS_NS}'><required/></starttls>")
    } else {
        format!("<starttls xmlns='{TLS_NS}'/>")
    }
}

pub fn bind_feature() -> String {
    format!("<bind xmlns='{BIND_NS}'/>")
}

pub fn session_feature() -> String {
    format!("<session xmlns='{SESSION_NS}'/>")
}

pub fn bind_result(id: &str, jid: &str) -> String {
    format!("<iq type='result' id='{id}'><bind xmlns='{BIND_NS}'><jid>{jid}</jid></bind></iq>")
}

/// Value of attribute `name` in the first tag of `xml`, with either quote style.
pub fn attr_value(xml: &str, name: &str) -> Option<String> {
    for quote in ['"', '\''] {
        let needle = format!(" {name}={quote}");
        if let Some(start) = xml.find(&needle) {
            let rest = &xml[start + needle.len()..];
            let end = rest.find(quote)?;
            return Some(rest[..end].to_string());
        }
    }
    None
}

/// Text content of the first `<name ...>text</name>` in `xml`.
pub fn element_text(xml: &str, name: &str) -> Option<String> {
    let open = xml.find(&format!("<{name}"))?;
    let after_open = &xml[open..];
    let body_start = after_open.find('>')? + 1;
    let body = &after_open[body_start..];
    let end = body.find(&format!("</{name}>"))?;
    Some(body[..end].to_string())
}

/// Hands out pre-made pipe ends and records TLS upgrades.
///
/// The TLS upgrade is a passthrough so scripted servers keep talking in
/// plain text.
#[derive(Default)]
pub struct MockConnector {
    streams: Mutex<VecDeque<DuplexStream>>,
    connects: AtomicUsize,
    tls_upgrades: AtomicUsize,
    tls_domains: Mutex<Vec<String>>,
}

impl MockConnector {
    pub fn new(streams: Vec<DuplexStream>) -> Self {
        Self {
            streams: Mutex::new(streams.into()),
            ..Self::default()
        }
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn tls_upgrades(&self) -> usize {
        self.tls_upgrades.load(Ordering::SeqCst)
    }

    pub fn tls_domains(&self) -> Vec<String> {
        self.tls_domains.lock().unwrap().clone()
    }
}

impl Connector for MockConnector {
    async fn connect(&self, _host: &str, _port: u16) -> Result<BoxedStream, XmppError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let next = self.streams.lock().unwrap().pop_front();
        match next {
            Some(stream) => Ok(Box::new(stream)),
            None => Err(XmppError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "no scripted server available",
            ))),
        }
    }

    async fn upgrade_to_tls(
        &self,
        stream: BoxedStream,
        domain: &str,
    ) -> Result<BoxedStream, XmppError> {
        self.tls_upgrades.fetch_add(1, Ordering::SeqCst);
        self.tls_domains.lock().unwrap().push(domain.to_string());
        Ok(stream)
    }
}
