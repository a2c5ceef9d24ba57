//! DIGEST-MD5 (RFC 2831).
//!
//! The exchange takes three round trips: an empty `<auth/>`, a response to
//! the server's digest challenge, and an empty response acknowledging the
//! server's `rspauth`.

use rand::Rng;
use tracing::{debug, warn};

use super::{SaslReply, read_reply, sasl_element};
use crate::error::XmppError;
use crate::session::{Credentials, SessionContext};
use crate::stream::StreamContext;

const NONCE_COUNT: &str = "00000001";
const QOP_AUTH: &str = "auth";

/// Directives from the server's first challenge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DigestChallenge {
    /// First realm offered, if any
    pub realm: Option<String>,
    /// Server nonce
    pub nonce: String,
    /// Offered quality-of-protection values
    pub qop: Vec<String>,
    /// Offered charset
    pub charset: Option<String>,
    /// Hash algorithm (must be `md5-sess`)
    pub algorithm: Option<String>,
}

impl DigestChallenge {
    /// Parse and check a challenge.
    ///
    /// The server must offer `qop=auth`, `algorithm=md5-sess` and a nonce.
    pub fn parse(data: &[u8]) -> Result<Self, XmppError> {
        let text = std::str::from_utf8(data)
            .map_err(|e| XmppError::protocol_violation(format!("challenge is not UTF-8: {}", e)))?;

        let mut challenge = DigestChallenge::default();
        let mut nonce = None;
        for (key, value) in parse_directives(text)? {
            match key.as_str() {
                "realm" if challenge.realm.is_none() => challenge.realm = Some(value),
                "nonce" => nonce = Some(value),
                "qop" => {
                    challenge.qop = value
                        .split(',')
                        .map(|qop| qop.trim().to_string())
                        .filter(|qop| !qop.is_empty())
                        .collect();
                }
                "charset" => challenge.charset = Some(value),
                "algorithm" => challenge.algorithm = Some(value),
                _ => {}
            }
        }

        challenge.nonce = nonce
            .filter(|nonce| !nonce.is_empty())
            .ok_or_else(|| XmppError::protocol_violation("DIGEST-MD5 challenge has no nonce"))?;
        if !challenge.qop.iter().any(|qop| qop == QOP_AUTH) {
            return Err(XmppError::protocol_violation(format!(
                "DIGEST-MD5 challenge does not offer qop=auth (offered {:?})",
                challenge.qop
            )));
        }
        if challenge.algorithm.as_deref() != Some("md5-sess") {
            return Err(XmppError::protocol_violation(format!(
                "DIGEST-MD5 challenge has unsupported algorithm {:?}",
                challenge.algorithm
            )));
        }

        Ok(challenge)
    }
}

/// Split `key=value,key="quoted, value"` into pairs.
fn parse_directives(text: &str) -> Result<Vec<(String, String)>, XmppError> {
    let mut directives = Vec::new();
    let mut chars = text.chars().peekable();

    loop {
        while matches!(chars.peek(), Some(c) if c.is_whitespace() || *c == ',') {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        let key: String = chars
            .by_ref()
            .take_while(|c| *c != '=')
            .collect::<String>()
            .trim()
            .to_ascii_lowercase();
        if key.is_empty() {
            return Err(XmppError::protocol_violation(format!(
                "malformed DIGEST-MD5 directive in '{}'",
                text
            )));
        }

        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            let mut closed = false;
            while let Some(c) = chars.next() {
                match c {
                    '\\' => value.extend(chars.next()),
                    '"' => {
                        closed = true;
                        break;
                    }
                    other => value.push(other),
                }
            }
            if !closed {
                return Err(XmppError::protocol_violation(format!(
                    "unterminated quoted value for '{}'",
                    key
                )));
            }
        } else {
            while let Some(c) = chars.peek() {
                if *c == ',' {
                    break;
                }
                value.push(*c);
                chars.next();
            }
            value = value.trim().to_string();
        }

        directives.push((key, value));
    }

    Ok(directives)
}

fn hex_md5(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

/// Compute the `response` directive.
///
/// `A1 = MD5(username:realm:password) ":" nonce ":" cnonce` and
/// `A2 = "AUTHENTICATE:" digest-uri`.
pub fn compute_response(
    username: &str,
    realm: &str,
    password: &str,
    nonce: &str,
    cnonce: &str,
    digest_uri: &str,
    qop: &str,
) -> String {
    digest(username, realm, password, nonce, cnonce, qop, &format!("AUTHENTICATE:{digest_uri}"))
}

/// The `rspauth` value the server is expected to send back.
fn compute_rspauth(
    username: &str,
    realm: &str,
    password: &str,
    nonce: &str,
    cnonce: &str,
    digest_uri: &str,
    qop: &str,
) -> String {
    digest(username, realm, password, nonce, cnonce, qop, &format!(":{digest_uri}"))
}

fn digest(
    username: &str,
    realm: &str,
    password: &str,
    nonce: &str,
    cnonce: &str,
    qop: &str,
    a2: &str,
) -> String {
    let secret = md5::compute(format!("{username}:{realm}:{password}"));
    let mut a1 = secret.0.to_vec();
    a1.extend_from_slice(format!(":{nonce}:{cnonce}").as_bytes());

    let kd = format!(
        "{}:{nonce}:{NONCE_COUNT}:{cnonce}:{qop}:{}",
        hex_md5(&a1),
        hex_md5(a2.as_bytes())
    );
    hex_md5(kd.as_bytes())
}

fn generate_cnonce() -> String {
    let bytes: [u8; 16] = rand::rng().random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

pub(super) async fn authenticate(
    session: &SessionContext,
    stream: &mut StreamContext,
    credentials: &Credentials,
) -> Result<(), XmppError> {
    let mut auth = sasl_element("auth", None);
    auth.set_attr("mechanism", "DIGEST-MD5");
    stream.send_element(&auth).await?;

    let challenge = match read_reply(stream).await? {
        SaslReply::Challenge(data) => DigestChallenge::parse(&data)?,
        SaslReply::Success(_) => {
            return Err(XmppError::protocol_violation(
                "DIGEST-MD5 succeeded before any challenge",
            ));
        }
    };

    let realm = challenge
        .realm
        .clone()
        .unwrap_or_else(|| session.host_name.clone());
    let digest_uri = format!("xmpp/{}", session.host_name);
    let cnonce = generate_cnonce();
    let response = compute_response(
        &credentials.username,
        &realm,
        &credentials.password,
        &challenge.nonce,
        &cnonce,
        &digest_uri,
        QOP_AUTH,
    );

    let mut directives = vec![
        format!("username={}", quote(&credentials.username)),
        format!("realm={}", quote(&realm)),
        format!("nonce={}", quote(&challenge.nonce)),
        format!("cnonce={}", quote(&cnonce)),
        format!("nc={NONCE_COUNT}"),
        format!("qop={QOP_AUTH}"),
        format!("digest-uri={}", quote(&digest_uri)),
        format!("response={response}"),
    ];
    if challenge.charset.as_deref() == Some("utf-8") {
        directives.push("charset=utf-8".to_string());
    }
    let payload = directives.join(",");
    stream
        .send_element(&sasl_element("response", Some(payload.as_bytes())))
        .await?;
    debug!(realm = %realm, "Sent DIGEST-MD5 response");

    let expected_rspauth = compute_rspauth(
        &credentials.username,
        &realm,
        &credentials.password,
        &challenge.nonce,
        &cnonce,
        &digest_uri,
        QOP_AUTH,
    );

    match read_reply(stream).await? {
        SaslReply::Success(data) => {
            check_rspauth(&data, &expected_rspauth);
            return Ok(());
        }
        SaslReply::Challenge(data) => {
            check_rspauth(&data, &expected_rspauth);
            stream.send_element(&sasl_element("response", None)).await?;
        }
    }

    match read_reply(stream).await? {
        SaslReply::Success(_) => Ok(()),
        SaslReply::Challenge(_) => Err(XmppError::protocol_violation(
            "unexpected third DIGEST-MD5 challenge",
        )),
    }
}

fn check_rspauth(data: &[u8], expected: &str) {
    if data.is_empty() {
        return;
    }
    let received = std::str::from_utf8(data)
        .ok()
        .and_then(|text| parse_directives(text).ok())
        .and_then(|directives| {
            directives
                .into_iter()
                .find(|(key, _)| key == "rspauth")
                .map(|(_, value)| value)
        });
    if received.as_deref() != Some(expected) {
        warn!("DIGEST-MD5 rspauth did not match the expected value");
    }
}
