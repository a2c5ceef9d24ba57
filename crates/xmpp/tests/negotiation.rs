//! Client negotiation against scripted servers.

mod common;

use assert_matches::assert_matches;
use base64::prelude::*;
use tokio::io::DuplexStream;
use waddle_xmpp_client::sasl::compute_response;
use waddle_xmpp_client::{
    Credentials, Mechanism, NegotiationOptions, NegotiationState, Negotiator, SessionContext,
    StanzaErrorCondition, StanzaErrorType, StreamContext, XmppError,
};

use common::*;

const PLAIN_PAYLOAD: &str = "cm9tZW9AZXhhbXBsZS5jb20Acm9tZW8AcGFzcw==";

struct Outcome {
    result: Result<(), XmppError>,
    session: SessionContext,
    encrypted: bool,
}

/// Negotiate as romeo@example.com/orchard; the stream is dropped afterwards
/// so the server sees EOF.
async fn negotiate(
    client: DuplexStream,
    connector: &MockConnector,
    options: NegotiationOptions,
) -> Outcome {
    let credentials = Credentials::new("romeo", "pass", Some("orchard".to_string()));
    let mut stream = StreamContext::new(Box::new(client), Some(credentials));
    let mut session = SessionContext::new("example.com");

    let result = Negotiator::new(connector, &options)
        .negotiate(&mut session, &mut stream)
        .await;

    Outcome {
        result,
        session,
        encrypted: stream.is_encrypted(),
    }
}

fn failure(outcome: Outcome) -> (NegotiationState, XmppError) {
    match outcome.result {
        Err(XmppError::Negotiation { state, source }) => (state, *source),
        other => panic!("expected a negotiation failure, got {:?}", other),
    }
}

fn directive(payload: &str, key: &str) -> Option<String> {
    payload.split(',').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k.trim() == key).then(|| v.trim().trim_matches('"').to_string())
    })
}

#[tokio::test]
async fn empty_features_complete_without_further_traffic() {
    let (client, mut server) = pipe();
    let connector = MockConnector::default();

    let script = async move {
        let header = server.open_stream("s1", "").await;
        (header, server.read_to_end().await)
    };
    let (outcome, (header, rest)) = tokio::join!(
        negotiate(client, &connector, NegotiationOptions::default()),
        script
    );

    assert!(header.contains("to='example.com'"));
    assert!(header.contains("version='1.0'"));
    assert!(outcome.result.is_ok());
    assert_eq!(outcome.session.stream_id.as_deref(), Some("s1"));
    assert_eq!(outcome.session.locale.as_deref(), Some("en"));
    assert_eq!(outcome.session.bound_jid, None);
    assert!(!outcome.encrypted);
    assert_eq!(rest, "");
    assert_eq!(connector.tls_upgrades(), 0);
}

#[tokio::test]
async fn starttls_plain_bind_and_session() {
    let (client, mut server) = pipe();
    let connector = MockConnector::default();

    let script = async move {
        server
            .open_stream("s1", &format!("{}{}", starttls(false), mechanisms(&["PLAIN"])))
            .await;
        let request = server.expect_element("starttls").await;
        assert!(request.contains(TLS_NS));
        server.send(&format!("<proceed xmlns='{TLS_NS}'/>")).await;

        server.open_stream("s2", &mechanisms(&["PLAIN"])).await;
        let auth = server.expect_element("auth").await;
        assert!(auth.contains("PLAIN"));
        assert!(auth.contains(PLAIN_PAYLOAD));
        server.send(&format!("<success xmlns='{SASL_NS}'/>")).await;

        server
            .open_stream("s3", &format!("{}{}", bind_feature(), session_feature()))
            .await;
        let bind = server.expect_element("iq").await;
        assert_eq!(attr_value(&bind, "id").as_deref(), Some("bind_1"));
        assert_eq!(attr_value(&bind, "type").as_deref(), Some("set"));
        assert_eq!(element_text(&bind, "resource").as_deref(), Some("orchard"));
        server
            .send(&bind_result("bind_1", "romeo@example.com/orchard"))
            .await;

        let session = server.expect_element("iq").await;
        assert_eq!(attr_value(&session, "id").as_deref(), Some("sess_1"));
        assert!(session.contains(SESSION_NS));
        server.send("<iq type='result' id='sess_1'/>").await;

        server.read_to_end().await
    };
    let (outcome, rest) = tokio::join!(
        negotiate(client, &connector, NegotiationOptions::default()),
        script
    );

    assert!(outcome.result.is_ok(), "{:?}", outcome.result);
    assert!(outcome.encrypted);
    assert_eq!(connector.tls_upgrades(), 1);
    assert_eq!(connector.tls_domains(), vec!["example.com".to_string()]);
    assert_eq!(
        outcome.session.bound_jid.map(|jid| jid.to_string()).as_deref(),
        Some("romeo@example.com/orchard")
    );
    assert_eq!(outcome.session.username.as_deref(), Some("romeo"));
    assert_eq!(outcome.session.resource.as_deref(), Some("orchard"));
    assert_eq!(outcome.session.stream_id.as_deref(), Some("s3"));
    assert_eq!(rest, "");
}

#[tokio::test]
async fn digest_md5_three_step_exchange() {
    let (client, mut server) = pipe();
    let connector = MockConnector::default();

    let script = async move {
        server
            .open_stream("s1", &mechanisms(&["PLAIN", "DIGEST-MD5"]))
            .await;
        let auth = server.expect_element("auth").await;
        assert!(auth.contains("DIGEST-MD5"));
        assert_eq!(element_text(&auth, "auth").unwrap_or_default(), "");

        let challenge = BASE64_STANDARD.encode(
            r#"realm="example.com",nonce="OA6MG9tEQGm2hh",qop="auth",charset=utf-8,algorithm=md5-sess"#,
        );
        server
            .send(&format!("<challenge xmlns='{SASL_NS}'>{challenge}</challenge>"))
            .await;

        let response = server.expect_element("response").await;
        let encoded = element_text(&response, "response").expect("response has a payload");
        let payload = String::from_utf8(BASE64_STANDARD.decode(encoded).unwrap()).unwrap();

        let rspauth = BASE64_STANDARD.encode("rspauth=ea40f60335c427b5527b84dbabcdfffd");
        server
            .send(&format!("<challenge xmlns='{SASL_NS}'>{rspauth}</challenge>"))
            .await;

        let acknowledgement = server.expect_element("response").await;
        assert_eq!(element_text(&acknowledgement, "response").unwrap_or_default(), "");
        server.send(&format!("<success xmlns='{SASL_NS}'/>")).await;

        server.open_stream("s2", "").await;
        (payload, server.read_to_end().await)
    };
    let (outcome, (payload, rest)) = tokio::join!(
        negotiate(client, &connector, NegotiationOptions::default()),
        script
    );

    assert!(outcome.result.is_ok(), "{:?}", outcome.result);
    assert_eq!(rest, "");

    assert_eq!(directive(&payload, "username").as_deref(), Some("romeo"));
    assert_eq!(directive(&payload, "realm").as_deref(), Some("example.com"));
    assert_eq!(directive(&payload, "nonce").as_deref(), Some("OA6MG9tEQGm2hh"));
    assert_eq!(directive(&payload, "nc").as_deref(), Some("00000001"));
    assert_eq!(directive(&payload, "qop").as_deref(), Some("auth"));
    assert_eq!(directive(&payload, "digest-uri").as_deref(), Some("xmpp/example.com"));
    assert_eq!(directive(&payload, "charset").as_deref(), Some("utf-8"));

    let cnonce = directive(&payload, "cnonce").expect("cnonce present");
    let expected = compute_response(
        "romeo",
        "example.com",
        "pass",
        "OA6MG9tEQGm2hh",
        &cnonce,
        "xmpp/example.com",
        "auth",
    );
    assert_eq!(directive(&payload, "response"), Some(expected));
}

/// Offer only DIGEST-MD5, send the first challenge and consume the client's
/// response.
async fn digest_until_response(server: &mut ScriptedServer) {
    server.open_stream("s1", &mechanisms(&["DIGEST-MD5"])).await;
    server.expect_element("auth").await;
    let challenge = BASE64_STANDARD.encode(
        r#"realm="example.com",nonce="OA6MG9tEQGm2hh",qop="auth",charset=utf-8,algorithm=md5-sess"#,
    );
    server
        .send(&format!("<challenge xmlns='{SASL_NS}'>{challenge}</challenge>"))
        .await;
    server.expect_element("response").await;
}

#[tokio::test]
async fn digest_md5_failure_after_response_aborts() {
    let (client, mut server) = pipe();
    let connector = MockConnector::default();

    let script = async move {
        digest_until_response(&mut server).await;
        server
            .send(&format!("<failure xmlns='{SASL_NS}'><not-authorized/></failure>"))
            .await;
        server.read_to_end().await
    };
    let (outcome, rest) = tokio::join!(
        negotiate(client, &connector, NegotiationOptions::default()),
        script
    );

    assert_eq!(rest, "");
    let (state, source) = failure(outcome);
    assert_eq!(state, NegotiationState::Authenticated);
    assert_matches!(
        source,
        XmppError::AuthenticationFailure { condition, .. } if condition == "not-authorized"
    );
}

#[tokio::test]
async fn digest_md5_failure_after_rspauth_acknowledgement_aborts() {
    let (client, mut server) = pipe();
    let connector = MockConnector::default();

    let script = async move {
        digest_until_response(&mut server).await;
        let rspauth = BASE64_STANDARD.encode("rspauth=ea40f60335c427b5527b84dbabcdfffd");
        server
            .send(&format!("<challenge xmlns='{SASL_NS}'>{rspauth}</challenge>"))
            .await;
        server.expect_element("response").await;
        server
            .send(&format!(
                "<failure xmlns='{SASL_NS}'><temporary-auth-failure/></failure>"
            ))
            .await;
        server.read_to_end().await
    };
    let (outcome, rest) = tokio::join!(
        negotiate(client, &connector, NegotiationOptions::default()),
        script
    );

    assert_eq!(rest, "");
    let (state, source) = failure(outcome);
    assert_eq!(state, NegotiationState::Authenticated);
    assert_matches!(
        source,
        XmppError::AuthenticationFailure { condition, .. } if condition == "temporary-auth-failure"
    );
}

#[tokio::test]
async fn digest_md5_success_carrying_rspauth_completes() {
    let (client, mut server) = pipe();
    let connector = MockConnector::default();

    let script = async move {
        digest_until_response(&mut server).await;
        let rspauth = BASE64_STANDARD.encode("rspauth=ea40f60335c427b5527b84dbabcdfffd");
        server
            .send(&format!("<success xmlns='{SASL_NS}'>{rspauth}</success>"))
            .await;
        // The next thing on the wire is the restarted stream header, not an
        // empty acknowledgement.
        let header = server.open_stream("s2", "").await;
        (header, server.read_to_end().await)
    };
    let (outcome, (header, rest)) = tokio::join!(
        negotiate(client, &connector, NegotiationOptions::default()),
        script
    );

    assert!(outcome.result.is_ok(), "{:?}", outcome.result);
    assert!(!header.contains("<response"));
    assert_eq!(outcome.session.stream_id.as_deref(), Some("s2"));
    assert_eq!(outcome.session.username.as_deref(), Some("romeo"));
    assert_eq!(rest, "");
}

#[tokio::test]
async fn configured_order_picks_plain_over_digest() {
    let (client, mut server) = pipe();
    let connector = MockConnector::default();
    let options = NegotiationOptions {
        mechanisms: vec![Mechanism::Plain, Mechanism::DigestMd5],
        ..NegotiationOptions::default()
    };

    let script = async move {
        server
            .open_stream("s1", &mechanisms(&["DIGEST-MD5", "PLAIN"]))
            .await;
        let auth = server.expect_element("auth").await;
        server.send(&format!("<success xmlns='{SASL_NS}'/>")).await;
        server.open_stream("s2", "").await;
        server.read_to_end().await;
        auth
    };
    let (outcome, auth) = tokio::join!(negotiate(client, &connector, options), script);

    assert!(outcome.result.is_ok());
    assert!(auth.contains("PLAIN"));
    assert!(!auth.contains("DIGEST-MD5"));
}

#[tokio::test]
async fn starttls_failure_aborts() {
    let (client, mut server) = pipe();
    let connector = MockConnector::default();

    let script = async move {
        server.open_stream("s1", &starttls(false)).await;
        server.expect_element("starttls").await;
        server.send(&format!("<failure xmlns='{TLS_NS}'/>")).await;
        server.read_to_end().await
    };
    let (outcome, _) = tokio::join!(
        negotiate(client, &connector, NegotiationOptions::default()),
        script
    );

    let (state, source) = failure(outcome);
    assert_eq!(state, NegotiationState::TlsReady);
    assert_matches!(source, XmppError::TlsNegotiationFailed(_));
    assert_eq!(connector.tls_upgrades(), 0);
}

#[tokio::test]
async fn unexpected_reply_to_starttls_is_protocol_violation() {
    let (client, mut server) = pipe();
    let connector = MockConnector::default();

    let script = async move {
        server.open_stream("s1", &starttls(false)).await;
        server.expect_element("starttls").await;
        server.send(&format!("<success xmlns='{SASL_NS}'/>")).await;
        server.read_to_end().await
    };
    let (outcome, _) = tokio::join!(
        negotiate(client, &connector, NegotiationOptions::default()),
        script
    );

    let (state, source) = failure(outcome);
    assert_eq!(state, NegotiationState::TlsReady);
    assert_matches!(source, XmppError::ProtocolViolation(_));
}

#[tokio::test]
async fn disabled_starttls_is_skipped_silently() {
    let (client, mut server) = pipe();
    let connector = MockConnector::default();
    let options = NegotiationOptions {
        starttls: false,
        ..NegotiationOptions::default()
    };

    let script = async move {
        server.open_stream("s1", &starttls(false)).await;
        server.read_to_end().await
    };
    let (outcome, rest) = tokio::join!(negotiate(client, &connector, options), script);

    assert!(outcome.result.is_ok());
    assert!(!outcome.encrypted);
    assert_eq!(rest, "");
}

#[tokio::test]
async fn required_starttls_with_tls_disabled_fails_without_traffic() {
    let (client, mut server) = pipe();
    let connector = MockConnector::default();
    let options = NegotiationOptions {
        starttls: false,
        ..NegotiationOptions::default()
    };

    let script = async move {
        server.open_stream("s1", &starttls(true)).await;
        server.read_to_end().await
    };
    let (outcome, rest) = tokio::join!(negotiate(client, &connector, options), script);

    let (state, source) = failure(outcome);
    assert_eq!(state, NegotiationState::TlsReady);
    assert_matches!(source, XmppError::TlsNegotiationFailed(_));
    assert_eq!(rest, "");
}

#[tokio::test]
async fn tls_is_verified_against_configured_host() {
    let (client, mut server) = pipe();
    let connector = MockConnector::default();

    let script = async move {
        server.expect_stream_header().await;
        server
            .send(&stream_header("s1", "chat.example.com", "1.0"))
            .await;
        server.send_features(&starttls(true)).await;
        server.expect_element("starttls").await;
        server.send(&format!("<proceed xmlns='{TLS_NS}'/>")).await;

        let header = server.expect_stream_header().await;
        server
            .send(&stream_header("s2", "chat.example.com", "1.0"))
            .await;
        server.send_features("").await;
        server.read_to_end().await;
        header
    };
    let (outcome, second_header) = tokio::join!(
        negotiate(client, &connector, NegotiationOptions::default()),
        script
    );

    assert!(outcome.result.is_ok());
    assert_eq!(connector.tls_domains(), vec!["example.com".to_string()]);
    assert_eq!(outcome.session.host_name, "chat.example.com");
    assert!(second_header.contains("to='chat.example.com'"));
}

#[tokio::test]
async fn unsupported_version_is_stream_error() {
    let (client, mut server) = pipe();
    let connector = MockConnector::default();

    let script = async move {
        server.expect_stream_header().await;
        server.send(&stream_header("s1", "example.com", "2.0")).await;
        server.read_to_end().await
    };
    let (outcome, _) = tokio::join!(
        negotiate(client, &connector, NegotiationOptions::default()),
        script
    );

    let (state, source) = failure(outcome);
    assert_eq!(state, NegotiationState::VersionChecked);
    assert_matches!(source, XmppError::Stream { condition, .. } if condition == "unsupported-version");
}

#[tokio::test]
async fn stream_error_instead_of_features() {
    let (client, mut server) = pipe();
    let connector = MockConnector::default();

    let script = async move {
        server.expect_stream_header().await;
        server.send_stream_header("s1").await;
        server
            .send(
                "<stream:error><host-unknown xmlns='urn:ietf:params:xml:ns:xmpp-streams'/>\
                 </stream:error>",
            )
            .await;
        server.read_to_end().await
    };
    let (outcome, _) = tokio::join!(
        negotiate(client, &connector, NegotiationOptions::default()),
        script
    );

    let (state, source) = failure(outcome);
    assert_eq!(state, NegotiationState::VersionChecked);
    assert_matches!(source, XmppError::Stream { condition, .. } if condition == "host-unknown");
}

#[tokio::test]
async fn no_common_mechanism() {
    let (client, mut server) = pipe();
    let connector = MockConnector::default();

    let script = async move {
        server
            .open_stream("s1", &mechanisms(&["SCRAM-SHA-1", "EXTERNAL"]))
            .await;
        server.read_to_end().await
    };
    let (outcome, rest) = tokio::join!(
        negotiate(client, &connector, NegotiationOptions::default()),
        script
    );

    let (state, source) = failure(outcome);
    assert_eq!(state, NegotiationState::Authenticated);
    assert_matches!(
        source,
        XmppError::NoAuthenticatorAvailable { offered } if offered == vec!["SCRAM-SHA-1", "EXTERNAL"]
    );
    assert_eq!(rest, "");
}

#[tokio::test]
async fn sasl_failure_reports_condition() {
    let (client, mut server) = pipe();
    let connector = MockConnector::default();

    let script = async move {
        server.open_stream("s1", &mechanisms(&["PLAIN"])).await;
        server.expect_element("auth").await;
        server
            .send(&format!(
                "<failure xmlns='{SASL_NS}'><not-authorized/><text>bad password</text></failure>"
            ))
            .await;
        server.read_to_end().await
    };
    let (outcome, _) = tokio::join!(
        negotiate(client, &connector, NegotiationOptions::default()),
        script
    );

    let (state, source) = failure(outcome);
    assert_eq!(state, NegotiationState::Authenticated);
    assert!(!source.is_retryable());
    assert_matches!(
        source,
        XmppError::AuthenticationFailure { condition, text }
            if condition == "not-authorized" && text.as_deref() == Some("bad password")
    );
}

#[tokio::test]
async fn bind_error_is_stanza_error() {
    let (client, mut server) = pipe();
    let connector = MockConnector::default();

    let script = async move {
        server.open_stream("s1", &bind_feature()).await;
        server.expect_element("iq").await;
        server
            .send(
                "<iq type='error' id='bind_1'><error type='cancel'>\
                 <conflict xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/></error></iq>",
            )
            .await;
        server.read_to_end().await
    };
    let (outcome, _) = tokio::join!(
        negotiate(client, &connector, NegotiationOptions::default()),
        script
    );

    let (state, source) = failure(outcome);
    assert_eq!(state, NegotiationState::Bound);
    assert_matches!(source, XmppError::Stanza(info) if info.condition == StanzaErrorCondition::Conflict);
}

#[tokio::test]
async fn session_error_is_stanza_error() {
    let (client, mut server) = pipe();
    let connector = MockConnector::default();

    let script = async move {
        server
            .open_stream("s1", &format!("{}{}", bind_feature(), session_feature()))
            .await;
        server.expect_element("iq").await;
        server
            .send(&bind_result("bind_1", "romeo@example.com/orchard"))
            .await;
        let session = server.expect_element("iq").await;
        assert_eq!(attr_value(&session, "id").as_deref(), Some("sess_1"));
        server
            .send(
                "<iq type='error' id='sess_1'><error type='wait'>\
                 <internal-server-error xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/>\
                 </error></iq>",
            )
            .await;
        server.read_to_end().await
    };
    let (outcome, _) = tokio::join!(
        negotiate(client, &connector, NegotiationOptions::default()),
        script
    );

    let (state, source) = failure(outcome);
    assert_eq!(state, NegotiationState::SessionEstablished);
    assert_matches!(
        source,
        XmppError::Stanza(info)
            if info.condition == StanzaErrorCondition::InternalServerError
                && info.error_type == StanzaErrorType::Wait
    );
}

#[tokio::test]
async fn unrelated_stanza_during_bind_is_protocol_violation() {
    let (client, mut server) = pipe();
    let connector = MockConnector::default();

    let script = async move {
        server.open_stream("s1", &bind_feature()).await;
        server.expect_element("iq").await;
        server
            .send("<message id='m1' from='juliet@example.com'><body>hi</body></message>")
            .await;
        server.read_to_end().await
    };
    let (outcome, _) = tokio::join!(
        negotiate(client, &connector, NegotiationOptions::default()),
        script
    );

    let (state, source) = failure(outcome);
    assert_eq!(state, NegotiationState::Bound);
    assert_matches!(source, XmppError::ProtocolViolation(_));
}

#[tokio::test]
async fn server_closing_mid_negotiation_is_connection_closed() {
    let (client, mut server) = pipe();
    let connector = MockConnector::default();

    let script = async move {
        server.expect_stream_header().await;
        drop(server);
    };
    let (outcome, _) = tokio::join!(
        negotiate(client, &connector, NegotiationOptions::default()),
        script
    );

    let (state, source) = failure(outcome);
    assert_eq!(state, NegotiationState::VersionChecked);
    assert_matches!(source, XmppError::ConnectionClosed(_));
}
