//! PLAIN (RFC 4616): one message carrying the password in the clear.

use super::{SaslReply, read_reply, sasl_element};
use crate::error::XmppError;
use crate::session::{Credentials, SessionContext};
use crate::stream::StreamContext;

/// `authzid NUL authcid NUL password`, with the bare account address as
/// authorization identity.
pub fn initial_response(username: &str, host: &str, password: &str) -> Vec<u8> {
    format!("{username}@{host}\0{username}\0{password}").into_bytes()
}

pub(super) async fn authenticate(
    session: &SessionContext,
    stream: &mut StreamContext,
    credentials: &Credentials,
) -> Result<(), XmppError> {
    let payload = initial_response(
        &credentials.username,
        &session.host_name,
        &credentials.password,
    );
    let mut auth = sasl_element("auth", Some(&payload));
    auth.set_attr("mechanism", "PLAIN");
    stream.send_element(&auth).await?;

    match read_reply(stream).await? {
        SaslReply::Success(_) => Ok(()),
        SaslReply::Challenge(_) => Err(XmppError::protocol_violation(
            "unexpected challenge during PLAIN authentication",
        )),
    }
}
