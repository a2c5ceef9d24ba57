//! Per-connection session state and login credentials.

use std::fmt;

use crate::jid::Jid;

/// What is known about the session on the current stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionContext {
    /// Server host the client connects to; survives resets
    pub host_name: String,
    /// Login name (node part of the account address)
    pub username: Option<String>,
    /// Requested or bound resource
    pub resource: Option<String>,
    /// Id of the current stream, as assigned by the server
    pub stream_id: Option<String>,
    /// Stream language announced by the server
    pub locale: Option<String>,
    /// Full address assigned by resource binding
    pub bound_jid: Option<Jid>,
}

impl SessionContext {
    /// A fresh session against `host_name`.
    pub fn new(host_name: impl Into<String>) -> Self {
        Self {
            host_name: host_name.into(),
            ..Self::default()
        }
    }

    /// Forget everything except the host name.
    pub fn reset(&mut self) {
        *self = Self::new(std::mem::take(&mut self.host_name));
    }

    /// The bare account address `username@host`, when the username is known.
    pub fn bare_jid(&self) -> Option<Jid> {
        let username = self.username.as_deref()?;
        Jid::new(Some(username), self.host_name.as_str(), None::<String>).ok()
    }
}

/// Login credentials, held only until authentication succeeds.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Authentication identity (node part of the account)
    pub username: String,
    /// Account password
    pub password: String,
    /// Resource to request when binding
    pub resource: Option<String>,
}

impl Credentials {
    /// Create credentials.
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        resource: Option<String>,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            resource,
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("resource", &self.resource)
            .finish()
    }
}
