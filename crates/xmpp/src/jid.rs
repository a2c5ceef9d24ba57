//! XMPP addresses of the form `[node@]host[/resource]`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::XmppError;

/// An XMPP address.
///
/// The host part is always present; node and resource are optional and never
/// empty when present. Two addresses are equal when their string forms are.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Jid {
    node: Option<String>,
    host: String,
    resource: Option<String>,
}

impl Jid {
    /// Build an address from its parts.
    ///
    /// Empty node or resource strings are treated as absent.
    pub fn new(
        node: Option<impl Into<String>>,
        host: impl Into<String>,
        resource: Option<impl Into<String>>,
    ) -> Result<Self, XmppError> {
        let host = host.into();
        if host.is_empty() {
            return Err(XmppError::address_format("host must not be empty"));
        }
        Ok(Self {
            node: node.map(Into::into).filter(|n: &String| !n.is_empty()),
            host,
            resource: resource.map(Into::into).filter(|r: &String| !r.is_empty()),
        })
    }

    /// Parse an address string.
    pub fn parse(s: &str) -> Result<Self, XmppError> {
        if s.is_empty() {
            return Err(XmppError::address_format("address is empty"));
        }

        let (rest, resource) = match s.split_once('/') {
            Some((_, "")) => {
                return Err(XmppError::address_format(format!(
                    "empty resource in '{}'",
                    s
                )));
            }
            Some((rest, resource)) => (rest, Some(resource.to_string())),
            None => (s, None),
        };

        let (node, host) = match rest.split_once('@') {
            Some(("", _)) => {
                return Err(XmppError::address_format(format!("empty node in '{}'", s)));
            }
            Some((node, host)) => (Some(node.to_string()), host),
            None => (None, rest),
        };

        if host.is_empty() {
            return Err(XmppError::address_format(format!("empty host in '{}'", s)));
        }

        Ok(Self {
            node,
            host: host.to_string(),
            resource,
        })
    }

    /// The local part, if any.
    pub fn node(&self) -> Option<&str> {
        self.node.as_deref()
    }

    /// The domain part.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The resource part, if any.
    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    /// Whether this address has no resource.
    pub fn is_bare(&self) -> bool {
        self.resource.is_none()
    }

    /// The same address without its resource.
    pub fn without_resource(&self) -> Jid {
        Jid {
            node: self.node.clone(),
            host: self.host.clone(),
            resource: None,
        }
    }

    /// The same address with `resource` replacing any existing one.
    pub fn with_resource(&self, resource: impl Into<String>) -> Jid {
        let resource = resource.into();
        Jid {
            node: self.node.clone(),
            host: self.host.clone(),
            resource: (!resource.is_empty()).then_some(resource),
        }
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(node) = &self.node {
            write!(f, "{}@", node)?;
        }
        f.write_str(&self.host)?;
        if let Some(resource) = &self.resource {
            write!(f, "/{}", resource)?;
        }
        Ok(())
    }
}

impl FromStr for Jid {
    type Err = XmppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Jid::parse(s)
    }
}

impl Serialize for Jid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Jid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Jid::parse(&s).map_err(serde::de::Error::custom)
    }
}
