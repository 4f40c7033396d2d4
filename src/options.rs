//! Client configuration bag.
//!
//! Options are immutable per client instance: every chaining method on
//! `Client` clones this bag, adjusts the clone, and wraps it in a new
//! client. Option-setting is referentially transparent; the original
//! client never observes the change.

use std::sync::Arc;

use http::HeaderMap;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::cache::Cache;
use crate::error::{Error, Result};
use crate::net::tls::TlsContext;
use crate::proxy::ProxyOptions;
use crate::timeout::TimeoutPolicy;

/// Redirect-following configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct FollowPolicy {
    /// Maximum redirect hops before giving up.
    pub max_hops: usize,
}

impl Default for FollowPolicy {
    fn default() -> Self {
        Self { max_hops: 5 }
    }
}

/// Structured argument for `Client::basic_auth`.
///
/// Both fields are required; a missing field is a configuration error
/// raised before any network activity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct BasicAuth {
    pub user: Option<String>,
    pub pass: Option<String>,
}

impl BasicAuth {
    pub fn new(user: impl Into<String>, pass: impl Into<String>) -> Self {
        Self {
            user: Some(user.into()),
            pass: Some(pass.into()),
        }
    }

    /// Extract the credential pair, failing eagerly on a missing key.
    pub(crate) fn require(&self) -> Result<(&str, &str)> {
        let user = self
            .user
            .as_deref()
            .ok_or_else(|| Error::Configuration("basic auth is missing :user".into()))?;
        let pass = self
            .pass
            .as_deref()
            .ok_or_else(|| Error::Configuration("basic auth is missing :pass".into()))?;
        Ok((user, pass))
    }
}

/// Everything a client instance is configured with.
#[derive(Clone, Default)]
pub struct ClientOptions {
    /// Forward proxy to route through, when set.
    pub proxy: Option<ProxyOptions>,

    /// Timeout policy applied to every request.
    pub timeout: TimeoutPolicy,

    /// Headers merged beneath each request's own headers.
    pub default_headers: HeaderMap,

    /// Redirect following; `None` returns 3xx responses verbatim.
    pub follow: Option<FollowPolicy>,

    /// Keep-alive reuse of one connection per destination.
    pub persistent: bool,

    /// Base URL for relative request targets (persistent mode).
    pub base_url: Option<Url>,

    /// Injectable TLS trust configuration; webpki roots when absent.
    pub tls: Option<TlsContext>,

    /// Injectable cache collaborator consulted before dispatch.
    pub cache: Option<Arc<dyn Cache>>,
}

impl std::fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientOptions")
            .field("proxy", &self.proxy)
            .field("timeout", &self.timeout)
            .field("default_headers", &self.default_headers)
            .field("follow", &self.follow)
            .field("persistent", &self.persistent)
            .field("base_url", &self.base_url.as_ref().map(Url::as_str))
            .field("tls", &self.tls.is_some())
            .field("cache", &self.cache.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_auth_requires_both_keys() {
        assert!(BasicAuth::new("user", "pass").require().is_ok());

        let missing_pass = BasicAuth {
            user: Some("user".into()),
            pass: None,
        };
        let err = missing_pass.require().unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains(":pass"));

        let missing_user = BasicAuth {
            user: None,
            pass: Some("pass".into()),
        };
        assert!(missing_user.require().unwrap_err().is_configuration());
    }

    #[test]
    fn follow_policy_defaults_to_five_hops() {
        assert_eq!(FollowPolicy::default().max_hops, 5);
    }

    #[test]
    fn follow_policy_deserializes_from_config() {
        let policy: FollowPolicy = serde_json::from_str(r#"{"max_hops": 2}"#).unwrap();
        assert_eq!(policy.max_hops, 2);
    }
}
