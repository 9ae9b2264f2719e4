//! Rate limit key generation.

use std::fmt;

use super::policy::{RateLimitPolicy, Scope};

/// Caller identity as extracted by the request middleware.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub ip: String,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub client_id: Option<String>,
}

impl Identity {
    pub fn from_ip(ip: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            ..Self::default()
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_client(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }
}

/// What kind of identity a key was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyKind {
    Global,
    Ip,
    User,
    Session,
    Client,
    Custom,
}

impl KeyKind {
    fn tag(&self) -> &'static str {
        match self {
            KeyKind::Global => "global",
            KeyKind::Ip => "ip",
            KeyKind::User => "user",
            KeyKind::Session => "session",
            KeyKind::Client => "client",
            KeyKind::Custom => "custom",
        }
    }
}

/// A key that uniquely identifies one rate limit counter.
///
/// Rendered as `{kind}:{identity length}:{identity}:{endpoint}`; the length
/// prefix keeps keys unambiguous whatever characters the identity or the
/// endpoint contain.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    pub kind: KeyKind,
    pub identity: String,
    pub endpoint: String,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

impl RateLimitKey {
    /// Derive the key for a request from the policy scope.
    ///
    /// Scopes whose identity is missing fall back to the caller's IP.
    pub fn for_request(endpoint: &str, identity: &Identity, policy: &RateLimitPolicy) -> Self {
        let by_ip = || (KeyKind::Ip, identity.ip.clone());

        let (kind, value) = match policy.scope {
            Scope::Global => (KeyKind::Global, String::new()),
            Scope::PerIp => by_ip(),
            Scope::PerUser => non_empty(&identity.user_id)
                .map(|v| (KeyKind::User, v.to_string()))
                .unwrap_or_else(by_ip),
            Scope::PerSession => non_empty(&identity.session_id)
                .map(|v| (KeyKind::Session, v.to_string()))
                .unwrap_or_else(by_ip),
            Scope::PerClient => non_empty(&identity.client_id)
                .map(|v| (KeyKind::Client, v.to_string()))
                .unwrap_or_else(by_ip),
            Scope::Custom => non_empty(&policy.custom_key)
                .map(|v| (KeyKind::Custom, v.to_string()))
                .unwrap_or_else(by_ip),
        };

        Self {
            kind,
            identity: value,
            endpoint: endpoint.to_string(),
        }
    }

    /// The string form used by the limiters.
    pub fn to_string_key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.kind.tag(),
            self.identity.len(),
            self.identity,
            self.endpoint
        )
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn policy(scope: Scope) -> RateLimitPolicy {
        RateLimitPolicy::new(10, Duration::from_secs(60)).with_scope(scope)
    }

    #[test]
    fn test_key_per_scope() {
        let identity = Identity::from_ip("10.0.0.1")
            .with_user("alice")
            .with_session("s1")
            .with_client("cli");

        let key = RateLimitKey::for_request("/api", &identity, &policy(Scope::PerIp));
        assert_eq!(key.to_string_key(), "ip:8:10.0.0.1:/api");

        let key = RateLimitKey::for_request("/api", &identity, &policy(Scope::PerUser));
        assert_eq!(key.to_string_key(), "user:5:alice:/api");

        let key = RateLimitKey::for_request("/api", &identity, &policy(Scope::Global));
        assert_eq!(key.to_string_key(), "global:0::/api");

        let key = RateLimitKey::for_request("/api", &identity, &policy(Scope::PerSession));
        assert_eq!(key.kind, KeyKind::Session);

        let key = RateLimitKey::for_request("/api", &identity, &policy(Scope::PerClient));
        assert_eq!(key.kind, KeyKind::Client);
    }

    #[test]
    fn test_missing_identity_falls_back_to_ip() {
        let identity = Identity::from_ip("10.0.0.1");
        let key = RateLimitKey::for_request("/api", &identity, &policy(Scope::PerUser));
        assert_eq!(key.kind, KeyKind::Ip);
        assert_eq!(key.identity, "10.0.0.1");

        let key = RateLimitKey::for_request("/api", &identity, &policy(Scope::Custom));
        assert_eq!(key.kind, KeyKind::Ip);
    }

    #[test]
    fn test_custom_key() {
        let mut custom = policy(Scope::Custom);
        custom.custom_key = Some("tenant-42".to_string());
        let key = RateLimitKey::for_request("/api", &Identity::from_ip("1.1.1.1"), &custom);
        assert_eq!(key.to_string_key(), "custom:9:tenant-42:/api");
    }

    #[test]
    fn test_keys_do_not_collide_across_scopes() {
        // a user literally named like an IP must not share the IP's counter
        let identity = Identity::from_ip("10.0.0.1").with_user("10.0.0.1");
        let by_ip = RateLimitKey::for_request("/api", &identity, &policy(Scope::PerIp));
        let by_user = RateLimitKey::for_request("/api", &identity, &policy(Scope::PerUser));
        assert_ne!(by_ip.to_string_key(), by_user.to_string_key());

        // identity containing the separator
        let a = RateLimitKey::for_request("b:/x", &Identity::from_ip("a"), &policy(Scope::PerIp));
        let b = RateLimitKey::for_request("/x", &Identity::from_ip("a:b"), &policy(Scope::PerIp));
        assert_ne!(a.to_string_key(), b.to_string_key());
    }
}
