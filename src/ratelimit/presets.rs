//! Canonical policy documents.

use std::collections::HashMap;
use std::time::Duration;

use super::policy::{Algorithm, RateLimitPolicy, Scope};
use super::store::PolicyStore;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

/// Named presets selectable from configuration and the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preset {
    Default,
    Production,
    Development,
}

impl Preset {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "default" => Some(Preset::Default),
            "production" | "prod" => Some(Preset::Production),
            "development" | "dev" => Some(Preset::Development),
            _ => None,
        }
    }

    pub fn build(&self) -> PolicyStore {
        match self {
            Preset::Default => PolicyStore::default_preset(),
            Preset::Production => PolicyStore::production(),
            Preset::Development => PolicyStore::development(),
        }
    }
}

fn auth_policy(limit: u64, burst: u64, per_ip: u64, body: &str) -> RateLimitPolicy {
    RateLimitPolicy {
        per_ip_limit: per_ip,
        response_code: 429,
        response_body: body.to_string(),
        ..RateLimitPolicy::new(limit, MINUTE)
            .with_burst(burst)
            .with_scope(Scope::PerIp)
    }
}

impl PolicyStore {
    /// Permissive defaults: 100 requests/minute with a burst of 10, loopback bypassed.
    pub fn default_preset() -> Self {
        Self {
            bypass_ips: vec!["127.0.0.1".to_string(), "::1".to_string()],
            internal_bypass: true,
            ..Self::default()
        }
    }

    /// Stricter defaults with named overrides for sensitive and high-traffic endpoints.
    pub fn production() -> Self {
        let mut endpoint_limits = HashMap::new();

        endpoint_limits.insert(
            "/api/v1/auth/login".to_string(),
            auth_policy(
                10,
                2,
                5,
                r#"{"error":"Too many authentication attempts","retry_after":60}"#,
            ),
        );
        endpoint_limits.insert(
            "/api/v1/auth/register".to_string(),
            auth_policy(
                5,
                1,
                3,
                r#"{"error":"Too many registration attempts","retry_after":60}"#,
            ),
        );
        endpoint_limits.insert(
            "/api/v1/memory/*".to_string(),
            RateLimitPolicy::new(100, MINUTE)
                .with_burst(10)
                .with_scope(Scope::PerUser)
                .with_headers(),
        );
        endpoint_limits.insert(
            "/api/v1/tasks/*".to_string(),
            RateLimitPolicy::new(50, MINUTE)
                .with_burst(5)
                .with_scope(Scope::PerUser)
                .with_headers(),
        );
        endpoint_limits.insert(
            "/api/v1/ws".to_string(),
            RateLimitPolicy {
                skip_successful_requests: true,
                ..RateLimitPolicy::new(1000, HOUR)
                    .with_burst(50)
                    .with_algorithm(Algorithm::TokenBucket)
            },
        );
        endpoint_limits.insert(
            "/health".to_string(),
            RateLimitPolicy {
                skip_paths: vec![
                    "/health".to_string(),
                    "/metrics".to_string(),
                    "/status".to_string(),
                ],
                ..RateLimitPolicy::new(1000, MINUTE)
                    .with_burst(100)
                    .with_algorithm(Algorithm::FixedWindow)
                    .with_scope(Scope::Global)
            },
        );
        endpoint_limits.insert(
            "/api/v1/cli/register".to_string(),
            RateLimitPolicy {
                per_ip_limit: 10,
                ..RateLimitPolicy::new(20, MINUTE).with_burst(3)
            },
        );

        Self {
            default_limit: 60,
            default_burst: 5,
            endpoint_limits,
            ..Self::default_preset()
        }
    }

    /// Very permissive limits with broad wildcards for local work.
    pub fn development() -> Self {
        let mut endpoint_limits = HashMap::new();

        endpoint_limits.insert(
            "/api/v1/auth/*".to_string(),
            RateLimitPolicy::new(100, MINUTE)
                .with_burst(20)
                .with_algorithm(Algorithm::FixedWindow),
        );
        endpoint_limits.insert(
            "/api/v1/*".to_string(),
            RateLimitPolicy::new(1000, MINUTE)
                .with_burst(200)
                .with_algorithm(Algorithm::TokenBucket)
                .with_headers(),
        );

        Self {
            default_limit: 1000,
            default_burst: 100,
            endpoint_limits,
            bypass_ips: vec![
                "127.0.0.1".to_string(),
                "::1".to_string(),
                "localhost".to_string(),
            ],
            internal_bypass: true,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_validate() {
        for preset in [Preset::Default, Preset::Production, Preset::Development] {
            let mut store = preset.build();
            store.validate().unwrap();
        }
    }

    #[test]
    fn test_production_overrides() {
        let store = PolicyStore::production();
        assert_eq!(store.default_limit, 60);

        let login = store.get_endpoint_limit("/api/v1/auth/login");
        assert_eq!(login.limit, 10);
        assert_eq!(login.per_ip_limit, 5);

        let memory = store.get_endpoint_limit("/api/v1/memory/abc");
        assert_eq!(memory.limit, 100);
        assert_eq!(memory.scope, Scope::PerUser);

        assert_eq!(
            store.get_endpoint_limit("/api/v1/ws").algorithm,
            Algorithm::TokenBucket
        );
        assert_eq!(
            store.get_endpoint_limit("/health").algorithm,
            Algorithm::FixedWindow
        );
        assert_eq!(store.get_endpoint_limit("/unmatched").limit, 60);
    }

    #[test]
    fn test_development_wildcards() {
        let store = PolicyStore::development();
        assert_eq!(store.get_endpoint_limit("/api/v1/auth/login").limit, 100);
        assert_eq!(store.get_endpoint_limit("/api/v1/anything").limit, 1000);
        assert!(store.should_bypass("localhost", "", false));
    }

    #[test]
    fn test_preset_round_trips_through_yaml() {
        let store = PolicyStore::production();
        let yaml = store.to_yaml().unwrap();
        let mut expected = store.clone();
        expected.validate().unwrap();
        assert_eq!(PolicyStore::from_yaml(&yaml).unwrap(), expected);
    }

    #[test]
    fn test_preset_names() {
        assert_eq!(Preset::from_name("prod"), Some(Preset::Production));
        assert_eq!(Preset::from_name("Development"), Some(Preset::Development));
        assert_eq!(Preset::from_name("staging"), None);
    }
}
