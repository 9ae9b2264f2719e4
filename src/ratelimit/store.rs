//! Policy storage and endpoint resolution.
//!
//! A `PolicyStore` holds the global defaults, per-endpoint policies and
//! bypass lists. Endpoint keys are either exact paths or wildcard patterns
//! ending in `*`. Resolution prefers an exact match, then the matching
//! pattern with the longest literal prefix, then a policy built from the
//! global defaults.

use std::borrow::Cow;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::policy::{
    Algorithm, RateLimitPolicy, Scope, DEFAULT_RESPONSE_BODY, DEFAULT_RESPONSE_CODE,
};
use crate::error::{LimiterError, Result};

/// Prefix prepended to every coordinator key unless configured otherwise.
pub const DEFAULT_KEY_PREFIX: &str = "rl:";

/// Global defaults, endpoint policies and bypass rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyStore {
    #[serde(default = "default_limit")]
    pub default_limit: u64,
    #[serde(default = "default_window", with = "crate::duration")]
    pub default_window: Duration,
    #[serde(default = "default_burst")]
    pub default_burst: u64,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Endpoint path or `prefix*` pattern to policy
    #[serde(default)]
    pub endpoint_limits: HashMap<String, RateLimitPolicy>,

    #[serde(default)]
    pub bypass_ips: Vec<String>,
    #[serde(default)]
    pub bypass_user_agents: Vec<String>,
    #[serde(default = "default_internal_bypass")]
    pub internal_bypass: bool,
}

fn default_limit() -> u64 {
    100
}

fn default_window() -> Duration {
    Duration::from_secs(60)
}

fn default_burst() -> u64 {
    10
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_internal_bypass() -> bool {
    true
}

impl Default for PolicyStore {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            default_window: default_window(),
            default_burst: default_burst(),
            key_prefix: default_key_prefix(),
            endpoint_limits: HashMap::new(),
            bypass_ips: Vec::new(),
            bypass_user_agents: Vec::new(),
            internal_bypass: default_internal_bypass(),
        }
    }
}

impl PolicyStore {
    /// Load a policy document from a YAML or JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit policies");

        let contents = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        if is_json {
            Self::from_json(&contents)
        } else {
            Self::from_yaml(&contents)
        }
    }

    /// Parse and validate a YAML policy document.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let mut store: PolicyStore = serde_yaml::from_str(yaml)
            .map_err(|e| LimiterError::Config(format!("Failed to parse policy document: {}", e)))?;
        store.validate()?;
        Ok(store)
    }

    /// Parse and validate a JSON policy document.
    pub fn from_json(json: &str) -> Result<Self> {
        let mut store: PolicyStore = serde_json::from_str(json)
            .map_err(|e| LimiterError::Config(format!("Failed to parse policy document: {}", e)))?;
        store.validate()?;
        Ok(store)
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| LimiterError::Config(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| LimiterError::Config(e.to_string()))
    }

    /// Validate defaults and every endpoint policy, normalizing defaults in place.
    pub fn validate(&mut self) -> Result<()> {
        if self.default_limit == 0 {
            return Err(LimiterError::Config("default limit must be positive".to_string()));
        }
        if self.default_window.is_zero() {
            return Err(LimiterError::Config("default window must be positive".to_string()));
        }
        if self.key_prefix.is_empty() {
            self.key_prefix = default_key_prefix();
        }

        for (endpoint, policy) in self.endpoint_limits.iter_mut() {
            if endpoint.is_empty() {
                return Err(LimiterError::Config("endpoint pattern cannot be empty".to_string()));
            }
            policy.validate().map_err(|e| {
                LimiterError::Config(format!("invalid configuration for endpoint {}: {}", endpoint, e))
            })?;
        }

        Ok(())
    }

    /// Register or replace the policy for an endpoint or pattern.
    pub fn insert(&mut self, endpoint: impl Into<String>, policy: RateLimitPolicy) {
        self.endpoint_limits.insert(endpoint.into(), policy);
    }

    /// Resolve the policy that applies to an endpoint.
    pub fn get_endpoint_limit(&self, endpoint: &str) -> Cow<'_, RateLimitPolicy> {
        if let Some(policy) = self.endpoint_limits.get(endpoint) {
            return Cow::Borrowed(policy);
        }

        let best = self
            .endpoint_limits
            .iter()
            .filter_map(|(pattern, policy)| {
                let prefix = pattern.strip_suffix('*')?;
                endpoint.starts_with(prefix).then_some((prefix.len(), pattern, policy))
            })
            // longest prefix wins; ties broken by pattern text so the choice never
            // depends on map iteration order
            .max_by(|a, b| a.0.cmp(&b.0).then_with(|| b.1.cmp(a.1)));

        if let Some((_, pattern, policy)) = best {
            debug!(endpoint = %endpoint, pattern = %pattern, "Resolved wildcard policy");
            return Cow::Borrowed(policy);
        }

        Cow::Owned(self.default_policy())
    }

    /// The policy applied to endpoints without a registered match.
    pub fn default_policy(&self) -> RateLimitPolicy {
        RateLimitPolicy {
            burst: self.default_burst,
            algorithm: Algorithm::SlidingWindow,
            scope: Scope::PerIp,
            include_headers: true,
            response_code: DEFAULT_RESPONSE_CODE,
            response_body: DEFAULT_RESPONSE_BODY.to_string(),
            ..RateLimitPolicy::new(self.default_limit, self.default_window)
        }
    }

    /// True when the request is exempt from rate limiting altogether.
    pub fn should_bypass(&self, ip: &str, user_agent: &str, is_internal: bool) -> bool {
        if is_internal && self.internal_bypass {
            return true;
        }
        self.bypass_ips.iter().any(|b| b == ip)
            || self.bypass_user_agents.iter().any(|b| b == user_agent)
    }
}

/// Shared, swappable view of the active `PolicyStore`.
///
/// Readers take a cheap `Arc` snapshot; writers validate a complete
/// replacement and swap it in, so a store is never edited while shared.
#[derive(Debug)]
pub struct PolicyHandle {
    current: RwLock<Arc<PolicyStore>>,
}

impl PolicyHandle {
    /// Validate `store` and wrap it in a handle.
    pub fn new(mut store: PolicyStore) -> Result<Self> {
        store.validate()?;
        Ok(Self {
            current: RwLock::new(Arc::new(store)),
        })
    }

    /// Snapshot of the active store.
    pub fn load(&self) -> Arc<PolicyStore> {
        self.current.read().clone()
    }

    /// Validate and atomically replace the active store, returning the previous one.
    pub fn swap(&self, mut store: PolicyStore) -> Result<Arc<PolicyStore>> {
        store.validate()?;
        let mut current = self.current.write();
        let previous = std::mem::replace(&mut *current, Arc::new(store));
        info!(endpoints = current.endpoint_limits.len(), "Swapped rate limit policies");
        Ok(previous)
    }

    /// Clone the active store, apply `edit` to the copy and swap it in.
    pub fn update<F>(&self, edit: F) -> Result<Arc<PolicyStore>>
    where
        F: FnOnce(&mut PolicyStore),
    {
        let mut next = (*self.load()).clone();
        edit(&mut next);
        self.swap(next)
    }
}
