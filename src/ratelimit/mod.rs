//! Rate limiting policies, limiters and coordinator plumbing.

pub mod backend;
pub mod breaker;
pub mod decision;
pub mod distributed;
pub mod fallback;
pub mod key;
pub mod policy;
pub mod presets;
pub mod scripts;
pub mod store;

pub use backend::Limiter;
pub use breaker::{BreakerPermit, BreakerState, BreakerStats, CoordinatorBreaker};
pub use decision::{DenialReason, DenyResponse, LimitDecision};
pub use distributed::{DistributedLimiter, KeyStats};
pub use fallback::{FallbackInfo, LocalFallbackLimiter, WindowStats};
pub use key::{Identity, KeyKind, RateLimitKey};
pub use policy::{Algorithm, RateLimitPolicy, Scope};
pub use presets::Preset;
pub use store::{PolicyHandle, PolicyStore};
