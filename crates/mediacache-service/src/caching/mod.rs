//! # In-memory media caching
//!
//! Media bytes are fetched once and then served from memory until they expire, are evicted, or
//! are invalidated. Consumers never hold the bytes themselves, they hold revocable handles
//! created by a [`HandleProvider`](crate::handles::HandleProvider).
//!
//! ## Request coalescing
//!
//! A lookup for a key that is already being fetched does not start another transfer. It joins
//! the running fetch and receives the same outcome, including failures. Failures are never
//! cached, so the next lookup after a failed fetch tries again.
//!
//! ## Expiry and eviction
//!
//! Every entry expires `ttl` after it was created, regardless of how often it is accessed.
//! Expired entries are removed lazily on lookup and periodically by the [`CacheJanitor`].
//!
//! Resident bytes are tracked exactly. Before a new fetch starts, and on every janitor tick,
//! usage above `cleanup_threshold * capacity_bytes` triggers eviction of least recently used
//! entries until usage is at or below `target_threshold * capacity_bytes`. Largest-first and
//! oldest-first eviction are available on demand.
//!
//! ## Invalidation
//!
//! Invalidating a media item, a study, or the whole cache revokes the affected handles
//! immediately. Fetches of affected keys that are still running are discarded when they finish:
//! their waiters get [`FetchError::Invalidated`](crate::download::FetchError::Invalidated) and
//! nothing is committed.
//!
//! ### Metrics
//!
//! - `caches.access`: All lookups.
//! - `caches.memory.hit`: Lookups served from memory.
//! - `caches.channel.hit`: Lookups that joined a running fetch.
//! - `caches.channel.miss`: Lookups that started a fetch.
//! - `caches.fetch`: Fetches actually run.
//! - `caches.fetch.failed`: Failed fetches, tagged with `reason`.
//! - `caches.fetch.size`: A histogram of the committed payload sizes.
//! - `caches.capacity_exceeded`: Capacity-triggered eviction runs.
//! - `caches.evicted`: Evicted entries, tagged with `order`.
//! - `caches.removed`: Entries removed by expiry or invalidation, tagged with `reason`.
//! - `caches.size.bytes` and `caches.size.items`: Gauges emitted on every janitor tick.

mod cache_key;
mod eviction;
mod hit_rate;
mod janitor;
mod store;


pub use cache_key::CacheKey;
pub use eviction::{EvictionOrder, EvictionReport};
pub use hit_rate::HitRateWindow;
pub use janitor::CacheJanitor;
pub use store::{CacheStats, MediaCache};
