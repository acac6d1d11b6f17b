// Typed data layer of the booking platform frontend: resource descriptors,
// a shared query cache and the executor that fetches through it

pub mod cache;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod executor;
pub mod observer;
pub mod resources;
pub mod transport;

// Re-export key types for convenience
pub use cache::{CacheEntry, CacheEvent, CacheStatsReport, CacheStore};
pub use config::{ClientConfig, RetryConfig};
pub use descriptor::{CachePolicy, Params, ResourceDescriptor, ResourceKey};
pub use error::{ClientError, QueryError};
pub use executor::{QueryClient, QueryOptions, QueryStatsReport};
pub use observer::{QueryObserver, QueryState};
pub use transport::{HttpTransport, RawPayload, Transport, TransportRequest};
