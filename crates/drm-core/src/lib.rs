//! Diagnostic Request Manager
//!
//! Multiplexes a small, fixed pool of request channels across many
//! diagnostic connections and runs the UDS request/response protocol on each
//! of them: suppressed positive responses, response-pending retries, P2/P2*
//! timing and negative response decoding. On top of that it arbitrates the
//! global mode (normal run, external tester present, functional request in
//! progress), collects functional sub-responses and scans for reachable
//! ECUs.
//!
//! The engine is poll driven. [`RequestManager::tick`] must be called
//! periodically at the configured `tick_ms`; the transport drives the rest
//! through the callback entry points of [`RequestManager`].
//!
//! # Example
//!
//! ```ignore
//! let config = DrmConfig::load("drm.toml")?;
//! let drm = RequestManager::new(config, transport)?;
//! drm.read_data_by_identifier(ConnectionId(0), 0xF190, Arc::new(|n| println!("{:?}", n)))?;
//! loop {
//!     drm.tick();
//!     std::thread::sleep(Duration::from_millis(10));
//! }
//! ```

pub mod config;
pub mod det;
pub mod discovery;
pub mod error;
pub mod firewall;
pub mod functional;
pub mod manager;
pub mod services;
pub mod store;
pub mod transport;
pub mod types;
pub mod uds;

mod allocator;
mod channel;
mod protocol;
mod state;
mod timer;

pub use config::{ConfigError, ConnectionConfig, DrmConfig, RequestDelay};
pub use det::{ApiId, DevError, DevErrorSink, TracingErrorSink};
pub use discovery::{DiscoveryFn, DiscoveryState, DiscoveryTable, EcuStatus};
pub use error::{CancelError, DiscoveryError, FetchError, SubmitError};
pub use functional::FunctionalResult;
pub use manager::{DiagRequest, RequestManager, DEFAULT_RESPONSE_CAPACITY};
pub use store::{DiscoveryStore, MemoryStore, StoreError};
pub use transport::{BufReqError, Transport, TransportError};
pub use types::{
    ChannelId, ChannelState, ConnectionId, DrmMode, Notification, NotificationKind, NotifyFn,
    PduId, ResponseCode,
};
pub use uds::NegativeResponseCode;
