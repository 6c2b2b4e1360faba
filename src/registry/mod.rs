//! Stream registry for pub/sub routing
//!
//! The registry maps stream keys to live sources. Each source fans published
//! messages out into one private queue per consumer, so every subscriber
//! drains at its own pace.
//!
//! # Architecture
//!
//! ```text
//!                          Arc<StreamRegistry>
//!                     ┌─────────────────────────┐
//!                     │ sources: HashMap<Key,   │
//!                     │   LiveSource {          │
//!                     │     gop: GopCache,      │
//!                     │     consumers: [..],    │
//!                     │   }                     │
//!                     │ >                       │
//!                     └───────────┬─────────────┘
//!                                 │
//!         ┌───────────────────────┼───────────────────────┐
//!         │                       │                       │
//!         ▼                       ▼                       ▼
//!    [Publisher]             [Consumer]              [Consumer]
//!    publish(msg)            wait()/dump_packets()   wait()/dump_packets()
//!         │                       ▲                       ▲
//!         └──► gop.cache() ──► enqueue + signal ──────────┘
//! ```
//!
//! # Zero-Copy Design
//!
//! `SharedMessage` is reference counted, so all consumers share the same
//! message. Only jitter correction creates a new header, and that header
//! still shares the payload `Bytes`.

pub mod config;
pub mod key;
pub mod source;
pub mod store;

pub use config::{RegistryConfig, Reloadable, StreamConfig};
pub use key::StreamKey;
pub use source::{LiveSource, Publisher, StreamState, DROP_LOG_INTERVAL};
pub use store::StreamRegistry;
