//! Meshwire xDS push engine
//!
//! This crate decides, for a fleet of connected proxies, what changed, who
//! needs to see it and when it is safe to send, including:
//! - ADS stream handling with ACK/NACK tracking per resource type
//! - Scoped push fan-out driven by each proxy's sidecar scope
//! - Flow control that holds and coalesces pushes until the proxy answers
//!
//! # Architecture
//!
//! - `xds` - wire messages, type URLs and resource bodies
//! - `mesh` / `store` - mesh configuration model and in-memory store
//! - `context` / `scope` - push contexts and per-proxy visibility
//! - `watch` - per-type watch state and request classification
//! - `connection` / `registry` - live streams
//! - `orchestrator` / `queue` / `debounce` - who gets pushed and when
//! - `generator` / `generators` / `cache` - resource generation
//! - `server` / `ads` / `grpc` - the discovery server and its gRPC surface
//! - `ledger` / `debug` - introspection

pub mod ads;
pub mod cache;
pub mod connection;
pub mod context;
pub mod debounce;
pub mod debug;
pub mod error;
pub mod generator;
pub mod generators;
pub mod grpc;
pub mod ledger;
pub mod mesh;
pub mod metrics;
pub mod model;
pub mod orchestrator;
pub mod queue;
pub mod registry;
pub mod scope;
pub mod server;
pub mod store;
pub mod watch;
pub mod xds;

// Re-export commonly used types
pub use connection::{Connection, ConnectionMeta};
pub use context::PushContext;
pub use debounce::DebounceOptions;
pub use error::{Result, XdsError};
pub use generator::{Generator, GeneratorRegistry, ResourceData};
pub use grpc::{AdsService, AggregatedDiscoveryServiceServer};
pub use mesh::MeshSnapshot;
pub use model::{ConfigKey, ConfigKind, Proxy, PushRequest, TriggerReason};
pub use server::{DiscoveryServer, DiscoveryServerConfig};
pub use store::{ConfigSource, MemoryConfigStore};
pub use xds::ResourceType;
