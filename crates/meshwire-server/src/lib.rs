//! Meshwire server bootstrap
//!
//! Configuration, logging, metrics and the two listeners (ADS over gRPC,
//! debug over HTTP) around the `meshwire-xds` discovery server.

pub mod config;
pub mod debug;
pub mod logging;
pub mod metrics;
pub mod shutdown;
pub mod startup;
