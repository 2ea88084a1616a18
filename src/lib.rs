//! Flotilla - building blocks for controllers that span a dynamic fleet of
//! Kubernetes clusters.
//!
//! A process using Flotilla holds one logical client per target cluster. The
//! [`fleet::FleetSupervisor`] keeps the set of live clients in step with a
//! pluggable [`configuration::ConfigurationSource`], and each
//! [`cluster::ClusterClient`] drives reconciliation through a rate-limited
//! [`queue::WorkQueue`]. A single cluster going away, failing to build, or
//! failing its health checks never disturbs its peers.
//!
//! # Modules
//!
//! - [`fleet`] - supervisor that reconciles live cluster clients against the
//!   configuration source
//! - [`cluster`] - one live cluster connection: typed CRUD, watches, health
//! - [`queue`] - rate-limited work queue with retry/backoff and three
//!   reconciler shapes
//! - [`handler`] - translators from watch events into work-queue items
//! - [`predicate`] - boolean filters applied to watch events
//! - [`configuration`] - cluster descriptors and their sources (ConfigMaps,
//!   directories, gateway resources)
//! - [`metrics`] - process-wide prometheus registry keyed by prefix
//! - [`pki`] - serving-certificate issuance (self-signed and CSR-based) and
//!   webhook CA injection
//! - [`finalizer`] - small helpers for object finalizers
//! - [`error`] - error types

#![deny(missing_docs)]

pub mod cluster;
pub mod configuration;
pub mod error;
pub mod finalizer;
pub mod fleet;
pub mod handler;
pub mod metrics;
pub mod pki;
pub mod predicate;
pub mod queue;

pub use error::Error;

use std::time::Duration;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Default watcher re-list period for a cluster client
pub const DEFAULT_SYNC_PERIOD: Duration = Duration::from_secs(30 * 60);

/// Default interval between cluster health checks
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Default bound for a single API call issued by a cluster client
pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(5);

/// Smallest accepted exec timeout; lower values are clamped to the default
pub const MIN_EXEC_TIMEOUT: Duration = Duration::from_millis(100);

/// Default interval between fleet configuration refreshes
pub const DEFAULT_FETCH_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Default client-side queries-per-second budget per cluster
pub const DEFAULT_QPS: u32 = 100;

/// Default client-side burst budget per cluster
pub const DEFAULT_BURST: u32 = 120;
