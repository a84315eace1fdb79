//! Lease-based service registration and watch-driven resolution
//!
//! This crate lets a service instance announce itself in a coordination
//! store under a time-limited lease, and lets clients keep an up-to-date
//! list of live instances of the services they call.
//!
//! # Architecture
//!
//! The subsystem is built around a small coordination contract
//! ([`backend::CoordinationClient`]) and is runtime-agnostic apart from
//! the background tasks, which run on `smol`. It uses:
//!
//! - [`Registrar`] to keep one instance's record alive under a renewed lease
//! - [`Resolver`] to mirror a key prefix into an address list
//! - [`WeightedBalancer`] to pick addresses from that list
//! - [`Discovery`] as the per-process context tying config and connector together
//!
//! # Example
//!
//! ```no_run
//! use service_discovery::{Discovery, DiscoveryConfig, backend::memory::MemoryCoordinator};
//! use std::sync::Arc;
//!
//! # async fn example() -> service_discovery::Result<()> {
//! let config = DiscoveryConfig::from_file("discovery.yaml").await?;
//! let cluster = MemoryCoordinator::new();
//! let discovery = Discovery::new(Arc::new(cluster.connector()), config)?;
//!
//! // Announce this instance, if configured
//! let registrar = discovery.register_configured().await?;
//!
//! // Resolve a dependency and pick an address per call
//! let user = discovery.resolve("user").await?;
//! if let Some(target) = user.pick() {
//!     println!("calling {}", target.address);
//! }
//!
//! user.close().await;
//! if let Some(registrar) = registrar {
//!     registrar.close().await?;
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod address_set;
pub mod backend;
pub mod backoff;
pub mod balancer;
pub mod config;
pub mod discovery;
pub mod error;
pub mod models;
pub mod registrar;
pub mod resolver;

pub use address_set::{AddressSet, AddressUpdater};
pub use balancer::WeightedBalancer;
pub use config::{
    BackoffConfig, CoordinationConfig, DiscoveryConfig, DomainConfig, LogConfig, RegistrarConfig,
    ResolverConfig,
};
pub use discovery::{BoundClient, ClientFactory, Discovery, ResolvedService};
pub use error::{Error, Result};
pub use models::*;
pub use registrar::{Registrar, RegistrarOptions, RegistrarState};
pub use resolver::{Resolver, ResolverOptions};

/// Re-export key types for convenience
pub mod prelude {
    pub use crate::{
        AddressEntry,
        AddressUpdater,
        Discovery,
        DiscoveryConfig,
        Error,
        Registrar,
        Resolver,
        Result,
        ServiceDescriptor,
        WeightedBalancer,
    };
}
