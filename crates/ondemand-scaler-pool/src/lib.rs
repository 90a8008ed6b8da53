//! Capacity pools for the ondemand scaler.
//!
//! This crate provides the [`Pool`] type and the [`NodeProvider`] boundary
//! it drives. It handles:
//!
//! - Pool specifications: compute-class fingerprints, node synthesis and
//!   YAML loading
//! - Pool membership from the cluster event stream
//! - The update protocol: request capacity, wait for it to register, retract
//!   whatever did not
//! - Provider registry and implementations (`anynode`, `karpenter`)
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │               Scaling workers / GC loop / ingestion              │
//! └─────────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                             Pool                                 │
//! │  ┌─────────────┐ ┌─────────────┐ ┌─────────────────────────┐   │
//! │  │  confirmed  │ │  tentative  │ │  update / warm_up /     │   │
//! │  │  nodes +    │ │  nodes +    │ │  remove_nodes           │   │
//! │  │  allocs     │ │  allocs     │ │                         │   │
//! │  └─────────────┘ └─────────────┘ └─────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         NodeProvider                             │
//! │        anynode (static)      ElasticProvider<KarpenterBackend>   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use ondemand_scaler_pool::{load_pool_specs, Pool};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut pools = Vec::new();
//! for spec in load_pool_specs("/etc/ondemand-scaler/pools.yml")? {
//!     pools.push(Pool::from_spec(spec).await?);
//! }
//! for pool in &pools {
//!     println!("{}: {} nodes", pool.name(), pool.node_count());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Testing
//!
//! Enable the `test-utils` feature for [`MockProvider`], which records every
//! resize and removal without touching infrastructure.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod pool;
pub mod provider;
pub mod render;
pub mod spec;
pub mod spec_file;

pub use error::{PoolError, Result};
pub use pool::{Pool, PoolSnapshot, UpdateOutcome, DEFAULT_IDLE_TIMEOUT};
pub use provider::{NodeProvider, ProviderKind};
pub use render::render_spec;
pub use spec::PoolNodeSpec;
pub use spec_file::{load_pool_specs, parse_pool_specs};

#[cfg(any(test, feature = "test-utils"))]
pub use provider::mock::MockProvider;
