//! Autoscaling control loop for the ondemand scaler.
//!
//! This crate turns blocked evaluations into capacity requests and retires
//! capacity nobody uses. It handles:
//!
//! - Configuration: TOML file, environment overrides and the allowed-free
//!   expression
//! - Eval-chain debouncing: blocked evaluations of one job are collected
//!   into a chain and fired as one [`ScalingEvent`] once the stream settles
//! - The scaling queue, where a resolved chain cancels its pending event
//! - Scaling workers: estimate the nodes a demand needs and update the pools
//! - The GC loop: drain and remove idle nodes, keep a floor of free nodes
//! - Startup population, event ingestion and the `SIGUSR1` state dump
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                  cluster event stream (runtime)                  │
//! └─────────────────────────────────────────────────────────────────┘
//!          │ evaluations                      │ nodes / allocations
//!          ▼                                  ▼
//! ┌──────────────────┐              ┌──────────────────────────────┐
//! │    Debouncer     │              │   distributors → Pool state   │
//! │  (eval chains)   │              └──────────────────────────────┘
//! └──────────────────┘                         ▲          ▲
//!          │ ScalingEvent                      │          │
//!          ▼                                   │          │
//! ┌──────────────────┐   estimate + update     │          │
//! │  ScalingQueue    │──► workers ─────────────┘          │
//! └──────────────────┘                                    │
//!                               GC loop ──► drain + remove┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use ondemand_scaler_cluster::HttpClusterClient;
//! use ondemand_scaler_control::{runtime, AppContext, ScalerConfig};
//! use ondemand_scaler_oracle::BinPackOracle;
//! use ondemand_scaler_pool::{load_pool_specs, Pool};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ScalerConfig::load("/etc/ondemand-scaler/config.toml")?;
//! let mut pools = Vec::new();
//! for spec in load_pool_specs(config.pool_config_path()?)? {
//!     pools.push(Arc::new(Pool::from_spec(spec).await?));
//! }
//! let cluster = Arc::new(HttpClusterClient::new(config.nomad.address.clone(), None)?);
//! let app = Arc::new(AppContext::new(config, pools, cluster, Arc::new(BinPackOracle::new()), 2));
//! runtime::run(app, 2).await;
//! # Ok(())
//! # }
//! ```
//!
//! # Testing
//!
//! The loops take an [`AppContext`], so tests build one over
//! `MockClusterApi` and `MockProvider` (feature `test-utils`) and drive it
//! with paused tokio time.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod context;
pub mod debouncer;
pub mod dump;
pub mod error;
pub mod estimate;
pub mod event;
pub mod expr;
pub mod gc;
pub mod placement;
pub mod queue;
pub mod runtime;
pub mod stats;
pub mod workers;

pub use config::ScalerConfig;
pub use context::{AppContext, DemandQueue};
pub use debouncer::{Debouncer, EvalChains};
pub use error::{Result, ScalerError};
pub use estimate::{estimate, Plan};
pub use event::{ScalingEvent, TaskGroupDemand};
pub use expr::AllowedFreeExpr;
pub use gc::GcState;
pub use queue::ScalingQueue;
pub use stats::{ScalerStats, StatsSnapshot};
