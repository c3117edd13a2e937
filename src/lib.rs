#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

//! Spyglass - a BGP prefix-hijack detection pipeline
//!
//! Spyglass correlates a live stream of normalized BGP updates against an
//! operator-supplied configuration of legitimate prefix ownership, and
//! classifies violations into typed hijack events in near real time.
//!
//! # Architecture
//!
//! The pipeline is organized into the following modules:
//!
//! - **[`policy`]**: the prefix-ownership model — rules, prefix nodes, the
//!   configuration document, ASN-range and RFC 2622 expansion, and the
//!   compiler that turns a document into an index
//! - **[`index`]**: per-family longest-prefix-match index over configured
//!   prefixes, including the worst-prefix (monitored prefix) walk
//! - **[`registry`]**: process-wide shared state behind segmented locks,
//!   with monotone configuration timestamps and atomic installs
//! - **[`fabric`]**: the in-process message fabric — named exchanges,
//!   bounded queues, and the deployment's routing keys
//! - **[`annotator`]**: worker that resolves each incoming update against
//!   the index and republishes it with its matching rule node attached
//! - **[`detector`]**: worker that classifies annotated updates along the
//!   prefix/path/data-plane/policy dimensions and maintains hijack events
//! - **[`server`]**: the HTTP control plane (configuration, start/stop,
//!   health, introspection) and worker supervision
//! - **[`config`]**: service settings from file and environment
//!
//! # Data flow
//!
//! ```text
//! collectors ──update──▶ annotator ──update-with-prefix-node──▶ detector
//!                            │                                     │
//!                 (LPM against the compiled              (classification +
//!                  prefix index; drop misses)             event upsert)
//!                            │                                     │
//!                            ▼                                     ▼
//!                   mitigate-with-action                  hijack-update /
//!                                                         mitigate
//! ```
//!
//! Surrounding functionality — wire-level BGP collection, persistent event
//! storage, the UI, and mitigation execution — lives in other services and
//! talks to the pipeline over the fabric and the HTTP surface.
//!
//! # Quick start
//!
//! ```rust,ignore
//! use spyglass::config::ServiceConfig;
//! use spyglass::server::{self, ServiceState};
//!
//! let state = ServiceState::new(ServiceConfig::new(&None)?);
//! server::fetch_initial_config(&state).await;
//! server::start_server(state).await?;
//! ```

pub mod annotator;
pub mod bgp;
pub mod config;
pub mod detector;
pub mod fabric;
pub mod index;
pub mod policy;
pub mod registry;
pub mod server;

pub use config::ServiceConfig;

// Commonly used pipeline types
pub use annotator::Annotator;
pub use bgp::{BgpUpdate, UpdateType};
pub use detector::{Detector, HijackEvent, HijackState, TypeTuple};
pub use index::PrefixIndex;
pub use policy::{ConfigDoc, PrefixNode, RuleConf};
pub use registry::SharedRegistry;
