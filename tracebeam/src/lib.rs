//! # TraceBeam
//!
//! Telemetry core of a performance-monitoring SDK: applications create
//! distributed-tracing spans, the crate samples them against a probability
//! negotiated with the ingestion endpoint, batches the survivors, and
//! delivers the batches in the background with bounded retry.
//!
//! The crate owns the decisions (identity, sampling, batching, retry); the
//! host supplies the capabilities (an HTTP [`Delivery`], optionally a
//! [`Persistence`] store, a [`Clock`], an async runtime). That split keeps
//! the core free of a mandatory HTTP client and portable across runtimes.
//!
//! ## Getting started
//!
//! ```no_run
//! use tracebeam::{Client, Configuration};
//! # use tracebeam::delivery::Delivery;
//! # async fn example(delivery: impl Delivery) -> Result<(), tracebeam::SdkError> {
//! let configuration = Configuration::new("abcdef0123456789abcdef0123456789")
//!     .with_app_version("2.1.0");
//! let client = Client::builder(configuration)
//!     .with_delivery(delivery)
//!     .build(tracebeam::runtime::Tokio)?;
//!
//! let span = client.start_span("page_load");
//! // ... monitored work ...
//! span.end();
//!
//! client.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Crate feature flags
//!
//! * `internal-logs` (default): emit the SDK's own diagnostics as [tracing]
//!   events.
//! * `rt-tokio` (default): the [`runtime::Tokio`] implementation of the
//!   runtime abstraction.
//! * `testing`: in-memory clock, delivery, and processor doubles for host
//!   application tests.
//!
//! [`Delivery`]: delivery::Delivery
//! [`Persistence`]: persistence::Persistence
//! [`Clock`]: time::Clock
//! [tracing]: https://crates.io/crates/tracing
#![warn(
    future_incompatible,
    missing_debug_implementations,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    unreachable_pub,
    unused
)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]

pub mod attributes;
pub mod client;
pub mod config;
pub mod delivery;
pub mod error;
mod logging;
pub mod persistence;
pub mod resource;
pub mod runtime;
#[cfg(any(feature = "testing", test))]
#[cfg_attr(docsrs, doc(cfg(feature = "testing")))]
pub mod testing;
pub mod time;
pub mod trace;

pub use client::{Client, ClientBuilder};
pub use config::Configuration;
pub use error::{SdkError, SdkResult};
pub use resource::Resource;

#[cfg(feature = "internal-logs")]
#[doc(hidden)]
pub mod _private {
    pub use tracing::{debug, error, info, warn};
}
