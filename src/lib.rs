//! Vitals - Live-Instance Telemetry Library
//!
//! This crate transparently enrolls running program instances into a
//! background monitor that periodically samples their live state and ships
//! it to a remote collector. It can be embedded as a library on either side
//! of the wire, or run standalone as the `vitals` collector binary.
//!
//! # Architecture
//!
//! - **Monitor**: per-class registries of weakly-held instance handles, one
//!   sampling loop per monitored class
//! - **Snapshot codec**: deterministic textual encoding of an instance's
//!   field set
//! - **Transport**: persistent outbound links carrying length-prefixed
//!   frames
//! - **Collector server**: accepts monitor connections and forwards
//!   received frames to a pluggable sink
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use vitals::{CollectorServer, Delivery, Monitor};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let (tx, mut rx) = tokio::sync::mpsc::channel::<Delivery>(256);
//!     let server = CollectorServer::start("127.0.0.1:8080".parse()?, Arc::new(tx)).await?;
//!
//!     let monitor = Arc::new(Monitor::new(server.local_addr()));
//!     // monitor.enroll(&instance, "Counter", Duration::from_secs(1)).await;
//!
//!     while let Some(delivery) = rx.recv().await {
//!         println!("{:?}", delivery);
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod monitor;
pub mod server;
pub mod snapshot;
pub mod transport;

pub use config::{AppConfig, ConfigError, MonitorConfig, ServerConfig};
pub use monitor::{Monitor, MIN_INTERVAL};
pub use server::{CollectorServer, Delivery, DeliverySink, ServerError};
pub use snapshot::{CodecError, Sampled, Snapshot};
pub use transport::{TransportError, TransportLink, MAX_FRAME_LEN};
