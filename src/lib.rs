//! Routerwatch - Router Registry and Telemetry Library
//!
//! This crate provides the core functionality for the routerwatch service.
//! It can be used as a library by other Rust projects, or run as a standalone
//! binary with the `routerwatch` executable.
//!
//! # Architecture
//!
//! - **Cipher**: Versioned key ring, device secrets sealed at rest
//! - **Storage**: SQLite persistence for devices, samples and events
//! - **Device**: Session factory over the RouterOS API transport
//! - **Poller**: Scheduled, failure-isolated sweeps into a metrics sink
//! - **Server**: JSON API for registration and on-demand queries
//!
//! # Example
//!
//! ```rust,ignore
//! use routerwatch::{KeyRing, Poller, RouterOsConnector, SecretCipher, SessionFactory, StorageBuilder};
//! use std::sync::Arc;
//!
//! let ring = KeyRing::load_or_init("data/keys")?;
//! let cipher = Arc::new(SecretCipher::new(&ring)?);
//! let handles = StorageBuilder::new("data/routerwatch.db").build(cipher).await?;
//!
//! let sessions = SessionFactory::new(handles.device_store.clone(), Arc::new(RouterOsConnector::new()));
//! let poller = Poller::new(sessions, Arc::new(handles.metric_writer.clone()));
//! let report = poller.run_sweep_once().await?;
//! println!("{}", report.summary());
//! ```

pub mod cipher;
pub mod config;
pub mod device;
pub mod error;
pub mod poller;
pub mod server;
pub mod sink;
pub mod storage;

pub use cipher::{CipherError, KeyRing, SealedSecret, SecretCipher};
pub use device::{DeviceConnector, DeviceSession, RouterOsConnector, SessionError, SessionFactory};
pub use error::ErrorKind;
pub use poller::{PollScheduler, Poller, PollerSettings, Schedule, SweepReport};
pub use sink::{MetricsSample, MetricsSink, SinkError};
pub use storage::{DeviceStore, NewDevice, RegistryError, StorageBuilder, StorageHandles};
