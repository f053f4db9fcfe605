//! Device Layer
//!
//! Everything between a registry record and a live management channel.
//!
//! # Architecture
//!
//! - [`DeviceSession`] / [`DeviceConnector`]: Transport abstraction (connect, run command, close)
//! - [`DeviceQuery`]: Typed capability queries ([`SystemResources`], [`Interfaces`])
//! - [`SessionFactory`]: Loads a record, decrypts its secret and opens a session
//! - [`routeros`]: RouterOS API transport

mod factory;
mod query;
pub mod routeros;
mod traits;

pub use factory::{DEFAULT_CONNECT_TIMEOUT, OpenSession, SessionError, SessionFactory};
pub use query::{DeviceQuery, Interfaces, SystemResources};
pub use routeros::RouterOsConnector;
pub use traits::{Credentials, DeviceConnector, DeviceError, DeviceSession, Record};
