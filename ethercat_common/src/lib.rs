//! EtherCAT Common Library
//!
//! Shared CiA-402 constants, configuration schema, command/status types, and
//! the PDO offset table shared between the cyclic worker and any application
//! that talks to it across the command/status transport.
//!
//! # Module Structure
//!
//! - [`cia402`] - CiA-402 object dictionary indices, controlword/statusword bits, mode enum
//! - [`config`] - `NetworkConfig`/`DriveConfig` schema, TOML loading, bounds validation
//! - [`command`] - the tagged `Command` enum crossing the worker boundary
//! - [`status`] - `NetworkStatus` snapshot published by the worker
//! - [`pdo`] - `PdoMap`: registered (index, subindex) -> (byte offset, bit width)
//! - [`prelude`] - common re-exports for convenience
//!
//! # Usage
//!
//! ```toml
//! [dependencies]
//! ethercat_common = { path = "../ethercat_common" }
//! ```

pub mod cia402;
pub mod command;
pub mod config;
pub mod consts;
pub mod pdo;
pub mod prelude;
pub mod status;
