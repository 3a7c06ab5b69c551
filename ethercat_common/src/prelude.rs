//! Prelude module for common re-exports.
//!
//! Consumers can do `use ethercat_common::prelude::*;` and get the most
//! frequently used types without listing individual paths.
//!
//! # Usage
//!
//! ```rust
//! use ethercat_common::prelude::*;
//! ```

// ─── CiA-402 ────────────────────────────────────────────────────────
pub use crate::cia402::{is_operation_enabled, ControlwordBits, Mode, StatuswordBits};

// ─── Commands ───────────────────────────────────────────────────────
pub use crate::command::{Command, CommandKind, JerkLimitOverrides, ProbeEdge};

// ─── Configuration ──────────────────────────────────────────────────
pub use crate::config::{ConfigError, ConfigLoader, DriveConfig, NetworkConfig};

// ─── System Constants ───────────────────────────────────────────────
pub use crate::consts::{CYCLE_TIME_MS_DEFAULT, MAX_SLAVES};

// ─── Process Image ──────────────────────────────────────────────────
pub use crate::pdo::{PdoMap, PdoOffset};

// ─── Status ─────────────────────────────────────────────────────────
pub use crate::status::{DriveFlags, NetworkStatus, PlannerStatus, SlaveStatus};
