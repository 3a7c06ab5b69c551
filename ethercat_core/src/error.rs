//! Layered error taxonomy (§7): `StartupError` is always fatal, `CycleError`
//! is transient unless it demands the worker stop, `PlannerError` never
//! bubbles past the slave that raised it.

use thiserror::Error;

/// Fatal conditions encountered during the one-shot startup sequence (§4.1).
/// A `StartupError` always terminates the worker.
#[derive(Debug, Error)]
pub enum StartupError {
    /// The master device could not be acquired, including after preflight release retries.
    #[error("failed to acquire master index {master_index}: {reason}")]
    MasterAcquisition {
        /// Configured master index.
        master_index: u32,
        /// Underlying failure reason.
        reason: String,
    },
    /// ESI decoding failed for a slave.
    #[error("slave {position}: ESI decode failed: {reason}")]
    EsiDecode {
        /// Bus position of the affected slave.
        position: u16,
        /// Underlying failure reason.
        reason: String,
    },
    /// A CiA-402 slave did not map both controlword and statusword.
    #[error("slave {position}: CiA-402 requires controlword (0x6040) and statusword (0x6041) mapped")]
    MissingCia402Registers {
        /// Bus position of the affected slave.
        position: u16,
    },
    /// A slave lacked identifying information (vendor id / product code).
    #[error("slave {position}: missing vendor_id/product_code identification")]
    MissingIdentity {
        /// Bus position of the affected slave.
        position: u16,
    },
    /// Slave identity or PDO registration against the master adapter failed.
    #[error("slave {position}: configuration failed: {reason}")]
    SlaveConfig {
        /// Bus position of the affected slave.
        position: u16,
        /// Underlying failure reason.
        reason: String,
    },
    /// Not every configured slave reached OP within `op_timeout_s` of activation.
    #[error("OP-entry timeout after {elapsed_s:.1}s ({missing} of {total} slaves not in OP)")]
    OpEntryTimeout {
        /// Seconds elapsed since activation.
        elapsed_s: f64,
        /// Slaves still not in OP.
        missing: usize,
        /// Total configured slaves.
        total: usize,
    },
    /// A distributed-clock configuration call returned a nonzero status.
    #[error("slave {position}: ecrt_slave_config_dc returned nonzero status {code}")]
    DcConfig {
        /// Bus position of the affected slave.
        position: u16,
        /// Native status code returned.
        code: i32,
    },
    /// Master activation failed.
    #[error("master activation failed: {0}")]
    Activation(String),
    /// Configuration failed `validate()`.
    #[error(transparent)]
    Config(#[from] ethercat_common::config::ConfigError),
}

/// Transient conditions raised during the steady-state cycle loop (§7).
/// Most variants are logged and do not stop the worker; `CycleOverrun` and
/// `DeadlineResync` are recorded in status, not escalated, per §4.1 step 11.
#[derive(Debug, Error)]
pub enum CycleError {
    /// A service-channel (SDO) write failed; retried on the next attempt.
    #[error("slave {position}: SDO write 0x{index:04X}:{subindex} failed: {reason}")]
    SdoWriteFailed {
        /// Bus position of the affected slave.
        position: u16,
        /// Object dictionary index.
        index: u16,
        /// Object dictionary subindex.
        subindex: u8,
        /// Underlying failure reason.
        reason: String,
    },
    /// A service-channel (SDO) read failed.
    #[error("slave {position}: SDO read 0x{index:04X}:{subindex} failed: {reason}")]
    SdoReadFailed {
        /// Bus position of the affected slave.
        position: u16,
        /// Object dictionary index.
        index: u16,
        /// Object dictionary subindex.
        subindex: u8,
        /// Underlying failure reason.
        reason: String,
    },
    /// Frame receive/process/queue/send against the master adapter failed.
    #[error("domain exchange failed: {0}")]
    DomainExchange(String),
    /// RT setup syscall (mlockall/affinity/scheduler) failed.
    #[error("RT setup failed: {0}")]
    RtSetup(String),
}

/// Errors raised by the jerk-limited planner (§4.4, §7). Always recoverable:
/// the request is aborted and the reason surfaces in the next status snapshot.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PlannerError {
    /// A kinematic limit (velocity/acceleration/jerk) was not strictly positive.
    #[error("invalid limit: {which} = {value} (must be > 0)")]
    InvalidLimit {
        /// Name of the offending limit.
        which: &'static str,
        /// The rejected value.
        value: f64,
    },
    /// The slave does not map actual position and/or actual velocity.
    #[error("actual {missing} not mapped; planner requires both position and velocity feedback")]
    UnmappedActual {
        /// Which actual field is missing.
        missing: &'static str,
    },
    /// The slave is not enabled, or not in CSP mode.
    #[error("planner requires an enabled slave in CSP mode")]
    NotReady,
}

/// Errors surfaced by a [`crate::master::MasterAdapter`] implementation.
/// Callers fold these into [`StartupError`] or [`CycleError`] depending on
/// when in the lifecycle they occur.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MasterError {
    /// The master device could not be requested/acquired.
    #[error("master acquisition failed: {0}")]
    Acquisition(String),
    /// Slave configuration (identity, PDO registration) failed.
    #[error("slave configuration failed: {0}")]
    SlaveConfig(String),
    /// Distributed-clock configuration returned a non-zero status (§9: the
    /// authoritative signature is adapter-specific; treat non-zero as error).
    #[error("distributed clock configuration failed with status {0}")]
    DcConfig(i32),
    /// Master activation failed.
    #[error("activation failed: {0}")]
    Activation(String),
    /// Frame receive/process/queue/send failed.
    #[error("domain exchange failed: {0}")]
    Domain(String),
    /// A service-channel (SDO) read or write failed.
    #[error("SDO operation failed: {0}")]
    Sdo(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_error_messages_are_descriptive() {
        let err = StartupError::MissingCia402Registers { position: 3 };
        assert!(err.to_string().contains("0x6040"));
        assert!(err.to_string().contains("0x6041"));
    }

    #[test]
    fn planner_error_equality() {
        let a = PlannerError::InvalidLimit { which: "max_jerk", value: -1.0 };
        let b = PlannerError::InvalidLimit { which: "max_jerk", value: -1.0 };
        assert_eq!(a, b);
    }

    #[test]
    fn op_entry_timeout_message() {
        let err = StartupError::OpEntryTimeout { elapsed_s: 10.2, missing: 1, total: 4 };
        let msg = err.to_string();
        assert!(msg.contains("1 of 4"));
    }
}
