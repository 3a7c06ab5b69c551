//! Configuration schema for an EtherCAT network of CiA-402 drives.
//!
//! Provides [`ConfigLoader`], a blanket TOML-loading trait mirroring the
//! workspace's existing configuration convention, plus the [`NetworkConfig`]
//! / [`DriveConfig`] schema and their `validate()` bounds checks, which are
//! deliberately separate from deserialization so a caller can load a
//! partially-defaulted config and still reject it explicitly.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consts;

/// Error type for configuration loading and validation.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at the specified path.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parsing failed.
    #[error("failed to parse configuration: {0}")]
    ParseError(String),

    /// Semantic validation failed.
    #[error("configuration validation failed: {0}")]
    ValidationError(String),
}

/// Trait for loading configuration from TOML files.
///
/// # Contract
/// - Returns [`ConfigError::FileNotFound`] if the file does not exist.
/// - Returns [`ConfigError::ParseError`] if TOML syntax is invalid.
/// Validation is the caller's responsibility via an explicit `validate()` call.
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    /// Load configuration from a TOML file.
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound(path.display().to_string())
            } else {
                ConfigError::ParseError(e.to_string())
            }
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

impl<T: serde::de::DeserializeOwned> ConfigLoader for T {}

fn default_cycle_time_ms() -> f64 {
    consts::CYCLE_TIME_MS_DEFAULT
}
fn default_op_timeout_s() -> f64 {
    consts::OP_TIMEOUT_S_DEFAULT
}
fn default_enable_transition_period_ms() -> f64 {
    consts::ENABLE_TRANSITION_PERIOD_MS_DEFAULT
}
fn default_pp_ack_mask() -> u16 {
    consts::PP_ACK_MASK_DEFAULT
}
fn default_pp_ack_timeout_ms() -> f64 {
    consts::PP_ACK_TIMEOUT_MS_DEFAULT
}
fn default_status_publish_period_ms() -> u64 {
    consts::STATUS_PUBLISH_PERIOD_MS_DEFAULT
}
fn default_ingress_drain_bound() -> usize {
    consts::INGRESS_DRAIN_BOUND_DEFAULT
}
fn default_ethercat_device_path() -> String {
    "/dev/EtherCAT0".to_string()
}
fn default_force_release_retry_delay_s() -> f64 {
    1.0
}
fn default_force_release_attempts() -> u32 {
    3
}
fn default_true() -> bool {
    true
}

/// Startup preflight: optionally release a prior process holding the master
/// device node before retrying acquisition. Privileged, off by default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterPreflight {
    /// If true, attempt to release a prior holder of the master device on acquisition failure.
    pub force_release_on_startup: bool,
    /// Device path checked/released (e.g. `/dev/EtherCAT0`).
    #[serde(default = "default_ethercat_device_path")]
    pub device_path: String,
    /// Try SIGTERM before SIGKILL when releasing.
    #[serde(default = "default_true")]
    pub sigterm_first: bool,
    /// Delay between a release attempt and retrying acquisition.
    #[serde(default = "default_force_release_retry_delay_s")]
    pub retry_delay_s: f64,
    /// Number of release+retry cycles to attempt before giving up.
    #[serde(default = "default_force_release_attempts")]
    pub attempts: u32,
    /// Log the owning process(es) before/after a release attempt.
    #[serde(default = "default_true")]
    pub debug_owners: bool,
}

impl Default for MasterPreflight {
    fn default() -> Self {
        Self {
            force_release_on_startup: false,
            device_path: default_ethercat_device_path(),
            sigterm_first: true,
            retry_delay_s: default_force_release_retry_delay_s(),
            attempts: default_force_release_attempts(),
            debug_owners: true,
        }
    }
}

/// Top-level, immutable startup configuration for an EtherCAT network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Master instance index passed to the native adapter (`ecrt_request_master`-style).
    pub master_index: u32,
    /// Optional network interface name, when the adapter needs one explicitly.
    pub network_interface: Option<String>,
    /// Fixed cycle period in milliseconds.
    #[serde(default = "default_cycle_time_ms")]
    pub cycle_time_ms: f64,
    /// Optional CPU core to pin the worker to (requires the `rt` feature to take effect).
    pub cpu_core: Option<usize>,
    /// Optional SCHED_FIFO priority (requires the `rt` feature to take effect).
    pub rt_priority: Option<i32>,
    /// Master acquisition preflight/release policy.
    #[serde(default)]
    pub preflight: MasterPreflight,
    /// Timeout to reach OP after activation for every configured slave.
    #[serde(default = "default_op_timeout_s")]
    pub op_timeout_s: f64,
    /// CiA-402 enable state-machine transition pacing.
    #[serde(default = "default_enable_transition_period_ms")]
    pub enable_transition_period_ms: f64,
    /// Set-point-acknowledged bit mask (statusword).
    #[serde(default = "default_pp_ack_mask")]
    pub pp_ack_mask: u16,
    /// Set-point acknowledgement timeout.
    #[serde(default = "default_pp_ack_timeout_ms")]
    pub pp_ack_timeout_ms: f64,
    /// Status snapshot publish period, decoupled from the cycle period.
    #[serde(default = "default_status_publish_period_ms")]
    pub status_publish_period_ms: u64,
    /// Bounded number of ingress commands drained per cycle.
    #[serde(default = "default_ingress_drain_bound")]
    pub ingress_drain_bound: usize,
    /// When true, the worker never issues enable/motion-affecting writes and
    /// counts+drops motion commands instead (safety interlock).
    #[serde(default)]
    pub forbid_motion_commands: bool,
    /// When true, the Drive State Machine (C2) runs automatically every cycle
    /// once a slave reaches OP; otherwise enabling is purely command-driven.
    #[serde(default = "default_true")]
    pub auto_enable: bool,
    /// Service-channel-only network: no cyclic process-data exchange is
    /// configured (bench bring-up). The state machine and motion controller
    /// must not run in this mode.
    #[serde(default)]
    pub sdo_only: bool,
    /// Ordered set of slave configurations, indexed by bus position.
    pub slaves: Vec<DriveConfig>,
}

/// Optional ESI reference used to derive PDO assignments at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EsiReference {
    /// Path to the ESI XML file.
    pub xml_file: String,
    /// Optional vendor id filter for multi-device ESI files.
    pub vendor_id: Option<u32>,
    /// Optional product code filter for multi-device ESI files.
    pub product_code: Option<u32>,
    /// Optional revision filter for multi-device ESI files.
    #[serde(default)]
    pub revision: Option<u32>,
}

/// Custom PDO mapping overriding (fully replacing, for the affected PDOs) the
/// ESI-derived assignment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PdoSelection {
    /// Receive (outbound, master->slave) PDO indices, in assignment order.
    #[serde(default)]
    pub rx_pdos: Vec<u16>,
    /// Transmit (inbound, slave->master) PDO indices, in assignment order.
    #[serde(default)]
    pub tx_pdos: Vec<u16>,
    /// Per-PDO entry list: pdo index -> ordered (object index, subindex, bit length).
    #[serde(default)]
    pub entries: Vec<PdoSelectionEntry>,
}

/// One entry of a [`PdoSelection`] override.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PdoSelectionEntry {
    /// Owning PDO index (e.g. 0x1600).
    pub pdo_index: u16,
    /// Object dictionary index.
    pub index: u16,
    /// Object dictionary subindex.
    pub subindex: u8,
    /// Bit length of this entry.
    pub bit_length: u8,
}

/// Homing parameters. Opaque to the core beyond the set-point pulse on bit 4;
/// attainment detection is device-specific and left to the application, which
/// polls the statusword.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HomingConfig {
    /// CiA-402 homing method (object 0x6098), passed through via startup SDO writes.
    pub method: Option<i8>,
    /// Search velocity, drive-native units.
    pub search_velocity: Option<f64>,
    /// Zero-search (creep) velocity, drive-native units.
    pub zero_velocity: Option<f64>,
    /// Homing acceleration, drive-native units.
    pub acceleration: Option<f64>,
    /// Home offset applied after homing completes.
    pub offset: Option<f64>,
}

/// Jerk-limited planner settings for CSP streaming (all drive-native units).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuckigConfig {
    /// Whether the planner is available for this slave at all.
    #[serde(default)]
    pub enabled: bool,
    /// Optional override of the planner step; defaults to the network cycle time.
    pub dt_ms: Option<f64>,
    /// Default max velocity, drive-native units/s.
    pub max_velocity: Option<f64>,
    /// Default max acceleration, drive-native units/s².
    pub max_acceleration: Option<f64>,
    /// Default max jerk, drive-native units/s³.
    pub max_jerk: Option<f64>,
    /// How far ahead (seconds) the moving goal is placed for velocity commands.
    #[serde(default = "default_velocity_lookahead_s")]
    pub velocity_lookahead_s: f64,
    /// On stop, hold the last commanded position (true) vs. the latest measured position (false).
    #[serde(default = "default_true")]
    pub hold_last_commanded_position: bool,
}

fn default_velocity_lookahead_s() -> f64 {
    0.5
}

/// One startup service-channel (SDO) write applied once, before activation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartupSdoWrite {
    /// Object dictionary index.
    pub index: u16,
    /// Object dictionary subindex.
    pub subindex: u8,
    /// Little-endian payload bytes.
    pub data: Vec<u8>,
}

/// Per-slave configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriveConfig {
    /// Bus position (0-based, in scan order).
    pub position: u16,
    /// Optional alias, when the bus uses aliased addressing.
    #[serde(default)]
    pub alias: u16,
    /// Vendor id, required for slave configuration.
    pub vendor_id: u32,
    /// Product code, required for slave configuration.
    pub product_code: u32,
    /// Enable distributed-clock synchronization for this slave.
    #[serde(default)]
    pub enable_dc: bool,
    /// DC assign/activate word, passed through to the adapter verbatim.
    pub dc_assign_activate: Option<u16>,
    /// DC SYNC0 cycle time, nanoseconds.
    pub dc_sync0_cycle_time_ns: Option<u32>,
    /// DC SYNC0 shift, nanoseconds.
    #[serde(default)]
    pub dc_sync0_shift_ns: i32,
    /// DC SYNC1 cycle time, nanoseconds.
    #[serde(default)]
    pub dc_sync1_cycle_time_ns: u32,
    /// DC SYNC1 shift, nanoseconds.
    #[serde(default)]
    pub dc_sync1_shift_ns: i32,
    /// Default operation mode applied at startup (CiA-402 mode byte).
    pub operation_mode: Option<u8>,
    /// Default profile velocity, drive-native units/s.
    pub profile_velocity: Option<f64>,
    /// Default profile acceleration, drive-native units/s².
    pub profile_acceleration: Option<f64>,
    /// Velocity cap enforced by the Mode & Motion Controller.
    pub max_velocity: Option<f64>,
    /// Torque cap enforced by the Mode & Motion Controller.
    pub max_torque: Option<f64>,
    /// Optional position limits (min, max); out-of-range CSP/PP targets are clamped, not rejected.
    pub position_limits: Option<(f64, f64)>,
    /// Homing parameters.
    pub homing: Option<HomingConfig>,
    /// ESI reference used to derive PDO assignment.
    pub esi: Option<EsiReference>,
    /// Custom PDO mapping override.
    pub pdo_override: Option<PdoSelection>,
    /// Jerk-limited planner settings.
    pub planner: Option<RuckigConfig>,
    /// Some drives require a set-point strobe (bit 4) for Profile Velocity too.
    #[serde(default)]
    pub pv_requires_setpoint_toggle: bool,
    /// Some drives require a set-point strobe (bit 4) for Profile Torque too.
    #[serde(default)]
    pub pt_requires_setpoint_toggle: bool,
    /// Startup service-channel writes, applied once before activation.
    #[serde(default)]
    pub startup_sdo_writes: Vec<StartupSdoWrite>,
}

impl NetworkConfig {
    /// Validate bounds not already enforced by deserialization.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(consts::CYCLE_TIME_MS_MIN..=consts::CYCLE_TIME_MS_MAX).contains(&self.cycle_time_ms) {
            return Err(ConfigError::ValidationError(format!(
                "cycle_time_ms={} out of range [{}, {}]",
                self.cycle_time_ms,
                consts::CYCLE_TIME_MS_MIN,
                consts::CYCLE_TIME_MS_MAX
            )));
        }
        if self.op_timeout_s <= 0.0 {
            return Err(ConfigError::ValidationError(
                "op_timeout_s must be > 0".to_string(),
            ));
        }
        if self.enable_transition_period_ms <= 0.0 {
            return Err(ConfigError::ValidationError(
                "enable_transition_period_ms must be > 0".to_string(),
            ));
        }
        if self.pp_ack_timeout_ms <= 0.0 {
            return Err(ConfigError::ValidationError(
                "pp_ack_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.slaves.is_empty() {
            return Err(ConfigError::ValidationError(
                "network must configure at least one slave".to_string(),
            ));
        }
        if self.slaves.len() > consts::MAX_SLAVES {
            return Err(ConfigError::ValidationError(format!(
                "too many slaves: {} > {}",
                self.slaves.len(),
                consts::MAX_SLAVES
            )));
        }
        let mut seen_positions = std::collections::HashSet::new();
        for slave in &self.slaves {
            slave.validate()?;
            if !seen_positions.insert(slave.position) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate slave position {}",
                    slave.position
                )));
            }
        }
        Ok(())
    }
}

impl DriveConfig {
    /// Validate bounds not already enforced by deserialization.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.vendor_id == 0 {
            return Err(ConfigError::ValidationError(format!(
                "slave {}: vendor_id must be non-zero",
                self.position
            )));
        }
        if let Some((min, max)) = self.position_limits {
            if min >= max {
                return Err(ConfigError::ValidationError(format!(
                    "slave {}: position_limits min ({min}) must be < max ({max})",
                    self.position
                )));
            }
        }
        if let Some(mv) = self.max_velocity {
            if mv <= 0.0 {
                return Err(ConfigError::ValidationError(format!(
                    "slave {}: max_velocity must be > 0",
                    self.position
                )));
            }
        }
        if self.enable_dc && self.dc_sync0_cycle_time_ns.is_none() {
            return Err(ConfigError::ValidationError(format!(
                "slave {}: enable_dc requires dc_sync0_cycle_time_ns",
                self.position
            )));
        }
        if let Some(planner) = &self.planner {
            if planner.enabled {
                let limits_ok = planner.max_velocity.unwrap_or(0.0) > 0.0
                    && planner.max_acceleration.unwrap_or(0.0) > 0.0
                    && planner.max_jerk.unwrap_or(0.0) > 0.0;
                if !limits_ok {
                    return Err(ConfigError::ValidationError(format!(
                        "slave {}: planner.enabled requires positive max_velocity/max_acceleration/max_jerk defaults",
                        self.position
                    )));
                }
                if planner.velocity_lookahead_s <= 0.0 {
                    return Err(ConfigError::ValidationError(format!(
                        "slave {}: planner.velocity_lookahead_s must be > 0",
                        self.position
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn minimal_drive(position: u16) -> DriveConfig {
        DriveConfig {
            position,
            alias: 0,
            vendor_id: 0x0000_00AB,
            product_code: 0x1234_5678,
            enable_dc: false,
            dc_assign_activate: None,
            dc_sync0_cycle_time_ns: None,
            dc_sync0_shift_ns: 0,
            dc_sync1_cycle_time_ns: 0,
            dc_sync1_shift_ns: 0,
            operation_mode: Some(8),
            profile_velocity: None,
            profile_acceleration: None,
            max_velocity: Some(100_000.0),
            max_torque: None,
            position_limits: None,
            homing: None,
            esi: None,
            pdo_override: None,
            planner: None,
            pv_requires_setpoint_toggle: false,
            pt_requires_setpoint_toggle: false,
            startup_sdo_writes: vec![],
        }
    }

    fn minimal_network() -> NetworkConfig {
        NetworkConfig {
            master_index: 0,
            network_interface: None,
            cycle_time_ms: 5.0,
            cpu_core: None,
            rt_priority: None,
            preflight: MasterPreflight::default(),
            op_timeout_s: 10.0,
            enable_transition_period_ms: 100.0,
            pp_ack_mask: 0x1000,
            pp_ack_timeout_ms: 100.0,
            status_publish_period_ms: 50,
            ingress_drain_bound: 16,
            forbid_motion_commands: false,
            auto_enable: true,
            sdo_only: false,
            slaves: vec![minimal_drive(0)],
        }
    }

    #[test]
    fn minimal_network_validates() {
        assert!(minimal_network().validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_cycle_time() {
        let mut cfg = minimal_network();
        cfg.cycle_time_ms = 1000.0;
        assert!(matches!(cfg.validate(), Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn rejects_empty_slave_list() {
        let mut cfg = minimal_network();
        cfg.slaves.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_duplicate_positions() {
        let mut cfg = minimal_network();
        cfg.slaves.push(minimal_drive(0));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_zero_vendor_id() {
        let mut drive = minimal_drive(0);
        drive.vendor_id = 0;
        assert!(drive.validate().is_err());
    }

    #[test]
    fn rejects_inverted_position_limits() {
        let mut drive = minimal_drive(0);
        drive.position_limits = Some((10.0, -10.0));
        assert!(drive.validate().is_err());
    }

    #[test]
    fn rejects_dc_enabled_without_sync0() {
        let mut drive = minimal_drive(0);
        drive.enable_dc = true;
        assert!(drive.validate().is_err());
    }

    #[test]
    fn rejects_planner_enabled_without_limits() {
        let mut drive = minimal_drive(0);
        drive.planner = Some(RuckigConfig {
            enabled: true,
            dt_ms: None,
            max_velocity: None,
            max_acceleration: None,
            max_jerk: None,
            velocity_lookahead_s: 0.5,
            hold_last_commanded_position: true,
        });
        assert!(drive.validate().is_err());
    }

    #[test]
    fn loads_from_toml_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
master_index = 0
cycle_time_ms = 5.0

[[slaves]]
position = 0
vendor_id = 171
product_code = 305419896
operation_mode = 8
max_velocity = 50000.0
"#
        )
        .unwrap();
        file.flush().unwrap();

        let cfg = NetworkConfig::load(file.path()).expect("load");
        assert_eq!(cfg.slaves.len(), 1);
        assert_eq!(cfg.slaves[0].vendor_id, 171);
        cfg.validate().expect("validate");
    }

    #[test]
    fn load_missing_file_reports_not_found() {
        let result = NetworkConfig::load(Path::new("/nonexistent/network.toml"));
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }
}
