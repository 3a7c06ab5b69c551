//! The Cyclic Worker (C1, §4.1): owns the master handle, the process-data
//! domain, and every slave's offsets table and [`SlaveRuntimeState`]; runs
//! the one-shot startup sequence; then the fixed-period cycle loop that
//! drains commands, exchanges frames, runs C2/C3/C4, and publishes status.
//!
//! Grounded on the workspace's own `cycle.rs`: the same RT setup sequence
//! (`mlockall` → prefault → `sched_setaffinity` → `SCHED_FIFO`), the same
//! `clock_nanosleep(TIMER_ABSTIME)` absolute-deadline pacing with a
//! `rt`-feature-gated no-op fallback, and the same O(1) per-cycle stats
//! struct — generalized here to jitter against a *configured* period rather
//! than a single fixed constant, and to fold in the domain/WKC and per-slave
//! bookkeeping a fieldbus cycle actually needs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ethercat_common::cia402::{self, Mode};
use ethercat_common::command::{Command, CommandKind};
use ethercat_common::config::{DriveConfig, NetworkConfig};
use ethercat_common::consts::{GRACEFUL_SHUTDOWN_MIN_CYCLES, JITTER_RING_CAPACITY};
use ethercat_common::pdo::{read_i32, read_u16, read_u32, PdoMap};
use ethercat_common::status::{
    CycleTimingStatus, DomainStatus, DriveFlags, NetworkStatus, PlannerStatus, SlaveStatus,
};

use crate::drive_state;
use crate::error::{CycleError, StartupError};
use crate::esi;
use crate::master::{ApplicationState, DcConfig, MasterAdapter, PdoEntrySpec};
use crate::motion;
use crate::planner::{Limits, SCurvePlanner, TrajectoryGenerator};
use crate::state::{FeatureSet, SlaveRuntimeState};
use crate::transport::{DriveHandle, StatusEgress, Transport};

// ─── Jitter Ring Buffer ─────────────────────────────────────────────

/// Fixed-capacity ring buffer of signed jitter samples (nanoseconds).
/// Percentiles are computed on demand from a sorted copy at publish time
/// (§9: "sort copy at publish time is acceptable at 20 Hz") rather than
/// maintained incrementally.
struct JitterRing {
    buf: Vec<i64>,
    cap: usize,
    write: usize,
    len: usize,
}

impl JitterRing {
    fn new(cap: usize) -> Self {
        Self { buf: vec![0i64; cap], cap, write: 0, len: 0 }
    }

    fn push(&mut self, sample_ns: i64) {
        self.buf[self.write] = sample_ns;
        self.write = (self.write + 1) % self.cap;
        self.len = (self.len + 1).min(self.cap);
    }

    /// `p` in `[0.0, 1.0]`; returns the absolute-value percentile of the
    /// samples currently held, or 0 if empty.
    fn percentile_abs(&self, p: f64) -> u64 {
        if self.len == 0 {
            return 0;
        }
        let mut sorted: Vec<u64> = self.buf[..self.len].iter().map(|v| v.unsigned_abs()).collect();
        sorted.sort_unstable();
        let idx = ((sorted.len() - 1) as f64 * p).round() as usize;
        sorted[idx]
    }
}

// ─── RT Setup (mirrors the workspace's mlockall/affinity/SCHED_FIFO sequence) ──

/// Lock all current and future memory pages. No-op without the `rt` feature.
#[cfg(feature = "rt")]
fn rt_mlockall() -> Result<(), CycleError> {
    use nix::sys::mman::{mlockall, MlockallFlags};
    mlockall(MlockallFlags::MCL_CURRENT | MlockallFlags::MCL_FUTURE)
        .map_err(|e| CycleError::RtSetup(format!("mlockall failed: {e}")))?;
    Ok(())
}

#[cfg(not(feature = "rt"))]
fn rt_mlockall() -> Result<(), CycleError> {
    Ok(())
}

/// Touch a megabyte of stack to prefault its pages before entering the loop.
fn prefault_stack() {
    let mut buf = [0u8; 1024 * 1024];
    for byte in buf.iter_mut() {
        unsafe { core::ptr::write_volatile(byte, 0xFF) };
    }
    core::hint::black_box(&buf);
}

#[cfg(feature = "rt")]
fn rt_set_affinity(cpu: usize) -> Result<(), CycleError> {
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::unistd::Pid;

    let mut cpuset = CpuSet::new();
    cpuset
        .set(cpu)
        .map_err(|e| CycleError::RtSetup(format!("CpuSet::set({cpu}) failed: {e}")))?;
    sched_setaffinity(Pid::from_raw(0), &cpuset)
        .map_err(|e| CycleError::RtSetup(format!("sched_setaffinity failed: {e}")))?;
    Ok(())
}

#[cfg(not(feature = "rt"))]
fn rt_set_affinity(_cpu: usize) -> Result<(), CycleError> {
    Ok(())
}

#[cfg(feature = "rt")]
fn rt_set_scheduler(priority: i32) -> Result<(), CycleError> {
    let param = libc::sched_param { sched_priority: priority };
    let ret = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        return Err(CycleError::RtSetup(format!(
            "sched_setscheduler(SCHED_FIFO, {priority}) failed: {err}"
        )));
    }
    Ok(())
}

#[cfg(not(feature = "rt"))]
fn rt_set_scheduler(_priority: i32) -> Result<(), CycleError> {
    Ok(())
}

/// Full RT setup sequence. All calls are no-ops without the `rt` feature, so
/// simulation/test builds (no `CAP_SYS_NICE`/`CAP_IPC_LOCK`) run unprivileged.
pub fn rt_setup(cpu_core: Option<usize>, rt_priority: Option<i32>) -> Result<(), CycleError> {
    rt_mlockall()?;
    prefault_stack();
    if let Some(cpu) = cpu_core {
        rt_set_affinity(cpu)?;
    }
    if let Some(priority) = rt_priority {
        rt_set_scheduler(priority)?;
    }
    Ok(())
}

// ─── Preflight master release (§4.1 step 1) ────────────────────────

/// Best-effort: terminate any process holding `device_path` open, escalating
/// SIGTERM then SIGKILL, so a stale prior instance doesn't block master
/// acquisition. Linux-only (reads `/proc/*/fd`); a no-op elsewhere. Gated by
/// [`ethercat_common::config::MasterPreflight::force_release_on_startup`]
/// because it requires permission to signal another process's PID.
#[cfg(target_os = "linux")]
fn release_device_holders(device_path: &str, sigterm_first: bool, debug_owners: bool) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    use std::fs;

    let Ok(real_device) = fs::canonicalize(device_path) else {
        return;
    };

    let Ok(procs) = fs::read_dir("/proc") else {
        return;
    };

    for entry in procs.flatten() {
        let Some(pid_str) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        let Ok(pid) = pid_str.parse::<i32>() else {
            continue;
        };
        let fd_dir = entry.path().join("fd");
        let Ok(fds) = fs::read_dir(&fd_dir) else {
            continue;
        };
        let holds_device = fds.flatten().any(|fd| {
            fs::read_link(fd.path())
                .map(|target| target == real_device)
                .unwrap_or(false)
        });
        if !holds_device {
            continue;
        }
        if debug_owners {
            tracing::warn!(pid, device = device_path, "releasing prior holder of master device");
        }
        let signal = if sigterm_first { Signal::SIGTERM } else { Signal::SIGKILL };
        let _ = kill(Pid::from_raw(pid), signal);
    }
}

#[cfg(not(target_os = "linux"))]
fn release_device_holders(_device_path: &str, _sigterm_first: bool, _debug_owners: bool) {}

// ─── Per-slave worker-side bundle ───────────────────────────────────

struct WorkerSlave {
    cfg: DriveConfig,
    map: PdoMap,
    state: SlaveRuntimeState,
    planner: SCurvePlanner,
    planner_dt_s: f64,
}

// ─── Cyclic Worker ──────────────────────────────────────────────────

/// The Cyclic Worker: the isolated owner of the master handle, domain, and
/// every slave's runtime state (§3, §4.1). `A` is the native master boundary
/// — production links a real adapter; tests and local development use
/// [`crate::master::SimMaster`].
pub struct CyclicWorker<A: MasterAdapter> {
    adapter: A,
    config: NetworkConfig,
    slaves: Vec<WorkerSlave>,
    transport: Transport,
    stop_flag: Arc<AtomicBool>,
    cycle_period: Duration,
    activated_at: Instant,
    next_deadline: Instant,
    jitter: JitterRing,
    max_jitter_ns: u64,
    last_measured_ns: u64,
    last_jitter_ns: i64,
    deadline_miss_count: u64,
    cycle_count: u64,
    min_wkc: u32,
    max_wkc: u32,
    last_publish: Option<Instant>,
    motion_blocked_count: u64,
}

impl<A: MasterAdapter> CyclicWorker<A> {
    /// Run the deterministic startup sequence (§4.1) and return a worker
    /// ready to [`CyclicWorker::run`], plus the application-facing command
    /// sender and status egress needed to build [`DriveHandle`]s.
    pub fn start(
        config: NetworkConfig,
        mut adapter: A,
        stop_flag: Arc<AtomicBool>,
    ) -> Result<(Self, std::sync::mpsc::SyncSender<Command>, StatusEgress), StartupError> {
        config.validate()?;

        // Step 1: acquire the master, with optional preflight release.
        let mut attempts_left = if config.preflight.force_release_on_startup {
            config.preflight.attempts
        } else {
            0
        };
        loop {
            match adapter.request(config.master_index) {
                Ok(()) => break,
                Err(e) if attempts_left > 0 => {
                    attempts_left -= 1;
                    release_device_holders(
                        &config.preflight.device_path,
                        config.preflight.sigterm_first,
                        config.preflight.debug_owners,
                    );
                    std::thread::sleep(Duration::from_secs_f64(config.preflight.retry_delay_s));
                    tracing::warn!(reason = %e, attempts_left, "retrying master acquisition after preflight release");
                }
                Err(e) => {
                    return Err(StartupError::MasterAcquisition {
                        master_index: config.master_index,
                        reason: e.to_string(),
                    })
                }
            }
        }

        // Step 2: create the domain.
        adapter.create_domain().map_err(|e| StartupError::MasterAcquisition {
            master_index: config.master_index,
            reason: e.to_string(),
        })?;

        // Steps 3-5: per-slave identity, PDO mapping, bulk registration,
        // CiA-402 register requirement.
        let mut slaves = Vec::with_capacity(config.slaves.len());
        for cfg in &config.slaves {
            if cfg.vendor_id == 0 {
                return Err(StartupError::MissingIdentity { position: cfg.position });
            }

            adapter
                .config_slave(cfg.position, cfg.alias, cfg.vendor_id, cfg.product_code)
                .map_err(|e| StartupError::SlaveConfig { position: cfg.position, reason: e.to_string() })?;

            for write in &cfg.startup_sdo_writes {
                adapter
                    .sdo_write(cfg.position, write.index, write.subindex, &write.data)
                    .map_err(|e| StartupError::SlaveConfig {
                        position: cfg.position,
                        reason: format!("startup SDO 0x{:04X}:{} failed: {e}", write.index, write.subindex),
                    })?;
            }

            let entries = build_pdo_entries(cfg)?;
            let offsets = adapter
                .register_pdo_entries(cfg.position, &entries)
                .map_err(|e| StartupError::SlaveConfig { position: cfg.position, reason: e.to_string() })?;

            let mut map = PdoMap::new();
            for (entry, offset) in entries.iter().zip(offsets.iter()) {
                if entry.outbound {
                    map.register_rx(entry.index, entry.subindex, *offset, entry.bit_length);
                } else {
                    map.register_tx(entry.index, entry.subindex, *offset, entry.bit_length);
                }
            }

            if !map.is_mapped(cia402::CONTROLWORD_INDEX, 0) || !map.is_mapped(cia402::STATUSWORD_INDEX, 0) {
                return Err(StartupError::MissingCia402Registers { position: cfg.position });
            }

            if !map.is_mapped(cia402::MODES_OF_OPERATION_INDEX, 0) {
                if let Some(mode_value) = cfg.operation_mode {
                    adapter
                        .sdo_write(cfg.position, cia402::MODES_OF_OPERATION_INDEX, 0, &[mode_value])
                        .map_err(|e| StartupError::SlaveConfig {
                            position: cfg.position,
                            reason: format!("initial mode-of-operation SDO write failed: {e}"),
                        })?;
                }
            }

            let features = FeatureSet::from_map(&map);
            let mut state = SlaveRuntimeState::new(cfg.position, features);
            state.mode = cfg.operation_mode.and_then(Mode::from_u8).unwrap_or_default();

            let planner_dt_s = cfg
                .planner
                .as_ref()
                .and_then(|p| p.dt_ms)
                .unwrap_or(config.cycle_time_ms)
                / 1000.0;

            slaves.push(WorkerSlave { cfg: cfg.clone(), map, state, planner: SCurvePlanner::new(), planner_dt_s });
        }

        // Step 6: distributed clocks. Reference is the first DC-enabled
        // slave (no explicit override is exposed in configuration).
        if let Some(reference) = slaves.iter().find(|s| s.cfg.enable_dc) {
            adapter
                .select_reference_clock(reference.cfg.position)
                .map_err(|e| StartupError::DcConfig { position: reference.cfg.position, code: dc_error_code(&e) })?;
        }
        for slave in &slaves {
            if !slave.cfg.enable_dc {
                continue;
            }
            let dc = DcConfig {
                assign_activate: slave.cfg.dc_assign_activate.unwrap_or(0),
                sync0_cycle_time_ns: slave.cfg.dc_sync0_cycle_time_ns.unwrap_or(0),
                sync0_shift_ns: slave.cfg.dc_sync0_shift_ns,
                sync1_cycle_time_ns: slave.cfg.dc_sync1_cycle_time_ns,
                sync1_shift_ns: slave.cfg.dc_sync1_shift_ns,
            };
            adapter
                .config_dc(slave.cfg.position, dc)
                .map_err(|e| StartupError::DcConfig { position: slave.cfg.position, code: dc_error_code(&e) })?;
        }

        // Step 7: initial application time.
        adapter.set_application_time(0);

        // Step 8: activate and record the activation wall time.
        adapter.activate().map_err(|e| StartupError::Activation(e.to_string()))?;
        let activated_at = Instant::now();

        let cycle_period = Duration::from_secs_f64(config.cycle_time_ms / 1000.0);
        let (transport, command_tx, status_egress) = Transport::new(config.ingress_drain_bound.max(1));

        let worker = Self {
            adapter,
            config: config.clone(),
            slaves,
            transport,
            stop_flag,
            cycle_period,
            activated_at,
            next_deadline: activated_at + cycle_period,
            jitter: JitterRing::new(JITTER_RING_CAPACITY),
            max_jitter_ns: 0,
            last_measured_ns: 0,
            last_jitter_ns: 0,
            deadline_miss_count: 0,
            cycle_count: 0,
            min_wkc: u32::MAX,
            max_wkc: 0,
            last_publish: None,
            motion_blocked_count: 0,
        };

        Ok((worker, command_tx, status_egress))
    }

    /// A handle addressed to `position`, sharing this worker's command
    /// sender and status egress. Convenience over re-deriving them from the
    /// tuple returned by [`CyclicWorker::start`].
    pub fn handle_for(&self, position: u16, commands: std::sync::mpsc::SyncSender<Command>, status: StatusEgress) -> DriveHandle {
        DriveHandle::new(position, commands, status)
    }

    /// Enter the cycle loop. Returns once the stop flag is observed and
    /// graceful shutdown completes, or immediately on the OP-entry timeout
    /// fatal condition (§4.1 step 4).
    pub fn run(&mut self) -> Result<(), StartupError> {
        loop {
            if self.stop_flag.load(Ordering::Relaxed) {
                break;
            }

            let cycle_start = Instant::now();
            self.record_timing(cycle_start);

            if let Err(fatal) = self.cycle_body(cycle_start) {
                self.graceful_shutdown();
                self.adapter.deactivate();
                self.adapter.release();
                return Err(fatal);
            }

            self.sleep_until_deadline();
        }

        self.graceful_shutdown();
        self.adapter.deactivate();
        self.adapter.release();
        Ok(())
    }

    fn record_timing(&mut self, cycle_start: Instant) {
        if self.cycle_count > 0 {
            let configured_ns = self.cycle_period.as_nanos() as i64;
            let measured_ns = cycle_start
                .saturating_duration_since(self.next_deadline - self.cycle_period)
                .as_nanos() as i64;
            let jitter_ns = measured_ns - configured_ns;
            self.jitter.push(jitter_ns);
            self.max_jitter_ns = self.max_jitter_ns.max(jitter_ns.unsigned_abs());
            self.last_measured_ns = measured_ns as u64;
            self.last_jitter_ns = jitter_ns;
        }
        if cycle_start > self.next_deadline {
            self.deadline_miss_count += 1;
        }
        self.cycle_count += 1;
    }

    /// One cycle body (§4.1 steps 2-10). Returns `Err` only for the fatal
    /// OP-entry-timeout condition; every other failure is logged and the
    /// cycle continues.
    fn cycle_body(&mut self, now: Instant) -> Result<(), StartupError> {
        // Step 2: drain ingress, bounded.
        let commands = self.transport.drain(self.config.ingress_drain_bound);
        for command in commands {
            self.apply_command(command);
        }

        if self.config.sdo_only {
            // No cyclic process-data image in this mode: service-channel
            // commands above are the only effect. Refuse to run the Drive
            // State Machine or Mode Controller since there is no cyclic
            // image to write into (§9 SDO-only diagnostic mode).
            let should_publish = self
                .last_publish
                .map(|last| now.saturating_duration_since(last).as_millis() as u64 >= self.config.status_publish_period_ms)
                .unwrap_or(true);
            if should_publish {
                let status = self.build_status(now);
                self.transport.publish(status);
                self.last_publish = Some(now);
            }
            return Ok(());
        }

        // Step 3: receive and process the domain.
        if let Err(e) = self.adapter.receive() {
            tracing::warn!(reason = %e, "frame receive failed; skipping this cycle's exchange");
            return Ok(());
        }
        self.adapter.process_domain();

        let (wkc, expected_wkc) = self.adapter.working_counter();
        self.min_wkc = self.min_wkc.min(wkc);
        self.max_wkc = self.max_wkc.max(wkc);

        // Step 4: per-slave application-layer state.
        let mut all_ever_op = true;
        for slave in &mut self.slaves {
            let observed = self.adapter.slave_state(slave.cfg.position);
            let was_in_op = slave.state.in_op;
            slave.state.in_op = observed == ApplicationState::Op;
            slave.state.last_app_state = observed;

            if slave.state.in_op && !was_in_op {
                slave.state.op_entered_last = Some(now);
                if slave.state.op_entered_first.is_none() {
                    slave.state.op_entered_first = Some(now);
                }
            } else if !slave.state.in_op && was_in_op {
                slave.state.reset_on_op_loss(now);
                let stop_pos = planner_stop_position(slave, &self.adapter);
                slave.planner.stop(stop_pos);
            }
            all_ever_op &= slave.state.op_entered_first.is_some();
        }

        if !all_ever_op {
            let elapsed = now.saturating_duration_since(self.activated_at).as_secs_f64();
            if elapsed >= self.config.op_timeout_s {
                let missing = self.slaves.iter().filter(|s| s.state.op_entered_first.is_none()).count();
                return Err(StartupError::OpEntryTimeout { elapsed_s: elapsed, missing, total: self.slaves.len() });
            }
        }

        let transition_period = Duration::from_secs_f64(self.config.enable_transition_period_ms / 1000.0);
        let pp_ack_timeout = Duration::from_secs_f64(self.config.pp_ack_timeout_ms / 1000.0);

        for slave in &mut self.slaves {
            if !slave.state.in_op {
                continue;
            }

            // Step 5: Drive State Machine.
            let controlword_base = if self.config.auto_enable {
                let statusword = slave
                    .map
                    .tx_offset(cia402::STATUSWORD_INDEX, 0)
                    .map(|off| read_u16(self.adapter.domain_data(), off.byte_offset))
                    .unwrap_or(0);
                drive_state::step(&mut slave.state, statusword, transition_period, now)
            } else {
                slave.state.desired_controlword
            };

            // Step 6: Planner, only while enabled, in CSP, with actual
            // position/velocity mapped (§4.4 safety contract).
            if slave.state.planner_active {
                step_planner(slave, &self.adapter, now);
            }

            // Step 7: Mode & Motion Controller.
            if let Err(e) = motion::apply_cycle(
                &mut slave.state,
                &slave.cfg,
                &slave.map,
                &mut self.adapter,
                controlword_base,
                now,
                self.config.pp_ack_mask,
                pp_ack_timeout,
            ) {
                tracing::warn!(position = slave.cfg.position, reason = %e, "motion controller write failed");
            }
        }

        // Step 8: application time and clock sync.
        let time_ns = now.saturating_duration_since(self.activated_at).as_nanos() as u64;
        self.adapter.set_application_time(time_ns);

        // Step 9: queue and send.
        self.adapter.queue_domain();
        if let Err(e) = self.adapter.send() {
            tracing::warn!(reason = %e, "frame send failed");
        }

        // Step 10: status, at most every `status_publish_period_ms`.
        let should_publish = self
            .last_publish
            .map(|last| now.saturating_duration_since(last).as_millis() as u64 >= self.config.status_publish_period_ms)
            .unwrap_or(true);
        if should_publish {
            let status = self.build_status(now);
            self.transport.publish(status);
            self.last_publish = Some(now);
        }

        Ok(())
    }

    fn apply_command(&mut self, command: Command) {
        if self.config.forbid_motion_commands && command.is_motion_command() {
            self.motion_blocked_count += 1;
            tracing::warn!(slave = command.slave, "motion command dropped: forbid_motion_commands is set");
            return;
        }

        let Some(slave) = self.slaves.iter_mut().find(|s| s.cfg.position == command.slave) else {
            tracing::warn!(slave = command.slave, "command addressed to unknown slave");
            return;
        };

        match command.kind {
            CommandKind::SetMode(mode) => {
                if mode != slave.state.mode {
                    slave.state.csp_seeded = false;
                }
                slave.state.mode = mode;
            }
            CommandKind::SetVelocity(v) => slave.state.last_velocity_cmd = v,
            CommandKind::SetPosition(p) => {
                slave.state.last_position_cmd = p;
                slave.state.pp_pulse.request();
            }
            CommandKind::SetPositionCsp(p) => slave.state.csp_next = Some(p),
            CommandKind::SetTorque(t) => slave.state.last_torque_cmd = t,
            CommandKind::StartHoming => slave.state.hm_pulse.request(),
            CommandKind::ArmProbe { edge, continuous } => {
                slave.state.probe_armed = true;
                slave.state.probe_edge = Some(edge);
                slave.state.probe_continuous = continuous;
                slave.state.pending_probe_word =
                    Some(cia402::probe_function_word(matches!(edge, ethercat_common::command::ProbeEdge::Negative)));
            }
            CommandKind::DisableProbe => {
                slave.state.probe_armed = false;
                slave.state.probe_edge = None;
                slave.state.pending_probe_word = Some(0);
            }
            CommandKind::EnableDrive => {
                slave.state.enable_requested = true;
                slave.state.manual_disable = false;
            }
            CommandKind::DisableDrive => {
                slave.state.manual_disable = true;
            }
            CommandKind::StopMotion => {
                slave.state.last_velocity_cmd = 0.0;
                slave.state.last_torque_cmd = 0.0;
                slave.state.planner_active = false;
                let stop_pos = planner_stop_position(slave, &self.adapter);
                slave.planner.stop(stop_pos);
            }
            CommandKind::WriteRawPdo { index, subindex, bytes } => {
                if let Some(off) = slave.map.rx_offset(index, subindex) {
                    let image = self.adapter.domain_data_mut();
                    let end = (off.byte_offset + bytes.len()).min(image.len());
                    image[off.byte_offset..end].copy_from_slice(&bytes[..end - off.byte_offset]);
                } else {
                    tracing::warn!(slave = command.slave, index, subindex, "write_raw_pdo: not mapped");
                }
            }
            CommandKind::WriteSdo { index, subindex, bytes } => {
                if let Err(e) = self.adapter.sdo_write(command.slave, index, subindex, &bytes) {
                    tracing::warn!(slave = command.slave, index, subindex, reason = %e, "SDO write failed");
                }
            }
            CommandKind::ReadSdo { index, subindex } => {
                if let Err(e) = self.adapter.sdo_read(command.slave, index, subindex) {
                    tracing::warn!(slave = command.slave, index, subindex, reason = %e, "SDO read failed");
                }
            }
            CommandKind::StartJerkMove { position, overrides } => {
                let Some(limits) = resolve_limits(&slave.cfg, overrides) else {
                    slave.state.planner_last_error = Some(crate::error::PlannerError::NotReady);
                    return;
                };
                if let Err(e) = planner_readiness(&slave.state, &slave.cfg) {
                    slave.state.planner_last_error = Some(e);
                    return;
                }
                match slave.planner.start_position(
                    slave.state.csp_current,
                    0.0,
                    position,
                    limits,
                    slave.planner_dt_s,
                ) {
                    Ok(()) => {
                        slave.state.planner_active = true;
                        slave.state.planner_is_velocity_mode = false;
                        slave.state.planner_target = position;
                        slave.state.planner_last_error = None;
                    }
                    Err(e) => slave.state.planner_last_error = Some(e),
                }
            }
            CommandKind::StartJerkVelocity { velocity, overrides } => {
                let Some(limits) = resolve_limits(&slave.cfg, overrides) else {
                    slave.state.planner_last_error = Some(crate::error::PlannerError::NotReady);
                    return;
                };
                if let Err(e) = planner_readiness(&slave.state, &slave.cfg) {
                    slave.state.planner_last_error = Some(e);
                    return;
                }
                let lookahead_s = slave.cfg.planner.as_ref().map(|p| p.velocity_lookahead_s).unwrap_or(0.5);
                match slave.planner.start_velocity(
                    slave.state.csp_current,
                    0.0,
                    velocity,
                    limits,
                    slave.planner_dt_s,
                    lookahead_s,
                ) {
                    Ok(()) => {
                        slave.state.planner_active = true;
                        slave.state.planner_is_velocity_mode = true;
                        slave.state.planner_target = velocity;
                        slave.state.planner_last_error = None;
                    }
                    Err(e) => slave.state.planner_last_error = Some(e),
                }
            }
            CommandKind::StopJerk => {
                slave.state.planner_active = false;
                let stop_pos = planner_stop_position(slave, &self.adapter);
                slave.planner.stop(stop_pos);
            }
            CommandKind::ClearFault => {
                slave.state.fault_reset_attempts = 0;
            }
            CommandKind::NoOp => {}
        }
    }

    fn build_status(&self, now: Instant) -> NetworkStatus {
        let timestamp_ns = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);

        let (wkc, expected_wkc) = self.adapter.working_counter();
        let timing = CycleTimingStatus {
            configured_period_ns: self.cycle_period.as_nanos() as u64,
            last_cycle_ns: self.last_measured_ns,
            last_jitter_ns: self.last_jitter_ns,
            max_jitter_ns: self.max_jitter_ns,
            p95_jitter_ns: self.jitter.percentile_abs(0.95),
            p99_jitter_ns: self.jitter.percentile_abs(0.99),
            p999_jitter_ns: self.jitter.percentile_abs(0.999),
            deadline_miss_count: self.deadline_miss_count,
            cycle_count: self.cycle_count,
        };

        let domain = DomainStatus {
            last_wkc: wkc,
            expected_wkc,
            min_wkc: if self.min_wkc == u32::MAX { 0 } else { self.min_wkc },
            max_wkc: self.max_wkc,
            all_in_op: self.slaves.iter().all(|s| s.state.in_op),
        };

        let mut status = NetworkStatus {
            timestamp_ns,
            cycle_time_ms: self.config.cycle_time_ms,
            timing,
            domain,
            motion_blocked_count: self.motion_blocked_count,
            slaves: heapless::Vec::new(),
        };

        for slave in &self.slaves {
            let image = self.adapter.domain_data();
            let statusword = slave.map.tx_offset(cia402::STATUSWORD_INDEX, 0).map(|o| read_u16(image, o.byte_offset));
            let flags = statusword
                .map(|sw| DriveFlags {
                    enabled: slave.state.enabled,
                    fault: drive_state::is_faulted(sw),
                    warning: sw & (1 << 7) != 0,
                    target_reached: sw & (1 << 10) != 0,
                    setpoint_ack: sw & self.config.pp_ack_mask != 0,
                })
                .unwrap_or_default();

            let probe_pos2 = slave
                .map
                .tx_offset(cia402::PROBE_POS2_INDEX, 0)
                .or_else(|| slave.map.tx_offset(cia402::PROBE_POS2_INDEX_ALT, 0))
                .map(|o| read_i32(image, o.byte_offset));

            let slave_status = SlaveStatus {
                position: slave.cfg.position,
                in_op: slave.state.in_op,
                op_dropout_count: slave.state.op_dropout_count,
                statusword,
                mode_display: slave
                    .map
                    .tx_offset(cia402::MODES_OF_OPERATION_DISPLAY_INDEX, 0)
                    .map(|o| image[o.byte_offset]),
                position_actual: slave.map.tx_offset(cia402::POSITION_ACTUAL_INDEX, 0).map(|o| read_i32(image, o.byte_offset)),
                velocity_actual: slave.map.tx_offset(cia402::VELOCITY_ACTUAL_INDEX, 0).map(|o| read_i32(image, o.byte_offset)),
                torque_actual: slave
                    .map
                    .tx_offset(cia402::TORQUE_ACTUAL_INDEX, 0)
                    .map(|o| ethercat_common::pdo::read_i16(image, o.byte_offset)),
                error_code: slave.map.tx_offset(cia402::ERROR_CODE_INDEX, 0).map(|o| read_u16(image, o.byte_offset)),
                digital_inputs: slave.map.tx_offset(cia402::DIGITAL_INPUTS_INDEX, 0).map(|o| read_u32(image, o.byte_offset)),
                probe_pos1: slave.map.tx_offset(cia402::PROBE_POS1_INDEX, 0).map(|o| read_i32(image, o.byte_offset)),
                probe_pos2,
                flags,
                planner: PlannerStatus {
                    active: slave.state.planner_active,
                    is_velocity_mode: slave.state.planner_is_velocity_mode,
                    target: slave.state.planner_target,
                    has_error: slave.state.planner_last_error.is_some(),
                },
            };
            let _ = status.slaves.push(slave_status);
        }

        status
    }

    /// Sleep until the next absolute deadline. If the deadline has already
    /// passed, resynchronize the timebase to `now` and skip sleeping this
    /// cycle (§4.1 step 11).
    fn sleep_until_deadline(&mut self) {
        let now = Instant::now();
        if self.next_deadline <= now {
            self.next_deadline = now;
        } else {
            #[cfg(feature = "rt")]
            {
                sleep_absolute_rt(self.next_deadline);
            }
            #[cfg(not(feature = "rt"))]
            {
                std::thread::sleep(self.next_deadline - now);
            }
        }
        self.next_deadline += self.cycle_period;
    }

    /// Graceful drive shutdown (§4.1): over at least
    /// [`GRACEFUL_SHUTDOWN_MIN_CYCLES`] cycles, write zero target velocity
    /// and hold the current target position, and controlword 0x0000, before
    /// the master deactivates. Uses [`motion::write_shutdown_frame`] rather
    /// than the ordinary disabled path: a running velocity command must be
    /// actively bled to zero, not frozen at its last value.
    fn graceful_shutdown(&mut self) {
        for slave in &mut self.slaves {
            slave.state.manual_disable = true;
            slave.state.planner_active = false;
        }

        for _ in 0..GRACEFUL_SHUTDOWN_MIN_CYCLES {
            if self.adapter.receive().is_err() {
                continue;
            }
            self.adapter.process_domain();
            for slave in &mut self.slaves {
                let _ = motion::write_shutdown_frame(&mut slave.state, &slave.map, &mut self.adapter);
            }
            self.adapter.queue_domain();
            let _ = self.adapter.send();
            std::thread::sleep(self.cycle_period);
        }
    }
}

#[cfg(feature = "rt")]
fn sleep_absolute_rt(deadline: Instant) {
    use nix::sys::time::TimeSpec;
    use nix::time::{clock_nanosleep, ClockId, ClockNanosleepFlags};

    let now = Instant::now();
    let remaining = deadline.saturating_duration_since(now);
    // clock_nanosleep(TIMER_ABSTIME) needs a CLOCK_MONOTONIC timestamp; since
    // `Instant` doesn't expose one portably, fall back to a relative sleep
    // computed from the same deadline math the caller already resynchronizes.
    let ts = TimeSpec::from_duration(remaining);
    let _ = clock_nanosleep(ClockId::CLOCK_MONOTONIC, ClockNanosleepFlags::empty(), &ts);
}

fn dc_error_code(e: &crate::error::MasterError) -> i32 {
    match e {
        crate::error::MasterError::DcConfig(code) => *code,
        _ => -1,
    }
}

/// Build the full `(index, subindex, bit_length, outbound)` entry list for a
/// slave: a `pdo_override` fully replaces the ESI-derived assignment for the
/// affected PDOs (§4.1 step 3); otherwise the ESI reference is decoded.
fn build_pdo_entries(cfg: &DriveConfig) -> Result<Vec<PdoEntrySpec>, StartupError> {
    if let Some(selection) = &cfg.pdo_override {
        let entries = selection
            .entries
            .iter()
            .map(|e| PdoEntrySpec {
                index: e.index,
                subindex: e.subindex,
                bit_length: e.bit_length,
                outbound: selection.rx_pdos.contains(&e.pdo_index),
            })
            .collect();
        return Ok(entries);
    }

    let esi_ref = cfg.esi.as_ref().ok_or_else(|| StartupError::SlaveConfig {
        position: cfg.position,
        reason: "no ESI reference or pdo_override configured".to_string(),
    })?;

    let description = esi::decode_esi_file(
        std::path::Path::new(&esi_ref.xml_file),
        esi_ref.vendor_id,
        esi_ref.product_code,
        esi_ref.revision,
    )
    .map_err(|e| StartupError::EsiDecode { position: cfg.position, reason: e.to_string() })?;

    let mut entries = Vec::new();
    for pdo in &description.rx_pdos {
        for entry in &pdo.entries {
            entries.push(PdoEntrySpec { index: entry.index, subindex: entry.subindex, bit_length: entry.bit_length, outbound: true });
        }
    }
    for pdo in &description.tx_pdos {
        for entry in &pdo.entries {
            entries.push(PdoEntrySpec { index: entry.index, subindex: entry.subindex, bit_length: entry.bit_length, outbound: false });
        }
    }
    Ok(entries)
}

/// §4.4 safety contract: the planner never runs for a disabled slave, one
/// not in CSP mode, or one missing actual-position/actual-velocity mapping.
/// Distinguishes the unmapped-feedback case so the reason surfaced in status
/// (§7) names the actual missing register rather than a generic rejection.
fn planner_readiness(state: &SlaveRuntimeState, cfg: &DriveConfig) -> Result<(), crate::error::PlannerError> {
    let _ = cfg;
    if !state.features.position_actual {
        return Err(crate::error::PlannerError::UnmappedActual { missing: "position" });
    }
    if !state.features.velocity_actual {
        return Err(crate::error::PlannerError::UnmappedActual { missing: "velocity" });
    }
    if !state.enabled || state.mode != Mode::CyclicSyncPosition {
        return Err(crate::error::PlannerError::NotReady);
    }
    Ok(())
}

/// Position to hand to `planner.stop()`: the last commanded CSP target
/// (`csp_current`) by default, or the latest measured actual position when
/// the slave's `hold_last_commanded_position` planner flag is `false` (§3).
fn planner_stop_position<A: MasterAdapter>(slave: &WorkerSlave, adapter: &A) -> f64 {
    let hold_commanded = slave.cfg.planner.as_ref().map(|p| p.hold_last_commanded_position).unwrap_or(true);
    if hold_commanded {
        return slave.state.csp_current;
    }
    slave
        .map
        .tx_offset(cia402::POSITION_ACTUAL_INDEX, 0)
        .map(|o| read_i32(adapter.domain_data(), o.byte_offset) as f64)
        .unwrap_or(slave.state.csp_current)
}

fn resolve_limits(cfg: &DriveConfig, overrides: ethercat_common::command::JerkLimitOverrides) -> Option<Limits> {
    let defaults = cfg.planner.as_ref()?;
    Some(Limits {
        max_velocity: overrides.max_velocity.or(defaults.max_velocity)?,
        max_acceleration: overrides.max_acceleration.or(defaults.max_acceleration)?,
        max_jerk: overrides.max_jerk.or(defaults.max_jerk)?,
    })
}

/// Step the planner for one slave (§4.4): feed it the measured position and
/// velocity, advance it one tick, and stream the result into `csp_next`.
fn step_planner<A: MasterAdapter>(slave: &mut WorkerSlave, adapter: &A, now: Instant) {
    let _ = now;
    if let Err(e) = planner_readiness(&slave.state, &slave.cfg) {
        slave.state.planner_active = false;
        slave.state.planner_last_error = Some(e);
        let stop_pos = planner_stop_position(slave, adapter);
        slave.planner.stop(stop_pos);
        return;
    }

    let image = adapter.domain_data();
    let actual_position = slave
        .map
        .tx_offset(cia402::POSITION_ACTUAL_INDEX, 0)
        .map(|o| read_i32(image, o.byte_offset) as f64)
        .unwrap_or(slave.state.csp_current);
    let actual_velocity = slave
        .map
        .tx_offset(cia402::VELOCITY_ACTUAL_INDEX, 0)
        .map(|o| read_i32(image, o.byte_offset) as f64)
        .unwrap_or(0.0);

    if let Some(step) = slave.planner.step(actual_position, actual_velocity) {
        slave.state.csp_next = Some(step.position);
        if step.done {
            slave.state.planner_active = false;
        }
    } else {
        slave.state.planner_active = false;
    }
}
