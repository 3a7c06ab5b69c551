//! The jerk-limited trajectory generator (C4): a bounded-jerk scalar motion
//! profile used to produce the CSP stream for `StartJerkMove` /
//! `StartJerkVelocity` requests (§4.4).
//!
//! Mirrors the external contract of the original `ruckig_planner.py`
//! generator (`start_position`, `start_velocity`, `step`, `stop`,
//! `is_active`) behind a trait so the Cyclic Worker depends on the shape of
//! the contract rather than a concrete algorithm.

use ethercat_common::consts::PLANNER_REBASE_THRESHOLD;

use crate::error::PlannerError;

/// Kinematic limits for one planner request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Limits {
    /// Maximum speed, drive-native units/s.
    pub max_velocity: f64,
    /// Maximum acceleration magnitude, drive-native units/s².
    pub max_acceleration: f64,
    /// Maximum jerk magnitude, drive-native units/s³.
    pub max_jerk: f64,
}

impl Limits {
    /// Reject non-positive limits; a planner cannot move with a zero or
    /// negative velocity/acceleration/jerk ceiling.
    pub fn validate(&self) -> Result<(), PlannerError> {
        if self.max_velocity <= 0.0 {
            return Err(PlannerError::InvalidLimit { which: "max_velocity", value: self.max_velocity });
        }
        if self.max_acceleration <= 0.0 {
            return Err(PlannerError::InvalidLimit { which: "max_acceleration", value: self.max_acceleration });
        }
        if self.max_jerk <= 0.0 {
            return Err(PlannerError::InvalidLimit { which: "max_jerk", value: self.max_jerk });
        }
        Ok(())
    }
}

/// One step's worth of planner output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlannerStep {
    /// Next CSP target position, drive-native units.
    pub position: f64,
    /// Planner-internal velocity estimate, drive-native units/s.
    pub velocity: f64,
    /// Planner-internal acceleration estimate, drive-native units/s².
    pub acceleration: f64,
    /// `true` once a position move has arrived and come to rest. Always
    /// `false` for a velocity-hold request until `stop()` is called.
    pub done: bool,
}

/// Behavioral contract a jerk-limited trajectory generator must satisfy.
/// `start_position`/`start_velocity` (re)arm the generator; `step` advances
/// it by one planner tick.
pub trait TrajectoryGenerator {
    /// Begin a point-to-point move toward `target_position`, auto-terminating
    /// (marks `done`) once arrived and at rest.
    fn start_position(
        &mut self,
        actual_position: f64,
        actual_velocity: f64,
        target_position: f64,
        limits: Limits,
        dt_s: f64,
    ) -> Result<(), PlannerError>;

    /// Begin (or retarget) a velocity hold. The moving goal position is
    /// continuously recomputed each `step` as `actual_position + target_velocity
    /// * lookahead_s`; the request never marks `done` on its own.
    fn start_velocity(
        &mut self,
        actual_position: f64,
        actual_velocity: f64,
        target_velocity: f64,
        limits: Limits,
        dt_s: f64,
        lookahead_s: f64,
    ) -> Result<(), PlannerError>;

    /// Advance the generator by one planner tick, given the latest measured
    /// feedback. Returns `None` if no request is active.
    fn step(&mut self, actual_position: f64, actual_velocity: f64) -> Option<PlannerStep>;

    /// Abort any active request, holding `hold_position` as the generator's
    /// internal reference point.
    fn stop(&mut self, hold_position: f64);

    /// Whether a request is currently active.
    fn is_active(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum RequestKind {
    Position { target: f64 },
    Velocity { target_velocity: f64, lookahead_s: f64 },
}

/// Online, bounded-jerk scalar motion profile: at each tick it picks a
/// target acceleration (accelerate toward the limit, cruise, or brake to
/// stop exactly at the goal under `max_acceleration`) and slews the actual
/// acceleration toward it at `max_jerk`.
pub struct SCurvePlanner {
    active: bool,
    kind: Option<RequestKind>,
    limits: Limits,
    dt_s: f64,
    /// Position relative to `rebase_offset`; kept near zero for long-running
    /// velocity holds so `f64` precision isn't spent on a large absolute value.
    local_position: f64,
    rebase_offset: f64,
    velocity: f64,
    acceleration: f64,
}

impl Default for SCurvePlanner {
    fn default() -> Self {
        Self::new()
    }
}

impl SCurvePlanner {
    /// A freshly constructed, inactive planner.
    pub fn new() -> Self {
        Self {
            active: false,
            kind: None,
            limits: Limits { max_velocity: 0.0, max_acceleration: 0.0, max_jerk: 0.0 },
            dt_s: 0.0,
            local_position: 0.0,
            rebase_offset: 0.0,
            velocity: 0.0,
            acceleration: 0.0,
        }
    }

    fn arm(&mut self, actual_position: f64, actual_velocity: f64, limits: Limits, dt_s: f64, kind: RequestKind) {
        self.limits = limits;
        self.dt_s = dt_s;
        self.local_position = actual_position;
        self.rebase_offset = 0.0;
        self.velocity = actual_velocity;
        self.acceleration = 0.0;
        self.kind = Some(kind);
        self.active = true;
    }

    fn output_position(&self) -> f64 {
        self.local_position + self.rebase_offset
    }
}

impl TrajectoryGenerator for SCurvePlanner {
    fn start_position(
        &mut self,
        actual_position: f64,
        actual_velocity: f64,
        target_position: f64,
        limits: Limits,
        dt_s: f64,
    ) -> Result<(), PlannerError> {
        limits.validate()?;
        self.arm(actual_position, actual_velocity, limits, dt_s, RequestKind::Position { target: target_position });
        Ok(())
    }

    fn start_velocity(
        &mut self,
        actual_position: f64,
        actual_velocity: f64,
        target_velocity: f64,
        limits: Limits,
        dt_s: f64,
        lookahead_s: f64,
    ) -> Result<(), PlannerError> {
        limits.validate()?;
        self.arm(
            actual_position,
            actual_velocity,
            limits,
            dt_s,
            RequestKind::Velocity { target_velocity, lookahead_s },
        );
        Ok(())
    }

    fn step(&mut self, actual_position: f64, actual_velocity: f64) -> Option<PlannerStep> {
        let _ = (actual_position, actual_velocity); // fed back only for (re)initialization in arm()
        if !self.active {
            return None;
        }
        let kind = self.kind?;

        let (target, is_velocity_mode) = match kind {
            RequestKind::Position { target } => (target, false),
            RequestKind::Velocity { target_velocity, lookahead_s } => {
                (self.output_position() + target_velocity * lookahead_s, true)
            }
        };

        let max_acc = self.limits.max_acceleration;
        let max_vel = self.limits.max_velocity;
        let max_jerk = self.limits.max_jerk;
        let dt = self.dt_s;

        let distance = target - self.output_position();
        let direction = if distance == 0.0 { 0.0 } else { distance.signum() };
        let braking_distance = (self.velocity * self.velocity) / (2.0 * max_acc);

        let desired_acc = if distance.abs() <= braking_distance {
            if self.velocity == 0.0 { 0.0 } else { -self.velocity.signum() * max_acc }
        } else if self.velocity.abs() < max_vel {
            direction * max_acc
        } else {
            0.0
        };

        let max_delta = max_jerk * dt;
        let delta = (desired_acc - self.acceleration).clamp(-max_delta, max_delta);
        self.acceleration = (self.acceleration + delta).clamp(-max_acc, max_acc);

        self.velocity = (self.velocity + self.acceleration * dt).clamp(-max_vel, max_vel);
        self.local_position += self.velocity * dt + 0.5 * self.acceleration * dt * dt;

        rebase(&mut self.local_position, &mut self.rebase_offset);

        let output_position = self.output_position();
        let done = !is_velocity_mode
            && (target - output_position).abs() < 1e-3
            && self.velocity.abs() < 1e-3;

        if done {
            self.active = false;
        }

        Some(PlannerStep { position: output_position, velocity: self.velocity, acceleration: self.acceleration, done })
    }

    fn stop(&mut self, hold_position: f64) {
        self.active = false;
        self.kind = None;
        self.velocity = 0.0;
        self.acceleration = 0.0;
        self.local_position = hold_position;
        self.rebase_offset = 0.0;
    }

    fn is_active(&self) -> bool {
        self.active
    }
}

/// Fold `local_position` back toward zero once it grows past
/// [`PLANNER_REBASE_THRESHOLD`], moving the truncated integer part into
/// `rebase_offset` so the externally visible position is unchanged.
fn rebase(local_position: &mut f64, rebase_offset: &mut f64) {
    if local_position.abs() > PLANNER_REBASE_THRESHOLD {
        let shift = local_position.round();
        *rebase_offset += shift;
        *local_position -= shift;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> Limits {
        Limits { max_velocity: 10.0, max_acceleration: 5.0, max_jerk: 50.0 }
    }

    #[test]
    fn rejects_non_positive_limits() {
        let bad = Limits { max_velocity: 0.0, max_acceleration: 5.0, max_jerk: 50.0 };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn position_move_converges_and_marks_done() {
        let mut planner = SCurvePlanner::new();
        planner.start_position(0.0, 0.0, 100.0, limits(), 0.01).unwrap();

        let mut pos = 0.0;
        let mut vel = 0.0;
        let mut done = false;
        for _ in 0..5000 {
            if let Some(step) = planner.step(pos, vel) {
                pos = step.position;
                vel = step.velocity;
                done = step.done;
                if done {
                    break;
                }
            } else {
                break;
            }
        }
        assert!(done, "planner did not converge within the iteration budget");
        assert!((pos - 100.0).abs() < 0.1);
        assert!(!planner.is_active());
    }

    #[test]
    fn velocity_hold_never_marks_done() {
        let mut planner = SCurvePlanner::new();
        planner.start_velocity(0.0, 0.0, 5.0, limits(), 0.01, 0.5).unwrap();

        let mut pos = 0.0;
        let mut vel = 0.0;
        for _ in 0..2000 {
            let step = planner.step(pos, vel).unwrap();
            assert!(!step.done);
            pos = step.position;
            vel = step.velocity;
        }
        assert!(vel > 4.0, "velocity hold should approach the target velocity: got {vel}");
        assert!(planner.is_active());
    }

    #[test]
    fn stop_deactivates_and_holds_position() {
        let mut planner = SCurvePlanner::new();
        planner.start_position(0.0, 0.0, 100.0, limits(), 0.01).unwrap();
        planner.step(0.0, 0.0);
        planner.stop(42.0);
        assert!(!planner.is_active());
        assert!(planner.step(42.0, 0.0).is_none());
    }

    #[test]
    fn rebase_preserves_output_position() {
        let mut local = PLANNER_REBASE_THRESHOLD + 10.0;
        let mut offset = 0.0;
        let before = local + offset;
        rebase(&mut local, &mut offset);
        let after = local + offset;
        assert!((before - after).abs() < 1e-6);
        assert!(local.abs() < PLANNER_REBASE_THRESHOLD);
    }

    #[test]
    fn rebase_is_noop_below_threshold() {
        let mut local = 1000.0;
        let mut offset = 0.0;
        rebase(&mut local, &mut offset);
        assert_eq!(local, 1000.0);
        assert_eq!(offset, 0.0);
    }
}
