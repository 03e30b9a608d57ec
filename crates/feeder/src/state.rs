//! Shared device state: the intent queue, flow-control counters, and the
//! commanded pose. One copy lives behind a mutex, shared between the
//! dispatch task and the [`crate::plot::Plotter`] handle.

use std::collections::VecDeque;

use ebb_geom::{AxisSteps, Config, Point};
use ebb_planner::{MoveCommand, PlannerSettings, Pose};
use ebb_protocol::Cmd;
use tokio::time::Instant;

use crate::settings::StoredSettings;

/// At most this many unacknowledged commands in flight.
pub const MAX_PENDING: u64 = 50;
/// Below this many pending commands, send two per tick to refill faster.
pub const LOW_WATER: u64 = 10;
/// A plot counts as draining once fewer than this many commands are pending.
pub const FINISH_PENDING: u64 = 5;
/// How long the queue must stay drained before the plot is declared done.
pub const FINISH_GRACE: std::time::Duration = std::time::Duration::from_millis(2000);

// Servo pulse endpoints, in units of 1/12 MHz. 7500 is roughly 0.6ms,
// 25000 roughly 2.1ms.
const SERVO_MIN: f64 = 7500.0;
const SERVO_MAX: f64 = 25000.0;

// Used to derive the acceleration limit from a speed setting: full speed
// should be reached in a quarter second.
const ACCEL_TIME_S: f64 = 0.25;

// Servo travel time per pulse-width unit, measured on the stock SG90.
const PEN_MS_PER_UNIT: f64 = 0.06;

/// Map a percent height setting onto the servo's pulse-width range.
pub fn servo_value(pct: f64) -> u32 {
    let pct = pct.clamp(0.0, 100.0);
    (SERVO_MIN + pct / 100.0 * (SERVO_MAX - SERVO_MIN)).round() as u32
}

/// A queued unit of work. Moves come out of the planner; pen flips are
/// interleaved between paths; queries ask the board where it is.
#[derive(Clone, Debug)]
pub enum Intent {
    Move(MoveCommand),
    Pen { up: bool },
    Query,
}

impl Intent {
    pub fn dist(&self) -> f64 {
        match self {
            Intent::Move(m) => m.dist,
            Intent::Pen { .. } | Intent::Query => 0.0,
        }
    }
}

pub struct DeviceState {
    pub queue: VecDeque<Intent>,
    pub commands_sent: u64,
    pub commands_completed: u64,
    /// Commanded pose, updated as commands are sent (not as they finish).
    pub position: Pose,
    /// Step counters as last reported by the board.
    pub device_steps: AxisSteps,
    /// Step scaling used to interpret the board's counters.
    pub config: Config,
    pub paused: bool,
    pub plotting: bool,
    /// Whether the dispatch task drains the queue on its tick. Cleared
    /// when a plot finishes or the motors are disengaged; new work sets
    /// it again.
    pub consuming: bool,
    /// Whether the dispatch task polls the board for step counters.
    pub polling: bool,
    /// Armed once the queue drains; the plot is done when it expires.
    pub finish_deadline: Option<Instant>,
    /// Servo pulse widths for the two pen heights, in 1/12 MHz units.
    pub pen_up_value: u32,
    pub pen_down_value: u32,
    pub speed_pct: f64,
    pub travel_speed_pct: f64,
    pub const_speed: bool,
    pub dist_done: f64,
    pub dist_total: f64,
}

impl DeviceState {
    pub fn new(settings: &StoredSettings) -> Self {
        DeviceState {
            queue: VecDeque::new(),
            commands_sent: 0,
            commands_completed: 0,
            position: Pose::at_origin(),
            device_steps: AxisSteps::default(),
            config: Config::default(),
            paused: false,
            plotting: false,
            consuming: true,
            polling: true,
            finish_deadline: None,
            pen_up_value: settings.pen_up_value,
            pen_down_value: settings.pen_down_value,
            speed_pct: settings.speed_pct,
            travel_speed_pct: settings.travel_speed_pct,
            const_speed: settings.const_speed,
            dist_done: 0.0,
            dist_total: 0.0,
        }
    }

    pub fn pending(&self) -> u64 {
        self.commands_sent - self.commands_completed
    }

    /// When the in-flight window is mostly empty, send two commands per
    /// tick to refill it; otherwise trickle one at a time.
    pub fn batch_size(&self) -> u64 {
        if self.pending() < LOW_WATER {
            2
        } else {
            1
        }
    }

    /// Count one acknowledgement. Completions can never outrun sends; a
    /// surplus ack means we missed a send somewhere, so it only gets
    /// logged.
    pub fn record_ack(&mut self) {
        if self.commands_completed >= self.commands_sent {
            log::warn!("ack with nothing pending; ignoring");
            self.commands_completed = self.commands_sent;
        } else {
            self.commands_completed += 1;
        }
    }

    /// How long the servo needs to swing between the two configured
    /// heights, in milliseconds.
    pub fn pen_transition_ms(&self) -> u32 {
        let travel = (self.pen_up_value as f64 - self.pen_down_value as f64).abs();
        (travel * PEN_MS_PER_UNIT) as u32
    }

    /// The wire command for a queued intent.
    pub fn command_for(&self, intent: &Intent) -> Cmd {
        match intent {
            Intent::Move(m) => Cmd::StepperMove {
                duration_ms: m.duration_ms,
                axis1: m.axis1 as i32,
                axis2: m.axis2 as i32,
            },
            Intent::Pen { up } => Cmd::SetPen {
                up: *up,
                duration_ms: self.pen_transition_ms(),
            },
            Intent::Query => Cmd::QueryGeneral,
        }
    }

    /// Advance the commanded pose past an intent that was just written.
    pub fn apply_sent(&mut self, intent: &Intent) {
        match intent {
            Intent::Move(m) => {
                self.position = m.pose;
                self.dist_done += m.dist;
            }
            Intent::Pen { up } => {
                self.position.pen_up = *up;
            }
            Intent::Query => {}
        }
    }

    /// Planner settings scaled by the configured speed percentages.
    pub fn planner_settings(&self) -> PlannerSettings {
        let mut s = PlannerSettings::default();
        s.speed_pen_down *= self.speed_pct / 100.0;
        s.speed_pen_up *= self.travel_speed_pct / 100.0;
        s.accel_pen_down = s.speed_pen_down / ACCEL_TIME_S;
        s.accel_pen_up = s.speed_pen_up / ACCEL_TIME_S;
        s.const_speed = self.const_speed;
        s
    }

    /// Back to a clean slate, keeping the pen and speed configuration.
    pub fn reset(&mut self) {
        self.queue.clear();
        self.commands_sent = 0;
        self.commands_completed = 0;
        self.position = Pose::at_origin();
        self.device_steps = AxisSteps::default();
        self.paused = false;
        self.plotting = false;
        self.consuming = true;
        self.polling = true;
        self.finish_deadline = None;
        self.dist_done = 0.0;
        self.dist_total = 0.0;
    }

    pub fn stored_settings(&self) -> StoredSettings {
        StoredSettings {
            pen_up_value: self.pen_up_value,
            pen_down_value: self.pen_down_value,
            speed_pct: self.speed_pct,
            travel_speed_pct: self.travel_speed_pct,
            const_speed: self.const_speed,
        }
    }

    /// Where the board says it is, derived from its step counters.
    pub fn reported_position(&self) -> Point {
        self.config.steps_to_point(&self.device_steps)
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            position: self.position,
            device_steps: self.device_steps,
            reported_position: self.reported_position(),
            paused: self.paused,
            plotting: self.plotting,
            queued: self.queue.len(),
            sent: self.commands_sent,
            completed: self.commands_completed,
            pending: self.pending(),
            dist_done: self.dist_done,
            dist_total: self.dist_total,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct StateSnapshot {
    /// Commanded pose, tracked as commands are written.
    pub position: Pose,
    pub device_steps: AxisSteps,
    /// Position derived from the board's own step counters.
    pub reported_position: Point,
    pub paused: bool,
    pub plotting: bool,
    pub queued: usize,
    pub sent: u64,
    pub completed: u64,
    pub pending: u64,
    pub dist_done: f64,
    pub dist_total: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn servo_values_span_the_pulse_range() {
        assert_eq!(servo_value(0.0), 7500);
        assert_eq!(servo_value(100.0), 25000);
        assert_eq!(servo_value(150.0), 25000);
        assert!(servo_value(50.0) > 7500 && servo_value(50.0) < 25000);
    }

    #[test]
    fn acks_never_outrun_sends() {
        let mut state = DeviceState::new(&StoredSettings::default());
        state.commands_sent = 2;
        state.record_ack();
        state.record_ack();
        state.record_ack();
        assert_eq!(state.commands_completed, 2);
    }

    #[test]
    fn batch_size_shrinks_under_load() {
        let mut state = DeviceState::new(&StoredSettings::default());
        assert_eq!(state.batch_size(), 2);
        state.commands_sent = 30;
        assert_eq!(state.batch_size(), 1);
    }

    #[test]
    fn reset_keeps_configuration() {
        let mut state = DeviceState::new(&StoredSettings::default());
        state.pen_up_value = 19500;
        state.commands_sent = 10;
        state.plotting = true;
        state.consuming = false;
        state.polling = false;
        state.reset();
        assert_eq!(state.pen_up_value, 19500);
        assert_eq!(state.commands_sent, 0);
        assert!(!state.plotting);
        assert!(state.consuming && state.polling);
    }

    #[test]
    fn pen_transition_tracks_servo_travel() {
        let mut state = DeviceState::new(&StoredSettings::default());
        state.pen_up_value = 18000;
        state.pen_down_value = 12750;
        assert_eq!(state.pen_transition_ms(), 315);
        state.pen_down_value = 18000;
        assert_eq!(state.pen_transition_ms(), 0);
    }
}
