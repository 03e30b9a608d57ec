//! The `Plotter` handle: the application-facing API. Turns paths into
//! planned intents, hands them to the dispatch task, and exposes the
//! immediate control operations (pen, pause, motors, reset).

use std::sync::Arc;

use anyhow::anyhow;
use ebb_geom::Point;
use ebb_planner::{plan_trajectory, PlannerSettings, Pose};
use ebb_protocol::{Cmd, SERVO_PEN_DOWN, SERVO_PEN_UP, SERVO_RATE_DOWN, SERVO_RATE_UP};
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::dispatch::Op;
use crate::state::{servo_value, DeviceState, Intent, StateSnapshot};

// Servo speed for SC,10 / SC,11, in pulse-width units per 24ms.
const SERVO_RATE: u32 = 400;

#[derive(Clone)]
pub struct Plotter {
    ops: mpsc::Sender<Op>,
    state: Arc<Mutex<DeviceState>>,
}

impl Plotter {
    pub fn new(ops: mpsc::Sender<Op>, state: Arc<Mutex<DeviceState>>) -> Self {
        Plotter { ops, state }
    }

    async fn execute(&self, cmd: Cmd) -> anyhow::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.ops
            .send(Op::Execute(cmd, tx))
            .await
            .map_err(|_| anyhow!("dispatch task is gone"))?;
        rx.await.map_err(|_| anyhow!("dispatch task is gone"))?
    }

    /// Push the servo endpoints and rates to the board, energize the
    /// motors, and raise the pen to a known state.
    pub async fn configure(&self) -> anyhow::Result<()> {
        let (up, down) = {
            let state = self.state.lock().await;
            (state.pen_up_value, state.pen_down_value)
        };
        self.execute(Cmd::ServoConfig {
            param: SERVO_PEN_UP,
            value: up,
        })
        .await?;
        self.execute(Cmd::ServoConfig {
            param: SERVO_PEN_DOWN,
            value: down,
        })
        .await?;
        self.execute(Cmd::ServoConfig {
            param: SERVO_RATE_UP,
            value: SERVO_RATE,
        })
        .await?;
        self.execute(Cmd::ServoConfig {
            param: SERVO_RATE_DOWN,
            value: SERVO_RATE,
        })
        .await?;
        self.execute(Cmd::EnableMotors {
            motor1: true,
            motor2: true,
        })
        .await?;
        self.pen_up().await
    }

    pub async fn pen_up(&self) -> anyhow::Result<()> {
        self.set_pen(true).await
    }

    pub async fn pen_down(&self) -> anyhow::Result<()> {
        self.set_pen(false).await
    }

    async fn set_pen(&self, up: bool) -> anyhow::Result<()> {
        let duration_ms = self.state.lock().await.pen_transition_ms();
        self.execute(Cmd::SetPen { up, duration_ms }).await?;
        self.state.lock().await.position.pen_up = up;
        Ok(())
    }

    /// Travel (pen up) to a point, through the queue.
    pub async fn move_to(&self, x: f64, y: f64) -> anyhow::Result<()> {
        let (settings, mut pose) = {
            let state = self.state.lock().await;
            (state.planner_settings(), state.position)
        };
        let mut intents = Vec::new();
        if !pose.pen_up {
            intents.push(Intent::Pen { up: true });
            pose.pen_up = true;
        }
        if let Some(traj) = plan_trajectory(&settings, &[pose.point(), Point::new(x, y)], &pose) {
            intents.extend(traj.moves.into_iter().map(Intent::Move));
        }
        self.enqueue(intents).await
    }

    /// Plot a set of polylines: order them to cut down on travel, then
    /// interleave pen flips with planned trajectories. With `lift` off the
    /// pen stays down between paths, drawing through the travels.
    pub async fn plot_paths(&self, paths: Vec<Vec<Point>>, lift: bool) -> anyhow::Result<()> {
        let (settings, pose) = {
            let state = self.state.lock().await;
            (state.planner_settings(), state.position)
        };
        let intents = plan_plot(&settings, pose, paths, lift)?;
        self.enqueue(intents).await
    }

    async fn enqueue(&self, intents: Vec<Intent>) -> anyhow::Result<()> {
        if intents.is_empty() {
            return Ok(());
        }
        self.ops
            .send(Op::Enqueue(intents))
            .await
            .map_err(|_| anyhow!("dispatch task is gone"))
    }

    pub async fn pause(&self) -> anyhow::Result<()> {
        self.ops
            .send(Op::Pause)
            .await
            .map_err(|_| anyhow!("dispatch task is gone"))
    }

    pub async fn resume(&self) -> anyhow::Result<()> {
        self.ops
            .send(Op::Resume)
            .await
            .map_err(|_| anyhow!("dispatch task is gone"))
    }

    /// Abandon the current plot and lift the pen.
    pub async fn stop(&self) -> anyhow::Result<()> {
        self.ops
            .send(Op::Clear)
            .await
            .map_err(|_| anyhow!("dispatch task is gone"))?;
        self.pen_up().await
    }

    /// Lift the pen and de-energize the steppers so the carriage can be
    /// moved by hand. Also stops the dispatch loops; enqueueing new work
    /// starts them again.
    pub async fn disengage(&self) -> anyhow::Result<()> {
        self.pen_up().await?;
        self.execute(Cmd::EnableMotors {
            motor1: false,
            motor2: false,
        })
        .await?;
        let mut state = self.state.lock().await;
        state.consuming = false;
        state.polling = false;
        Ok(())
    }

    /// Reboot the board and wipe all local tracking. The board needs a
    /// [`Plotter::configure`] afterwards.
    pub async fn reset(&self) -> anyhow::Result<()> {
        self.ops
            .send(Op::Clear)
            .await
            .map_err(|_| anyhow!("dispatch task is gone"))?;
        self.execute(Cmd::Reset).await?;
        self.state.lock().await.reset();
        Ok(())
    }

    /// Reset the board, then declare the current physical position to be
    /// (0, 0). The reset zeroes the board's step counters so they stay in
    /// agreement with ours.
    pub async fn set_origin(&self) -> anyhow::Result<()> {
        self.execute(Cmd::Reset).await?;
        let mut state = self.state.lock().await;
        state.position = Pose {
            pen_up: state.position.pen_up,
            ..Pose::at_origin()
        };
        state.device_steps = Default::default();
        Ok(())
    }

    /// Ask the board for its step counters, then report the position they
    /// translate to. The answer reflects the board's last reply, which may
    /// trail the query by a poll cycle.
    pub async fn get_position(&self) -> anyhow::Result<Point> {
        self.enqueue(vec![Intent::Query]).await?;
        Ok(self.state.lock().await.reported_position())
    }

    pub async fn snapshot(&self) -> StateSnapshot {
        self.state.lock().await.snapshot()
    }

    /// Set the pen-up servo pulse width directly, in the board's 1/12 MHz
    /// units, and push it to the board.
    pub async fn set_pen_up_value(&self, value: u32) -> anyhow::Result<()> {
        self.state.lock().await.pen_up_value = value;
        self.execute(Cmd::ServoConfig {
            param: SERVO_PEN_UP,
            value,
        })
        .await
    }

    pub async fn set_pen_down_value(&self, value: u32) -> anyhow::Result<()> {
        self.state.lock().await.pen_down_value = value;
        self.execute(Cmd::ServoConfig {
            param: SERVO_PEN_DOWN,
            value,
        })
        .await
    }

    /// Percent versions of the pen height setters, for callers that think
    /// in fractions of the servo's range.
    pub async fn set_pen_up_pct(&self, pct: f64) -> anyhow::Result<()> {
        self.set_pen_up_value(servo_value(pct)).await
    }

    pub async fn set_pen_down_pct(&self, pct: f64) -> anyhow::Result<()> {
        self.set_pen_down_value(servo_value(pct)).await
    }

    /// Drawing speed as a percentage of the planner's full speed. Applies
    /// to trajectories planned after the change.
    pub async fn set_speed_pct(&self, pct: f64) {
        self.state.lock().await.speed_pct = pct.clamp(1.0, 100.0);
    }

    pub async fn set_travel_speed_pct(&self, pct: f64) {
        self.state.lock().await.travel_speed_pct = pct.clamp(1.0, 100.0);
    }

    /// Ask the dispatch task to exit.
    pub async fn shutdown(&self) {
        let _ = self.ops.send(Op::Shutdown).await;
    }
}

/// Build the full intent sequence for a drawing: order the paths, travel
/// between them (lifting the pen only when asked to), and park back at
/// the origin with the pen up.
fn plan_plot(
    settings: &PlannerSettings,
    mut pose: Pose,
    paths: Vec<Vec<Point>>,
    lift: bool,
) -> anyhow::Result<Vec<Intent>> {
    let paths: Vec<_> = paths.into_iter().filter(|p| p.len() >= 2).collect();
    if paths.is_empty() {
        return Err(anyhow!("nothing to plot"));
    }
    let ordered = order_paths(pose.point(), paths);

    let mut intents = Vec::new();
    for path in ordered {
        let travel = (path[0] - pose.point()).length() >= settings.min_step_dist();
        if travel {
            if lift && !pose.pen_up {
                intents.push(Intent::Pen { up: true });
                pose.pen_up = true;
            }
            if let Some(traj) = plan_trajectory(settings, &[pose.point(), path[0]], &pose) {
                intents.extend(traj.moves.into_iter().map(Intent::Move));
                pose = traj.end;
            }
        }
        if pose.pen_up {
            intents.push(Intent::Pen { up: false });
            pose.pen_up = false;
        }
        let mut verts = Vec::with_capacity(path.len() + 1);
        verts.push(pose.point());
        verts.extend(path);
        if let Some(traj) = plan_trajectory(settings, &verts, &pose) {
            intents.extend(traj.moves.into_iter().map(Intent::Move));
            pose = traj.end;
        }
    }
    if !pose.pen_up {
        intents.push(Intent::Pen { up: true });
        pose.pen_up = true;
    }
    // Park back at the origin once the drawing is done.
    if let Some(traj) = plan_trajectory(settings, &[pose.point(), Point::new(0.0, 0.0)], &pose) {
        intents.extend(traj.moves.into_iter().map(Intent::Move));
    }
    Ok(intents)
}

/// Greedy nearest-neighbor ordering, trying both endpoints of every
/// remaining path and reversing when the far end is closer.
fn order_paths(start: Point, mut paths: Vec<Vec<Point>>) -> Vec<Vec<Point>> {
    let mut ordered = Vec::with_capacity(paths.len());
    let mut pos = start;
    while !paths.is_empty() {
        let mut best = 0;
        let mut best_dist = f64::INFINITY;
        let mut reverse = false;
        for (i, path) in paths.iter().enumerate() {
            let head = (path[0] - pos).length();
            let tail = (path[path.len() - 1] - pos).length();
            if head < best_dist {
                best = i;
                best_dist = head;
                reverse = false;
            }
            if tail < best_dist {
                best = i;
                best_dist = tail;
                reverse = true;
            }
        }
        let mut path = paths.swap_remove(best);
        if reverse {
            path.reverse();
        }
        pos = path[path.len() - 1];
        ordered.push(path);
    }
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Feeder;
    use crate::settings::StoredSettings;
    use crate::transport::MockTransport;

    fn pt(x: f64, y: f64) -> Point {
        Point::new(x, y)
    }

    async fn harness() -> (
        Plotter,
        Arc<Mutex<DeviceState>>,
        Arc<std::sync::Mutex<Vec<String>>>,
    ) {
        let state = Arc::new(Mutex::new(DeviceState::new(&StoredSettings::default())));
        let (tx, rx) = mpsc::channel(64);
        let transport = MockTransport::auto_acking(tx);
        let sent = transport.sent_log();
        let (ops_tx, ops_rx) = mpsc::channel(16);
        tokio::spawn(Feeder::new(transport, state.clone()).run(rx, ops_rx));
        (Plotter::new(ops_tx, state.clone()), state, sent)
    }

    fn pen_flips(intents: &[Intent]) -> Vec<bool> {
        intents
            .iter()
            .filter_map(|i| match i {
                Intent::Pen { up } => Some(*up),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn lifting_between_paths_flips_the_pen() {
        let settings = PlannerSettings::default();
        let paths = vec![
            vec![pt(10.0, 0.0), pt(20.0, 0.0)],
            vec![pt(40.0, 0.0), pt(50.0, 0.0)],
        ];
        let intents = plan_plot(&settings, Pose::at_origin(), paths, true).unwrap();
        // Down for each path, up for the travel between them and the park.
        assert_eq!(pen_flips(&intents), vec![false, true, false, true]);
    }

    #[test]
    fn withholding_the_lift_draws_through_travels() {
        let settings = PlannerSettings::default();
        let paths = vec![
            vec![pt(10.0, 0.0), pt(20.0, 0.0)],
            vec![pt(40.0, 0.0), pt(50.0, 0.0)],
        ];
        let intents = plan_plot(&settings, Pose::at_origin(), paths, false).unwrap();
        // One drop at the start, one lift before parking, nothing between.
        assert_eq!(pen_flips(&intents), vec![false, true]);
    }

    #[tokio::test]
    async fn disengage_stops_the_dispatch_loops() {
        let (plotter, state, sent) = harness().await;
        plotter.disengage().await.unwrap();
        {
            let state = state.lock().await;
            assert!(!state.consuming && !state.polling);
        }
        let sent = sent.lock().unwrap();
        assert!(sent.iter().any(|l| l == "EM,0,0\r"));
    }

    #[tokio::test]
    async fn set_origin_reboots_the_board() {
        let (plotter, state, sent) = harness().await;
        {
            let mut state = state.lock().await;
            state.position.x = 12.0;
            state.device_steps.a = 100;
        }
        plotter.set_origin().await.unwrap();
        {
            let state = state.lock().await;
            assert_eq!(state.position.x, 0.0);
            assert_eq!(state.device_steps.a, 0);
        }
        let sent = sent.lock().unwrap();
        assert!(sent.iter().any(|l| l == "R\r"));
    }

    #[tokio::test]
    async fn pen_heights_are_set_in_servo_units() {
        let (plotter, state, sent) = harness().await;
        plotter.set_pen_up_value(16000).await.unwrap();
        plotter.set_pen_down_value(9000).await.unwrap();
        {
            let state = state.lock().await;
            assert_eq!(state.pen_up_value, 16000);
            assert_eq!(state.pen_down_value, 9000);
        }
        let sent = sent.lock().unwrap();
        assert!(sent.iter().any(|l| l == "SC,4,16000\r"));
        assert!(sent.iter().any(|l| l == "SC,5,9000\r"));
    }

    #[tokio::test]
    async fn position_query_reports_board_steps() {
        let state = Arc::new(Mutex::new(DeviceState::new(&StoredSettings::default())));
        // No auto-ack here: a status reply would overwrite the counters.
        let (_tx, rx) = mpsc::channel(64);
        let (ops_tx, ops_rx) = mpsc::channel(16);
        tokio::spawn(Feeder::new(MockTransport::new(), state.clone()).run(rx, ops_rx));
        let plotter = Plotter::new(ops_tx, state.clone());
        {
            let mut state = state.lock().await;
            state.device_steps.a = 160;
            state.device_steps.b = 0;
        }
        let pos = plotter.get_position().await.unwrap();
        assert!((pos.x - 1.0).abs() < 1e-9);
        assert!((pos.y - 1.0).abs() < 1e-9);
    }

    #[test]
    fn ordering_picks_the_nearest_path_first() {
        let paths = vec![
            vec![pt(100.0, 0.0), pt(110.0, 0.0)],
            vec![pt(1.0, 0.0), pt(10.0, 0.0)],
        ];
        let ordered = order_paths(pt(0.0, 0.0), paths);
        assert_eq!(ordered[0][0], pt(1.0, 0.0));
        assert_eq!(ordered[1][0], pt(100.0, 0.0));
    }

    #[test]
    fn ordering_reverses_when_the_tail_is_closer() {
        let paths = vec![vec![pt(50.0, 0.0), pt(2.0, 0.0)]];
        let ordered = order_paths(pt(0.0, 0.0), paths);
        assert_eq!(ordered[0][0], pt(2.0, 0.0));
        assert_eq!(ordered[0][1], pt(50.0, 0.0));
    }

    #[test]
    fn ordering_chains_from_each_path_end() {
        let paths = vec![
            vec![pt(0.0, 10.0), pt(0.0, 20.0)],
            vec![pt(0.0, 22.0), pt(0.0, 30.0)],
            vec![pt(0.0, 2.0), pt(0.0, 8.0)],
        ];
        let ordered = order_paths(pt(0.0, 0.0), paths);
        assert_eq!(ordered[0][0], pt(0.0, 2.0));
        assert_eq!(ordered[1][0], pt(0.0, 10.0));
        assert_eq!(ordered[2][0], pt(0.0, 22.0));
    }
}
