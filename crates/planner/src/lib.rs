//! Trajectory planning for polyline plots.
//!
//! A polyline comes in as world-space vertices; what goes out is a list of
//! timed whole-step moves for the two CoreXY motors. Planning happens in
//! three stages: junction speed limiting (how fast may we pass through each
//! vertex, given the turn angle and the acceleration limit), per-segment
//! velocity profile synthesis (trapezoid, triangle, or a degenerate
//! fallback), and discretization of the continuous profile into whole-step
//! `SM` moves.
//!
//! Everything here is pure computation; the planner carries no state beyond
//! the [`Pose`] threaded between calls.

use ebb_geom::{Point, Vector};
use serde::{Deserialize, Serialize};

mod segment;

pub use segment::{compute_segment, SegmentPlan};

/// Motion resolution mode; low resolution doubles the minimum resolvable
/// segment length.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resolution {
    High,
    Low,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlannerSettings {
    /// Speed limit while drawing, mm/s.
    pub speed_pen_down: f64,
    /// Speed limit for travel moves, mm/s.
    pub speed_pen_up: f64,
    /// Acceleration while drawing, mm/s².
    pub accel_pen_down: f64,
    /// Acceleration for travel moves, mm/s².
    pub accel_pen_up: f64,
    /// Unitless cornering factor: how much speed survives a sharp turn.
    pub cornering: f64,
    /// Granule for slicing velocity profiles into discrete moves.
    pub time_slice_ms: f64,
    /// Per-axis step rate cap, steps/ms.
    pub max_step_rate: f64,
    /// Steps per millimeter on the native motor axes.
    pub steps_per_mm: f64,
    pub resolution: Resolution,
    /// Minimum resolvable segment length in high-resolution mode, mm.
    pub min_step_dist_hr: f64,
    /// Minimum resolvable segment length in low-resolution mode, mm.
    pub min_step_dist_lr: f64,
    /// Skip velocity profiling for pen-down segments and move at constant
    /// speed instead.
    pub const_speed: bool,
    /// Step rates below this (steps/ms) are treated as noise and zeroed.
    /// Empirically tuned; see the discretization step.
    pub min_step_rate: f64,
    /// How much to lengthen an overspeed sub-move per attempt, ms.
    pub overspeed_pad_ms: u32,
}

impl Default for PlannerSettings {
    fn default() -> Self {
        Self {
            speed_pen_down: 55.0,
            speed_pen_up: 110.0,
            accel_pen_down: 220.0,
            accel_pen_up: 440.0,
            cornering: 10.0,
            time_slice_ms: 25.0,
            max_step_rate: 25.0,
            steps_per_mm: ebb_geom::STEPS_PER_INCH / ebb_geom::MM_PER_INCH,
            resolution: Resolution::High,
            min_step_dist_hr: 0.0125,
            min_step_dist_lr: 0.025,
            const_speed: false,
            min_step_rate: 0.001,
            overspeed_pad_ms: 1,
        }
    }
}

impl PlannerSettings {
    pub fn speed_limit(&self, pen_up: bool) -> f64 {
        if pen_up {
            self.speed_pen_up
        } else {
            self.speed_pen_down
        }
    }

    pub fn accel(&self, pen_up: bool) -> f64 {
        if pen_up {
            self.accel_pen_up
        } else {
            self.accel_pen_down
        }
    }

    pub fn min_step_dist(&self) -> f64 {
        match self.resolution {
            Resolution::High => self.min_step_dist_hr,
            Resolution::Low => self.min_step_dist_lr,
        }
    }
}

/// The planner's notion of where the machine is and whether the pen is up.
/// Thread this between planning calls so multi-path plots chain correctly.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub x: f64,
    pub y: f64,
    pub pen_up: bool,
}

impl Pose {
    pub fn at_origin() -> Self {
        Pose {
            x: 0.0,
            y: 0.0,
            pen_up: true,
        }
    }

    pub fn point(&self) -> Point {
        Point::new(self.x, self.y)
    }
}

/// One timed stepper move, ready to encode as `SM,duration,axis1,axis2`.
///
/// `axis1` carries the native A steps; the device wiring flips the second
/// axis, so `axis2` is the negated native B steps.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MoveCommand {
    pub axis1: i64,
    pub axis2: i64,
    pub duration_ms: u32,
    /// Commanded pose after this move.
    pub pose: Pose,
    /// World distance covered by this move, mm.
    pub dist: f64,
}

#[derive(Clone, Debug)]
pub struct Trajectory {
    pub moves: Vec<MoveCommand>,
    pub end: Pose,
    /// Total world distance covered, mm. Diagnostic only.
    pub dist: f64,
}

/// Plan a full polyline. Returns `None` when the path collapses to nothing
/// after dropping unresolvably short segments.
pub fn plan_trajectory(
    settings: &PlannerSettings,
    vertices: &[Point],
    start: &Pose,
) -> Option<Trajectory> {
    debug_assert!(settings.speed_pen_down > 0.0 && settings.speed_pen_up > 0.0);
    debug_assert!(settings.accel_pen_down > 0.0 && settings.accel_pen_up > 0.0);
    debug_assert!(settings.steps_per_mm > 0.0);
    debug_assert!(settings.time_slice_ms > 0.0);
    // The overspeed loop in discretization only terminates if padding
    // makes progress against a positive rate cap.
    debug_assert!(settings.max_step_rate > 0.0);
    debug_assert!(settings.overspeed_pad_ms >= 1);

    if vertices.len() < 2 {
        return None;
    }

    // Drop segments shorter than the resolvable minimum, keeping the
    // surviving lengths and unit direction vectors.
    let min_dist = settings.min_step_dist();
    let mut kept: Vec<Point> = Vec::new();
    let mut lens: Vec<f64> = Vec::new();
    let mut units: Vec<Vector> = Vec::new();
    let mut last = vertices[0];
    for v in &vertices[1..] {
        let delta = *v - last;
        let d = delta.length();
        if d >= min_dist {
            kept.push(*v);
            lens.push(d);
            units.push(delta / d);
            last = *v;
        }
    }
    if kept.is_empty() {
        return None;
    }

    if kept.len() == 1 {
        let seg = compute_segment(settings, kept[0], 0.0, 0.0, start)?;
        return Some(Trajectory {
            moves: seg.moves,
            end: seg.end,
            dist: seg.dist,
        });
    }

    let vels = JunctionVelocities::plan(settings, start.pen_up, &lens, &units);

    let mut pose = *start;
    let mut moves = Vec::new();
    let mut dist = 0.0;
    for (i, target) in kept.iter().enumerate() {
        if let Some(seg) = compute_segment(settings, *target, vels[i], vels[i + 1], &pose) {
            pose = seg.end;
            dist += seg.dist;
            moves.extend(seg.moves);
        }
    }
    Some(Trajectory {
        moves,
        end: pose,
        dist,
    })
}

/// Maximum speed through the corner between an incoming and outgoing unit
/// direction. A straight continuation is effectively unlimited; a full
/// reversal forces a stop.
pub fn junction_limit(accel: f64, cornering: f64, v_in: Vector, v_out: Vector) -> f64 {
    let delta = cornering / 5000.0;
    let cosine = -v_in.dot(v_out);
    let root = ((1.0 - cosine) / 2.0).sqrt();
    let denom = 1.0 - root;
    let rfactor = if denom > 1e-4 {
        delta * root / denom
    } else {
        // Straight line: no junction constraint.
        100_000.0
    };
    (accel * rfactor).sqrt()
}

/// Final speed after accelerating at `a` over distance `d` starting from `vi`.
fn v_final(vi: f64, a: f64, d: f64) -> f64 {
    (vi * vi + 2.0 * a * d).max(0.0).sqrt()
}

/// Per-vertex speed limits for a filtered polyline: `vels[i]` is the speed
/// at which segment `i` is entered, with `vels[lens.len()]` the final exit
/// speed. Endpoints are pinned to zero.
struct JunctionVelocities<'a> {
    speed_limit: f64,
    accel: f64,
    cornering: f64,
    lens: &'a [f64],
    units: &'a [Vector],
    vels: Vec<f64>,
}

impl<'a> JunctionVelocities<'a> {
    fn plan(
        settings: &PlannerSettings,
        pen_up: bool,
        lens: &'a [f64],
        units: &'a [Vector],
    ) -> Vec<f64> {
        let mut ret = Self {
            speed_limit: settings.speed_limit(pen_up),
            accel: settings.accel(pen_up),
            cornering: settings.cornering,
            lens,
            units,
            vels: Vec::with_capacity(lens.len() + 1),
        };
        ret.forward_pass();
        ret.backward_pass();
        ret.vels
    }

    /// Walk the junctions front to back, limiting each vertex speed by what
    /// acceleration can reach from the previous vertex and by the corner
    /// sharpness.
    fn forward_pass(&mut self) {
        self.vels.push(0.0);
        for i in 1..self.lens.len() {
            let d = self.lens[i - 1];
            let v_prev = self.vels[i - 1];

            let t_max = self.speed_limit / self.accel;
            let accel_dist = 0.5 * self.accel * t_max * t_max;
            let mut v_max = if d > accel_dist {
                self.speed_limit
            } else {
                v_final(v_prev, self.accel, d).min(self.speed_limit)
            };

            v_max = v_max.min(junction_limit(
                self.accel,
                self.cornering,
                self.units[i - 1],
                self.units[i],
            ));
            self.vels.push(v_max);
        }
        self.vels.push(0.0);
    }

    /// Walk back from the final (zero-speed) vertex, clamping any entry
    /// speed we couldn't decelerate from within the segment.
    fn backward_pass(&mut self) {
        for i in (1..self.vels.len()).rev() {
            let v_exit = self.vels[i];
            let v_entry = self.vels[i - 1];
            let d = self.lens[i - 1];
            if v_entry > v_exit && d > 0.0 {
                self.vels[i - 1] = v_entry.min(v_final(v_exit, self.accel, d));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ebb_geom::inverse;
    use proptest::prelude::*;

    fn pt(x: f64, y: f64) -> Point {
        Point::new(x, y)
    }

    fn start_down() -> Pose {
        Pose {
            x: 0.0,
            y: 0.0,
            pen_up: false,
        }
    }

    #[test]
    #[should_panic]
    fn zero_step_rate_cap_is_rejected() {
        let mut s = PlannerSettings::default();
        s.max_step_rate = 0.0;
        let _ = plan_trajectory(&s, &[pt(0.0, 0.0), pt(10.0, 0.0)], &start_down());
    }

    #[test]
    #[should_panic]
    fn zero_overspeed_pad_is_rejected() {
        let mut s = PlannerSettings::default();
        s.overspeed_pad_ms = 0;
        let _ = plan_trajectory(&s, &[pt(0.0, 0.0), pt(10.0, 0.0)], &start_down());
    }

    #[test]
    fn straight_continuation_is_unlimited() {
        let u = Vector::new(1.0, 0.0);
        let v = junction_limit(220.0, 10.0, u, u);
        // Far above any configured speed limit, so the min() never bites.
        assert!(v > 1000.0);
    }

    #[test]
    fn reversal_forces_a_stop() {
        let u = Vector::new(1.0, 0.0);
        let v = junction_limit(220.0, 10.0, u, -u);
        assert!(v.abs() < 1e-9);
    }

    #[test]
    fn right_angle_is_between() {
        let v = junction_limit(
            220.0,
            10.0,
            Vector::new(1.0, 0.0),
            Vector::new(0.0, 1.0),
        );
        assert!(v > 0.0);
        assert!(v < 55.0);
    }

    #[test]
    fn single_vertex_is_a_noop() {
        let s = PlannerSettings::default();
        assert!(plan_trajectory(&s, &[pt(1.0, 1.0)], &start_down()).is_none());
    }

    #[test]
    fn coincident_vertices_are_a_noop() {
        let s = PlannerSettings::default();
        assert!(plan_trajectory(&s, &[pt(1.0, 1.0), pt(1.0, 1.0)], &start_down()).is_none());
    }

    #[test]
    fn empty_path_is_a_noop() {
        let s = PlannerSettings::default();
        assert!(plan_trajectory(&s, &[], &start_down()).is_none());
    }

    // Plot a 10mm horizontal line at 50% speed; the accumulated steps must
    // land on (10, 0) to within one step.
    #[test]
    fn ten_mm_line_lands_on_target() {
        let mut s = PlannerSettings::default();
        s.speed_pen_down *= 0.5;
        s.accel_pen_down *= 0.5;

        let traj =
            plan_trajectory(&s, &[pt(0.0, 0.0), pt(10.0, 0.0)], &start_down()).expect("a plan");
        assert!(!traj.moves.is_empty());

        let a: i64 = traj.moves.iter().map(|m| m.axis1).sum();
        let b: i64 = traj.moves.iter().map(|m| -m.axis2).sum();
        let (dx, dy) = inverse(a as f64, b as f64);
        let step = 1.0 / s.steps_per_mm;
        assert!((dx / s.steps_per_mm - 10.0).abs() <= step);
        assert!((dy / s.steps_per_mm).abs() <= step);

        assert!((traj.end.x - 10.0).abs() <= step);
        assert!(traj.end.y.abs() <= step);
        assert!(!traj.end.pen_up);
    }

    // Boundary continuity: starting and ending at rest, the first and last
    // sub-moves can't be faster than one slice of acceleration allows.
    #[test]
    fn profile_starts_and_ends_slow() {
        let s = PlannerSettings::default();
        let traj =
            plan_trajectory(&s, &[pt(0.0, 0.0), pt(100.0, 0.0)], &start_down()).expect("a plan");
        assert!(traj.moves.len() > 4);

        let speed_of = |m: &MoveCommand| m.dist / (m.duration_ms as f64 / 1000.0);
        let first = &traj.moves[0];
        let last = traj.moves.last().unwrap();
        let tol = 1.5;
        assert!(speed_of(first) <= s.accel_pen_down * (first.duration_ms as f64 / 1000.0) * tol);
        assert!(speed_of(last) <= s.accel_pen_down * (last.duration_ms as f64 / 1000.0) * tol);
    }

    // A long segment should reach the configured cruise speed.
    #[test]
    fn long_segment_cruises_at_the_limit() {
        let s = PlannerSettings::default();
        let traj =
            plan_trajectory(&s, &[pt(0.0, 0.0), pt(500.0, 0.0)], &start_down()).expect("a plan");
        let peak = traj
            .moves
            .iter()
            .map(|m| m.dist / (m.duration_ms as f64 / 1000.0))
            .fold(0.0f64, f64::max);
        assert!(peak > s.speed_pen_down * 0.9);
        assert!(peak <= s.speed_pen_down * 1.1);
    }

    // A sharp corner slows the middle vertex down; the sub-move straddling
    // it must be slower than the cruise portions around it.
    #[test]
    fn sharp_corner_slows_down() {
        let s = PlannerSettings::default();
        let traj = plan_trajectory(
            &s,
            &[pt(0.0, 0.0), pt(100.0, 0.0), pt(0.0, 10.0)],
            &start_down(),
        )
        .expect("a plan");
        let speeds: Vec<f64> = traj
            .moves
            .iter()
            .map(|m| m.dist / (m.duration_ms as f64 / 1000.0))
            .collect();
        let peak = speeds.iter().cloned().fold(0.0f64, f64::max);
        // Find the move closest to the corner and check it's well below peak.
        let corner_idx = traj
            .moves
            .iter()
            .enumerate()
            .min_by(|(_, m), (_, n)| {
                let dm = (m.pose.x - 100.0).abs() + m.pose.y.abs();
                let dn = (n.pose.x - 100.0).abs() + n.pose.y.abs();
                dm.total_cmp(&dn)
            })
            .map(|(i, _)| i)
            .unwrap();
        assert!(speeds[corner_idx] < peak * 0.5);
    }

    #[test]
    fn const_speed_emits_a_single_move_per_segment() {
        let mut s = PlannerSettings::default();
        s.const_speed = true;
        let traj =
            plan_trajectory(&s, &[pt(0.0, 0.0), pt(50.0, 0.0)], &start_down()).expect("a plan");
        assert_eq!(traj.moves.len(), 1);
    }

    proptest! {
        // Every emitted move has at least one nonzero axis, a duration of
        // at least 1ms, and a step rate below the configured cap.
        #[test]
        fn emitted_moves_are_well_formed(
            xs in proptest::collection::vec((-200.0..200.0f64, -200.0..200.0f64), 2..8),
            pen_up in proptest::bool::ANY,
        ) {
            let s = PlannerSettings::default();
            let verts: Vec<Point> = xs.iter().map(|&(x, y)| pt(x, y)).collect();
            let start = Pose { x: verts[0].x, y: verts[0].y, pen_up };
            if let Some(traj) = plan_trajectory(&s, &verts, &start) {
                for m in &traj.moves {
                    assert!(m.axis1 != 0 || m.axis2 != 0);
                    assert!(m.duration_ms >= 1);
                    let dt = m.duration_ms as f64;
                    assert!((m.axis1.abs() as f64) / dt < s.max_step_rate);
                    assert!((m.axis2.abs() as f64) / dt < s.max_step_rate);
                }
            }
        }

        // The planned end pose always matches the accumulated step deltas.
        #[test]
        fn end_pose_matches_accumulated_steps(
            xs in proptest::collection::vec((-100.0..100.0f64, -100.0..100.0f64), 2..6),
        ) {
            let s = PlannerSettings::default();
            let verts: Vec<Point> = xs.iter().map(|&(x, y)| pt(x, y)).collect();
            let start = Pose { x: verts[0].x, y: verts[0].y, pen_up: false };
            if let Some(traj) = plan_trajectory(&s, &verts, &start) {
                let a: i64 = traj.moves.iter().map(|m| m.axis1).sum();
                let b: i64 = traj.moves.iter().map(|m| -m.axis2).sum();
                let (dx, dy) = inverse(a as f64 / s.steps_per_mm, b as f64 / s.steps_per_mm);
                // Within a step per planned segment: each segment rounds
                // independently, and sub-step noise suppression can shed a
                // step here and there.
                let tol = (xs.len() as f64) / s.steps_per_mm;
                assert!((start.x + dx - traj.end.x).abs() <= tol);
                assert!((start.y + dy - traj.end.y).abs() <= tol);
            }
        }
    }
}
