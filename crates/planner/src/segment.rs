//! Single-segment profile synthesis and step discretization.

use ebb_geom::{forward, inverse, Point};

use crate::{MoveCommand, PlannerSettings, Pose};

#[derive(Clone, Debug)]
pub struct SegmentPlan {
    pub moves: Vec<MoveCommand>,
    pub end: Pose,
    /// World distance covered by the emitted moves, mm.
    pub dist: f64,
}

/// A velocity profile sampled at time-slice boundaries: cumulative elapsed
/// milliseconds and cumulative distance along the segment.
#[derive(Debug, Default)]
struct Profile {
    t_ms: Vec<u64>,
    dist: Vec<f64>,
    /// Final accumulated distance, used to normalize the samples.
    total: f64,
}

impl Profile {
    fn push(&mut self, elapsed_s: f64, position: f64) {
        self.t_ms.push((elapsed_s * 1000.0).round() as u64);
        self.dist.push(position);
    }
}

/// Plan one straight segment from `start` to `target` with boundary speeds
/// `vi` and `vf`. Returns `None` when the segment rounds to zero motor
/// steps.
pub fn compute_segment(
    settings: &PlannerSettings,
    target: Point,
    vi: f64,
    vf: f64,
    start: &Pose,
) -> Option<SegmentPlan> {
    let pen_up = start.pen_up;
    let dx = target.x - start.x;
    let dy = target.y - start.y;
    if dx.hypot(dy) <= 0.0 {
        return None;
    }

    let speed_limit = settings.speed_limit(pen_up);
    let vi = vi.clamp(0.0, speed_limit);
    let vf = vf.clamp(0.0, speed_limit);

    // Quantize the move to whole motor steps up front and synthesize the
    // profile over the step-rounded length: position is ultimately step
    // discrete, and profiling the unrounded length would accumulate drift.
    let (a_mm, b_mm) = forward(dx, dy);
    let steps_a = (settings.steps_per_mm * a_mm).round();
    let steps_b = (settings.steps_per_mm * b_mm).round();
    if steps_a.abs() < 1.0 && steps_b.abs() < 1.0 {
        return None;
    }
    let (dx_r, dy_r) = inverse(
        steps_a / settings.steps_per_mm,
        steps_b / settings.steps_per_mm,
    );
    let seg_len = dx_r.hypot(dy_r);

    let profile = synthesize(settings, pen_up, seg_len, vi, vf);
    let moves = discretize(settings, &profile, steps_a, steps_b, start);

    let dist = moves.iter().map(|m| m.dist).sum();
    let end = Pose {
        x: start.x + dx_r,
        y: start.y + dy_r,
        pen_up,
    };
    Some(SegmentPlan { moves, end, dist })
}

/// Build the velocity-vs-time profile for a segment of (rounded) length
/// `seg_len`: a trapezoid when acceleration, cruise, and deceleration all
/// fit; otherwise a triangle; otherwise a short linear or constant-speed
/// fallback.
fn synthesize(
    settings: &PlannerSettings,
    pen_up: bool,
    seg_len: f64,
    vi: f64,
    vf: f64,
) -> Profile {
    let speed_limit = settings.speed_limit(pen_up);
    let accel = settings.accel(pen_up);
    let slice = settings.time_slice_ms / 1000.0;

    let mut p = Profile::default();
    let mut elapsed = 0.0;
    let mut position = 0.0;
    let mut velocity = vi;

    if settings.const_speed && !pen_up {
        // Constant-velocity mode: one move for the whole segment.
        let v = vi.max(vf).max(settings.speed_pen_down / 10.0);
        p.push(seg_len / v, seg_len);
        p.total = seg_len;
        return p;
    }

    let t_accel_max = (speed_limit - vi) / accel;
    let t_decel_max = (speed_limit - vf) / accel;
    let accel_dist_max = vi * t_accel_max + 0.5 * accel * t_accel_max * t_accel_max;
    let decel_dist_max = vf * t_decel_max + 0.5 * accel * t_decel_max * t_decel_max;
    let cruise_time_estimate = seg_len / speed_limit;

    let fits_trapezoid = seg_len > accel_dist_max + decel_dist_max + slice * speed_limit
        && cruise_time_estimate > 4.0 * slice;

    if fits_trapezoid {
        // Ramp up to the speed limit.
        let up = (t_accel_max / slice).floor() as usize;
        if up > 0 {
            let per = t_accel_max / up as f64;
            let vel_step = (speed_limit - vi) / (up as f64 + 1.0);
            for _ in 0..up {
                velocity += vel_step;
                elapsed += per;
                position += velocity * per;
                p.push(elapsed, position);
            }
        }

        // Cruise, sampled coarsely: the device buffers whole moves, so
        // there's no point slicing a constant-velocity stretch finely.
        let coast_dist = seg_len - (accel_dist_max + decel_dist_max);
        if coast_dist > slice * speed_limit {
            velocity = speed_limit;
            let cruise_slice = 20.0 * slice;
            let mut remaining = coast_dist / velocity;
            while remaining > cruise_slice {
                remaining -= cruise_slice;
                elapsed += cruise_slice;
                position += velocity * cruise_slice;
                p.push(elapsed, position);
            }
            elapsed += remaining;
            position += velocity * remaining;
            p.push(elapsed, position);
        }

        // Ramp down to the exit speed.
        let down = (t_decel_max / slice).floor() as usize;
        if down > 0 {
            let per = t_decel_max / down as f64;
            let vel_step = (speed_limit - vf) / (down as f64 + 1.0);
            for _ in 0..down {
                velocity -= vel_step;
                elapsed += per;
                position += velocity * per;
                p.push(elapsed, position);
            }
        }
    } else {
        // Too short for a full trapezoid. Try a triangle: accelerate to a
        // peak, then decelerate, with the peak chosen so both boundary
        // speeds are met. When even that doesn't fit, back the
        // acceleration off to 90% of what the segment geometry allows.
        let accel_local = if seg_len >= 0.9 * (accel_dist_max + decel_dist_max) {
            let denom = if seg_len > 0.0 { seg_len } else { 1.0 };
            0.9 * ((accel_dist_max + decel_dist_max) / denom) * accel
        } else {
            accel
        };

        let mut t_up = if accel_local > 0.0 {
            ((2.0 * vi * vi + 2.0 * vf * vf + 4.0 * accel_local * seg_len).sqrt() - 2.0 * vi)
                / (2.0 * accel_local)
        } else {
            0.0
        };
        let v_peak = vi + accel_local * t_up;
        let up = (t_up / slice).floor() as usize;
        if up == 0 {
            t_up = 0.0;
        }
        let t_down = if accel_local > 0.0 {
            t_up - (vf - vi) / accel_local
        } else {
            0.0
        };
        let down = (t_down / slice).floor() as usize;

        if up + down > 4 {
            if up > 0 {
                let per = t_up / up as f64;
                let vel_step = (v_peak - vi) / (up as f64 + 1.0);
                for _ in 0..up {
                    velocity += vel_step;
                    elapsed += per;
                    position += velocity * per;
                    p.push(elapsed, position);
                }
            }
            if down > 0 {
                let per = t_down / down as f64;
                let vel_step = (v_peak - vf) / (down as f64 + 1.0);
                for _ in 0..down {
                    velocity -= vel_step;
                    elapsed += per;
                    position += velocity * per;
                    p.push(elapsed, position);
                }
            }
        } else {
            // Fewer than five slices: not enough room for meaningful
            // profiling. Interpolate linearly between the boundary speeds,
            // or fall back to one constant-velocity move.
            let local_accel = (vf * vf - vi * vi) / (2.0 * seg_len);
            if local_accel.abs() < 1e-6 {
                let v = if vi > 0.0 { vi } else { speed_limit / 10.0 };
                p.push(seg_len / v, seg_len);
                position = seg_len;
            } else {
                let t_seg = (vf - vi) / local_accel.clamp(-accel, accel);
                let n = (t_seg / slice).floor() as usize;
                if n > 1 {
                    let per = t_seg / n as f64;
                    let vel_step = (vf - vi) / (n as f64 + 1.0);
                    for _ in 0..n {
                        velocity += vel_step;
                        elapsed += per;
                        position += velocity * per;
                        p.push(elapsed, position);
                    }
                } else {
                    let v = vi.max(vf).max(speed_limit / 10.0);
                    p.push(seg_len / v, seg_len);
                    position = seg_len;
                }
            }
        }
    }

    p.total = position;
    p
}

/// Turn cumulative profile samples into incremental whole-step moves.
fn discretize(
    settings: &PlannerSettings,
    profile: &Profile,
    steps_a: f64,
    steps_b: f64,
    start: &Pose,
) -> Vec<MoveCommand> {
    let mut moves = Vec::with_capacity(profile.t_ms.len());
    let mut prev_a: i64 = 0;
    let mut prev_b: i64 = 0;
    let mut prev_t: u64 = 0;
    let mut x = start.x;
    let mut y = start.y;

    for (&t, &d) in profile.t_ms.iter().zip(&profile.dist) {
        let frac = if profile.total > 0.0 {
            d / profile.total
        } else {
            1.0
        };
        let dest_a = (frac * steps_a).round() as i64;
        let dest_b = (frac * steps_b).round() as i64;

        let mut sa = dest_a - prev_a;
        let mut sb = dest_b - prev_b;
        let mut dt = t.saturating_sub(prev_t).max(1) as u32;
        prev_t = t;

        // An axis crawling below the noise floor contributes nothing this
        // slice; save its steps for a later one.
        if (sa.abs() as f64) / (dt as f64) < settings.min_step_rate {
            sa = 0;
        }
        if (sb.abs() as f64) / (dt as f64) < settings.min_step_rate {
            sb = 0;
        }

        // A sub-move over the rate cap gets stretched, not rejected.
        while (sa.abs() as f64) / (dt as f64) >= settings.max_step_rate
            || (sb.abs() as f64) / (dt as f64) >= settings.max_step_rate
        {
            dt += settings.overspeed_pad_ms;
        }

        prev_a += sa;
        prev_b += sb;
        if sa != 0 || sb != 0 {
            let (mdx, mdy) = inverse(
                sa as f64 / settings.steps_per_mm,
                sb as f64 / settings.steps_per_mm,
            );
            x += mdx;
            y += mdy;
            moves.push(MoveCommand {
                axis1: sa,
                // The second axis is wired mirrored on the device.
                axis2: -sb,
                duration_ms: dt,
                pose: Pose {
                    x,
                    y,
                    pen_up: start.pen_up,
                },
                dist: mdx.hypot(mdy),
            });
        }
    }
    moves
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> PlannerSettings {
        PlannerSettings::default()
    }

    #[test]
    fn zero_length_segment_is_none() {
        let start = Pose {
            x: 5.0,
            y: 5.0,
            pen_up: false,
        };
        assert!(compute_segment(&settings(), Point::new(5.0, 5.0), 0.0, 0.0, &start).is_none());
    }

    #[test]
    fn sub_step_segment_is_none() {
        let start = Pose {
            x: 0.0,
            y: 0.0,
            pen_up: false,
        };
        // A fraction of one motor step.
        let target = Point::new(0.003, 0.0);
        assert!(compute_segment(&settings(), target, 0.0, 0.0, &start).is_none());
    }

    #[test]
    fn end_pose_is_step_rounded() {
        let s = settings();
        let start = Pose {
            x: 0.0,
            y: 0.0,
            pen_up: true,
        };
        let plan = compute_segment(&s, Point::new(10.0003, 0.0), 0.0, 0.0, &start).unwrap();
        // The end pose is on the step grid, not the requested point.
        let steps = s.steps_per_mm * (plan.end.x + plan.end.y);
        assert!((steps - steps.round()).abs() < 1e-6);
    }

    #[test]
    fn short_segment_falls_back_to_a_single_move() {
        let s = settings();
        let start = Pose {
            x: 0.0,
            y: 0.0,
            pen_up: false,
        };
        // Long enough to step, far too short for a 5-slice triangle.
        let plan = compute_segment(&s, Point::new(0.2, 0.0), 0.0, 0.0, &start).unwrap();
        assert_eq!(plan.moves.len(), 1);
        assert!(plan.moves[0].duration_ms >= 1);
    }

    #[test]
    fn durations_are_monotone_nonoverlapping() {
        let s = settings();
        let start = Pose {
            x: 0.0,
            y: 0.0,
            pen_up: false,
        };
        let plan = compute_segment(&s, Point::new(60.0, 40.0), 0.0, 0.0, &start).unwrap();
        let total_ms: u64 = plan.moves.iter().map(|m| m.duration_ms as u64).sum();
        // Rough sanity: 72mm at up to 55mm/s with ramps should take
        // between one and ten seconds.
        assert!(total_ms > 1000);
        assert!(total_ms < 10_000);
    }
}
