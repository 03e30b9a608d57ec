//! CoreXY kinematics for an EiBotBoard pen plotter.
//!
//! The plotter's two stepper motors don't drive X and Y directly: the belt
//! routing makes each motor move the carriage diagonally, so world
//! coordinates and motor coordinates are related by a linear transform.
//! We call the motor axes A and B; moving motor A alone goes along `x = y`,
//! moving motor B alone goes along `x = -y`.
//!
//! World coordinates are in millimeters. Motor positions are in whole
//! steps, and all conversions round to the nearest step before going back
//! to millimeters so that repeated round trips don't drift.

use serde::{Deserialize, Serialize};

/// Unit tag for world coordinates (millimeters).
pub struct Mm;

pub type Point = euclid::Point2D<f64, Mm>;
pub type Vector = euclid::Vector2D<f64, Mm>;

pub const MM_PER_INCH: f64 = 25.4;

/// The EiBotBoard moves 2032 steps per inch in its high-resolution mode.
pub const STEPS_PER_INCH: f64 = 2032.0;

/// Signed step counts (or absolute step positions) on the native CoreXY
/// motor axes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisSteps {
    pub a: i64,
    pub b: i64,
}

/// CoreXY forward transform: world deltas to native-axis deltas.
pub fn forward(dx: f64, dy: f64) -> (f64, f64) {
    (dx + dy, dx - dy)
}

/// CoreXY inverse transform: native-axis deltas back to world deltas.
pub fn inverse(a: f64, b: f64) -> (f64, f64) {
    ((a + b) / 2.0, (a - b) / 2.0)
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Steps per millimeter of travel, applied on the native axes.
    pub steps_per_mm: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            steps_per_mm: STEPS_PER_INCH / MM_PER_INCH,
        }
    }
}

impl Config {
    /// Convert a world position to absolute motor-step positions.
    pub fn point_to_steps(&self, p: &Point) -> AxisSteps {
        let (a, b) = forward(p.x, p.y);
        AxisSteps {
            a: (a * self.steps_per_mm).round() as i64,
            b: (b * self.steps_per_mm).round() as i64,
        }
    }

    /// Convert absolute motor-step positions back to a world position.
    pub fn steps_to_point(&self, steps: &AxisSteps) -> Point {
        let (dx, dy) = inverse(steps.a as f64, steps.b as f64);
        Point::new(dx / self.steps_per_mm, dy / self.steps_per_mm)
    }

    /// Convert a world-space delta to whole-step motor deltas.
    pub fn delta_to_steps(&self, dx: f64, dy: f64) -> AxisSteps {
        let (a, b) = forward(dx, dy);
        AxisSteps {
            a: (a * self.steps_per_mm).round() as i64,
            b: (b * self.steps_per_mm).round() as i64,
        }
    }

    /// The world-space delta corresponding to whole-step motor deltas.
    pub fn steps_to_delta(&self, steps: &AxisSteps) -> (f64, f64) {
        let (dx, dy) = inverse(steps.a as f64, steps.b as f64);
        (dx / self.steps_per_mm, dy / self.steps_per_mm)
    }
}
