//! The EiBotBoard ASCII serial protocol.
//!
//! Commands are single comma-separated lines terminated by a carriage
//! return. The board answers with CRLF-terminated lines: `OK` acknowledges
//! a command, and query commands get a line echoing the query prefix
//! followed by status fields. Responses are not correlated to individual
//! commands, so callers count acknowledgments rather than matching them.
//!
//! Pen-state convention: `SP,1` raises the pen and `SP,0` lowers it, with
//! servo parameter 4 holding the pen-up endpoint and parameter 5 the
//! pen-down endpoint.

use ebb_geom::AxisSteps;
use serde::{Deserialize, Serialize};

pub mod reader;

pub use reader::ResponseReader;

/// Servo configuration parameter: pen-up endpoint.
pub const SERVO_PEN_UP: u8 = 4;
/// Servo configuration parameter: pen-down endpoint.
pub const SERVO_PEN_DOWN: u8 = 5;
/// Servo configuration parameter: raise rate.
pub const SERVO_RATE_UP: u8 = 10;
/// Servo configuration parameter: lower rate.
pub const SERVO_RATE_DOWN: u8 = 11;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cmd {
    /// `SC,<param>,<value>`
    ServoConfig { param: u8, value: u32 },
    /// `SP,<state>,<duration_ms>`; state 1 is pen up, 0 is pen down.
    SetPen { up: bool, duration_ms: u32 },
    /// `SM,<duration_ms>,<axis1>,<axis2>`: a timed move on both motors.
    StepperMove {
        duration_ms: u32,
        axis1: i32,
        axis2: i32,
    },
    /// `LM,<rate>,<axis1>,<axis2>`: a rate-based move. Supported by the
    /// board but not used by the trapezoidal planner path.
    LowLevelMove { rate: u32, axis1: i32, axis2: i32 },
    /// `EM,<enable1>,<enable2>`
    EnableMotors { motor1: bool, motor2: bool },
    /// `QG`: general status query.
    QueryGeneral,
    /// `QM`: legacy motor status query.
    QueryMotors,
    /// `R`: reset the board.
    Reset,
}

impl Cmd {
    /// Encode as a CR-terminated command line, ready to write to the port.
    pub fn encode(&self) -> String {
        match *self {
            Cmd::ServoConfig { param, value } => format!("SC,{param},{value}\r"),
            Cmd::SetPen { up, duration_ms } => {
                format!("SP,{},{}\r", u8::from(up), duration_ms)
            }
            Cmd::StepperMove {
                duration_ms,
                axis1,
                axis2,
            } => format!("SM,{duration_ms},{axis1},{axis2}\r"),
            Cmd::LowLevelMove { rate, axis1, axis2 } => format!("LM,{rate},{axis1},{axis2}\r"),
            Cmd::EnableMotors { motor1, motor2 } => {
                format!("EM,{},{}\r", u8::from(motor1), u8::from(motor2))
            }
            Cmd::QueryGeneral => "QG\r".to_owned(),
            Cmd::QueryMotors => "QM\r".to_owned(),
            Cmd::Reset => "R\r".to_owned(),
        }
    }
}

/// One decoded response line from the board.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response {
    /// A plain acknowledgment.
    Ok,
    /// A `QG,...` general-status line. `steps` is absent when the position
    /// fields are missing or malformed; the line still counts as an
    /// acknowledgment either way.
    General {
        status: Option<u8>,
        steps: Option<AxisSteps>,
    },
    /// A `QM,...` legacy motor-status line.
    Motors { steps: Option<AxisSteps> },
    /// Anything else the board printed. Logged, nothing more.
    Info(String),
}

impl Response {
    /// Whether this line counts toward the completed-command counter.
    /// Query status lines complete their query implicitly, keeping the
    /// in-flight count consistent.
    pub fn is_ack(&self) -> bool {
        !matches!(self, Response::Info(_))
    }

    /// The absolute motor positions carried by this line, if any.
    pub fn steps(&self) -> Option<AxisSteps> {
        match self {
            Response::General { steps, .. } | Response::Motors { steps } => *steps,
            _ => None,
        }
    }
}
