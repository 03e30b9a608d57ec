//! Line-oriented response decoding.
//!
//! The serial port hands us arbitrary byte chunks; complete CRLF-terminated
//! lines are classified into [`Response`] events and the trailing partial
//! line is kept for the next chunk. Decoding never fails: unrecognized
//! lines become [`Response::Info`] and malformed numeric fields just drop
//! the position payload.

use ebb_geom::AxisSteps;

use crate::Response;

#[derive(Debug, Default)]
pub struct ResponseReader {
    buf: String,
}

impl ResponseReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes, appending decoded events to `out`.
    pub fn push(&mut self, bytes: &[u8], out: &mut Vec<Response>) {
        self.buf.push_str(&String::from_utf8_lossy(bytes));
        while let Some(idx) = self.buf.find("\r\n") {
            let line = self.buf[..idx].trim().to_owned();
            self.buf.drain(..idx + 2);
            if !line.is_empty() {
                out.push(classify(&line));
            }
        }
    }

    /// The retained partial line, if any. Mostly useful for diagnostics.
    pub fn pending(&self) -> &str {
        &self.buf
    }
}

fn classify(line: &str) -> Response {
    if line.contains("OK") {
        Response::Ok
    } else if line.starts_with("QG,") {
        let fields: Vec<&str> = line.split(',').collect();
        Response::General {
            status: fields.get(1).and_then(|f| f.parse().ok()),
            steps: parse_steps(&fields, 2),
        }
    } else if line.starts_with("QM,") {
        // QM carries an extra per-motor status field, so the positions sit
        // one field later than in QG.
        let fields: Vec<&str> = line.split(',').collect();
        Response::Motors {
            steps: parse_steps(&fields, 3),
        }
    } else {
        log::debug!("unclassified EBB response: {line:?}");
        Response::Info(line.to_owned())
    }
}

fn parse_steps(fields: &[&str], first: usize) -> Option<AxisSteps> {
    let a = fields.get(first)?.trim().parse().ok()?;
    let b = fields.get(first + 1)?.trim().parse().ok()?;
    Some(AxisSteps { a, b })
}
