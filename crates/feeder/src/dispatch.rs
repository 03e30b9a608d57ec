//! The dispatch task: owns the transport, drains the intent queue under
//! flow control, and folds the board's responses back into shared state.

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use ebb_protocol::{Cmd, Response, ResponseReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::Instant;

use crate::state::{DeviceState, Intent, FINISH_GRACE, FINISH_PENDING, MAX_PENDING};
use crate::transport::Transport;

/// How often queued intents are fed to the board.
pub const CONSUME_TICK: Duration = Duration::from_millis(50);
/// How often the board is asked for its status.
pub const POLL_TICK: Duration = Duration::from_millis(100);

/// Control messages from the [`crate::plot::Plotter`] handle.
pub enum Op {
    /// Append work to the queue.
    Enqueue(Vec<Intent>),
    /// Send one command immediately, bypassing the queue, and report
    /// whether the write succeeded.
    Execute(Cmd, oneshot::Sender<anyhow::Result<()>>),
    Pause,
    Resume,
    /// Drop all queued work.
    Clear,
    Shutdown,
}

pub struct Feeder<T> {
    transport: T,
    state: Arc<Mutex<DeviceState>>,
    reader: ResponseReader,
}

impl<T: Transport> Feeder<T> {
    pub fn new(transport: T, state: Arc<Mutex<DeviceState>>) -> Self {
        Feeder {
            transport,
            state,
            reader: ResponseReader::new(),
        }
    }

    /// Run until shutdown. `incoming` carries raw bytes from the serial
    /// reader thread; `ops` carries control messages. Returns an error if
    /// the serial side goes away.
    pub async fn run(
        mut self,
        mut incoming: mpsc::Receiver<Vec<u8>>,
        mut ops: mpsc::Receiver<Op>,
    ) -> anyhow::Result<()> {
        let mut consume = tokio::time::interval(CONSUME_TICK);
        let mut poll = tokio::time::interval(POLL_TICK);
        loop {
            tokio::select! {
                _ = consume.tick() => self.consume_tick().await,
                _ = poll.tick() => self.poll_status().await,
                bytes = incoming.recv() => match bytes {
                    Some(bytes) => self.handle_bytes(&bytes).await,
                    None => return Err(anyhow!("serial reader stopped")),
                },
                op = ops.recv() => match op {
                    Some(op) => {
                        if self.handle_op(op).await {
                            return Ok(());
                        }
                    }
                    // All handles dropped.
                    None => return Ok(()),
                },
            }
        }
    }

    /// Feed the board from the queue, respecting the in-flight cap. With
    /// the queue drained, watch for the plot to finish instead. A failed
    /// write puts the intent back and leaves it for the next tick.
    pub async fn consume_tick(&mut self) {
        let mut state = self.state.lock().await;
        if state.paused || !state.consuming {
            return;
        }
        if state.queue.is_empty() {
            check_finished(&mut state);
            return;
        }
        state.finish_deadline = None;
        for _ in 0..state.batch_size() {
            if state.pending() >= MAX_PENDING {
                break;
            }
            let Some(intent) = state.queue.pop_front() else {
                break;
            };
            let cmd = state.command_for(&intent);
            if let Err(e) = self.transport.send(&cmd) {
                log::warn!("write failed, will retry: {e}");
                state.queue.push_front(intent);
                break;
            }
            state.commands_sent += 1;
            state.apply_sent(&intent);
        }
    }

    /// Ask the board for its status. Skipped when the in-flight window is
    /// full, so a stalled board doesn't accumulate queries.
    pub async fn poll_status(&mut self) {
        let mut state = self.state.lock().await;
        if !state.polling || state.pending() >= MAX_PENDING {
            return;
        }
        match self.transport.send(&Cmd::QueryGeneral) {
            Ok(()) => state.commands_sent += 1,
            Err(e) => log::warn!("status poll failed: {e}"),
        }
    }

    pub async fn handle_bytes(&mut self, bytes: &[u8]) {
        let mut responses = Vec::new();
        self.reader.push(bytes, &mut responses);
        if responses.is_empty() {
            return;
        }
        let mut state = self.state.lock().await;
        for r in responses {
            match r {
                Response::Ok => state.record_ack(),
                // Status lines are their query's acknowledgment.
                Response::General { steps, .. } | Response::Motors { steps } => {
                    state.record_ack();
                    if let Some(steps) = steps {
                        state.device_steps = steps;
                    }
                }
                Response::Info(line) => log::debug!("device: {line}"),
            }
        }
    }

    /// Returns true when the task should exit.
    async fn handle_op(&mut self, op: Op) -> bool {
        match op {
            Op::Enqueue(intents) => {
                let mut state = self.state.lock().await;
                state.dist_total += intents.iter().map(Intent::dist).sum::<f64>();
                state.plotting |= intents.iter().any(|i| matches!(i, Intent::Move(_)));
                state.queue.extend(intents);
                // New work restarts the loops if a disengage stopped them.
                state.consuming = true;
                state.polling = true;
                state.finish_deadline = None;
            }
            Op::Execute(cmd, reply) => {
                let res = self.transport.send(&cmd);
                if res.is_ok() {
                    self.state.lock().await.commands_sent += 1;
                } else if let Err(e) = &res {
                    log::error!("write failed: {e}");
                }
                let _ = reply.send(res);
            }
            Op::Pause => self.state.lock().await.paused = true,
            Op::Resume => self.state.lock().await.paused = false,
            Op::Clear => {
                let mut state = self.state.lock().await;
                state.queue.clear();
                state.plotting = false;
                state.finish_deadline = None;
                state.dist_done = 0.0;
                state.dist_total = 0.0;
            }
            Op::Shutdown => return true,
        }
        false
    }
}

/// Arm or fire the finish deadline. Acknowledgements trail the board's
/// actual motion, so an empty queue with a nearly-empty window still gets
/// a grace period before the plot counts as done.
fn check_finished(state: &mut DeviceState) {
    if !state.plotting {
        return;
    }
    if state.commands_sent > 0 && state.pending() < FINISH_PENDING {
        let now = Instant::now();
        match state.finish_deadline {
            None => state.finish_deadline = Some(now + FINISH_GRACE),
            Some(deadline) if now >= deadline => {
                state.plotting = false;
                state.consuming = false;
                state.finish_deadline = None;
                log::info!(
                    "plot finished: {} commands, {:.1}mm drawn",
                    state.commands_sent,
                    state.dist_done
                );
            }
            Some(_) => {}
        }
    }
}
