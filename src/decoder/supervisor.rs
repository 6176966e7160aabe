//! Per-source decoder supervision loop.

use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::RestartPolicy;
use crate::decoder::decoder_command;
use crate::error::DecoderError;
use crate::event::{EngineEvent, EventCallback};
use crate::source::{SourceId, Transport};
use crate::PcmChunk;

/// Lifecycle of one supervision loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// No process and no restart pending.
    Stopped,
    /// The decoder process is alive and its stdout is being streamed.
    Running,
    /// The decoder exited; a restart is scheduled after a delay.
    Backoff,
}

/// Outcome of one decoder process run.
enum RunOutcome {
    /// A stop request arrived; the process is killed and reaped.
    Stopped,
    /// The chunk channel closed; the source is being torn down.
    SenderClosed,
    /// The process failed to start or exited on its own.
    Failed(DecoderError),
}

/// Handle held by the registry for one supervision loop.
pub(crate) struct SupervisorHandle {
    stop_tx: mpsc::Sender<oneshot::Sender<()>>,
    state_rx: watch::Receiver<SupervisorState>,
    join: JoinHandle<()>,
}

impl SupervisorHandle {
    /// Current supervision state.
    pub(crate) fn state(&self) -> SupervisorState {
        *self.state_rx.borrow()
    }

    /// Stops the loop and blocks until the decoder process is reaped.
    ///
    /// Safe to call at any point in the loop's lifecycle: a stop request
    /// always takes precedence over a pending restart, and a loop that has
    /// already exited resolves through the join.
    pub(crate) async fn shutdown(self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.stop_tx.send(ack_tx).await.is_ok() {
            let _ = ack_rx.await;
        }
        let _ = self.join.await;
    }
}

struct DecoderSupervisor {
    source_id: SourceId,
    program: String,
    url: String,
    transport: Transport,
    sample_rate: u32,
    channels: u16,
    read_chunk_bytes: usize,
    policy: RestartPolicy,
    chunk_tx: mpsc::Sender<PcmChunk>,
    stop_rx: mpsc::Receiver<oneshot::Sender<()>>,
    state_tx: watch::Sender<SupervisorState>,
    event_callback: Option<EventCallback>,
}

impl DecoderSupervisor {
    async fn run(mut self) {
        let mut consecutive_failures: u32 = 0;
        let mut degraded = false;
        let mut last_spawn: Option<Instant> = None;

        loop {
            // Spawn-rate ceiling: never start two processes closer together
            // than the configured minimum interval, backoff state aside.
            if let Some(previous) = last_spawn {
                let elapsed = previous.elapsed();
                if elapsed < self.policy.min_spawn_interval
                    && self
                        .wait_or_stop(self.policy.min_spawn_interval - elapsed)
                        .await
                {
                    break;
                }
            }
            last_spawn = Some(Instant::now());
            self.set_state(SupervisorState::Running);

            let started = Instant::now();
            match self.run_decoder_once().await {
                RunOutcome::Stopped | RunOutcome::SenderClosed => break,
                RunOutcome::Failed(error) => {
                    if started.elapsed() >= self.policy.stability_threshold {
                        // A long healthy run forgives earlier crashes.
                        consecutive_failures = 0;
                        degraded = false;
                    }
                    consecutive_failures += 1;
                    tracing::warn!(
                        source = %self.source_id,
                        error = %error,
                        consecutive_failures,
                        "decoder exited, restart scheduled"
                    );

                    if consecutive_failures >= self.policy.restart_budget && !degraded {
                        degraded = true;
                        self.emit(EngineEvent::StreamDegraded {
                            source_id: self.source_id.clone(),
                            consecutive_failures,
                        });
                    }

                    let delay = self.policy.backoff_delay(consecutive_failures);
                    self.emit(EngineEvent::DecoderRestarting {
                        source_id: self.source_id.clone(),
                        consecutive_failures,
                        delay,
                    });

                    self.set_state(SupervisorState::Backoff);
                    if self.wait_or_stop(delay).await {
                        break;
                    }
                }
            }
        }

        self.set_state(SupervisorState::Stopped);
        tracing::info!(source = %self.source_id, "decoder supervision stopped");
    }

    /// Spawns the decoder once and streams its stdout until it exits or a
    /// stop arrives. Guarantees the child is reaped before returning.
    async fn run_decoder_once(&mut self) -> RunOutcome {
        let mut command = decoder_command(
            &self.program,
            &self.url,
            self.transport,
            self.sample_rate,
            self.channels,
        );

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => return RunOutcome::Failed(DecoderError::SpawnFailed { source: e }),
        };
        tracing::info!(source = %self.source_id, pid = ?child.id(), "decoder started");

        let Some(mut stdout) = child.stdout.take() else {
            let _ = child.kill().await;
            return RunOutcome::Failed(DecoderError::NoStdout);
        };

        let mut buf = vec![0u8; self.read_chunk_bytes];
        loop {
            tokio::select! {
                request = self.stop_rx.recv() => {
                    if let Err(e) = child.kill().await {
                        tracing::warn!(source = %self.source_id, "failed to kill decoder: {e}");
                    }
                    if let Some(ack) = request {
                        let _ = ack.send(());
                    }
                    return RunOutcome::Stopped;
                }
                read = stdout.read(&mut buf) => match read {
                    Ok(0) => {
                        let status = match child.wait().await {
                            Ok(status) => status.to_string(),
                            Err(e) => e.to_string(),
                        };
                        return RunOutcome::Failed(DecoderError::Exited { status });
                    }
                    Ok(n) => {
                        let chunk = PcmChunk::new(self.source_id.clone(), buf[..n].to_vec());
                        if self.chunk_tx.send(chunk).await.is_err() {
                            let _ = child.kill().await;
                            return RunOutcome::SenderClosed;
                        }
                    }
                    Err(e) => {
                        let _ = child.kill().await;
                        return RunOutcome::Failed(DecoderError::Exited {
                            status: e.to_string(),
                        });
                    }
                }
            }
        }
    }

    /// Sleeps for `delay` unless a stop request interrupts it.
    /// Returns `true` if the loop should exit.
    async fn wait_or_stop(&mut self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            request = self.stop_rx.recv() => {
                if let Some(ack) = request {
                    let _ = ack.send(());
                }
                true
            }
        }
    }

    fn set_state(&self, state: SupervisorState) {
        let _ = self.state_tx.send(state);
    }

    fn emit(&self, event: EngineEvent) {
        if let Some(ref callback) = self.event_callback {
            callback(event);
        }
    }
}

/// Spawns a supervision loop for one network source.
#[allow(clippy::too_many_arguments)]
pub(crate) fn spawn_supervisor(
    source_id: SourceId,
    program: String,
    url: String,
    transport: Transport,
    sample_rate: u32,
    channels: u16,
    read_chunk_bytes: usize,
    policy: RestartPolicy,
    chunk_tx: mpsc::Sender<PcmChunk>,
    event_callback: Option<EventCallback>,
) -> SupervisorHandle {
    let (stop_tx, stop_rx) = mpsc::channel(4);
    let (state_tx, state_rx) = watch::channel(SupervisorState::Stopped);

    let supervisor = DecoderSupervisor {
        source_id,
        program,
        url,
        transport,
        sample_rate,
        channels,
        read_chunk_bytes,
        policy,
        chunk_tx,
        stop_rx,
        state_tx,
        event_callback,
    };
    let join = tokio::spawn(supervisor.run());

    SupervisorHandle {
        stop_tx,
        state_rx,
        join,
    }
}
