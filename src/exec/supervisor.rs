// src/exec/supervisor.rs

use std::process::Stdio;
use std::time::Duration;

use chrono::Local;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::config::model::NodeId;
use crate::engine::events::{Event, EventTx, ExitReport, OutputStream};
use crate::errors::SynthError;

/// Lines longer than this are emitted as multiple `NodeOutput` events, so a
/// producer that never writes a newline cannot exhaust memory.
pub const LINE_CAP: usize = 64 * 1024;

/// How long a process group gets between SIGTERM and SIGKILL.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(10);

/// Everything needed to launch one run of a node. Command and environment
/// values are already rendered.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub node: NodeId,
    pub run: u64,
    pub command: String,
    pub env: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy)]
enum StopMode {
    Graceful,
    Immediate,
}

/// Handle to a supervised run. Stop requests are asynchronous; the one
/// `NodeExited` event arrives on the bus once the process is reaped and both
/// pipes are drained.
#[derive(Debug)]
pub struct RunHandle {
    pub node: NodeId,
    pub pid: u32,
    stop_tx: mpsc::Sender<StopMode>,
}

impl RunHandle {
    /// Begin the graceful termination protocol (SIGTERM, grace, SIGKILL).
    pub fn stop(&self) {
        let _ = self.stop_tx.try_send(StopMode::Graceful);
    }

    /// SIGKILL the whole group immediately.
    pub fn kill(&self) {
        let _ = self.stop_tx.try_send(StopMode::Immediate);
    }
}

/// Spawns shell commands and owns their lifetimes until exit.
#[derive(Debug, Clone)]
pub struct Supervisor {
    events: EventTx,
    grace: Duration,
}

impl Supervisor {
    pub fn new(events: EventTx) -> Self {
        Self {
            events,
            grace: DEFAULT_GRACE,
        }
    }

    pub fn with_grace(events: EventTx, grace: Duration) -> Self {
        Self { events, grace }
    }

    /// Launch one run of a node under `sh -c`, in its own process group so
    /// that one group signal reaches the whole subtree.
    ///
    /// A spawn failure is returned to the caller; no events are emitted for
    /// runs that never started.
    pub fn spawn(&self, spec: SpawnSpec) -> Result<RunHandle, SynthError> {
        info!(node = %spec.node, run = spec.run, "starting node process");

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&spec.command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env("SYNTH_NODE_ID", &spec.node)
            .kill_on_drop(true);
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| SynthError::Spawn {
            node: spec.node.clone(),
            source,
        })?;

        let pid = child.id().ok_or_else(|| SynthError::Supervisor {
            node: spec.node.clone(),
            message: "child exited before a pid could be read".to_string(),
        })?;

        let (stop_tx, stop_rx) = mpsc::channel(4);

        tokio::spawn(supervise(
            spec.node.clone(),
            spec.run,
            child,
            pid,
            self.events.clone(),
            self.grace,
            stop_rx,
        ));

        Ok(RunHandle {
            node: spec.node,
            pid,
            stop_tx,
        })
    }
}

/// Owns one child from spawn to reap: applies the termination protocol,
/// waits for both pipes to drain, and emits exactly one `NodeExited`.
async fn supervise(
    node: NodeId,
    run: u64,
    mut child: Child,
    pid: u32,
    events: EventTx,
    grace: Duration,
    mut stop_rx: mpsc::Receiver<StopMode>,
) {
    let started = Instant::now();

    // Published before the pumps exist, so every NodeOutput of this run
    // lands after its NodeStarted.
    events
        .publish(Event::NodeStarted {
            node: node.clone(),
            run,
            pid,
        })
        .await;

    let out_pump = child.stdout.take().map(|stream| {
        tokio::spawn(pump_lines(
            node.clone(),
            OutputStream::Stdout,
            stream,
            events.clone(),
        ))
    });
    let err_pump = child.stderr.take().map(|stream| {
        tokio::spawn(pump_lines(
            node.clone(),
            OutputStream::Stderr,
            stream,
            events.clone(),
        ))
    });

    let status = wait_with_stop(&mut child, pid, grace, &mut stop_rx).await;

    // Pipes first: all NodeOutput events for this run must precede its exit.
    if let Some(pump) = out_pump {
        let _ = pump.await;
    }
    if let Some(pump) = err_pump {
        let _ = pump.await;
    }

    let exit = match status {
        Ok(status) => {
            use std::os::unix::process::ExitStatusExt;
            ExitReport {
                code: status.code().unwrap_or(-1),
                signal: status.signal(),
                duration: started.elapsed(),
            }
        }
        Err(err) => {
            warn!(node = %node, error = %err, "failed to wait for child; reporting failure");
            ExitReport {
                code: -1,
                signal: None,
                duration: started.elapsed(),
            }
        }
    };

    info!(
        node = %node,
        run,
        exit_code = exit.code,
        signal = ?exit.signal,
        "node process exited"
    );

    events
        .publish(Event::NodeExited { node, run, exit })
        .await;
}

/// Wait for the child while honouring stop requests: SIGTERM the group, give
/// it the grace period, then SIGKILL. An immediate stop (or a second request
/// during the grace window) escalates straight to SIGKILL.
async fn wait_with_stop(
    child: &mut Child,
    pid: u32,
    grace: Duration,
    stop_rx: &mut mpsc::Receiver<StopMode>,
) -> std::io::Result<std::process::ExitStatus> {
    let mode = tokio::select! {
        status = child.wait() => return status,
        mode = stop_rx.recv() => mode.unwrap_or(StopMode::Immediate),
    };

    match mode {
        StopMode::Graceful => {
            signal_group(pid, Signal::SIGTERM);

            tokio::select! {
                status = child.wait() => return status,
                _ = sleep(grace) => {
                    debug!(pid, "grace period expired; killing process group");
                }
                _ = wait_for_immediate(stop_rx) => {
                    debug!(pid, "escalation requested; killing process group");
                }
            }
        }
        StopMode::Immediate => {}
    }

    signal_group(pid, Signal::SIGKILL);
    child.wait().await
}

async fn wait_for_immediate(stop_rx: &mut mpsc::Receiver<StopMode>) {
    loop {
        match stop_rx.recv().await {
            Some(StopMode::Immediate) => return,
            Some(StopMode::Graceful) => continue,
            // All handles dropped; nothing can escalate any more.
            None => std::future::pending::<()>().await,
        }
    }
}

/// Signal the whole process group. A group that is already gone (ESRCH) is
/// treated as already-exited.
fn signal_group(pid: u32, signal: Signal) {
    let pgid = Pid::from_raw(pid as i32);
    match killpg(pgid, signal) {
        Ok(()) => {}
        Err(Errno::ESRCH) => {}
        Err(err) => {
            warn!(pid, %signal, error = %err, "failed to signal process group");
        }
    }
}

/// Read a pipe into `NodeOutput` events, one per line. A line that exceeds
/// [`LINE_CAP`] is emitted in multiple fragments so the buffer stays bounded.
async fn pump_lines<R>(node: NodeId, stream: OutputStream, mut reader: R, events: EventTx)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf: Vec<u8> = Vec::with_capacity(8 * 1024);
    let mut chunk = [0u8; 8 * 1024];

    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                debug!(node = %node, ?stream, error = %err, "pipe read error; closing stream");
                break;
            }
        };
        buf.extend_from_slice(&chunk[..n]);

        loop {
            if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = buf.drain(..=pos).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                emit_line(&node, stream, line, &events).await;
            } else if buf.len() >= LINE_CAP {
                let fragment: Vec<u8> = buf.drain(..LINE_CAP).collect();
                emit_line(&node, stream, fragment, &events).await;
            } else {
                break;
            }
        }
    }

    if !buf.is_empty() {
        emit_line(&node, stream, buf, &events).await;
    }
}

async fn emit_line(node: &str, stream: OutputStream, line: Vec<u8>, events: &EventTx) {
    events
        .publish(Event::NodeOutput {
            node: node.to_string(),
            stream,
            line,
            timestamp: Local::now(),
        })
        .await;
}
