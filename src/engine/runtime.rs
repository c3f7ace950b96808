// src/engine/runtime.rs

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::model::{NodeId, ResolvedFlow};
use crate::engine::events::{self, Event, EventTx, ExitReport, FireCause, ShutdownReason};
use crate::engine::scheduler::{Action, NodeState, Scheduler};
use crate::errors::{Result, SynthError};
use crate::exec::supervisor::{RunHandle, SpawnSpec, Supervisor, DEFAULT_GRACE};
use crate::render::Renderer;
use crate::template;
use crate::watch::{spawn_watcher, WatcherHandle};

/// Knobs the CLI (or a test) can turn before starting the engine.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Time between SIGTERM and SIGKILL on stop.
    pub grace: Duration,
    /// Install SIGINT/SIGTERM handlers. Off by default so embedding the
    /// engine (e.g. in tests) does not touch process-wide signal state.
    pub install_signal_handlers: bool,
    /// Swallow renderer output instead of writing to the terminal.
    pub quiet: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            grace: DEFAULT_GRACE,
            install_signal_handlers: false,
            quiet: false,
        }
    }
}

/// Handle for delivering an external shutdown signal to a running engine.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    events: EventTx,
}

impl EngineHandle {
    /// Equivalent to the user pressing Ctrl-C once.
    pub async fn interrupt(&self) {
        self.events
            .publish(Event::EngineShuttingDown {
                reason: ShutdownReason::UserInterrupt,
            })
            .await;
    }
}

/// What the engine saw, returned to the CLI once everything is reaped.
#[derive(Debug)]
pub struct EngineReport {
    pub exit_code: i32,
    pub nodes: BTreeMap<NodeId, NodeState>,
}

/// The engine: wires scheduler, supervisor, watcher and renderer together
/// and drives them from one event loop until shutdown completes.
pub struct Engine {
    flow: ResolvedFlow,
    options: EngineOptions,
    scheduler: Scheduler,
    supervisor: Supervisor,
    handles: BTreeMap<NodeId, RunHandle>,
    timers: BTreeMap<(NodeId, usize), JoinHandle<()>>,
    watcher: Option<WatcherHandle>,
    events_tx: EventTx,
    events_rx: mpsc::Receiver<Event>,
    renderer_tx: mpsc::Sender<Event>,
    renderer_task: JoinHandle<()>,
    signal_task: Option<JoinHandle<()>>,
    /// Events the engine synthesizes for itself (synthetic exits, shutdown
    /// requests); processed before pulling from the channel so the loop can
    /// never deadlock on its own publishes.
    pending: VecDeque<Event>,
    last_interrupt: Option<Instant>,
}

impl Engine {
    pub fn new(flow: ResolvedFlow, options: EngineOptions) -> (Engine, EngineHandle) {
        let (events_tx, events_rx) = events::channel(256);
        let (renderer_tx, renderer_rx) = mpsc::channel::<Event>(256);

        let renderer_task = if options.quiet {
            tokio::spawn(drain(renderer_rx))
        } else {
            let renderer = Renderer::new(&flow, renderer_rx);
            tokio::spawn(renderer.run())
        };

        let scheduler = Scheduler::new(&flow);
        let supervisor = Supervisor::with_grace(events_tx.clone(), options.grace);

        let handle = EngineHandle {
            events: events_tx.clone(),
        };

        let engine = Engine {
            flow,
            options,
            scheduler,
            supervisor,
            handles: BTreeMap::new(),
            timers: BTreeMap::new(),
            watcher: None,
            events_tx,
            events_rx,
            renderer_tx,
            renderer_task,
            signal_task: None,
            pending: VecDeque::new(),
            last_interrupt: None,
        };

        (engine, handle)
    }

    /// Run the flow to completion: until quiescent, or until an interrupt
    /// has been honoured and every child is reaped.
    pub async fn run(mut self) -> Result<EngineReport> {
        info!("engine starting");

        if self.options.install_signal_handlers {
            self.signal_task = Some(spawn_signal_task(self.events_tx.clone()));
        }

        let roots: Vec<_> = self.flow.watch_roots().into_iter().collect();
        if !roots.is_empty() {
            let debounce = self
                .flow
                .min_debounce()
                .unwrap_or(Duration::from_millis(150));
            self.watcher = Some(spawn_watcher(roots, debounce, self.events_tx.clone())?);
        }

        let actions = self.scheduler.start();
        self.execute(actions).await;

        loop {
            if self.scheduler.shutdown_reason().is_some() && self.scheduler.drained() {
                break;
            }

            let event = match self.pending.pop_front() {
                Some(event) => event,
                None => match self.events_rx.recv().await {
                    Some(event) => event,
                    None => break,
                },
            };

            let _ = self.renderer_tx.send(event.clone()).await;
            let actions = self.apply(event);
            self.execute(actions).await;
        }

        self.teardown().await
    }

    /// Apply one event to the scheduler; runtime-level concerns (interrupt
    /// escalation, timer/watcher cancellation) are handled here.
    fn apply(&mut self, event: Event) -> Vec<Action> {
        debug!(?event, "engine received event");

        match event {
            Event::NodeStarted { node, pid, .. } => self.scheduler.on_started(&node, pid),
            Event::NodeExited { node, exit, .. } => {
                self.handles.remove(&node);
                self.scheduler.on_exited(&node, exit)
            }
            Event::TriggerFired {
                node,
                trigger,
                cause,
            } => self.scheduler.on_trigger_fired(&node, trigger, cause),
            Event::WatchEvent { paths } => self.scheduler.on_watch_event(&paths),
            Event::EngineShuttingDown { reason } => {
                if reason == ShutdownReason::UserInterrupt {
                    if let Some(previous) = self.last_interrupt {
                        if previous.elapsed() < Duration::from_secs(2) {
                            warn!("second interrupt; killing all children immediately");
                            for handle in self.handles.values() {
                                handle.kill();
                            }
                        }
                    }
                    self.last_interrupt = Some(Instant::now());
                }

                for (_, timer) in std::mem::take(&mut self.timers) {
                    timer.abort();
                }
                self.watcher = None;

                self.scheduler.on_shutdown(reason)
            }
            Event::NodeOutput { .. } | Event::NodePhase { .. } | Event::EngineStopped => {
                Vec::new()
            }
        }
    }

    async fn execute(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Start { node, run } => self.start_node(node, run).await,
                Action::Stop { node } => {
                    if let Some(handle) = self.handles.get(&node) {
                        handle.stop();
                    }
                }
                Action::ArmRestart {
                    node,
                    trigger_index,
                    delay,
                } => {
                    let events = self.events_tx.clone();
                    let fired = node.clone();
                    let timer = tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        events
                            .publish(Event::TriggerFired {
                                node: fired,
                                trigger: Some(trigger_index),
                                cause: FireCause::RestartDelay,
                            })
                            .await;
                    });
                    self.timers.insert((node, trigger_index), timer);
                }
                Action::Notify(event) => {
                    let _ = self.renderer_tx.send(event).await;
                }
                Action::RequestShutdown { reason } => {
                    self.pending.push_back(Event::EngineShuttingDown { reason });
                }
            }
        }
    }

    /// Render and spawn one run. Render and spawn failures become a
    /// synthetic failing exit for the node; they never stop the engine.
    async fn start_node(&mut self, node: NodeId, run: u64) {
        let spec = match self.render_spec(&node, run) {
            Ok(spec) => spec,
            Err(err) => {
                warn!(node = %node, error = %err, "rendering failed; recording synthetic failure");
                self.synthetic_exit(node, run);
                return;
            }
        };

        match self.supervisor.spawn(spec) {
            Ok(handle) => {
                self.handles.insert(node, handle);
            }
            Err(err) => {
                warn!(node = %node, error = %err, "spawn failed; recording synthetic failure");
                self.synthetic_exit(node, run);
            }
        }
    }

    fn render_spec(&self, node: &str, run: u64) -> std::result::Result<SpawnSpec, SynthError> {
        let Some(resolved) = self.flow.nodes.get(node) else {
            return Err(SynthError::Supervisor {
                node: node.to_string(),
                message: "node missing from flow".to_string(),
            });
        };

        let bindings = self.flow.bindings_for(resolved);

        let command =
            template::render(&resolved.target.commands, &bindings).map_err(|err| {
                SynthError::Render {
                    node: node.to_string(),
                    message: err.to_string(),
                }
            })?;

        let mut env = Vec::new();
        for (key, value) in self.flow.env_for(resolved) {
            let rendered = template::render(&value, &bindings).map_err(|err| {
                SynthError::Render {
                    node: node.to_string(),
                    message: format!("environment variable '{key}': {err}"),
                }
            })?;
            env.push((key, rendered));
        }

        Ok(SpawnSpec {
            node: node.to_string(),
            run,
            command,
            env,
        })
    }

    fn synthetic_exit(&mut self, node: NodeId, run: u64) {
        self.pending.push_back(Event::NodeExited {
            node,
            run,
            exit: ExitReport {
                code: -1,
                signal: None,
                duration: Duration::ZERO,
            },
        });
    }

    async fn teardown(mut self) -> Result<EngineReport> {
        for (_, timer) in std::mem::take(&mut self.timers) {
            timer.abort();
        }
        self.watcher = None;
        if let Some(task) = self.signal_task.take() {
            task.abort();
        }

        // Let the renderer drain everything it has, print the summary, and
        // flush before we return.
        let _ = self.renderer_tx.send(Event::EngineStopped).await;
        let _ = (&mut self.renderer_task).await;

        let report = EngineReport {
            exit_code: self.scheduler.exit_code(),
            nodes: self.scheduler.report(),
        };
        info!(exit_code = report.exit_code, "engine stopped");
        Ok(report)
    }
}

async fn drain(mut rx: mpsc::Receiver<Event>) {
    while let Some(event) = rx.recv().await {
        if matches!(event, Event::EngineStopped) {
            break;
        }
    }
}

/// SIGINT/SIGTERM both request shutdown; the engine escalates on a repeat.
fn spawn_signal_task(events: EventTx) -> JoinHandle<()> {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(stream) => stream,
            Err(err) => {
                warn!(error = %err, "failed to install SIGINT handler");
                return;
            }
        };
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                return;
            }
        };

        loop {
            tokio::select! {
                _ = sigint.recv() => {}
                _ = sigterm.recv() => {}
            }
            events
                .publish(Event::EngineShuttingDown {
                    reason: ShutdownReason::UserInterrupt,
                })
                .await;
        }
    })
}
