// src/render/renderer.rs

use std::collections::BTreeMap;
use std::io::Write;
use std::time::Duration;

use chrono::{DateTime, Local};
use crossterm::tty::IsTty;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant, MissedTickBehavior};

use crate::config::model::{NodeId, ResolvedFlow};
use crate::engine::events::{Event, ExitReport, FireCause, Lifecycle, ShutdownReason};

/// 256-color codes handed out to nodes in declaration order. Stable across a
/// run, distinct enough side by side.
const PALETTE: [u8; 10] = [114, 81, 215, 175, 141, 203, 120, 179, 69, 216];

#[derive(Debug)]
struct NodeView {
    color: u8,
    lifecycle: Lifecycle,
    run_count: u64,
    last_exit: Option<ExitReport>,
    started: Option<Instant>,
    total: Duration,
}

/// Sole owner of the terminal. Consumes the event stream, interleaves node
/// output with per-node colored prefixes, and keeps a live status footer at
/// the bottom of the screen (when stdout is a TTY).
pub struct Renderer {
    rx: mpsc::Receiver<Event>,
    views: BTreeMap<NodeId, NodeView>,
    prefix_width: usize,
    term_width: usize,
    is_tty: bool,
    footer_rows: usize,
    shutting_down: bool,
}

impl Renderer {
    pub fn new(flow: &ResolvedFlow, rx: mpsc::Receiver<Event>) -> Self {
        let views: BTreeMap<NodeId, NodeView> = flow
            .nodes
            .keys()
            .enumerate()
            .map(|(index, id)| {
                (
                    id.clone(),
                    NodeView {
                        color: PALETTE[index % PALETTE.len()],
                        lifecycle: Lifecycle::Waiting,
                        run_count: 0,
                        last_exit: None,
                        started: None,
                        total: Duration::ZERO,
                    },
                )
            })
            .collect();

        let prefix_width = views.keys().map(|id| id.len()).max().unwrap_or(0);
        let term_width = crossterm::terminal::size()
            .map(|(cols, _rows)| cols as usize)
            .unwrap_or(80);

        Self {
            rx,
            views,
            prefix_width,
            term_width,
            is_tty: std::io::stdout().is_tty(),
            footer_rows: 0,
            shutting_down: false,
        }
    }

    /// Consume events until `EngineStopped`, then print the summary and
    /// flush.
    pub async fn run(mut self) {
        let mut tick = interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                event = self.rx.recv() => match event {
                    Some(event) => {
                        if self.handle(event) {
                            break;
                        }
                    }
                    None => break,
                },
                _ = tick.tick() => self.redraw(),
            }
        }
    }

    /// Returns true once the final summary has been printed.
    fn handle(&mut self, event: Event) -> bool {
        match event {
            Event::NodeStarted { node, pid, .. } => {
                if let Some(view) = self.views.get_mut(&node) {
                    view.started = Some(Instant::now());
                    view.run_count += 1;
                }
                self.print_status(&node, &format!("started (pid {pid})"));
            }
            Event::NodeOutput {
                node,
                line,
                timestamp,
                ..
            } => {
                self.print_output(&node, &line, timestamp);
            }
            Event::NodeExited { node, exit, .. } => {
                if let Some(view) = self.views.get_mut(&node) {
                    view.started = None;
                    view.total += exit.duration;
                    view.last_exit = Some(exit);
                }
                let outcome = match exit.signal {
                    Some(signal) => format!("killed by signal {signal}"),
                    None => format!("exited with code {}", exit.code),
                };
                self.print_status(
                    &node,
                    &format!("{outcome} in {:.3}s", exit.duration.as_secs_f64()),
                );
            }
            Event::NodePhase { node, lifecycle } => {
                if let Some(view) = self.views.get_mut(&node) {
                    view.lifecycle = lifecycle;
                }
                self.redraw();
            }
            Event::TriggerFired {
                node,
                cause: FireCause::PathsChanged(paths),
                ..
            } => {
                let shown: Vec<String> = paths
                    .iter()
                    .take(3)
                    .map(|p| p.display().to_string())
                    .collect();
                let suffix = if paths.len() > shown.len() {
                    format!(" (+{} more)", paths.len() - shown.len())
                } else {
                    String::new()
                };
                self.print_status(
                    &node,
                    &format!("triggered by changes: {}{suffix}", shown.join(" ")),
                );
            }
            Event::TriggerFired { .. } | Event::WatchEvent { .. } => {}
            Event::EngineShuttingDown { reason } => {
                if !self.shutting_down {
                    self.shutting_down = true;
                    let text = match reason {
                        ShutdownReason::Quiescent => "no more work to do; shutting down",
                        ShutdownReason::UserInterrupt => "interrupted; shutting down",
                    };
                    self.print_plain(text);
                }
            }
            Event::EngineStopped => {
                self.finish();
                return true;
            }
        }
        false
    }

    fn print_output(&mut self, node: &str, line: &[u8], timestamp: DateTime<Local>) {
        let color = self.color_of(node);
        let width = self.prefix_width;
        let mut out = std::io::stdout().lock();
        let _ = self.clear_footer(&mut out);
        let _ = write!(
            out,
            "\x1b[2m{}\x1b[0m \x1b[38;5;{}m{:<width$}\x1b[0m │ ",
            timestamp.format("%H:%M:%S"),
            color,
            node,
        );
        // Raw bytes, invalid UTF-8 and all.
        let _ = out.write_all(line);
        let _ = out.write_all(b"\n");
        let _ = self.draw_footer(&mut out);
        let _ = out.flush();
    }

    /// A dim lifecycle line attributed to a node.
    fn print_status(&mut self, node: &str, text: &str) {
        let color = self.color_of(node);
        let width = self.prefix_width;
        let mut out = std::io::stdout().lock();
        let _ = self.clear_footer(&mut out);
        let _ = writeln!(
            out,
            "\x1b[2m{}\x1b[0m \x1b[38;5;{}m{:<width$}\x1b[0m \x1b[2m│ {}\x1b[0m",
            Local::now().format("%H:%M:%S"),
            color,
            node,
            text,
        );
        let _ = self.draw_footer(&mut out);
        let _ = out.flush();
    }

    /// A dim line not attributed to any node.
    fn print_plain(&mut self, text: &str) {
        let mut out = std::io::stdout().lock();
        let _ = self.clear_footer(&mut out);
        let _ = writeln!(
            out,
            "\x1b[2m{} {}\x1b[0m",
            Local::now().format("%H:%M:%S"),
            text,
        );
        let _ = self.draw_footer(&mut out);
        let _ = out.flush();
    }

    fn redraw(&mut self) {
        if !self.is_tty {
            return;
        }
        let mut out = std::io::stdout().lock();
        let _ = self.clear_footer(&mut out);
        let _ = self.draw_footer(&mut out);
        let _ = out.flush();
    }

    fn clear_footer(&mut self, out: &mut impl Write) -> std::io::Result<()> {
        if self.footer_rows > 0 {
            write!(out, "\x1b[{}A\x1b[0J", self.footer_rows)?;
            self.footer_rows = 0;
        }
        Ok(())
    }

    fn draw_footer(&mut self, out: &mut impl Write) -> std::io::Result<()> {
        if !self.is_tty || self.views.is_empty() {
            return Ok(());
        }

        writeln!(out, "\x1b[2m{}\x1b[0m", "─".repeat(self.term_width))?;
        let width = self.prefix_width;
        for (id, view) in &self.views {
            writeln!(
                out,
                "\x1b[38;5;{}m{:<width$}\x1b[0m  {:<11} runs {:>3}  exit {:>5}  {:>8}",
                view.color,
                id,
                view.lifecycle.display(),
                view.run_count,
                format_exit(view.last_exit),
                format_elapsed(view),
            )?;
        }
        self.footer_rows = self.views.len() + 1;
        Ok(())
    }

    /// Final summary: one line per node, then a closing rule, red if
    /// anything failed.
    fn finish(&mut self) {
        let mut out = std::io::stdout().lock();
        let _ = self.clear_footer(&mut out);

        let _ = writeln!(out, "\x1b[2m{}\x1b[0m", "─".repeat(self.term_width));
        let width = self.prefix_width;
        let mut any_failed = false;
        for (id, view) in &self.views {
            if view.lifecycle == Lifecycle::Failed
                || view.last_exit.map(|e| !e.success()).unwrap_or(false)
            {
                any_failed = true;
            }
            let _ = writeln!(
                out,
                "\x1b[38;5;{}m{:<width$}\x1b[0m  {:<11} runs {:>3}  exit {:>5}  {:>8}",
                view.color,
                id,
                view.lifecycle.display(),
                view.run_count,
                format_exit(view.last_exit),
                format_elapsed(view),
            );
        }

        let rule = "─".repeat(self.term_width);
        if any_failed {
            let _ = writeln!(out, "\x1b[31m{rule}\x1b[0m");
        } else {
            let _ = writeln!(out, "{rule}");
        }
        let _ = out.flush();
    }

    fn color_of(&self, node: &str) -> u8 {
        self.views.get(node).map(|v| v.color).unwrap_or(203)
    }
}

fn format_exit(exit: Option<ExitReport>) -> String {
    match exit {
        None => "-".to_string(),
        Some(exit) => match exit.signal {
            Some(signal) => format!("sig{signal}"),
            None => exit.code.to_string(),
        },
    }
}

fn format_elapsed(view: &NodeView) -> String {
    let mut total = view.total;
    if let Some(started) = view.started {
        total += started.elapsed();
    }
    format!("{:.1}s", total.as_secs_f64())
}
