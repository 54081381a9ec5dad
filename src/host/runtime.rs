//! Async driver for a [`WidgetHost`].
//!
//! One task per widget slot owns the controller. Commands arrive on a
//! channel (from the UI layer and from the frame's message listener),
//! notices go out on another; retry timers are served by sleeping until
//! the scheduler's next deadline.
use std::time::Instant;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use super::controller::{HostError, HostNotice, WidgetHost};
use super::frame::GuestFrame;
use crate::config::Config;
use crate::sandbox::{SandboxDocument, WidgetTemplate};

/// Commands accepted by the host runtime.
pub enum HostCommand {
    /// Open (or reopen, if the identity changed) a session for a template.
    Mount {
        template: WidgetTemplate,
        reply: oneshot::Sender<Result<Option<SandboxDocument>, HostError>>,
    },
    Attach(Box<dyn GuestFrame>),
    Detach,
    SetPayload {
        data: Value,
        params: Value,
    },
    /// Raw message received from the frame (`message` event data).
    Inbound(String),
    Capture {
        pixel_ratio: f64,
        hide_numbers: bool,
        reply: oneshot::Sender<Result<String, HostError>>,
    },
    Unmount,
}

impl std::fmt::Debug for HostCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            HostCommand::Mount { .. } => "Mount",
            HostCommand::Attach(_) => "Attach",
            HostCommand::Detach => "Detach",
            HostCommand::SetPayload { .. } => "SetPayload",
            HostCommand::Inbound(_) => "Inbound",
            HostCommand::Capture { .. } => "Capture",
            HostCommand::Unmount => "Unmount",
        };
        f.write_str(name)
    }
}

pub struct HostRuntime {
    host: WidgetHost,
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(tokio::time::Instant::from_std(d)).await,
        None => std::future::pending::<()>().await,
    }
}

impl HostRuntime {
    pub fn new(widget_id: impl Into<String>, config: Config) -> Self {
        Self {
            host: WidgetHost::new(widget_id, config),
        }
    }

    /// Spawns the runtime and returns its command and notice channels.
    pub fn spawn(
        widget_id: impl Into<String>,
        config: Config,
    ) -> (mpsc::Sender<HostCommand>, mpsc::Receiver<HostNotice>) {
        let (cmd_tx, cmd_rx) = mpsc::channel::<HostCommand>(100);
        let (notice_tx, notice_rx) = mpsc::channel::<HostNotice>(100);
        let runtime = Self::new(widget_id, config);
        tokio::spawn(runtime.run(cmd_rx, notice_tx));
        (cmd_tx, notice_rx)
    }

    /// Main loop; returns when the command channel closes.
    pub async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<HostCommand>,
        notice_tx: mpsc::Sender<HostNotice>,
    ) {
        info!("Widget host {} started", self.host.widget_id());

        loop {
            let deadline = self.host.next_deadline();
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    if let Some(notice) = self.handle(cmd) {
                        if notice_tx.send(notice).await.is_err() {
                            debug!("Notice receiver dropped for widget {}", self.host.widget_id());
                        }
                    }
                }
                _ = sleep_until(deadline) => {
                    self.host.fire_due(Instant::now());
                }
            }
        }

        self.host.close();
        info!("Widget host {} stopped", self.host.widget_id());
    }

    fn handle(&mut self, cmd: HostCommand) -> Option<HostNotice> {
        let now = Instant::now();
        match cmd {
            HostCommand::Mount { template, reply } => {
                let _ = reply.send(self.host.ensure_template(&template, now));
                None
            }
            HostCommand::Attach(frame) => {
                self.host.attach(frame);
                None
            }
            HostCommand::Detach => {
                self.host.detach();
                None
            }
            HostCommand::SetPayload { data, params } => {
                if let Err(e) = self.host.set_payload(data, params, now) {
                    debug!("Payload for widget {} dropped: {e}", self.host.widget_id());
                }
                None
            }
            HostCommand::Inbound(raw) => self.host.receive_str(&raw, now),
            HostCommand::Capture {
                pixel_ratio,
                hide_numbers,
                reply,
            } => {
                let _ = reply.send(self.host.request_capture(pixel_ratio, hide_numbers));
                None
            }
            HostCommand::Unmount => {
                self.host.close();
                None
            }
        }
    }
}
