//! LED indicator actor.
//!
//! [`LedIndicator`] is a cheap, cloneable handle: every call only queues a
//! command and returns. The [`LedDriver`] owns both outputs and runs each
//! flash sequence as its own task, cancellable through a
//! [`CancellationToken`].
//!
//! A request of one kind first stops any sequence of the opposite kind and
//! forces that output low; a request of the same kind restarts its
//! sequence. Failures to reach the I/O port are logged per step and never
//! abort a sequence.

use log::{debug, info, trace, warn};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_graceful_shutdown::SubsystemHandle;
use tokio_util::sync::CancellationToken;

use checkpoint_core::led::{startup_steps, FlashStep};
use checkpoint_core::{LedKind, LedRequest};

use crate::config::LedConfig;
use crate::device::IoPort;
use crate::error::CheckpointError;

#[derive(Debug)]
enum LedCommand {
    Startup,
    Flash(LedRequest),
}

#[derive(Clone, Debug)]
pub struct LedIndicator {
    tx: mpsc::UnboundedSender<LedCommand>,
}

impl LedIndicator {
    /// Handle for a station without LEDs; every call is dropped
    pub fn disabled() -> Self {
        let (tx, _) = mpsc::unbounded_channel();
        LedIndicator { tx }
    }

    pub fn indicate_on_startup(&self) {
        self.send(LedCommand::Startup);
    }

    pub fn indicate_success(&self, flash_duration_ms: u64, repeat_count: u32) {
        self.send(LedCommand::Flash(LedRequest::new(
            LedKind::Success,
            flash_duration_ms,
            repeat_count,
        )));
    }

    pub fn indicate_failure(&self, flash_duration_ms: u64, repeat_count: u32) {
        self.send(LedCommand::Flash(LedRequest::new(
            LedKind::Failure,
            flash_duration_ms,
            repeat_count,
        )));
    }

    fn send(&self, command: LedCommand) {
        if let Err(e) = self.tx.send(command) {
            trace!("LED: dropped {:?}, no driver", e.0);
        }
    }
}

struct Sequence {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    /// Output this sequence forces low
    reset: Option<u32>,
}

impl Sequence {
    async fn stop(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}

pub struct LedDriver {
    rx: mpsc::UnboundedReceiver<LedCommand>,
    port: Arc<dyn IoPort>,
    success_port: u32,
    failure_port: u32,
    running: HashMap<LedKind, Sequence>,
    startup: Option<Sequence>,
}

impl LedDriver {
    pub fn new(config: &LedConfig, port: Arc<dyn IoPort>) -> (LedIndicator, LedDriver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let driver = LedDriver {
            rx,
            port,
            success_port: config.success_port,
            failure_port: config.failure_port,
            running: HashMap::new(),
            startup: None,
        };
        (LedIndicator { tx }, driver)
    }

    fn port_of(&self, kind: LedKind) -> u32 {
        match kind {
            LedKind::Success => self.success_port,
            LedKind::Failure => self.failure_port,
        }
    }

    pub async fn run(self, subsys: SubsystemHandle) -> Result<(), CheckpointError> {
        info!(
            "LED: driving success port {} and failure port {}",
            self.success_port, self.failure_port
        );
        self.serve(subsys.on_shutdown_requested()).await;
        Ok(())
    }

    /// Process commands until `shutdown` completes or every handle is gone,
    /// then leave both outputs low.
    pub async fn serve(mut self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    debug!("LED: shutdown requested");
                    break;
                }
                command = self.rx.recv() => match command {
                    Some(LedCommand::Startup) => self.startup().await,
                    Some(LedCommand::Flash(request)) => self.flash(request).await,
                    None => break,
                },
            }
        }

        self.stop_all().await;
        for port in [self.success_port, self.failure_port] {
            set_port(self.port.as_ref(), port, false).await;
        }
    }

    async fn stop_all(&mut self) {
        if let Some(sequence) = self.startup.take() {
            sequence.stop().await;
        }
        for (_, sequence) in self.running.drain() {
            sequence.stop().await;
        }
    }

    async fn startup(&mut self) {
        self.stop_all().await;
        let ports = vec![self.success_port, self.failure_port];
        self.startup = Some(self.spawn(ports, startup_steps(), None));
    }

    async fn flash(&mut self, request: LedRequest) {
        let opposite = request.kind.opposite();
        let mut reset = None;
        if let Some(sequence) = self.startup.take() {
            sequence.stop().await;
            reset = Some(self.port_of(opposite));
        }
        if let Some(sequence) = self.running.remove(&opposite) {
            debug!("LED: {} cancels running {} sequence", request.kind, opposite);
            sequence.stop().await;
            reset = Some(self.port_of(opposite));
        }
        if let Some(sequence) = self.running.remove(&request.kind) {
            debug!("LED: restarting {} sequence", request.kind);
            reset = reset.or(sequence.reset);
            sequence.stop().await;
        }

        trace!("LED: {:?}", request);
        let sequence = self.spawn(vec![self.port_of(request.kind)], request.steps(), reset);
        self.running.insert(request.kind, sequence);
    }

    /// Run `steps` on `ports` as a task. `reset` is forced low alongside the
    /// first step. Cancellation interrupts port calls as well as holds.
    fn spawn(&self, ports: Vec<u32>, steps: Vec<FlashStep>, reset: Option<u32>) -> Sequence {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let io = self.port.clone();
        let handle = tokio::spawn(async move {
            let reset_low = async {
                if let Some(port) = reset {
                    set_port(io.as_ref(), port, false).await;
                }
            };
            let sequence = async {
                for step in steps {
                    for port in &ports {
                        set_port(io.as_ref(), *port, step.active).await;
                    }
                    if step.hold_ms > 0 {
                        tokio::time::sleep(Duration::from_millis(step.hold_ms)).await;
                    }
                }
            };
            tokio::select! {
                _ = token.cancelled() => {}
                _ = async { tokio::join!(reset_low, sequence) } => {}
            }
        });
        Sequence {
            cancel,
            handle,
            reset,
        }
    }
}

async fn set_port(io: &dyn IoPort, port: u32, active: bool) {
    if let Err(e) = io.set_state(port, active).await {
        warn!("LED: cannot set port {} to {}: {}", port, active, e);
    }
}
