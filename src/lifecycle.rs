//! Lifecycle coordinator.
//! Connects the device, supervises the telemetry and command tasks, and drains
//! them before shutting the session down.

use crate::command::CommandHandler;
use crate::device::Device;
use crate::error::{DeviceError, Result};
use crate::listener::run_command_listener;
use crate::telemetry::run_telemetry;
use log::{debug, error, info, warn};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Starting,
    Connected,
    Running,
    Draining,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskKind {
    Telemetry,
    CommandListener,
}

type TaskOutcome = (TaskKind, Result<()>);

/// Owns the device's concurrent tasks and the single token that cancels them.
pub struct Coordinator {
    device: Device,
    handler: Arc<dyn CommandHandler>,
    telemetry_interval: Duration,
    cancel: CancellationToken,
    tasks: JoinSet<TaskOutcome>,
    state_tx: watch::Sender<LifecycleState>,
}

impl Coordinator {
    pub fn new(
        device: Device,
        handler: Arc<dyn CommandHandler>,
        telemetry_interval: Duration,
    ) -> Self {
        let (state_tx, _) = watch::channel(LifecycleState::Starting);
        Self {
            device,
            handler,
            telemetry_interval,
            cancel: CancellationToken::new(),
            tasks: JoinSet::new(),
            state_tx,
        }
    }

    /// Follow lifecycle transitions.
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state_tx.subscribe()
    }

    fn transition(&self, next: LifecycleState) {
        let previous = self.state_tx.send_replace(next);
        debug!("Lifecycle {:?} -> {:?}", previous, next);
    }

    /// Runs the device until `quit` resolves or a task fails.
    ///
    /// A failed initial connect is returned immediately. Otherwise the tasks
    /// are cancelled and joined, the session is shut down, and the first fatal
    /// task error (if any) is returned.
    pub async fn run<Q>(mut self, quit: Q) -> Result<()>
    where
        Q: Future<Output = ()>,
    {
        self.transition(LifecycleState::Starting);
        if let Err(e) = self.device.connect().await {
            error!("Startup failed: {}", e);
            self.transition(LifecycleState::Stopped);
            return Err(e);
        }
        self.transition(LifecycleState::Connected);

        self.spawn_tasks();
        self.transition(LifecycleState::Running);

        let mut failure = self.supervise(quit).await;

        self.transition(LifecycleState::Draining);
        self.cancel.cancel();
        while let Some(joined) = self.tasks.join_next().await {
            if let Some(e) = task_error(joined) {
                failure.get_or_insert(e);
            }
        }

        if let Err(e) = self.device.shutdown().await {
            warn!("Session shutdown failed: {}", e);
        }
        self.transition(LifecycleState::Stopped);
        info!("Device stopped");

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn spawn_tasks(&mut self) {
        let device = self.device.clone();
        let interval = self.telemetry_interval;
        let cancel = self.cancel.child_token();
        self.tasks.spawn(async move {
            (
                TaskKind::Telemetry,
                run_telemetry(device, interval, cancel).await,
            )
        });

        let device = self.device.clone();
        let handler = self.handler.clone();
        let cancel = self.cancel.child_token();
        self.tasks.spawn(async move {
            (
                TaskKind::CommandListener,
                run_command_listener(device, handler, cancel).await,
            )
        });
    }

    /// Waits for the quit signal or the first task failure.
    async fn supervise<Q>(&mut self, quit: Q) -> Option<DeviceError>
    where
        Q: Future<Output = ()>,
    {
        tokio::pin!(quit);
        loop {
            tokio::select! {
                _ = &mut quit => {
                    info!("Quit requested");
                    return None;
                }
                joined = self.tasks.join_next() => match joined {
                    Some(joined) => {
                        if let Some(e) = task_error(joined) {
                            return Some(e);
                        }
                    }
                    None => {
                        // Every task ended on its own; only quit is left to wait for.
                        (&mut quit).await;
                        info!("Quit requested");
                        return None;
                    }
                },
            }
        }
    }
}

fn task_error(joined: std::result::Result<TaskOutcome, JoinError>) -> Option<DeviceError> {
    match joined {
        Ok((kind, Ok(()))) => {
            info!("{:?} task finished", kind);
            None
        }
        Ok((kind, Err(e))) => {
            error!("{:?} task failed: {}", kind, e);
            Some(e)
        }
        Err(e) => {
            error!("Task did not complete: {}", e);
            Some(DeviceError::Task(e.to_string()))
        }
    }
}
