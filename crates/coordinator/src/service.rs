//! Control-plane service: the [`Controller`] run as a [`Pipeline`].
//!
//! `start` spawns three tasks:
//! - the event loop, feeding transport events to the controller
//! - the statistics loop, asking every switch for counters each
//!   `stats_interval_secs`
//! - the rebalance loop, running one balancing pass per domain each
//!   `balance_interval_secs`
//!
//! ```ignore
//! let (mut plane, command_rx) = ControlPlaneBuilder::new()
//!     .config(config)
//!     .build()?;
//! let events = plane.event_sender();
//! plane.start().await?;
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use scipass_core::error::{PipelineError, ScipassError};
use scipass_core::event::{CommandEvent, ControlEvent};
use scipass_core::pipeline::{HealthStatus, Pipeline};

use crate::config::CoordinatorConfig;
use crate::controller::Controller;
use crate::error::CoordinatorError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum PlaneState {
    Initialized,
    Running,
    Stopped,
}

pub struct ControlPlane {
    config: CoordinatorConfig,
    state: PlaneState,
    controller: Arc<Controller>,
    event_tx: mpsc::Sender<ControlEvent>,
    event_rx: Option<mpsc::Receiver<ControlEvent>>,
    tasks: Vec<JoinHandle<()>>,
    events_processed: Arc<AtomicU64>,
    rebalance_passes: Arc<AtomicU64>,
}

impl ControlPlane {
    pub fn state_name(&self) -> &str {
        match self.state {
            PlaneState::Initialized => "initialized",
            PlaneState::Running => "running",
            PlaneState::Stopped => "stopped",
        }
    }

    /// Sender for transport events.
    pub fn event_sender(&self) -> mpsc::Sender<ControlEvent> {
        self.event_tx.clone()
    }

    /// Shared controller, for signals and queries.
    pub fn controller(&self) -> Arc<Controller> {
        Arc::clone(&self.controller)
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn events_processed(&self) -> u64 {
        self.events_processed.load(Ordering::Relaxed)
    }

    pub fn rebalance_passes(&self) -> u64 {
        self.rebalance_passes.load(Ordering::Relaxed)
    }
}

impl Pipeline for ControlPlane {
    async fn start(&mut self) -> Result<(), ScipassError> {
        if self.state == PlaneState::Running {
            return Err(PipelineError::AlreadyRunning.into());
        }
        info!("starting control plane");

        let mut event_rx = self.event_rx.take().ok_or(ScipassError::Pipeline(
            PipelineError::InitFailed(
                "event receiver already consumed, rebuild the control plane to restart".to_owned(),
            ),
        ))?;

        let controller = Arc::clone(&self.controller);
        let events_processed = Arc::clone(&self.events_processed);
        self.tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(event) = event_rx.recv() => {
                        events_processed.fetch_add(1, Ordering::Relaxed);
                        controller.handle_event(event).await;
                    }
                    else => {
                        info!("event channel closed, stopping control event loop");
                        break;
                    }
                }
            }
        }));

        let controller = Arc::clone(&self.controller);
        let stats_interval = self.config.stats_interval();
        self.tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(stats_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let requested = controller.request_stats().await;
                debug!(switches = requested, "flow stats requested");
            }
        }));

        let controller = Arc::clone(&self.controller);
        let rebalance_passes = Arc::clone(&self.rebalance_passes);
        let balance_interval = self.config.balance_interval();
        self.tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(balance_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick fires at once; nothing has traffic yet
            ticker.tick().await;
            loop {
                ticker.tick().await;
                controller.rebalance_all().await;
                rebalance_passes.fetch_add(1, Ordering::Relaxed);
            }
        }));

        self.state = PlaneState::Running;
        info!(
            stats_interval_secs = self.config.stats_interval_secs,
            balance_interval_secs = self.config.balance_interval_secs,
            switches = self.config.switches.len(),
            "control plane started"
        );
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), ScipassError> {
        if self.state != PlaneState::Running {
            return Err(PipelineError::NotRunning.into());
        }
        info!("stopping control plane");
        for task in self.tasks.drain(..) {
            task.abort();
            let _ = task.await;
        }
        for switch in self.controller.switches().await {
            self.controller.switch_left(switch).await;
        }
        self.state = PlaneState::Stopped;
        info!("control plane stopped");
        Ok(())
    }

    async fn health_check(&self) -> HealthStatus {
        match self.state {
            PlaneState::Running => {
                if self.tasks.iter().any(JoinHandle::is_finished) {
                    HealthStatus::Unhealthy("a control plane task exited".to_owned())
                } else if self.controller.commands_closed() {
                    HealthStatus::Degraded("command channel closed".to_owned())
                } else {
                    HealthStatus::Healthy
                }
            }
            PlaneState::Initialized => HealthStatus::Unhealthy("not started".to_owned()),
            PlaneState::Stopped => HealthStatus::Unhealthy("stopped".to_owned()),
        }
    }
}

/// Builds a [`ControlPlane`] and its channels.
pub struct ControlPlaneBuilder {
    config: CoordinatorConfig,
    command_tx: Option<mpsc::Sender<CommandEvent>>,
}

impl Default for ControlPlaneBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlPlaneBuilder {
    pub fn new() -> Self {
        Self {
            config: CoordinatorConfig::default(),
            command_tx: None,
        }
    }

    pub fn config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    /// External channel for outbound switch commands. Without one the
    /// builder creates a channel and returns its receiver.
    pub fn command_sender(mut self, tx: mpsc::Sender<CommandEvent>) -> Self {
        self.command_tx = Some(tx);
        self
    }

    /// # Returns
    /// - the control plane
    /// - the command receiver, `None` if an external sender was set
    pub fn build(
        self,
    ) -> Result<(ControlPlane, Option<mpsc::Receiver<CommandEvent>>), CoordinatorError> {
        self.config.validate()?;

        let (command_tx, command_rx) = match self.command_tx {
            Some(tx) => (tx, None),
            None => {
                let (tx, rx) = mpsc::channel(self.config.command_channel_capacity);
                (tx, Some(rx))
            }
        };
        let (event_tx, event_rx) = mpsc::channel(self.config.event_channel_capacity);
        let controller = Arc::new(Controller::new(self.config.clone(), command_tx));

        let plane = ControlPlane {
            config: self.config,
            state: PlaneState::Initialized,
            controller,
            event_tx,
            event_rx: Some(event_rx),
            tasks: Vec::new(),
            events_processed: Arc::new(AtomicU64::new(0)),
            rebalance_passes: Arc::new(AtomicU64::new(0)),
        };
        Ok((plane, command_rx))
    }
}
