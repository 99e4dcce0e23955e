//! Daemon assembly and lifecycle.
//!
//! The [`Orchestrator`] loads the configuration, builds the control plane,
//! wires its channels and runs it until SIGTERM or SIGINT.
//!
//! Outbound switch commands are handed to whoever takes the receiver with
//! [`Orchestrator::take_command_receiver`]. If nobody does, a logger task
//! drains and logs them so the control plane never blocks on a full queue.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, mpsc};

use scipass_coordinator::{ControlPlane, ControlPlaneBuilder, Controller, CoordinatorConfig};
use scipass_core::config::ScipassConfig;
use scipass_core::event::{CommandEvent, ControlEvent};
use scipass_core::pipeline::Pipeline;

use crate::health::{DaemonHealth, ModuleHealth, aggregate_status};
use crate::metrics_server;

const CONTROL_PLANE_MODULE: &str = "control-plane";

pub struct Orchestrator {
    config: ScipassConfig,
    plane: ControlPlane,
    shutdown_tx: broadcast::Sender<()>,
    start_time: Instant,
    command_rx: Option<mpsc::Receiver<CommandEvent>>,
    pid_file: Option<PathBuf>,
}

impl Orchestrator {
    /// Load `scipass.toml` (with environment overrides) and build.
    pub async fn build(config_path: &Path) -> Result<Self> {
        let config = ScipassConfig::load(config_path)
            .await
            .with_context(|| format!("failed to load config {}", config_path.display()))?;
        Self::build_from_config(config)
    }

    /// Build from an already-loaded configuration.
    ///
    /// Installs the metrics recorder when `[metrics]` is enabled, so call
    /// this at most once per process with metrics on.
    pub fn build_from_config(config: ScipassConfig) -> Result<Self> {
        config.validate().context("config validation failed")?;

        if config.metrics.enabled {
            metrics_server::install_metrics_recorder(&config.metrics)?;
        }

        let (plane, command_rx) = ControlPlaneBuilder::new()
            .config(CoordinatorConfig::from_core(&config))
            .build()
            .context("failed to build control plane")?;
        let (shutdown_tx, _) = broadcast::channel(16);
        let pid_file = (!config.general.pid_file.is_empty())
            .then(|| PathBuf::from(&config.general.pid_file));

        tracing::info!(
            switches = config.switches.len(),
            persistence = config.persistence.enabled,
            "orchestrator initialized"
        );

        Ok(Self {
            config,
            plane,
            shutdown_tx,
            start_time: Instant::now(),
            command_rx,
            pid_file,
        })
    }

    pub fn config(&self) -> &ScipassConfig {
        &self.config
    }

    /// Sender for switch events from the transport.
    pub fn event_sender(&self) -> mpsc::Sender<ControlEvent> {
        self.plane.event_sender()
    }

    /// Shared controller, for signals and queries.
    pub fn controller(&self) -> Arc<Controller> {
        self.plane.controller()
    }

    /// Outbound switch commands. `None` once taken.
    pub fn take_command_receiver(&mut self) -> Option<mpsc::Receiver<CommandEvent>> {
        self.command_rx.take()
    }

    /// Start the control plane and run until a shutdown signal arrives.
    pub async fn run(&mut self) -> Result<()> {
        self.start().await?;

        let signal = wait_for_shutdown_signal().await?;
        tracing::info!(signal = signal, "shutdown signal received");

        self.shutdown().await
    }

    /// Write the pid file, start the control plane and its helper tasks.
    ///
    /// On failure the pid file is removed again.
    pub async fn start(&mut self) -> Result<()> {
        if let Some(path) = &self.pid_file {
            write_pid_file(path)?;
        }

        if let Err(e) = self.plane.start().await {
            tracing::error!(error = %e, "control plane failed to start");
            if let Some(path) = &self.pid_file {
                remove_pid_file(path);
            }
            return Err(e).context("failed to start control plane");
        }

        if let Some(command_rx) = self.command_rx.take() {
            tracing::debug!("no transport attached, logging outbound commands");
            spawn_command_logger(command_rx, self.shutdown_tx.subscribe());
        }
        if self.config.metrics.enabled {
            spawn_uptime_updater(self.start_time, self.shutdown_tx.subscribe());
        }

        tracing::info!("scipass daemon running");
        Ok(())
    }

    /// Stop helper tasks and the control plane, then remove the pid file.
    pub async fn shutdown(&mut self) -> Result<()> {
        tracing::info!("broadcasting shutdown to background tasks");
        let _ = self.shutdown_tx.send(());

        let result = self
            .plane
            .stop()
            .await
            .context("failed to stop control plane");

        if let Some(path) = &self.pid_file {
            remove_pid_file(path);
        }
        tracing::info!("scipass daemon stopped");
        result
    }

    /// Current aggregated health.
    pub async fn health(&self) -> DaemonHealth {
        let modules = vec![ModuleHealth {
            name: CONTROL_PLANE_MODULE.to_owned(),
            enabled: true,
            status: self.plane.health_check().await,
        }];
        let uptime_secs = self.start_time.elapsed().as_secs();

        if self.config.metrics.enabled {
            #[allow(clippy::cast_precision_loss)]
            metrics::gauge!(scipass_core::metrics::DAEMON_UPTIME_SECONDS).set(uptime_secs as f64);
        }

        DaemonHealth {
            status: aggregate_status(&modules),
            uptime_secs,
            connected_switches: self.plane.controller().switches().await.len(),
            modules,
        }
    }
}

/// Wait for SIGTERM or SIGINT and return its name.
async fn wait_for_shutdown_signal() -> Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm =
            signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
        let mut sigint =
            signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;

        tokio::select! {
            _ = sigterm.recv() => Ok("SIGTERM"),
            _ = sigint.recv() => Ok("SIGINT"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for ctrl-c")?;
        Ok("ctrl-c")
    }
}

/// Create the pid file, refusing to overwrite an existing one.
///
/// The parent directory is created with mode 0700 and the file with
/// mode 0600. The error for an existing file names the pid it holds.
pub fn write_pid_file(path: &Path) -> Result<()> {
    use std::fs::{self, OpenOptions};

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        let mut builder = fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(0o700);
        }
        builder
            .create(parent)
            .with_context(|| format!("failed to create pid directory {}", parent.display()))?;
    }

    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = match options.open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            let existing = fs::read_to_string(path).unwrap_or_default();
            return Err(anyhow::anyhow!(
                "PID file {} already exists (pid {}); is another scipass-daemon running?",
                path.display(),
                existing.trim()
            ));
        }
        Err(e) => {
            return Err(e).with_context(|| format!("failed to create PID file {}", path.display()));
        }
    };

    let pid = std::process::id();
    writeln!(file, "{pid}")?;

    tracing::info!(pid = pid, path = %path.display(), "PID file written");
    Ok(())
}

/// Remove the pid file. Failures are logged, never returned.
pub fn remove_pid_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        tracing::warn!(path = %path.display(), error = %e, "failed to remove PID file");
    } else {
        tracing::info!(path = %path.display(), "PID file removed");
    }
}

/// Drain outbound commands into the log until shutdown or channel close.
pub fn spawn_command_logger(
    mut command_rx: mpsc::Receiver<CommandEvent>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                command = command_rx.recv() => {
                    match command {
                        Some(command) => {
                            tracing::info!(
                                command_id = %command.id,
                                trace_id = %command.metadata.trace_id,
                                switch = %command.switch,
                                domain = command.domain.as_deref().unwrap_or("-"),
                                command = %command.command,
                                "switch command"
                            );
                        }
                        None => {
                            tracing::debug!("command channel closed, exiting logger");
                            break;
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::debug!("command logger shutting down");
                    break;
                }
            }
        }
    })
}

/// Refresh the uptime gauge every 10 seconds.
fn spawn_uptime_updater(
    start_time: Instant,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    use scipass_core::metrics as m;

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(10));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    #[allow(clippy::cast_precision_loss)]
                    metrics::gauge!(m::DAEMON_UPTIME_SECONDS).set(start_time.elapsed().as_secs() as f64);
                }
                _ = shutdown_rx.recv() => {
                    tracing::debug!("uptime updater shutting down");
                    break;
                }
            }
        }
    })
}
