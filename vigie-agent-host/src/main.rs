//! Vigie Agent Host - node-side half of the monitoring fabric
//!
//! Every `update_interval_secs` the agent:
//! - samples CPU, RAM, disk, network and top processes
//! - picks up new SSH logins from the auth log
//! - sends one signed heartbeat carrying both, plus finished task results
//! - starts the tasks the controller handed back
//!
//! Tasks run concurrently so a 90s speedtest never delays heartbeats.

mod authlog;
mod client;
mod config;
mod execution;
mod metrics;

use anyhow::{Context, Result};
use authlog::AuthLogTailer;
use client::HeartbeatClient;
use config::AgentConfig;
use execution::TaskExecutor;
use metrics::MetricsCollector;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use vigie_proto::{token_prefix, ResultPayload, TaskKind, WireResult, WireStats, WireTask};

/// Runs controller tasks in the background and collects their results.
struct TaskRunner {
    executor: TaskExecutor,
    tx: mpsc::UnboundedSender<WireResult>,
    rx: mpsc::UnboundedReceiver<WireResult>,
}

impl TaskRunner {
    fn new(executor: TaskExecutor) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { executor, tx, rx }
    }

    /// Starts every task. Returns true if a reboot was requested; its
    /// acknowledgement is queued immediately so it leaves with the next
    /// heartbeat, before the host goes down.
    fn dispatch(&self, tasks: Vec<WireTask>, stats: &WireStats) -> bool {
        let mut reboot = false;
        for task in tasks {
            if task.command == TaskKind::Reboot {
                reboot = true;
                let ack = WireResult { command: TaskKind::Reboot, user_id: task.user_id, result: ResultPayload::i18n("reboot_ok") };
                let _ = self.tx.send(ack);
                continue;
            }
            let executor = self.executor.clone();
            let tx = self.tx.clone();
            let stats = stats.clone();
            tokio::spawn(async move {
                let result = executor.execute(task.command, &stats).await;
                let _ = tx.send(WireResult { command: task.command, user_id: task.user_id, result });
            });
        }
        reboot
    }

    fn finished(&mut self) -> Vec<WireResult> {
        let mut done = Vec::new();
        while let Ok(result) = self.rx.try_recv() {
            done.push(result);
        }
        done
    }
}

struct Agent {
    config: AgentConfig,
    metrics: MetricsCollector,
    authlog: AuthLogTailer,
    client: HeartbeatClient,
    runner: TaskRunner,
    pending: Vec<WireTask>,
}

impl Agent {
    fn new(config: AgentConfig) -> Result<Self> {
        let metrics = MetricsCollector::new(&config.external_ip_url).context("Failed to build metrics collector")?;
        let client = HeartbeatClient::new(config.heartbeat_url(), config.token.clone())
            .context("Failed to build heartbeat client")?;
        Ok(Self {
            authlog: AuthLogTailer::new(config.auth_log.clone()),
            runner: TaskRunner::new(TaskExecutor::new(&config.speedtest_bin)),
            metrics,
            client,
            config,
            pending: Vec::new(),
        })
    }

    async fn run(&mut self) -> Result<()> {
        info!(
            "Agent {} reporting to {} every {}s",
            token_prefix(&self.config.token),
            self.config.heartbeat_url(),
            self.config.update_interval_secs
        );
        let mut ticker = interval(Duration::from_secs(self.config.update_interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.cycle().await,
                _ = tokio::signal::ctrl_c() => {
                    info!("Agent stopping");
                    return Ok(());
                }
            }
        }
    }

    /// One heartbeat cycle. Failures only skip the current cycle; buffered
    /// results and logins are retried next time.
    async fn cycle(&mut self) {
        let stats = self.metrics.collect().await;
        self.client.push_logins(self.authlog.poll());

        let reboot = self.runner.dispatch(std::mem::take(&mut self.pending), &stats);
        for result in self.runner.finished() {
            self.client.push_result(result);
        }

        match self.client.send(stats, chrono::Utc::now().timestamp()).await {
            Ok(tasks) => {
                if !tasks.is_empty() {
                    debug!("received {} task(s)", tasks.len());
                }
                self.pending = tasks;
            }
            Err(e) => warn!("heartbeat failed: {e}"),
        }

        if reboot {
            if let Err(e) = execution::reboot_host().await {
                error!("reboot failed: {e}");
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vigie_agent_host=info")))
        .init();

    info!("Vigie Agent Host v{} starting", env!("CARGO_PKG_VERSION"));

    let config = AgentConfig::load().await.context("Failed to load agent configuration")?;
    let mut agent = Agent::new(config).context("Failed to create agent")?;

    agent.run().await.context("Agent execution failed")?;

    Ok(())
}
