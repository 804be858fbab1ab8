//! The run orchestrator: validates the configuration, admits connection
//! workers at the ramp-up rate, and owns the render/drain/signal tasks.
//!
//! There is no cooperative cancellation of in-flight workers: the interrupt
//! handler prints the final metrics and exits the process immediately, since
//! workers hold no durable state.

use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info};

use crate::config::{ConfigError, RunConfig};
use crate::message::{new_message_source, MessageGetter};
use crate::metrics::{LogBuffer, Metrics};
use crate::output::{ConsoleOutput, FileOutput, Printer};
use crate::template::SeqRegistry;
use crate::transport::Connector;
use crate::worker::Worker;

pub struct Generator {
    cfg: RunConfig,
    worker: Worker,
    metrics: Arc<Metrics>,
    printer: Arc<dyn Printer>,
}

impl Generator {
    /// Fatal configuration errors (missing target, unparsable templates,
    /// unopenable files) surface here, before any connection is attempted.
    pub async fn new(cfg: RunConfig) -> Result<Self, ConfigError> {
        if cfg.total_conns == 0 {
            return Err(ConfigError::MissingConnections);
        }

        let registry = Arc::new(SeqRegistry::new());
        let load = build_source(&cfg.load_message, "load", Arc::clone(&registry)).await?;
        let auth = build_source(&cfg.auth_message, "auth", registry).await?;

        let printer: Arc<dyn Printer> = match &cfg.out_file {
            Some(path) => Arc::new(FileOutput::create(path).map_err(|source| {
                ConfigError::OutFile {
                    path: path.clone(),
                    source,
                }
            })?),
            None => Arc::new(ConsoleOutput::new()),
        };

        let metrics = Metrics::new(cfg.total_conns);
        let worker = Worker {
            connector: Arc::new(Connector::new(cfg.url.clone(), cfg.headers.clone())),
            auth,
            load,
            wait_before_auth: cfg.wait_before_auth,
            wait_after_auth: cfg.wait_after_auth,
            message_interval: cfg.message_interval,
            metrics: Arc::clone(&metrics),
        };

        Ok(Self {
            cfg,
            worker,
            metrics,
            printer,
        })
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Admits workers once per second at the ramp-up rate until the target
    /// count is reached, returning every admitted worker's handle.
    pub async fn ramp_up(&self) -> Vec<JoinHandle<()>> {
        let total = self.cfg.total_conns;
        let per_second = self.cfg.ramp_up_per_sec.max(1);

        let mut handles = Vec::with_capacity(total as usize);
        let mut ticker = interval(Duration::from_secs(1));
        while (handles.len() as u64) < total {
            ticker.tick().await;
            for _ in 0..per_second {
                if handles.len() as u64 >= total {
                    break;
                }
                handles.push(tokio::spawn(self.worker.clone().run()));
            }
            debug!("admitted {} of {} connections", handles.len(), total);
        }
        handles
    }

    pub async fn run(self, logs: LogBuffer) -> Result<()> {
        self.metrics.spawn_error_drain(logs);
        self.metrics
            .spawn_render_loop(Arc::clone(&self.printer), self.cfg.print_interval);
        self.spawn_signal_handler();

        info!(
            "starting load generation: {} connections at {}/s",
            self.cfg.total_conns, self.cfg.ramp_up_per_sec
        );

        if self.cfg.out_file.is_some() {
            let handles = self.ramp_up().await;
            for handle in handles {
                let _ = handle.await;
            }
            // All workers are done; the interrupt handler owns the exit path.
            std::future::pending::<()>().await;
            Ok(())
        } else {
            let printer = Arc::clone(&self.printer);
            tokio::spawn(async move {
                for handle in self.ramp_up().await {
                    let _ = handle.await;
                }
            });
            printer.start().await;
            Ok(())
        }
    }

    fn spawn_signal_handler(&self) -> JoinHandle<()> {
        let printer = Arc::clone(&self.printer);
        let metrics = Arc::clone(&self.metrics);
        tokio::spawn(async move {
            if let Err(err) = signal::ctrl_c().await {
                error!("error while waiting for the interrupt signal: {err}");
                return;
            }
            printer.stop();
            metrics.print_final();
            process::exit(0);
        })
    }
}

async fn build_source(
    spec: &str,
    role: &'static str,
    registry: Arc<SeqRegistry>,
) -> Result<Option<Arc<dyn MessageGetter>>, ConfigError> {
    if spec.is_empty() {
        return Ok(None);
    }
    new_message_source(spec, registry)
        .await
        .map(Some)
        .map_err(|source| ConfigError::Message { role, source })
}
