use crate::metrics::DeployMetrics;
use bigip_gateway_controller_core::{DeployRequest, Deployer, Error};
use std::{
    future::{self, Future},
    sync::Arc,
};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info};

const REPORTS_CAPACITY: usize = 64;

/// The outcome of delivering one request.
#[derive(Clone, Debug)]
pub struct DeployReport {
    pub partition: String,
    pub meta: String,
    /// Failures are [`Error::Device`].
    pub result: Result<(), Arc<Error>>,
}

/// Drains the deploy queue into a [`Deployer`], one request at a time.
pub struct Controller<D> {
    deployer: D,
    requests: mpsc::Receiver<DeployRequest>,
    reports: broadcast::Sender<DeployReport>,
    metrics: DeployMetrics,
}

// === impl Controller ===

impl<D: Deployer> Controller<D> {
    pub fn new(
        deployer: D,
        requests: mpsc::Receiver<DeployRequest>,
        metrics: DeployMetrics,
    ) -> Self {
        let (reports, _) = broadcast::channel(REPORTS_CAPACITY);
        Self {
            deployer,
            requests,
            reports,
            metrics,
        }
    }

    /// Subscribes to the outcome of every request delivered after this call.
    pub fn reports(&self) -> broadcast::Receiver<DeployReport> {
        self.reports.subscribe()
    }

    /// Runs until every pipeline feeding the queue has been dropped.
    ///
    /// Failed requests are reported and not retried.
    pub async fn run(self) {
        self.run_until(future::pending::<()>()).await;
    }

    /// Runs until `shutdown` completes, then delivers the requests already
    /// queued and returns the shutdown output.
    pub async fn run_until<F: Future>(mut self, shutdown: F) -> Option<F::Output> {
        tokio::pin!(shutdown);
        let mut signaled = None;
        loop {
            let request = tokio::select! {
                out = &mut shutdown, if signaled.is_none() => {
                    debug!(queued = self.requests.len(), "Closing deploy queue");
                    self.requests.close();
                    signaled = Some(out);
                    continue;
                }
                request = self.requests.recv() => request,
            };
            let Some(request) = request else {
                break;
            };
            self.deliver(request).await;
        }
        info!("Deploy queue closed");
        signaled
    }

    async fn deliver(&self, request: DeployRequest) {
        self.metrics.set_queue_depth(self.requests.len());

        let result = self.deployer.deploy(&request).await;
        let DeployRequest {
            partition, meta, ..
        } = request;
        self.metrics.delivered(&partition, result.is_ok());
        let result = result.map_err(|source| Error::Device {
            partition: partition.clone(),
            source,
        });
        match &result {
            Ok(()) => debug!(%partition, %meta, "Deployed"),
            Err(Error::Device { source, .. }) => {
                error!(%partition, %meta, error = %source, "Deploy failed")
            }
            Err(error) => error!(%partition, %meta, %error, "Deploy failed"),
        }

        // Nobody may be listening.
        let _ = self.reports.send(DeployReport {
            partition,
            meta,
            result: result.map_err(Arc::new),
        });
    }
}
