use crate::{
    core::{DeployStyle, DEFAULT_CONTROLLER_NAME, DEFAULT_SERVICES_PARTITION},
    deploy::{self, DeployMetrics, DeployPipeline, PlanDeployer},
    index::{self, NodeFabricCache, TopologyCache},
    k8s::{
        gateway::{Gateway, GatewayClass, HttpRoute, ReferenceGrant},
        Endpoints, Namespace, Node, Secret, Service,
    },
    render::SnapshotBuilder,
    watch::{Deploys, NodeWatch, SyncGate, Watch, Watched},
};
use anyhow::{bail, Result};
use clap::Parser;
use kube::runtime::watcher;
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{info, info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(
    name = "bigip-gateway-controller",
    about = "Renders Gateway API resources into BIG-IP partitions"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "bigip_gateway_controller=info,warn",
        env = "BIGIP_GATEWAY_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// The GatewayClass `controllerName` handled by this controller.
    #[clap(long, default_value = DEFAULT_CONTROLLER_NAME)]
    controller_name: String,

    /// How configuration is shaped for the device: `rest` or `as3`.
    #[clap(long, default_value = "rest")]
    deploy_style: DeployStyle,

    /// The partition holding pools shared by every class.
    #[clap(long, default_value = DEFAULT_SERVICES_PARTITION)]
    services_partition: String,

    #[clap(long, default_value = "16")]
    deploy_queue_size: usize,

    /// Holds a pipeline-wide lock for the whole of each event's
    /// render-mutate-render window.
    #[clap(long)]
    serialize_deploys: bool,

    #[clap(long, default_value = "500")]
    retry_delay_ms: u64,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            admin,
            controller_name,
            deploy_style,
            services_partition,
            deploy_queue_size,
            serialize_deploys,
            retry_delay_ms,
        } = self;

        if deploy_queue_size == 0 {
            bail!("--deploy-queue-size must be at least 1");
        }

        let cache = TopologyCache::shared(controller_name);
        let nodes = NodeFabricCache::shared();

        let mut prom = <Registry>::default();
        index::metrics::register(&mut prom, cache.clone(), nodes.clone());
        let deploy_metrics = DeployMetrics::register(prom.sub_registry_with_prefix("deploy"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        let builder = SnapshotBuilder::new(cache.clone(), nodes, deploy_style, services_partition);
        let (pipeline, requests) = DeployPipeline::new(
            builder,
            deploy_queue_size,
            serialize_deploys,
            deploy_metrics.clone(),
        );
        let deploys = Deploys::new(
            Arc::new(pipeline),
            Duration::from_millis(retry_delay_ms),
        );
        info!(
            controller = %cache.controller_name(),
            style = %deploy_style,
            serialize_deploys,
            "Starting"
        );

        // Spawn resource watches.

        let gate = SyncGate::new(cache);
        spawn_watch::<GatewayClass, _>(&mut runtime, &deploys, &gate, "gatewayclasses");
        spawn_watch::<Gateway, _>(&mut runtime, &deploys, &gate, "gateways");
        spawn_watch::<HttpRoute, _>(&mut runtime, &deploys, &gate, "httproutes");
        spawn_watch::<ReferenceGrant, _>(&mut runtime, &deploys, &gate, "referencegrants");
        spawn_watch::<Secret, _>(&mut runtime, &deploys, &gate, "secrets");
        spawn_watch::<Service, _>(&mut runtime, &deploys, &gate, "services");
        spawn_watch::<Endpoints, _>(&mut runtime, &deploys, &gate, "endpoints");
        spawn_watch::<Namespace, _>(&mut runtime, &deploys, &gate, "namespaces");

        let node_events = runtime.watch_all::<Node>(watcher::Config::default());
        tokio::spawn(
            NodeWatch::new(deploys.clone(), gate.token())
                .run(node_events)
                .instrument(info_span!("nodes")),
        );

        if gate.release() {
            let deploys = deploys.clone();
            tokio::spawn(async move { deploys.initial().await }.instrument(info_span!("sync")));
        }

        // Spawn the deploy consumer. Watches hold the pipeline for the life
        // of the process, so the queue is closed by the shutdown signal.
        let controller = deploy::Controller::new(PlanDeployer::default(), requests, deploy_metrics);
        tokio::spawn(
            consume(controller, runtime.shutdown_handle()).instrument(info_span!("deploy")),
        );

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

fn spawn_watch<K, S: 'static>(
    runtime: &mut kubert::Runtime<S>,
    deploys: &Deploys,
    gate: &SyncGate,
    name: &'static str,
) where
    K: Watched,
{
    let events = runtime.watch_all::<K>(watcher::Config::default());
    tokio::spawn(
        Watch::new(deploys.clone(), gate.token())
            .run(events)
            .instrument(info_span!("watch", kind = name)),
    );
}

/// Delivers deploy requests until shutdown, holding the shutdown open until
/// the requests already queued have been delivered.
async fn consume(controller: deploy::Controller<PlanDeployer>, drain: drain::Watch) {
    let release = controller.run_until(drain.signaled()).await;
    drop(release);
}
