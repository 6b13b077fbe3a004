use bigip_gateway_controller_core::{plan::plan, DeployRequest, Deployer, PartitionAction};
use tracing::{debug, info};

/// Logs the operations each request would apply without contacting a device.
#[derive(Clone, Debug, Default)]
pub struct PlanDeployer(());

#[async_trait::async_trait]
impl Deployer for PlanDeployer {
    async fn deploy(&self, request: &DeployRequest) -> anyhow::Result<()> {
        let partition = &request.partition;
        if request.action == Some(PartitionAction::Create) {
            info!(%partition, "Create partition");
        }

        let ops = plan(&request.from, &request.to);
        if ops.is_empty() {
            debug!(%partition, meta = %request.meta, "No changes");
        }
        for op in &ops {
            info!(
                %partition,
                folder = %op.folder(),
                path = %op.path(),
                "{}",
                op.verb()
            );
        }

        if request.action == Some(PartitionAction::Delete) {
            info!(%partition, "Delete partition");
        }
        Ok(())
    }
}
