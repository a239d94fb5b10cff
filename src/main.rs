// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{net::Ipv4Addr, path::Path, sync::Arc};

use anyhow::{Context, Result};
use exanodes_lum::{
    cfg::{config::Config, logger::init_logger},
    cluster::{algo::PrEngine, comm::LoopbackNet, node::NodeSet},
    errors::LumError,
    export::export::Export,
    lum::{
        blockdevice::RamVolumeStore,
        executive::{BdevAdapter, LumExecutive},
    },
    registry::{
        reconcile::{self, RecoveryActions, local::local_workflows},
        service::ExportsService,
        table::ExportTable,
    },
    scsi::dispatch::ScsiCore,
    target::{core::TargetCore, listener::run_listener},
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

struct DaemonRecovery {
    executive: Arc<LumExecutive>,
    target: Arc<TargetCore>,
    listen_address: Ipv4Addr,
    cancel: CancellationToken,
}

impl RecoveryActions for DaemonRecovery {
    fn set_peers(&self) -> Result<(), LumError> {
        Ok(())
    }

    fn listen_addresses(&self) -> Vec<Ipv4Addr> {
        vec![self.listen_address]
    }

    fn install_membership(&self, _nodes: &NodeSet) -> Result<(), LumError> {
        Ok(())
    }

    fn install_target_addresses(&self, addrs: &[Ipv4Addr]) -> Result<(), LumError> {
        self.target.set_cluster_addresses(addrs);
        Ok(())
    }

    fn republish(&self, table: &mut ExportTable) -> Result<(), LumError> {
        let mut buf = vec![0u8; Export::serialized_size()];
        for adm in table.iter_mut() {
            adm.export().serialize(&mut buf)?;
            match self.executive.export(&buf) {
                Ok(()) => adm.set_published(true),
                Err(LumError::NotFound) => {
                    warn!(
                        "export {} has no started volume on this node",
                        adm.export().uuid()
                    );
                },
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn start_target(&self) -> Result<(), LumError> {
        let core = self.target.clone();
        let addr = self.listen_address;
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = run_listener(core, addr, cancel).await {
                warn!("iSCSI listener failed: {e}");
            }
        });
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let config_path = args.next().unwrap_or_else(|| "exanodes.yaml".to_string());
    let logger_path = args.next().unwrap_or_else(|| "config_logger.yaml".to_string());

    let _logger_guard = init_logger(&logger_path)?;

    let cfg = Config::load_from_file(&config_path)
        .with_context(|| format!("failed to load config {config_path}"))?;
    let node_id = cfg.node_id();
    let target_iqn = cfg.target_iqn()?;
    info!("starting LUM core as {node_id}, target {target_iqn}");

    // SCSI core + cluster-ordered reservation engine (single-node transport)
    let scsi = ScsiCore::new(node_id, cfg.target.buffer_size);
    let net = LoopbackNet::new();
    let (link, inbound) = net.join(node_id);
    let (engine, pr_handle) = PrEngine::new(scsi.clone(), link, inbound);
    scsi.bind_pr_engine(pr_handle.clone());
    tokio::spawn(engine.run());
    pr_handle.set_membership([node_id].into_iter().collect());

    // the iSCSI target doubles as the SCSI transport and the iSCSI adapter
    let target = TargetCore::new(
        scsi.clone(),
        target_iqn,
        cfg.target.queue_depth,
        cfg.target.buffer_size,
    );
    scsi.bind_transport(target.clone());

    let store = RamVolumeStore::new();
    let executive =
        LumExecutive::new(store.clone(), target.clone(), BdevAdapter::new());

    // registry: load the persisted catalog, then reconcile (single node)
    let mut service = ExportsService::open(Path::new(&cfg.storage.cache_dir))?;
    info!(
        "loaded {} exports at version {}",
        service.table().number(),
        service.table().version()
    );

    // demo volume store: back every cataloged export with a 64 MiB RAM volume
    for adm in service.table().iter() {
        store.create_volume(*adm.export().uuid(), 131_072);
    }

    let cancel = CancellationToken::new();
    let recovery = DaemonRecovery {
        executive,
        target: target.clone(),
        listen_address: cfg.target.listen_address,
        cancel: cancel.clone(),
    };
    let workflow = local_workflows([node_id].into_iter().collect())
        .into_iter()
        .next()
        .expect("one workflow for one node");

    let file = service.file().clone();
    let rc =
        reconcile::reconcile(&workflow, &recovery, service.table_mut(), &file).await;
    anyhow::ensure!(rc.is_success(), "recovery failed: {rc}");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    cancel.cancel();
    Ok(())
}
