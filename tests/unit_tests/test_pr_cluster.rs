// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Cross-node reservation behavior: every node applies the same event order
//! and ends with the same reservation state.

use std::sync::Arc;

use exanodes_lum::{
    cluster::{
        algo::{PrEngine, PrEngineHandle},
        comm::LoopbackNet,
        event::{ClusterEvent, global_session_id},
        node::{NodeId, NodeSet},
        pr::PrStatus,
    },
    export::lun::Lun,
    scsi::{
        dispatch::{ScsiCore, ScsiTransport},
        sense::SENSE_LEN,
    },
};

/// The reservation tests never raise unit attentions; a silent transport
/// keeps the cores happy.
struct NullTransport;

impl ScsiTransport for NullTransport {
    fn update_lun_access_authorizations(
        &self,
        _export: &exanodes_lum::export::export::Export,
    ) {
    }

    fn async_event(&self, _id: usize, _lun: Lun, _sense: [u8; SENSE_LEN]) {}

    fn async_event_all_sessions(&self, _lun: Lun, _sense: [u8; SENSE_LEN]) {}
}

fn cluster(n: u32) -> Vec<(Arc<ScsiCore>, PrEngineHandle)> {
    let net = LoopbackNet::new();
    let membership: NodeSet = (0..n).map(NodeId::new).collect();
    let mut out = Vec::new();
    for id in 0..n {
        let node = NodeId::new(id);
        let scsi = ScsiCore::new(node, 262_144);
        scsi.bind_transport(Arc::new(NullTransport));
        let (link, inbound) = net.join(node);
        let (engine, handle) = PrEngine::new(scsi.clone(), link, inbound);
        scsi.bind_pr_engine(handle.clone());
        handle.set_membership(membership.clone());
        tokio::spawn(engine.run());
        out.push((scsi, handle));
    }
    out
}

fn pr_register(lun: Lun, gsid: u16, sa_key: u64) -> ClusterEvent {
    let mut cdb = [0u8; 16];
    cdb[0] = 0x5F;
    cdb[1] = 0x00; // REGISTER
    let mut params = [0u8; 24];
    params[8..16].copy_from_slice(&sa_key.to_be_bytes());
    ClusterEvent::reserve_out(lun, gsid, &cdb, &params)
}

fn pr_reserve(lun: Lun, gsid: u16, key: u64, rtype: u8) -> ClusterEvent {
    let mut cdb = [0u8; 16];
    cdb[0] = 0x5F;
    cdb[1] = 0x01; // RESERVE
    cdb[2] = rtype;
    let mut params = [0u8; 24];
    params[0..8].copy_from_slice(&key.to_be_bytes());
    ClusterEvent::reserve_out(lun, gsid, &cdb, &params)
}

async fn settled(cores: &[(Arc<ScsiCore>, PrEngineHandle)]) -> Vec<Vec<u8>> {
    // let the final broadcasts land everywhere before comparing
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    cores
        .iter()
        .map(|(scsi, _)| {
            scsi.reservations
                .lock()
                .expect("poisoned PR context")
                .pack()
        })
        .collect()
}

#[tokio::test]
async fn concurrent_registrations_converge_on_both_nodes() {
    let cores = cluster(2);
    let lun = Lun::new(3).expect("valid");

    let s1 = global_session_id(0, NodeId::new(0));
    let s2 = global_session_id(0, NodeId::new(1));

    // both nodes register concurrently, then node 0 reserves exclusively
    let h0 = cores[0].1.clone();
    let h1 = cores[1].1.clone();
    let (r1, r2) = tokio::join!(
        h0.submit(pr_register(lun, s1, 0xAA)),
        h1.submit(pr_register(lun, s2, 0xBB)),
    );
    assert_eq!(r1, PrStatus::Good);
    assert_eq!(r2, PrStatus::Good);

    let r = h0.submit(pr_reserve(lun, s1, 0xAA, 0x1)).await;
    assert_eq!(r, PrStatus::Good);

    let packed = settled(&cores).await;
    assert_eq!(packed[0], packed[1]);

    // a write from s2 now conflicts on every node
    let mut write10 = [0u8; 16];
    write10[0] = 0x2A;
    for (scsi, _) in &cores {
        let ctx = scsi.reservations.lock().expect("poisoned PR context");
        assert!(!ctx.check_rights(lun, &write10, s2));
        assert!(ctx.check_rights(lun, &write10, s1));
    }
}

#[tokio::test]
async fn session_death_releases_its_state_cluster_wide() {
    let cores = cluster(3);
    let lun = Lun::new(5).expect("valid");
    let s1 = global_session_id(2, NodeId::new(1));

    let h1 = cores[1].1.clone();
    assert_eq!(h1.submit(pr_register(lun, s1, 0xCC)).await, PrStatus::Good);
    assert_eq!(
        h1.submit(pr_reserve(lun, s1, 0xCC, 0x3)).await,
        PrStatus::Good
    );
    assert_eq!(
        h1.submit(ClusterEvent::DelSession { gsid: s1 }).await,
        PrStatus::Good
    );

    let packed = settled(&cores).await;
    assert_eq!(packed[0], packed[1]);
    assert_eq!(packed[1], packed[2]);

    let mut read10 = [0u8; 16];
    read10[0] = 0x28;
    for (scsi, _) in &cores {
        let ctx = scsi.reservations.lock().expect("poisoned PR context");
        assert!(ctx.check_rights(lun, &read10, global_session_id(0, NodeId::new(0))));
    }
}

#[tokio::test]
async fn aborted_pr_command_yields_no_response() {
    use exanodes_lum::{
        export::{export::Export, iqn::Iqn, iqn_filter::FilterPolicy, uuid::ExaUuid},
        lum::{
            blockdevice::RamVolumeStore,
            executive::{BdevAdapter, LumExecutive},
        },
        scsi::{
            dispatch::{CommandEnv, execute_command},
            sense::ScsiStatus,
        },
        target::core::TargetCore,
    };

    // an engine that is never run: submissions park, like a busy cluster
    let node = NodeId::new(0);
    let scsi = ScsiCore::new(node, 262_144);
    let target_iqn = Iqn::new("iqn.2004-05.com.seanodes:exanodes-t").expect("iqn");
    let core = TargetCore::new(scsi.clone(), target_iqn, 64, 262_144);
    scsi.bind_transport(core.clone());
    let net = LoopbackNet::new();
    let (link, inbound) = net.join(node);
    let (engine, handle) = PrEngine::new(scsi.clone(), link, inbound);
    scsi.bind_pr_engine(handle);

    // a defined LUN so the dispatch reaches the reservation branch
    let lun = Lun::new(4).expect("valid");
    let store = RamVolumeStore::new();
    let executive = LumExecutive::new(store.clone(), core, BdevAdapter::new());
    let uuid = ExaUuid([9, 9, 9, 9]);
    store.create_volume(uuid, 128);
    let export = Export::new_iscsi(uuid, lun, FilterPolicy::Accept);
    let mut buf = vec![0u8; Export::serialized_size()];
    export.serialize(&mut buf).expect("serialize");
    executive.export(&buf).expect("export");

    let scsi2 = scsi.clone();
    let task = tokio::spawn(async move {
        let env = CommandEnv {
            local_session_id: 0,
            tag: 0x42,
            authorized: &|_| true,
        };
        let mut cdb = [0u8; 16];
        cdb[0] = 0x5F; // PERSISTENT RESERVE OUT, parked in the engine
        let lun_field = lun.to_bhs_field();
        execute_command(&scsi2, &env, lun_field, cdb, &[0u8; 24]).await
    });

    // wait until the command is linked to the LUN, then reset it away
    while !scsi.luns.in_use(lun) {
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    scsi.luns.local_logical_unit_reset(lun).await;

    // dropping the engine wakes the parked submission
    drop(engine);

    let status = task.await.expect("join");
    assert_eq!(status.status, ScsiStatus::TaskAborted);
    assert!(!scsi.luns.in_use(lun));
}
