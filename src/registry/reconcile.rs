// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The reconcile protocol: equalize the export catalog across nodes after a
//! membership change.
//!
//! Every numbered step ends on a cluster barrier, so either all alive nodes
//! observe the same aggregate result or the whole recovery aborts with the
//! barrier's code and retries on the next membership change.

use std::net::Ipv4Addr;

use tracing::{debug, error};

use crate::{
    cluster::node::{NodeId, NodeSet},
    errors::{BarrierCode, LumError},
    export::export::Export,
    registry::{
        table::{AdmExport, ExportTable},
        xml::ExportsFile,
    },
};

/// Barrier/broadcast workflow against the cluster RPC service (an external
/// collaborator; `LocalWorkflow` is the in-process rendition).
pub trait ClusterWorkflow: Send + Sync {
    fn node_id(&self) -> NodeId;

    /// The membership this recovery is converging on: nodes up, plus going
    /// up, minus going down.
    fn nodes_up(&self) -> NodeSet;

    /// Report the local return code; resolves once every alive node
    /// reported, to the merged code.
    fn barrier(
        &self,
        local: BarrierCode,
        label: &str,
    ) -> impl Future<Output = BarrierCode> + Send;

    /// Contribute a payload and collect every node's contribution. A node
    /// that died mid-step is simply absent from the result.
    fn broadcast_collect(
        &self,
        tag: &str,
        payload: Vec<u8>,
    ) -> impl Future<Output = Vec<(NodeId, Vec<u8>)>> + Send;
}

/// Node-local actions the recovery drives between barriers.
pub trait RecoveryActions: Send + Sync {
    fn set_peers(&self) -> Result<(), LumError>;

    fn listen_addresses(&self) -> Vec<Ipv4Addr>;

    fn install_membership(&self, nodes: &NodeSet) -> Result<(), LumError>;

    fn install_target_addresses(&self, addrs: &[Ipv4Addr]) -> Result<(), LumError>;

    /// Re-publish every export whose volume is started on this node.
    fn republish(&self, table: &mut ExportTable) -> Result<(), LumError>;

    fn start_target(&self) -> Result<(), LumError>;
}

/// Run one recovery round. Returns `Success` when the node finished the
/// whole sequence, or the failing barrier's code.
pub async fn reconcile<W: ClusterWorkflow, A: RecoveryActions>(
    workflow: &W,
    actions: &A,
    table: &mut ExportTable,
    file: &ExportsFile,
) -> BarrierCode {
    let my_id = workflow.node_id();

    let ret: BarrierCode = actions.set_peers().into();
    let rc = workflow.barrier(ret, "Setting peers").await;
    if !rc.is_success() {
        error!("cannot set peers: {rc}");
        return rc;
    }

    let nodes = workflow.nodes_up();
    let ret: BarrierCode = actions.install_membership(&nodes).into();
    let rc = workflow.barrier(ret, "Setting membership").await;
    if !rc.is_success() {
        error!("cannot set LUM membership: {rc}");
        return rc;
    }

    // exchange target listen addresses; the target advertises the union
    // through SendTargets
    let mut payload = Vec::new();
    for addr in actions.listen_addresses() {
        payload.extend_from_slice(&addr.octets());
    }
    let contributions = workflow.broadcast_collect("target-addresses", payload).await;
    let mut addresses = Vec::new();
    for (_, bytes) in &contributions {
        for chunk in bytes.chunks_exact(4) {
            let addr = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            if !addr.is_unspecified() {
                addresses.push(addr);
            }
        }
    }
    let rc = workflow
        .barrier(BarrierCode::Success, "Exchanging target listen addresses")
        .await;
    if !rc.is_success() {
        error!("cannot exchange listen addresses: {rc}");
        return rc;
    }

    let ret: BarrierCode = actions.install_target_addresses(&addresses).into();
    let rc = workflow.barrier(ret, "Setting targets").await;
    if !rc.is_success() {
        error!("cannot set targets: {rc}");
        return rc;
    }

    // exchange exports file versions; best = (max version, min node id)
    let contributions = workflow
        .broadcast_collect("exports-version", table.version().to_be_bytes().to_vec())
        .await;
    let mut best: Option<(u64, NodeId)> = None;
    for (node, bytes) in &contributions {
        let Ok(raw) = <[u8; 8]>::try_from(bytes.as_slice()) else {
            continue;
        };
        let version = u64::from_be_bytes(raw);
        debug!("{node} has exports file version {version}");
        best = match best {
            None => Some((version, *node)),
            Some((bv, bn)) if version > bv || (version == bv && *node < bn) => {
                Some((version, *node))
            },
            keep => keep,
        };
    }
    let rc = workflow
        .barrier(BarrierCode::Success, "Exchanging exports version")
        .await;
    if !rc.is_success() {
        error!("cannot exchange exports version: {rc}");
        return rc;
    }

    let (best_version, best_node) = best.expect("no exports version seen");
    let am_best = best_node == my_id;
    let need_update = table.version() < best_version;
    debug!(
        "best exports file on {best_node} (version {best_version}).{}{}",
        if am_best {
            " I have the best file and will send."
        } else {
            ""
        },
        if need_update {
            " I need to update"
        } else {
            " I don't have to update"
        }
    );
    assert!(!(am_best && need_update));

    // first the number of exports to sync, then each export in order
    let payload = if am_best {
        (table.number() as u32).to_be_bytes().to_vec()
    } else {
        if need_update {
            table.clear();
        }
        Vec::new()
    };
    let contributions = workflow.broadcast_collect("exports-number", payload).await;
    let elements_to_sync = if am_best {
        table.number()
    } else {
        contributions
            .iter()
            .find(|(n, _)| *n == best_node)
            .and_then(|(_, b)| <[u8; 4]>::try_from(b.as_slice()).ok())
            .map(|raw| u32::from_be_bytes(raw) as usize)
            .unwrap_or(0)
    };
    let rc = workflow
        .barrier(BarrierCode::Success, "Exchanging exports number")
        .await;
    if !rc.is_success() {
        error!("cannot exchange exports number: {rc}");
        return rc;
    }

    let mut exchange_ok = true;
    for i in 0..elements_to_sync {
        let payload = if am_best {
            let adm = table.get_nth(i).expect("in range");
            let mut buf = vec![0u8; Export::serialized_size()];
            adm.export()
                .serialize(&mut buf)
                .expect("export serialization cannot fail at full size");
            debug!("sending element {i} {}", adm.export().uuid());
            buf
        } else {
            Vec::new()
        };
        let contributions = workflow
            .broadcast_collect(&format!("exports-export-{i}"), payload)
            .await;
        if need_update {
            match contributions.iter().find(|(n, _)| *n == best_node) {
                Some((_, bytes)) => {
                    // a corrupt payload from the trusted replica means the
                    // cluster itself is corrupt
                    let export = Export::deserialize(bytes)
                        .expect("corrupt export from best node");
                    debug!("got element {i} {} from best node", export.uuid());
                    table
                        .insert(AdmExport::new(export))
                        .expect("duplicate export from best node");
                },
                None => {
                    exchange_ok = false;
                    break;
                },
            }
        }
    }

    if !exchange_ok {
        error!("cannot exchange exports data: lost the best node");
        if need_update {
            // rollback MUST succeed, otherwise the situation is unrecoverable
            file.load(table).expect("exports file rollback failed");
        }
        return BarrierCode::Failed(LumError::NodeDown);
    }

    if need_update {
        debug!("exports exchange done, saving file");
        table.set_version(best_version);
        let _ = file.store(table);
    }

    let rc = workflow
        .barrier(BarrierCode::Success, "Exchanging exports data")
        .await;
    if !rc.is_success() {
        error!("cannot exchange exports data: {rc}");
        return rc;
    }

    let ret: BarrierCode = actions.republish(table).into();
    let rc = workflow.barrier(ret, "Re-exporting exports").await;
    if !rc.is_success() {
        error!("cannot re-export exports: {rc}");
        return rc;
    }

    actions.start_target().into()
}

/// In-process workflow: N participants over shared state. Single-node
/// deployments run the recovery through this with one participant; the
/// multi-node tests wire several.
pub mod local {
    use std::{
        collections::HashMap,
        sync::{Arc, Mutex},
    };

    use tokio::sync::Notify;

    use super::*;

    #[derive(Default)]
    struct Round {
        contributions: Vec<(NodeId, Vec<u8>)>,
        readers_done: usize,
    }

    struct Shared {
        nodes: NodeSet,
        rounds: Mutex<HashMap<(String, u64), Round>>,
        notify: Notify,
    }

    pub struct LocalWorkflow {
        shared: Arc<Shared>,
        node: NodeId,
        /// Per-tag round counters; all nodes step through tags in the same
        /// order, so the counters line up.
        counters: Mutex<HashMap<String, u64>>,
    }

    /// Build one workflow handle per participating node.
    pub fn local_workflows(nodes: NodeSet) -> Vec<LocalWorkflow> {
        let shared = Arc::new(Shared {
            nodes: nodes.clone(),
            rounds: Mutex::new(HashMap::new()),
            notify: Notify::new(),
        });
        nodes
            .iter()
            .map(|node| LocalWorkflow {
                shared: shared.clone(),
                node,
                counters: Mutex::new(HashMap::new()),
            })
            .collect()
    }

    impl LocalWorkflow {
        async fn exchange(&self, tag: &str, payload: Vec<u8>) -> Vec<(NodeId, Vec<u8>)> {
            let round = {
                let mut counters = self.counters.lock().expect("poisoned counters");
                let c = counters.entry(tag.to_string()).or_insert(0);
                let round = *c;
                *c += 1;
                round
            };
            let key = (tag.to_string(), round);
            let total = self.shared.nodes.len();

            {
                let mut rounds = self.shared.rounds.lock().expect("poisoned rounds");
                rounds
                    .entry(key.clone())
                    .or_default()
                    .contributions
                    .push((self.node, payload));
            }
            self.shared.notify.notify_waiters();

            loop {
                let wait = self.shared.notify.notified();
                tokio::pin!(wait);
                wait.as_mut().enable();
                {
                    let mut rounds =
                        self.shared.rounds.lock().expect("poisoned rounds");
                    let entry = rounds.get_mut(&key).expect("round exists");
                    if entry.contributions.len() == total {
                        let mut result = entry.contributions.clone();
                        entry.readers_done += 1;
                        if entry.readers_done == total {
                            rounds.remove(&key);
                        }
                        result.sort_by_key(|(n, _)| *n);
                        self.shared.notify.notify_waiters();
                        return result;
                    }
                }
                wait.await;
            }
        }
    }

    impl ClusterWorkflow for LocalWorkflow {
        fn node_id(&self) -> NodeId {
            self.node
        }

        fn nodes_up(&self) -> NodeSet {
            self.shared.nodes.clone()
        }

        async fn barrier(&self, local: BarrierCode, label: &str) -> BarrierCode {
            let payload = match local {
                BarrierCode::Success => vec![0u8; 4],
                BarrierCode::Failed(e) => (e.code() as u32).to_be_bytes().to_vec(),
            };
            let tag = format!("barrier:{label}");
            let all = self.exchange(&tag, payload).await;
            let mut merged = BarrierCode::Success;
            for (_, bytes) in all {
                if bytes != [0u8; 4] {
                    // the first failing code wins, like the RPC layer
                    let code = <[u8; 4]>::try_from(bytes.as_slice())
                        .map(u32::from_be_bytes)
                        .ok()
                        .and_then(|c| LumError::from_code(c as i32))
                        .unwrap_or(LumError::NodeDown);
                    merged = merged.merge(BarrierCode::Failed(code));
                }
            }
            merged
        }

        async fn broadcast_collect(
            &self,
            tag: &str,
            payload: Vec<u8>,
        ) -> Vec<(NodeId, Vec<u8>)> {
            self.exchange(tag, payload).await
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    use super::{local::local_workflows, *};
    use crate::export::{
        iqn::Iqn, iqn_filter::FilterPolicy, lun::Lun, uuid::ExaUuid,
    };

    struct StubActions {
        addr: Ipv4Addr,
        republished: AtomicUsize,
        installed_addresses: Mutex<Vec<Ipv4Addr>>,
        target_started: AtomicUsize,
    }

    impl StubActions {
        fn new(addr: Ipv4Addr) -> Self {
            StubActions {
                addr,
                republished: AtomicUsize::new(0),
                installed_addresses: Mutex::new(Vec::new()),
                target_started: AtomicUsize::new(0),
            }
        }
    }

    impl RecoveryActions for StubActions {
        fn set_peers(&self) -> Result<(), LumError> {
            Ok(())
        }

        fn listen_addresses(&self) -> Vec<Ipv4Addr> {
            vec![self.addr]
        }

        fn install_membership(&self, _nodes: &NodeSet) -> Result<(), LumError> {
            Ok(())
        }

        fn install_target_addresses(&self, addrs: &[Ipv4Addr]) -> Result<(), LumError> {
            *self.installed_addresses.lock().expect("poisoned") = addrs.to_vec();
            Ok(())
        }

        fn republish(&self, table: &mut ExportTable) -> Result<(), LumError> {
            for adm in table.iter_mut() {
                adm.set_published(true);
            }
            self.republished.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn start_target(&self) -> Result<(), LumError> {
            self.target_started.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn uuid(n: u32) -> ExaUuid {
        ExaUuid([n, 1, 2, 3])
    }

    fn table_with(version: u64, uuids: &[u32]) -> ExportTable {
        let mut table = ExportTable::new();
        for (i, n) in uuids.iter().enumerate() {
            let mut export = Export::new_iscsi(
                uuid(*n),
                Lun::new(i as u64 + 2).expect("valid"),
                FilterPolicy::Accept,
            );
            export
                .add_iqn_filter(
                    Iqn::new("iqn.2020-01.example:*").expect("valid"),
                    FilterPolicy::Reject,
                )
                .expect("filter");
            table.insert(AdmExport::new(export)).expect("insert");
        }
        table.set_version(version);
        table
    }

    #[tokio::test]
    async fn two_nodes_adopt_the_freshest_catalog() {
        let nodes: NodeSet = [NodeId::new(0), NodeId::new(1)].into_iter().collect();
        let mut workflows = local_workflows(nodes).into_iter();
        let wf_a = workflows.next().expect("node 0");
        let wf_b = workflows.next().expect("node 1");

        let dir_a = tempfile::tempdir().expect("tempdir");
        let dir_b = tempfile::tempdir().expect("tempdir");
        let file_a = ExportsFile::new(dir_a.path());
        let file_b = ExportsFile::new(dir_b.path());

        // node A is stale at version 7, node B has version 9
        let mut table_a = table_with(7, &[1]);
        let mut table_b = table_with(9, &[1, 2, 3]);
        file_a.store(&table_a).expect("store");
        file_b.store(&table_b).expect("store");

        let actions_a = StubActions::new(Ipv4Addr::new(10, 0, 0, 1));
        let actions_b = StubActions::new(Ipv4Addr::new(10, 0, 0, 2));

        let run_a = reconcile(&wf_a, &actions_a, &mut table_a, &file_a);
        let run_b = reconcile(&wf_b, &actions_b, &mut table_b, &file_b);
        let (rc_a, rc_b) = tokio::join!(run_a, run_b);
        assert!(rc_a.is_success());
        assert!(rc_b.is_success());

        // both nodes now hold (version 9, identical export sets)
        assert_eq!(table_a.version(), 9);
        assert_eq!(table_b.version(), 9);
        assert_eq!(table_a.number(), 3);
        for (a, b) in table_a.iter().zip(table_b.iter()) {
            assert!(a.is_equal(b));
        }

        // the adopted catalog was persisted on the stale node
        let mut reloaded = ExportTable::new();
        file_a.load(&mut reloaded).expect("reload");
        assert_eq!(reloaded.version(), 9);
        assert_eq!(reloaded.number(), 3);

        // every node republished and restarted its target, and learned both
        // listen addresses
        assert_eq!(actions_a.republished.load(Ordering::SeqCst), 1);
        assert_eq!(actions_b.republished.load(Ordering::SeqCst), 1);
        assert_eq!(actions_a.target_started.load(Ordering::SeqCst), 1);
        assert_eq!(
            actions_a.installed_addresses.lock().expect("poisoned").len(),
            2
        );
    }

    #[tokio::test]
    async fn tie_break_prefers_lowest_node_id() {
        let nodes: NodeSet = [NodeId::new(0), NodeId::new(1)].into_iter().collect();
        let mut workflows = local_workflows(nodes).into_iter();
        let wf_a = workflows.next().expect("node 0");
        let wf_b = workflows.next().expect("node 1");

        let dir_a = tempfile::tempdir().expect("tempdir");
        let dir_b = tempfile::tempdir().expect("tempdir");
        let file_a = ExportsFile::new(dir_a.path());
        let file_b = ExportsFile::new(dir_b.path());

        // same version, different content: node 0 is authoritative
        let mut table_a = table_with(5, &[1, 2]);
        let mut table_b = table_with(5, &[9]);

        let actions_a = StubActions::new(Ipv4Addr::new(10, 0, 0, 1));
        let actions_b = StubActions::new(Ipv4Addr::new(10, 0, 0, 2));

        let (rc_a, rc_b) = tokio::join!(
            reconcile(&wf_a, &actions_a, &mut table_a, &file_a),
            reconcile(&wf_b, &actions_b, &mut table_b, &file_b),
        );
        assert!(rc_a.is_success());
        assert!(rc_b.is_success());

        // neither node was behind on version, so nobody adopted anything
        assert_eq!(table_a.number(), 2);
        assert_eq!(table_b.number(), 1);
    }

    #[tokio::test]
    async fn single_node_recovery_runs_through() {
        let nodes: NodeSet = [NodeId::new(0)].into_iter().collect();
        let wf = local_workflows(nodes)
            .into_iter()
            .next()
            .expect("node 0");
        let dir = tempfile::tempdir().expect("tempdir");
        let file = ExportsFile::new(dir.path());
        let mut table = table_with(3, &[1]);
        let actions = StubActions::new(Ipv4Addr::new(127, 0, 0, 1));

        let rc = reconcile(&wf, &actions, &mut table, &file).await;
        assert!(rc.is_success());
        assert!(table.iter().all(|a| a.published()));
        assert_eq!(actions.target_started.load(Ordering::SeqCst), 1);
    }
}
