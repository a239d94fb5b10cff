// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The PR-lock ordering engine.
//!
//! The lowest node id in the installed membership acts as sequencer: it
//! stamps every reservation event with a sequence number and broadcasts it.
//! Followers apply strictly in stamp order, so any two nodes apply any two
//! events in the same relative order. A node that joins mid-life receives
//! the packed PR context from the sequencer instead of a history replay.
//!
//! Submissions survive a sequencer change: unordered ones are re-sent to
//! the new sequencer, and the sequencer de-duplicates by (origin, submit id)
//! so a resend never orders twice.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::cluster::{
    comm::{PrLink, PrMessage},
    event::ClusterEvent,
    node::{NodeId, NodeSet},
    pr::PrStatus,
};

/// The local half the engine drives: event application and snapshotting.
pub trait PrApplier: Send + Sync + 'static {
    /// Apply one ordered event to the local PR state. Must be deterministic
    /// across nodes; the returned status only matters on the origin node.
    fn apply_event(
        &self,
        event: ClusterEvent,
    ) -> impl Future<Output = PrStatus> + Send;

    /// Packed PR context for late joiners.
    fn snapshot(&self) -> Vec<u8>;

    /// Install a replica's packed context. A parse failure means cluster
    /// corruption and must not be survived.
    fn install_snapshot(&self, data: &[u8]);
}

enum EngineCmd {
    Submit {
        event: ClusterEvent,
        done: oneshot::Sender<PrStatus>,
    },
    Membership {
        nodes: NodeSet,
    },
}

#[derive(Clone)]
pub struct PrEngineHandle {
    tx: mpsc::UnboundedSender<EngineCmd>,
}

impl PrEngineHandle {
    /// Order an event cluster-wide and wait for its local application.
    pub async fn submit(&self, event: ClusterEvent) -> PrStatus {
        let (done, wait) = oneshot::channel();
        if self.tx.send(EngineCmd::Submit { event, done }).is_err() {
            warn!("PR engine is gone; treating submission as aborted");
            return PrStatus::Conflict;
        }
        match wait.await {
            Ok(status) => status,
            Err(_) => {
                warn!("PR engine dropped a submission");
                PrStatus::Conflict
            },
        }
    }

    /// Install the post-recovery membership; the sequencer re-publishes the
    /// PR context to bring joiners level.
    pub fn set_membership(&self, nodes: NodeSet) {
        let _ = self.tx.send(EngineCmd::Membership { nodes });
    }
}

struct Waiting {
    event: Vec<u8>,
    ordered: bool,
    done: oneshot::Sender<PrStatus>,
}

pub struct PrEngine<A: PrApplier, L: PrLink> {
    node: NodeId,
    applier: Arc<A>,
    link: Arc<L>,
    inbound: mpsc::UnboundedReceiver<PrMessage>,
    cmds: mpsc::UnboundedReceiver<EngineCmd>,

    membership: NodeSet,
    /// Next sequence number this node will hand out while sequencer.
    next_seq: u64,
    /// Next sequence number to apply locally.
    apply_seq: u64,
    pending: BTreeMap<u64, (NodeId, u64, Vec<u8>)>,
    waiting: HashMap<u64, Waiting>,
    next_submit_id: u64,
    /// Sequencer-side resend filter.
    ordered_ids: HashSet<(NodeId, u64)>,
}

impl<A: PrApplier, L: PrLink> PrEngine<A, L> {
    /// Build the engine and hand back its submission handle; `run` must be
    /// spawned on the runtime.
    pub fn new(
        applier: Arc<A>,
        link: Arc<L>,
        inbound: mpsc::UnboundedReceiver<PrMessage>,
    ) -> (Self, PrEngineHandle) {
        let (tx, cmds) = mpsc::unbounded_channel();
        let node = link.node_id();
        (
            PrEngine {
                node,
                applier,
                link,
                inbound,
                cmds,
                membership: [node].into_iter().collect(),
                next_seq: 0,
                apply_seq: 0,
                pending: BTreeMap::new(),
                waiting: HashMap::new(),
                next_submit_id: 0,
                ordered_ids: HashSet::new(),
            },
            PrEngineHandle { tx },
        )
    }

    fn sequencer(&self) -> NodeId {
        self.membership.first().unwrap_or(self.node)
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.cmds.recv() => match cmd {
                    Some(EngineCmd::Submit { event, done }) => self.on_submit(event, done),
                    Some(EngineCmd::Membership { nodes }) => self.on_membership(nodes),
                    None => break,
                },
                msg = self.inbound.recv() => match msg {
                    Some(msg) => self.on_message(msg).await,
                    None => break,
                },
            }
        }
        debug!("PR engine on {} stopped", self.node);
    }

    fn on_submit(&mut self, event: ClusterEvent, done: oneshot::Sender<PrStatus>) {
        let submit_id = self.next_submit_id;
        self.next_submit_id += 1;
        let bytes = event.pack();
        self.waiting.insert(
            submit_id,
            Waiting {
                event: bytes.clone(),
                ordered: false,
                done,
            },
        );
        self.route_submit(submit_id, bytes);
    }

    fn route_submit(&mut self, submit_id: u64, event: Vec<u8>) {
        let sequencer = self.sequencer();
        if sequencer == self.node {
            self.order(self.node, submit_id, event);
        } else {
            self.link.send_to(
                sequencer,
                PrMessage::Submit {
                    origin: self.node,
                    submit_id,
                    event,
                },
            );
        }
    }

    /// Sequencer only: stamp and broadcast (the broadcast loops back to us).
    fn order(&mut self, origin: NodeId, submit_id: u64, event: Vec<u8>) {
        if !self.ordered_ids.insert((origin, submit_id)) {
            debug!("dropping duplicate submission {submit_id} from {origin}");
            return;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.link.broadcast(PrMessage::Ordered {
            seq,
            origin,
            submit_id,
            event,
        });
    }

    fn on_membership(&mut self, nodes: NodeSet) {
        self.membership = nodes;
        if self.sequencer() == self.node {
            // becoming sequencer: continue numbering from what we applied
            if self.next_seq < self.apply_seq {
                self.next_seq = self.apply_seq;
            }
            self.link.broadcast(PrMessage::Snapshot {
                next_seq: self.next_seq,
                data: self.applier.snapshot(),
            });
        }
        // unordered submissions chase the new sequencer
        let resend: Vec<(u64, Vec<u8>)> = self
            .waiting
            .iter()
            .filter(|(_, w)| !w.ordered)
            .map(|(id, w)| (*id, w.event.clone()))
            .collect();
        for (submit_id, event) in resend {
            self.route_submit(submit_id, event);
        }
    }

    async fn on_message(&mut self, msg: PrMessage) {
        match msg {
            PrMessage::Submit {
                origin,
                submit_id,
                event,
            } => {
                if self.sequencer() == self.node {
                    self.order(origin, submit_id, event);
                } else {
                    debug!("ignoring Submit from {origin}: not the sequencer");
                }
            },
            PrMessage::Ordered {
                seq,
                origin,
                submit_id,
                event,
            } => {
                if origin == self.node
                    && let Some(w) = self.waiting.get_mut(&submit_id)
                {
                    w.ordered = true;
                }
                self.pending.insert(seq, (origin, submit_id, event));
                self.drain().await;
            },
            PrMessage::Snapshot { next_seq, data } => {
                if next_seq > self.apply_seq {
                    self.applier.install_snapshot(&data);
                    self.apply_seq = next_seq;
                    self.pending.retain(|seq, _| *seq >= next_seq);
                    self.drain().await;
                }
            },
        }
    }

    async fn drain(&mut self) {
        while let Some((origin, submit_id, event)) =
            self.pending.remove(&self.apply_seq)
        {
            // a replica handed us garbage: the cluster state is corrupt
            let event = ClusterEvent::unpack(&event)
                .expect("corrupt ordered reservation event");
            let status = self.applier.apply_event(event).await;
            if origin == self.node
                && let Some(w) = self.waiting.remove(&submit_id)
            {
                let _ = w.done.send(status);
            }
            self.apply_seq += 1;
        }
    }
}
