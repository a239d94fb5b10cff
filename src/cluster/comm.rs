// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Messaging primitives the reservation ordering engine runs on.
//!
//! The real transport is the cluster messaging service; it is modeled here
//! as a trait so the engine, the reconcile protocol and the tests all speak
//! the same contract. The loopback implementation wires N in-process nodes
//! together with channels and is what single-node deployments and the test
//! suite use.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use tokio::sync::mpsc;
use tracing::warn;

use crate::cluster::node::NodeId;

/// Messages of the PR ordering protocol.
#[derive(Debug, Clone)]
pub enum PrMessage {
    /// A node asks the sequencer to order an event.
    Submit {
        origin: NodeId,
        submit_id: u64,
        event: Vec<u8>,
    },
    /// The sequencer fixed a position; everyone applies in `seq` order.
    Ordered {
        seq: u64,
        origin: NodeId,
        submit_id: u64,
        event: Vec<u8>,
    },
    /// Packed PR context pushed to late joiners instead of a replay.
    Snapshot { next_seq: u64, data: Vec<u8> },
}

/// Outbound half of the PR transport.
pub trait PrLink: Send + Sync + 'static {
    fn node_id(&self) -> NodeId;
    fn send_to(&self, node: NodeId, msg: PrMessage);
    /// Deliver to every member, the sender included.
    fn broadcast(&self, msg: PrMessage);
}

/// In-process transport: per-node mailboxes over unbounded channels.
/// Delivery is reliable and FIFO per sender, which matches what the cluster
/// messaging layer guarantees.
#[derive(Default)]
pub struct LoopbackNet {
    mailboxes: Mutex<BTreeMap<NodeId, mpsc::UnboundedSender<PrMessage>>>,
}

impl LoopbackNet {
    pub fn new() -> Arc<Self> {
        Arc::new(LoopbackNet::default())
    }

    /// Register a node; returns its outbound link and inbound mailbox.
    pub fn join(
        self: &Arc<Self>,
        node: NodeId,
    ) -> (Arc<LoopbackLink>, mpsc::UnboundedReceiver<PrMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.mailboxes
            .lock()
            .expect("poisoned loopback net")
            .insert(node, tx);
        (
            Arc::new(LoopbackLink {
                net: Arc::clone(self),
                node,
            }),
            rx,
        )
    }

    pub fn leave(&self, node: NodeId) {
        self.mailboxes
            .lock()
            .expect("poisoned loopback net")
            .remove(&node);
    }
}

pub struct LoopbackLink {
    net: Arc<LoopbackNet>,
    node: NodeId,
}

impl PrLink for LoopbackLink {
    fn node_id(&self) -> NodeId {
        self.node
    }

    fn send_to(&self, node: NodeId, msg: PrMessage) {
        let boxes = self.net.mailboxes.lock().expect("poisoned loopback net");
        match boxes.get(&node) {
            Some(tx) => {
                if tx.send(msg).is_err() {
                    warn!("loopback: {node} mailbox closed");
                }
            },
            None => warn!("loopback: no such node {node}"),
        }
    }

    fn broadcast(&self, msg: PrMessage) {
        let boxes = self.net.mailboxes.lock().expect("poisoned loopback net");
        for (node, tx) in boxes.iter() {
            if tx.send(msg.clone()).is_err() {
                warn!("loopback: {node} mailbox closed");
            }
        }
    }
}
