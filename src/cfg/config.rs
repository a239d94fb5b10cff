// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, net::Ipv4Addr, path::Path};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::{cluster::node::NodeId, export::iqn::Iqn};

/// Default negotiated data segment size (bytes).
pub const DATA_SEGMENT_LENGTH: u32 = 262_144;

/// TCP port the target listens on.
pub const ISCSI_PORT: u16 = 3260;

/// Fixed portal group tag advertised at login.
pub const TARGET_PORTAL_GROUP_TAG: u16 = 1;

/// Upper bound on concurrently logged-in sessions per node.
pub const MAX_SESSIONS: usize = 64;

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    /// Cluster-wide identity and local node placement.
    pub cluster: ClusterConfig,
    /// iSCSI target tunables.
    pub target: TargetConfig,
    /// Where the node keeps its persistent state (exports file).
    pub storage: StorageConfig,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ClusterConfig {
    /// Cluster name; underscores become dashes inside the target IQN.
    pub name: String,
    /// This node's id within the cluster.
    pub node_id: u32,
    /// Number of nodes the cluster may grow to.
    pub max_nodes: u32,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct TargetConfig {
    /// Address the listener binds to.
    #[serde(default = "default_listen_address")]
    pub listen_address: Ipv4Addr,
    /// Per-session command queue depth, drives MaxCmdSN.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: u32,
    /// Per-command data buffer size; also the MaxBurstLength ceiling.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: u32,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct StorageConfig {
    /// Cache directory holding the exports file.
    pub cache_dir: String,
}

fn default_listen_address() -> Ipv4Addr {
    Ipv4Addr::UNSPECIFIED
}

fn default_queue_depth() -> u32 {
    64
}

fn default_buffer_size() -> u32 {
    DATA_SEGMENT_LENGTH
}

impl Config {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(&path).with_context(|| {
            format!("failed to read config {}", path.as_ref().display())
        })?;
        let mut cfg: Config =
            serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(!self.cluster.name.is_empty(), "cluster name must not be empty");
        ensure!(self.cluster.max_nodes >= 1, "max_nodes must be >= 1");
        ensure!(
            self.cluster.node_id < self.cluster.max_nodes,
            "node_id {} out of range (max_nodes {})",
            self.cluster.node_id,
            self.cluster.max_nodes
        );
        ensure!(self.target.queue_depth >= 1, "queue_depth must be >= 1");
        ensure!(
            self.target.buffer_size >= DATA_SEGMENT_LENGTH,
            "buffer_size ({}) below the data segment length ({DATA_SEGMENT_LENGTH})",
            self.target.buffer_size
        );
        ensure!(!self.storage.cache_dir.is_empty(), "cache_dir must not be empty");
        Ok(())
    }

    #[inline]
    pub fn node_id(&self) -> NodeId {
        NodeId::new(self.cluster.node_id)
    }

    /// The target IQN presented to every initiator:
    /// `iqn.2004-05.com.seanodes:exanodes-<cluster>`, underscores replaced
    /// with dashes to stay inside the IQN charset.
    pub fn target_iqn(&self) -> Result<Iqn> {
        let cluster = self.cluster.name.replace('_', "-");
        Iqn::format(format_args!("iqn.2004-05.com.seanodes:exanodes-{cluster}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Config {
        Config {
            cluster: ClusterConfig {
                name: "my_cluster".to_string(),
                node_id: 0,
                max_nodes: 4,
            },
            target: TargetConfig {
                listen_address: Ipv4Addr::UNSPECIFIED,
                queue_depth: 64,
                buffer_size: DATA_SEGMENT_LENGTH,
            },
            storage: StorageConfig {
                cache_dir: "/var/cache/exanodes".to_string(),
            },
        }
    }

    #[test]
    fn target_iqn_replaces_underscores() {
        let cfg = sample();
        assert_eq!(
            cfg.target_iqn().expect("iqn").as_str(),
            "iqn.2004-05.com.seanodes:exanodes-my-cluster"
        );
    }

    #[test]
    fn validation_rejects_small_buffer() {
        let mut cfg = sample();
        cfg.target.buffer_size = 4096;
        assert!(cfg.validate_and_normalize().is_err());
    }

    #[test]
    fn validation_rejects_node_id_out_of_range() {
        let mut cfg = sample();
        cfg.cluster.node_id = 4;
        assert!(cfg.validate_and_normalize().is_err());
    }
}
