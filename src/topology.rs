// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Node identity and replication topology.
//!
//! Everything here is derived from the pod hostname and static config; nothing
//! is persisted. Two processes given the same inputs compute the same
//! topology.
//!
//! # Topology
//!
//! ```text
//!        ordinal 0 (master, read-write)
//!        ▲     ▲      ▲
//!        │     │      │
//!   ordinal 1  2  ...  n   (replicas, read-only)
//! ```

use crate::config::NodeConfig;
use crate::error::{Result, SidecarError};
use std::collections::BTreeMap;
use std::fmt;

/// The node's role, decided purely by ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Master,
    Replica,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Master => write!(f, "master"),
            Role::Replica => write!(f, "replica"),
        }
    }
}

/// Parse the trailing `-<n>` ordinal of a stateful-set hostname.
///
/// `db-mysql-2` → `Some(2)`; `db-mysql` → `None`.
pub fn parse_ordinal(hostname: &str) -> Option<u32> {
    // Only the first DNS label names the pod.
    let label = hostname.split('.').next()?;
    let (_, suffix) = label.rsplit_once('-')?;
    if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    // Leading zeros would give two hostnames the same ordinal.
    if suffix.len() > 1 && suffix.starts_with('0') {
        return None;
    }
    suffix.parse().ok()
}

/// Who this node is within the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    /// Pod name without any domain, e.g. `db-mysql-2`.
    pub hostname: String,
    pub cluster_name: String,
    pub ordinal: u32,
    pub server_id: u32,
    pub service_name: Option<String>,
    pub namespace: Option<String>,
    /// `hostname` with the ordinal stripped, e.g. `db-mysql`.
    base_name: String,
}

impl NodeIdentity {
    pub fn from_config(config: &NodeConfig) -> Result<Self> {
        let hostname = config
            .hostname
            .split('.')
            .next()
            .unwrap_or_default()
            .to_string();
        let ordinal = parse_ordinal(&hostname).ok_or_else(|| {
            SidecarError::ConfigInvalid(format!(
                "cannot derive ordinal from hostname '{}' (expected '<name>-<n>')",
                config.hostname
            ))
        })?;
        let server_id = config.server_id_offset.checked_add(ordinal).ok_or_else(|| {
            SidecarError::ConfigInvalid(format!(
                "server id overflows: offset {} + ordinal {}",
                config.server_id_offset, ordinal
            ))
        })?;
        // `parse_ordinal` guarantees a '-' is present.
        let base_name = hostname
            .rsplit_once('-')
            .map(|(base, _)| base.to_string())
            .unwrap_or_default();

        Ok(Self {
            hostname,
            cluster_name: config.cluster_name.clone(),
            ordinal,
            server_id,
            service_name: config.service_name.clone(),
            namespace: config.namespace.clone(),
            base_name,
        })
    }

    pub fn role(&self) -> Role {
        if self.ordinal == 0 {
            Role::Master
        } else {
            Role::Replica
        }
    }

    /// Hostname of the peer with `ordinal` in the same set.
    pub fn peer_hostname(&self, ordinal: u32) -> String {
        format!("{}-{}", self.base_name, ordinal)
    }

    /// Resolvable name of the peer with `ordinal`.
    pub fn peer_fqdn(&self, ordinal: u32) -> String {
        self.qualify(self.peer_hostname(ordinal))
    }

    /// This node's resolvable name; used as `report-host`.
    pub fn fqdn(&self) -> String {
        self.qualify(self.hostname.clone())
    }

    fn qualify(&self, host: String) -> String {
        let mut name = host;
        if let Some(service) = &self.service_name {
            name.push('.');
            name.push_str(service);
            if let Some(namespace) = &self.namespace {
                name.push('.');
                name.push_str(namespace);
            }
        }
        name
    }

    /// Peers worth probing as clone donors, nearest lower ordinal first.
    ///
    /// Higher ordinals are started after us and are never donors.
    pub fn donor_candidates(&self) -> Vec<u32> {
        (0..self.ordinal).rev().collect()
    }
}

/// Ordinal → upstream ordinal for every node up to a given ordinal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationTopology {
    upstream: BTreeMap<u32, Option<u32>>,
}

impl ReplicationTopology {
    /// Star topology over ordinals `0..=max_ordinal`: every replica follows 0.
    pub fn star(max_ordinal: u32) -> Self {
        let upstream = (0..=max_ordinal)
            .map(|ordinal| (ordinal, if ordinal == 0 { None } else { Some(0) }))
            .collect();
        Self { upstream }
    }

    /// Topology covering this node (and everything below it).
    pub fn for_node(identity: &NodeIdentity) -> Self {
        Self::star(identity.ordinal)
    }

    /// Upstream of `ordinal`, `None` for the root or unknown ordinals.
    pub fn master_of(&self, ordinal: u32) -> Option<u32> {
        self.upstream.get(&ordinal).copied().flatten()
    }

    pub fn roots(&self) -> Vec<u32> {
        self.upstream
            .iter()
            .filter(|(_, up)| up.is_none())
            .map(|(ordinal, _)| *ordinal)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.upstream.len()
    }

    pub fn is_empty(&self) -> bool {
        self.upstream.is_empty()
    }

    /// Exactly one root, every upstream known, and no cycles.
    pub fn validate(&self) -> Result<()> {
        let roots = self.roots();
        if roots.len() != 1 {
            return Err(SidecarError::TopologyConflict(format!(
                "expected exactly one root, found {:?}",
                roots
            )));
        }
        for &start in self.upstream.keys() {
            let mut current = start;
            let mut hops = 0usize;
            while let Some(next) = self.upstream.get(&current).copied().flatten() {
                if !self.upstream.contains_key(&next) {
                    return Err(SidecarError::TopologyConflict(format!(
                        "ordinal {current} follows unknown ordinal {next}"
                    )));
                }
                hops += 1;
                if hops > self.upstream.len() {
                    return Err(SidecarError::TopologyConflict(format!(
                        "cycle reachable from ordinal {start}"
                    )));
                }
                current = next;
            }
        }
        Ok(())
    }

    #[cfg(test)]
    fn from_pairs(pairs: &[(u32, Option<u32>)]) -> Self {
        Self {
            upstream: pairs.iter().copied().collect(),
        }
    }
}
