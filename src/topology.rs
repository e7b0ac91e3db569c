//! Cluster topology allocation: deterministic client/peer address table.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use crate::utils::PaxbootError;

use serde::Deserialize;

/// Replica index type. A cluster holds at most `u8::MAX` replicas.
pub type ReplicaId = u8;

/// Which peer addresses a replica gets told about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerPolicy {
    /// Every peer address except the replica's own.
    ExcludeSelf,

    /// Every peer address, the replica's own included.
    IncludeSelf,
}

impl PeerPolicy {
    /// Parse command line string into `PeerPolicy` enum.
    pub fn parse_name(name: &str) -> Option<Self> {
        match name {
            "exclude_self" | "ExcludeSelf" => Some(Self::ExcludeSelf),
            "include_self" | "IncludeSelf" => Some(Self::IncludeSelf),
            _ => None,
        }
    }
}

impl fmt::Display for PeerPolicy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::ExcludeSelf => write!(f, "exclude_self"),
            Self::IncludeSelf => write!(f, "include_self"),
        }
    }
}

/// Address pair allocated to one replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicaAddrs {
    /// Client-facing address.
    pub client: SocketAddr,

    /// Peer-peer consensus protocol address.
    pub peer: SocketAddr,
}

impl fmt::Display for ReplicaAddrs {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "client {} peer {}", self.client, self.peer)
    }
}

/// Full address table of a cluster, indexed by `ReplicaId`. Read-only once
/// allocated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    addrs: Vec<ReplicaAddrs>,
}

impl Topology {
    /// Allocates addresses for `population` replicas: replica `i` gets client
    /// port `client_port_base + i` and peer port `peer_port_base + i`, both
    /// on `bind_host`.
    pub fn allocate(
        population: u8,
        bind_host: IpAddr,
        client_port_base: u16,
        peer_port_base: u16,
    ) -> Result<Self, PaxbootError> {
        if population == 0 {
            return Err(PaxbootError::msg(format!(
                "invalid population {}",
                population
            )));
        }
        if client_port_base <= 1024 {
            return Err(PaxbootError::msg(format!(
                "invalid client_port_base {}",
                client_port_base
            )));
        }
        if peer_port_base <= 1024 {
            return Err(PaxbootError::msg(format!(
                "invalid peer_port_base {}",
                peer_port_base
            )));
        }

        // both port ranges must fit under u16::MAX
        let n = population as u32;
        for (role, base) in
            [("client", client_port_base), ("peer", peer_port_base)]
        {
            if base as u32 + n - 1 > u16::MAX as u32 {
                return Err(PaxbootError::msg(format!(
                    "{} ports {}..{} overflow the port range",
                    role,
                    base,
                    base as u32 + n
                )));
            }
        }

        // client and peer port ranges must not collide
        let (cb, pb) = (client_port_base as u32, peer_port_base as u32);
        if cb < pb + n && pb < cb + n {
            return Err(PaxbootError::msg(format!(
                "client ports {}..{} overlap peer ports {}..{}",
                cb,
                cb + n,
                pb,
                pb + n
            )));
        }

        let addrs = (0..population)
            .map(|i| ReplicaAddrs {
                client: SocketAddr::new(
                    bind_host,
                    client_port_base + i as u16,
                ),
                peer: SocketAddr::new(bind_host, peer_port_base + i as u16),
            })
            .collect();
        Ok(Topology { addrs })
    }

    /// Number of replicas in the cluster.
    pub fn population(&self) -> u8 {
        self.addrs.len() as u8
    }

    /// Address pair of replica `id`.
    pub fn addrs(&self, id: ReplicaId) -> Result<ReplicaAddrs, PaxbootError> {
        self.addrs.get(id as usize).copied().ok_or_else(|| {
            PaxbootError::msg(format!(
                "replica ID {} out of population {}",
                id,
                self.addrs.len()
            ))
        })
    }

    /// Iterator over `(id, addrs)` in ascending ID order.
    pub fn iter(&self) -> impl Iterator<Item = (ReplicaId, &ReplicaAddrs)> {
        self.addrs
            .iter()
            .enumerate()
            .map(|(i, addrs)| (i as ReplicaId, addrs))
    }

    /// Peer addresses to advertise to replica `id` under `policy`, in
    /// ascending ID order.
    pub fn peers(
        &self,
        id: ReplicaId,
        policy: PeerPolicy,
    ) -> Result<Vec<SocketAddr>, PaxbootError> {
        self.addrs(id)?;
        Ok(self
            .iter()
            .filter(|&(i, _)| policy == PeerPolicy::IncludeSelf || i != id)
            .map(|(_, addrs)| addrs.peer)
            .collect())
    }
}
