use crate::identity::IdentHash;
use bytes::BufMut;
#[cfg(test)] use mockall::automock;
use std::sync::Arc;
use std::time::SystemTime;

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("system clock is before the epoch")
        .as_millis() as u64
}

/// One inbound path to a destination: send to this gateway / tunnel id and the packet
///  comes out at the destination, until `end_date`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub tunnel_gateway: IdentHash,
    pub tunnel_id: u32,
    /// millis since epoch
    pub end_date: u64,
}

/// A destination's published collection of current leases.
#[derive(Debug, Clone)]
pub struct LeaseSet {
    ident_hash: IdentHash,
    leases: Vec<Lease>,
}

impl LeaseSet {
    pub fn new(ident_hash: IdentHash, leases: Vec<Lease>) -> LeaseSet {
        LeaseSet { ident_hash, leases }
    }

    pub fn ident_hash(&self) -> &IdentHash {
        &self.ident_hash
    }

    pub fn leases(&self) -> &[Lease] {
        &self.leases
    }

    pub fn non_expired_leases(&self, now: u64) -> Vec<Lease> {
        self.leases
            .iter()
            .filter(|l| l.end_date > now)
            .cloned()
            .collect()
    }

    /// An empty lease set counts as expired so it gets rebuilt as soon as tunnels exist.
    pub fn has_expired_leases(&self, now: u64) -> bool {
        self.leases.is_empty() || self.leases.iter().any(|l| l.end_date <= now)
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_slice(self.ident_hash.as_bytes());
        buf.put_u8(self.leases.len() as u8);
        for lease in &self.leases {
            buf.put_slice(lease.tunnel_gateway.as_bytes());
            buf.put_u32(lease.tunnel_id);
            buf.put_u64(lease.end_date);
        }
    }
}

/// Lookup of remote lease sets. The network database owns the lease sets; the streaming
///  layer re-resolves on demand instead of caching beyond the current send.
#[cfg_attr(test, automock)]
pub trait NetDb: Send + Sync + 'static {
    fn find_lease_set(&self, ident_hash: &IdentHash) -> Option<Arc<LeaseSet>>;
}
