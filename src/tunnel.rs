use crate::i2np::I2npMessage;
use crate::identity::IdentHash;
use crate::lease::Lease;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::sync::Arc;

/// One constructed outbound tunnel. Submitting a message hands it to the first hop;
///  delivery is best effort.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait OutboundTunnel: Send + Sync + 'static {
    async fn send_tunnel_data_msg(&self, gateway: &IdentHash, tunnel_id: u32, msg: I2npMessage);
}

/// The pool of tunnels maintained for one local destination.
#[cfg_attr(test, automock)]
pub trait TunnelPool: Send + Sync + 'static {
    fn next_outbound_tunnel(&self) -> Option<Arc<dyn OutboundTunnel>>;

    /// The current inbound tunnels, as leases a remote peer can send through.
    fn inbound_leases(&self) -> Vec<Lease>;
}

/// Creation of tunnel pools is the tunnel subsystem's business; the streaming layer only
///  asks for one per destination.
#[cfg_attr(test, automock)]
pub trait TunnelPoolProvider: Send + Sync + 'static {
    fn create_tunnel_pool(&self, local: &IdentHash, hop_count: usize) -> Arc<dyn TunnelPool>;
}
