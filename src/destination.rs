use crate::config::StreamingConfig;
use crate::garlic::Garlic;
use crate::i2np::{I2npMessage, I2npMessageKind};
use crate::identity::{self, IdentHash, Identity, PrivateKeys, ENCRYPTION_KEY_LEN};
use crate::lease::{now_millis, LeaseSet, NetDb};
use crate::packet::{Packet, SIGNATURE_LEN};
use crate::service::Service;
use crate::stream::Stream;
use crate::tunnel::{TunnelPool, TunnelPoolProvider};
use bytes::BytesMut;
use dsa::SigningKey;
use rand::RngCore;
use rustc_hash::FxHashMap;
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Invoked for each new inbound stream, before its first packet is processed.
pub type Acceptor = Box<dyn Fn(&Arc<Stream>) + Send + Sync>;

/// One local cryptographic identity: owns a tunnel pool, its published lease set and the
///  table of streams terminating here. Inbound packets are routed to streams by the
///  send-stream-id they carry; a send-stream-id of 0 announces a new inbound stream.
pub struct Destination {
    self_ref: Weak<Destination>,
    config: Arc<StreamingConfig>,
    service: Service,
    keys: PrivateKeys,
    signing_key: SigningKey,
    ident_hash: IdentHash,
    /// ephemeral DH keypair, consumed by the garlic layer
    dh_private_key: [u8; ENCRYPTION_KEY_LEN],
    dh_public_key: [u8; ENCRYPTION_KEY_LEN],
    netdb: Arc<dyn NetDb>,
    garlic: Arc<dyn Garlic>,
    tunnel_pool: Arc<dyn TunnelPool>,
    lease_set: RwLock<Option<Arc<LeaseSet>>>,
    streams: RwLock<FxHashMap<u32, Arc<Stream>>>,
    acceptor: RwLock<Option<Acceptor>>,
}

impl Destination {
    pub fn new(
        keys: PrivateKeys,
        config: Arc<StreamingConfig>,
        service: Service,
        netdb: Arc<dyn NetDb>,
        garlic: Arc<dyn Garlic>,
        tunnel_pools: &dyn TunnelPoolProvider,
    ) -> anyhow::Result<Arc<Destination>> {
        let signing_key = keys.dsa_signing_key()?;
        let ident_hash = keys.identity.hash();
        let tunnel_pool = tunnel_pools.create_tunnel_pool(&ident_hash, config.tunnel_hop_count);

        let mut dh_private_key = [0u8; ENCRYPTION_KEY_LEN];
        let mut dh_public_key = [0u8; ENCRYPTION_KEY_LEN];
        rand::rngs::OsRng.fill_bytes(&mut dh_private_key);
        rand::rngs::OsRng.fill_bytes(&mut dh_public_key);

        info!("local destination {} ready", ident_hash);
        Ok(Arc::new_cyclic(|self_ref| Destination {
            self_ref: self_ref.clone(),
            config,
            service,
            keys,
            signing_key,
            ident_hash,
            dh_private_key,
            dh_public_key,
            netdb,
            garlic,
            tunnel_pool,
            lease_set: RwLock::new(None),
            streams: RwLock::new(FxHashMap::default()),
            acceptor: RwLock::new(None),
        }))
    }

    pub fn ident_hash(&self) -> &IdentHash {
        &self.ident_hash
    }

    pub fn identity(&self) -> &Identity {
        &self.keys.identity
    }

    pub fn dh_keypair(&self) -> (&[u8; ENCRYPTION_KEY_LEN], &[u8; ENCRYPTION_KEY_LEN]) {
        (&self.dh_private_key, &self.dh_public_key)
    }

    pub(crate) fn config(&self) -> &StreamingConfig {
        &self.config
    }

    pub(crate) fn service(&self) -> Service {
        self.service.clone()
    }

    pub(crate) fn netdb(&self) -> Arc<dyn NetDb> {
        self.netdb.clone()
    }

    pub(crate) fn garlic(&self) -> Arc<dyn Garlic> {
        self.garlic.clone()
    }

    pub(crate) fn tunnel_pool(&self) -> Arc<dyn TunnelPool> {
        self.tunnel_pool.clone()
    }

    pub async fn set_acceptor(&self, acceptor: Acceptor) {
        *self.acceptor.write().await = Some(acceptor);
    }

    pub async fn stream_count(&self) -> usize {
        self.streams.read().await.len()
    }

    pub async fn create_outgoing_stream(&self, remote_lease_set: Arc<LeaseSet>) -> Arc<Stream> {
        let this = self.self_ref.upgrade().expect("destinations live behind an Arc");
        let mut streams = self.streams.write().await;
        let recv_stream_id = allocate_stream_id(&streams);
        let stream = Stream::new_outgoing(recv_stream_id, &this, remote_lease_set);
        streams.insert(recv_stream_id, stream.clone());
        debug!("created outgoing stream {} on {}", recv_stream_id, self.ident_hash);
        stream
    }

    pub async fn create_incoming_stream(&self) -> Arc<Stream> {
        let this = self.self_ref.upgrade().expect("destinations live behind an Arc");
        let mut streams = self.streams.write().await;
        let recv_stream_id = allocate_stream_id(&streams);
        let stream = Stream::new_incoming(recv_stream_id, &this);
        streams.insert(recv_stream_id, stream.clone());
        stream
    }

    /// Removes the stream from the table; its buffered packets go with it.
    pub async fn delete_stream(&self, recv_stream_id: u32) -> bool {
        if self.streams.write().await.remove(&recv_stream_id).is_some() {
            debug!("deleted stream {} on {}", recv_stream_id, self.ident_hash);
            true
        } else {
            false
        }
    }

    pub async fn handle_next_packet(&self, packet: Packet) {
        let send_stream_id = packet.send_stream_id();
        if send_stream_id != 0 {
            let stream = self.streams.read().await.get(&send_stream_id).cloned();
            match stream {
                Some(stream) => stream.handle_next_packet(packet).await,
                None => debug!("packet for unknown stream {} on {} - dropping", send_stream_id, self.ident_hash),
            }
        } else {
            // new inbound stream - the acceptor runs before the first packet so the
            //  application can attach itself atomically with respect to data arrival
            let stream = self.create_incoming_stream().await;
            debug!("new incoming stream {} on {}", stream.recv_stream_id(), self.ident_hash);
            if let Some(acceptor) = self.acceptor.read().await.as_ref() {
                acceptor(&stream);
            }
            stream.handle_next_packet(packet).await;
        }
    }

    /// The current lease set, rebuilt from the tunnel pool when missing or when any lease
    ///  in it has expired. After a rebuild every owned stream bundles the fresh lease set
    ///  into its next outbound packet.
    pub async fn lease_set(&self) -> Arc<LeaseSet> {
        let mut guard = self.lease_set.write().await;

        let needs_refresh = guard.as_ref().map_or(true, |ls| ls.has_expired_leases(now_millis()));
        if needs_refresh {
            let fresh = Arc::new(LeaseSet::new(self.ident_hash, self.tunnel_pool.inbound_leases()));
            debug!("republishing lease set for {} with {} leases", self.ident_hash, fresh.leases().len());
            *guard = Some(fresh);

            for stream in self.streams.read().await.values() {
                stream.set_lease_set_updated();
            }
        }

        guard.clone().expect("refreshed above")
    }

    pub async fn lease_set_msg(&self) -> I2npMessage {
        let lease_set = self.lease_set().await;
        let mut buf = BytesMut::new();
        lease_set.ser(&mut buf);
        I2npMessage::new(I2npMessageKind::DatabaseStore, buf.to_vec())
    }

    pub fn sign(&self, data: &[u8]) -> anyhow::Result<[u8; SIGNATURE_LEN]> {
        identity::sign(&self.signing_key, data)
    }
}

fn allocate_stream_id(streams: &FxHashMap<u32, Arc<Stream>>) -> u32 {
    loop {
        let id: u32 = rand::random();
        if id != 0 && !streams.contains_key(&id) {
            return id;
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::garlic::MockGarlic;
    use crate::identity::test_support::{local_keys, remote_keys};
    use crate::lease::{Lease, MockNetDb};
    use crate::tunnel::{MockOutboundTunnel, MockTunnelPool, MockTunnelPoolProvider, OutboundTunnel};
    use crate::service::ServiceThread;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    pub(crate) struct SentPacket {
        pub gateway: IdentHash,
        pub tunnel_id: u32,
        pub msg: I2npMessage,
    }

    impl SentPacket {
        pub(crate) fn packet(&self) -> Packet {
            crate::codec::parse_data_message(&self.msg.payload).expect("sent packet parses")
        }
    }

    pub(crate) struct TestHarness {
        pub service_thread: ServiceThread,
        pub destination: Arc<Destination>,
        pub sent_rx: mpsc::UnboundedReceiver<SentPacket>,
        /// one entry per garlic wrap: was a lease set bundled?
        pub bundled_flags: Arc<Mutex<Vec<bool>>>,
    }

    impl TestHarness {
        /// Waits until every task posted to the service so far has run.
        pub(crate) async fn flush_service(&self) {
            let (tx, rx) = tokio::sync::oneshot::channel();
            self.service_thread.service().post(async move {
                let _ = tx.send(());
            });
            tokio::time::timeout(Duration::from_secs(5), rx)
                .await
                .expect("service did not flush in time")
                .expect("service dropped the flush marker");
        }

        pub(crate) async fn next_sent(&mut self) -> SentPacket {
            tokio::time::timeout(Duration::from_secs(5), self.sent_rx.recv())
                .await
                .expect("no packet was sent in time")
                .expect("send capture channel closed")
        }
    }

    pub(crate) fn fresh_lease(tag: u8) -> Lease {
        Lease {
            tunnel_gateway: IdentHash::from_bytes([tag; 32]),
            tunnel_id: tag as u32,
            end_date: now_millis() + 600_000,
        }
    }

    pub(crate) fn expired_lease(tag: u8) -> Lease {
        Lease {
            tunnel_gateway: IdentHash::from_bytes([tag; 32]),
            tunnel_id: tag as u32,
            end_date: 1,
        }
    }

    pub(crate) fn remote_lease_set(leases: Vec<Lease>) -> Arc<LeaseSet> {
        Arc::new(LeaseSet::new(remote_keys().identity.hash(), leases))
    }

    pub(crate) fn netdb_returning_none() -> MockNetDb {
        let mut netdb = MockNetDb::new();
        netdb.expect_find_lease_set().returning(|_| None);
        netdb
    }

    pub(crate) fn harness(netdb: MockNetDb) -> TestHarness {
        harness_with_inbound_leases(netdb, vec![fresh_lease(9)])
    }

    pub(crate) fn harness_with_inbound_leases(netdb: MockNetDb, inbound_leases: Vec<Lease>) -> TestHarness {
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let mut tunnel = MockOutboundTunnel::new();
        tunnel
            .expect_send_tunnel_data_msg()
            .returning(move |gateway, tunnel_id, msg| {
                let _ = sent_tx.send(SentPacket { gateway: *gateway, tunnel_id, msg });
            });
        let tunnel: Arc<dyn OutboundTunnel> = Arc::new(tunnel);

        let mut pool = MockTunnelPool::new();
        pool.expect_next_outbound_tunnel().returning(move || Some(tunnel.clone()));
        pool.expect_inbound_leases().returning(move || inbound_leases.clone());
        let pool: Arc<dyn TunnelPool> = Arc::new(pool);

        let mut tunnel_pools = MockTunnelPoolProvider::new();
        tunnel_pools.expect_create_tunnel_pool().returning(move |_, _| pool.clone());

        let bundled_flags = Arc::new(Mutex::new(Vec::new()));
        let mut garlic = MockGarlic::new();
        {
            let bundled_flags = bundled_flags.clone();
            garlic.expect_wrap_message().returning(move |_, msg, bundled| {
                bundled_flags.lock().unwrap().push(bundled.is_some());
                msg
            });
        }

        let service_thread = ServiceThread::spawn().expect("service thread");
        let destination = Destination::new(
            local_keys().clone(),
            Arc::new(StreamingConfig::new(PathBuf::from("."))),
            service_thread.service(),
            Arc::new(netdb),
            Arc::new(garlic),
            &tunnel_pools,
        )
        .expect("destination");

        TestHarness {
            service_thread,
            destination,
            sent_rx,
            bundled_flags,
        }
    }
}
