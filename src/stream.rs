use crate::codec;
use crate::destination::Destination;
use crate::garlic::Garlic;
use crate::identity::Identity;
use crate::lease::{now_millis, Lease, LeaseSet, NetDb};
use crate::packet::{
    Packet, PacketHeader, FLAG_CLOSE, FLAG_FROM_INCLUDED, FLAG_MAX_PACKET_SIZE_INCLUDED,
    FLAG_NO_ACK, FLAG_SIGNATURE_INCLUDED, FLAG_SYNCHRONIZE, PACKET_HEADER_LEN, SIGNATURE_LEN,
};
use crate::service::Service;
use anyhow::{anyhow, bail};
use bytes::{BufMut, BytesMut};
use rand::Rng;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// outgoing stream before the first `send`, i.e. before the SYN went out
    New,
    Open,
    Closed,
}

struct StreamInner {
    /// the peer's receive stream id; 0 until the first packet from the peer arrives
    send_stream_id: u32,
    /// next sequence number to assign to an outbound packet
    sequence_number: u32,
    /// highest sequence number delivered in order; `None` until the first packet is processed
    last_received_sequence_number: Option<u32>,
    state: StreamState,
    remote_identity: Option<Identity>,
    remote_lease_set: Option<Arc<LeaseSet>>,
    current_remote_lease: Option<Lease>,
    /// in-order payload, available to the application through `concatenate`
    receive_queue: VecDeque<Packet>,
    /// out-of-order future packets, waiting for the gap to be filled
    saved_packets: BTreeMap<u32, Packet>,
}

impl StreamInner {
    fn next_seqn(&mut self) -> u32 {
        let seqn = self.sequence_number;
        self.sequence_number = self.sequence_number.wrapping_add(1);
        seqn
    }

    fn next_expected_seqn(&self) -> u32 {
        self.last_received_sequence_number.map_or(1, |last| last.wrapping_add(1))
    }
}

/// One endpoint of a reliable, in-order, bidirectional byte stream.
///
/// Inbound packets are re-ordered by sequence number and surface through `concatenate` /
///  `receive`; every in-order delivery is acknowledged with a data-less quick ack.
///  Outbound data is packetized (SYN with identity and signature on the first send of an
///  outgoing stream), garlic-wrapped and handed to an outbound tunnel aimed at the
///  currently chosen lease of the peer.
pub struct Stream {
    recv_stream_id: u32,
    is_outgoing: bool,
    /// handle to the `Arc` every stream lives behind, for posting work onto the service
    self_ref: Weak<Stream>,
    local: Weak<Destination>,
    netdb: Arc<dyn NetDb>,
    garlic: Arc<dyn Garlic>,
    service: Service,
    /// when set, the next outbound packet bundles the local lease set for the peer
    lease_set_updated: AtomicBool,
    /// notified when payload arrives or the stream closes - the application's wait-for-data
    ///  primitive
    receive_notify: Notify,
    inner: RwLock<StreamInner>,
}

impl Stream {
    pub(crate) fn new_outgoing(
        recv_stream_id: u32,
        local: &Arc<Destination>,
        remote_lease_set: Arc<LeaseSet>,
    ) -> Arc<Stream> {
        let current_remote_lease = pick_lease(&remote_lease_set);
        Arc::new_cyclic(|self_ref| Stream {
            recv_stream_id,
            is_outgoing: true,
            self_ref: self_ref.clone(),
            local: Arc::downgrade(local),
            netdb: local.netdb(),
            garlic: local.garlic(),
            service: local.service(),
            lease_set_updated: AtomicBool::new(true),
            receive_notify: Notify::new(),
            inner: RwLock::new(StreamInner {
                send_stream_id: 0,
                sequence_number: 0,
                last_received_sequence_number: None,
                state: StreamState::New,
                remote_identity: None,
                remote_lease_set: Some(remote_lease_set),
                current_remote_lease,
                receive_queue: VecDeque::new(),
                saved_packets: BTreeMap::new(),
            }),
        })
    }

    pub(crate) fn new_incoming(recv_stream_id: u32, local: &Arc<Destination>) -> Arc<Stream> {
        Arc::new_cyclic(|self_ref| Stream {
            recv_stream_id,
            is_outgoing: false,
            self_ref: self_ref.clone(),
            local: Arc::downgrade(local),
            netdb: local.netdb(),
            garlic: local.garlic(),
            service: local.service(),
            lease_set_updated: AtomicBool::new(true),
            receive_notify: Notify::new(),
            inner: RwLock::new(StreamInner {
                send_stream_id: 0,
                sequence_number: 0,
                last_received_sequence_number: None,
                state: StreamState::Open,
                remote_identity: None,
                remote_lease_set: None,
                current_remote_lease: None,
                receive_queue: VecDeque::new(),
                saved_packets: BTreeMap::new(),
            }),
        })
    }

    pub fn recv_stream_id(&self) -> u32 {
        self.recv_stream_id
    }

    pub fn is_outgoing(&self) -> bool {
        self.is_outgoing
    }

    pub async fn state(&self) -> StreamState {
        self.inner.read().await.state
    }

    pub async fn is_open(&self) -> bool {
        self.inner.read().await.state == StreamState::Open
    }

    pub(crate) fn local_destination(&self) -> Option<Arc<Destination>> {
        self.local.upgrade()
    }

    pub(crate) fn set_lease_set_updated(&self) {
        self.lease_set_updated.store(true, Ordering::Relaxed);
    }

    pub(crate) fn take_lease_set_updated(&self) -> bool {
        self.lease_set_updated.swap(false, Ordering::Relaxed)
    }

    /// Schedules `buf` for transmission as one packet and returns the accepted length.
    ///  The first send on an outgoing stream produces the SYN packet carrying the local
    ///  identity and a signature over the whole packet.
    pub async fn send(&self, buf: &[u8]) -> anyhow::Result<usize> {
        let local = self
            .local
            .upgrade()
            .ok_or_else(|| anyhow!("local destination is gone"))?;
        let mut inner = self.inner.write().await;

        let packet_buf = match inner.state {
            StreamState::Closed => bail!("stream {} is closed", self.recv_stream_id),
            StreamState::New => {
                let packet_buf = self.build_syn_packet(&mut inner, &local, buf)?;
                inner.state = StreamState::Open;
                packet_buf
            }
            StreamState::Open => self.build_follow_on_packet(&mut inner, &local, buf)?,
        };
        drop(inner);

        let stream = self.self_ref.upgrade().expect("streams live behind an Arc");
        self.service.post(async move {
            stream.send_packet(&packet_buf).await;
        });
        Ok(buf.len())
    }

    /// Closes the sending direction: emits a signed FIN packet. Idempotent; draining the
    ///  receive queue stays possible.
    pub async fn close(&self) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        match inner.state {
            StreamState::Closed => return Ok(()),
            // nothing was ever sent, so there is nothing to close - the stream stays
            //  usable and the first send still opens it
            StreamState::New => return Ok(()),
            StreamState::Open => {}
        }
        let local = self
            .local
            .upgrade()
            .ok_or_else(|| anyhow!("local destination is gone"))?;
        inner.state = StreamState::Closed;

        let mut buf = BytesMut::new();
        PacketHeader {
            send_stream_id: inner.send_stream_id,
            recv_stream_id: self.recv_stream_id,
            seqn: inner.next_seqn(),
            ack_through: inner.last_received_sequence_number.unwrap_or(0),
            flags: FLAG_CLOSE | FLAG_SIGNATURE_INCLUDED,
            option_size: SIGNATURE_LEN as u16,
        }
        .ser(&mut buf);
        let signature_offset = buf.len();
        buf.put_bytes(0, SIGNATURE_LEN);
        let signature = local.sign(&buf)?;
        buf[signature_offset..signature_offset + SIGNATURE_LEN].copy_from_slice(&signature);
        drop(inner);

        self.receive_notify.notify_waiters();

        let stream = self.self_ref.upgrade().expect("streams live behind an Arc");
        self.service.post(async move {
            if stream.send_packet(&buf).await {
                debug!("FIN sent on stream {}", stream.recv_stream_id);
            }
        });
        Ok(())
    }

    fn build_syn_packet(
        &self,
        inner: &mut StreamInner,
        local: &Destination,
        payload: &[u8],
    ) -> anyhow::Result<BytesMut> {
        let option_size = Identity::SERIALIZED_LEN + 2 + SIGNATURE_LEN;
        let mtu = local.config().streaming_mtu;
        if PACKET_HEADER_LEN + option_size + payload.len() > mtu {
            bail!("SYN payload of {} bytes exceeds the streaming MTU of {}", payload.len(), mtu);
        }

        let mut buf = BytesMut::with_capacity(PACKET_HEADER_LEN + option_size + payload.len());
        PacketHeader {
            send_stream_id: inner.send_stream_id,
            recv_stream_id: self.recv_stream_id,
            seqn: inner.next_seqn(),
            ack_through: 0,
            flags: FLAG_SYNCHRONIZE
                | FLAG_FROM_INCLUDED
                | FLAG_SIGNATURE_INCLUDED
                | FLAG_MAX_PACKET_SIZE_INCLUDED
                | FLAG_NO_ACK,
            option_size: option_size as u16,
        }
        .ser(&mut buf);
        local.identity().ser(&mut buf);
        buf.put_u16(mtu as u16);
        let signature_offset = buf.len();
        buf.put_bytes(0, SIGNATURE_LEN);
        buf.put_slice(payload);

        // sign the whole packet with the signature field zeroed, then patch it in
        let signature = local.sign(&buf)?;
        buf[signature_offset..signature_offset + SIGNATURE_LEN].copy_from_slice(&signature);
        Ok(buf)
    }

    fn build_follow_on_packet(
        &self,
        inner: &mut StreamInner,
        local: &Destination,
        payload: &[u8],
    ) -> anyhow::Result<BytesMut> {
        let mtu = local.config().streaming_mtu;
        if PACKET_HEADER_LEN + payload.len() > mtu {
            bail!("payload of {} bytes exceeds the streaming MTU of {}", payload.len(), mtu);
        }

        let mut buf = BytesMut::with_capacity(PACKET_HEADER_LEN + payload.len());
        PacketHeader {
            send_stream_id: inner.send_stream_id,
            recv_stream_id: self.recv_stream_id,
            seqn: inner.next_seqn(),
            ack_through: inner.last_received_sequence_number.unwrap_or(0),
            flags: 0,
            option_size: 0,
        }
        .ser(&mut buf);
        buf.put_slice(payload);
        Ok(buf)
    }

    /// Non-blocking peek: is any in-order payload buffered right now? Usable from sync
    ///  contexts such as an acceptor callback.
    pub fn has_buffered_payload(&self) -> bool {
        self.inner
            .try_read()
            .map(|inner| !inner.receive_queue.is_empty())
            .unwrap_or(false)
    }

    /// Drains in-order payload into `buf`, partially consuming the head packet if `buf`
    ///  is smaller. Non-blocking; returns the number of bytes copied.
    pub async fn concatenate(&self, buf: &mut [u8]) -> usize {
        let mut inner = self.inner.write().await;

        let mut pos = 0;
        while pos < buf.len() {
            let Some(packet) = inner.receive_queue.front_mut() else {
                break;
            };
            let payload = packet.remaining();
            let count = payload.len().min(buf.len() - pos);
            buf[pos..pos + count].copy_from_slice(&payload[..count]);
            packet.advance(count);
            pos += count;

            if packet.remaining().is_empty() {
                inner.receive_queue.pop_front();
            }
        }
        pos
    }

    /// Like `concatenate`, but waits up to `timeout` for payload to arrive if none is
    ///  buffered. Returns 0 on timeout or when the stream is closed and drained.
    pub async fn receive(&self, buf: &mut [u8], timeout: Duration) -> usize {
        let mut notified = std::pin::pin!(self.receive_notify.notified());
        notified.as_mut().enable();

        let count = self.concatenate(buf).await;
        if count > 0 {
            return count;
        }
        if self.inner.read().await.state != StreamState::Open {
            return 0;
        }

        let _ = tokio::time::timeout(timeout, notified).await;
        self.concatenate(buf).await
    }

    pub async fn handle_next_packet(&self, packet: Packet) {
        let mut inner = self.inner.write().await;

        if inner.send_stream_id == 0 {
            inner.send_stream_id = packet.recv_stream_id();
        }

        let seqn = packet.seqn();
        if seqn == 0 && !packet.is_syn() {
            trace!("plain ack through #{} received on stream {}", packet.ack_through(), self.recv_stream_id);
            return;
        }

        trace!("received packet #{} on stream {}", seqn, self.recv_stream_id);
        let in_order = match inner.last_received_sequence_number {
            None => seqn == 1 || packet.is_syn() && seqn == 0,
            Some(last) => seqn == last.wrapping_add(1),
        };

        if in_order {
            if let Err(e) = self.process_packet(&mut inner, packet).await {
                debug!("dropping packet #{} on stream {}: {:#}", seqn, self.recv_stream_id, e);
                return;
            }

            // the gap towards stored future packets may be closed now
            loop {
                let next = inner.next_expected_seqn();
                let Some(saved) = inner.saved_packets.remove(&next) else {
                    break;
                };
                if let Err(e) = self.process_packet(&mut inner, saved).await {
                    debug!("dropping stored packet #{} on stream {}: {:#}", next, self.recv_stream_id, e);
                }
            }

            if inner.state == StreamState::Open {
                self.send_quick_ack(&mut inner).await;
            }
        } else if inner.last_received_sequence_number.is_some_and(|last| seqn <= last) {
            // a duplicate means our ack did not reach the peer, typically because the
            //  outbound tunnel died - switch to another lease and ack again
            debug!("duplicate packet #{} received on stream {}", seqn, self.recv_stream_id);
            self.update_current_remote_lease(&mut inner);
            self.send_quick_ack(&mut inner).await;
        } else {
            debug!(
                "missing packets #{}..#{} on stream {} - storing #{}",
                inner.next_expected_seqn(),
                seqn.wrapping_sub(1),
                self.recv_stream_id,
                seqn
            );
            inner.saved_packets.entry(seqn).or_insert(packet);
        }
    }

    async fn process_packet(&self, inner: &mut StreamInner, packet: Packet) -> anyhow::Result<()> {
        let seqn = packet.seqn();
        trace!("processing packet #{} with flags {:#06x} on stream {}", seqn, packet.flags(), self.recv_stream_id);

        let options = packet.options().to_vec();
        let mut cursor = 0;

        if packet.is_from_included() {
            let (identity, consumed) = Identity::from_buffer(&options[cursor..])?;
            cursor += consumed;

            if let Some(lease_set) = &inner.remote_lease_set {
                if identity.hash() != *lease_set.ident_hash() {
                    warn!(
                        "unexpected identity {} on stream {}, {} expected - discarding cached lease set",
                        identity.hash(),
                        self.recv_stream_id,
                        lease_set.ident_hash()
                    );
                    inner.remote_lease_set = None;
                }
            } else {
                debug!("stream {} peer identity is {}", self.recv_stream_id, identity.hash());
            }
            inner.remote_identity = Some(identity);
        }

        if packet.is_max_packet_size_included() {
            if options.len() < cursor + 2 {
                bail!("option block too short for the advertised packet size");
            }
            let advertised = u16::from_be_bytes(options[cursor..cursor + 2].try_into()?);
            trace!("peer on stream {} advertises a packet size of {}", self.recv_stream_id, advertised);
            cursor += 2;
        }

        if packet.is_signature_included() {
            if options.len() < cursor + SIGNATURE_LEN {
                bail!("option block too short for a signature");
            }
            let signature_offset = packet.option_offset() + cursor;
            match &inner.remote_identity {
                Some(identity) => {
                    let mut signed = packet.as_bytes().to_vec();
                    signed[signature_offset..signature_offset + SIGNATURE_LEN].fill(0);
                    identity
                        .verify(&signed, &packet.as_bytes()[signature_offset..signature_offset + SIGNATURE_LEN])
                        .map_err(|e| anyhow!("packet signature rejected: {:#}", e))?;
                }
                None => debug!(
                    "packet #{} on stream {} carries a signature but no identity is known - skipping verification",
                    seqn, self.recv_stream_id
                ),
            }
        }

        let is_close = packet.is_close();
        if packet.payload().is_empty() {
            // data-less control packet, nothing to queue
        } else {
            inner.receive_queue.push_back(packet);
            self.receive_notify.notify_waiters();
        }
        inner.last_received_sequence_number = Some(seqn);

        if is_close {
            debug!("peer closed stream {}", self.recv_stream_id);
            self.send_quick_ack(inner).await;
            inner.state = StreamState::Closed;
            self.receive_notify.notify_waiters();
        }
        Ok(())
    }

    async fn send_quick_ack(&self, inner: &mut StreamInner) {
        let mut buf = BytesMut::new();
        PacketHeader {
            send_stream_id: inner.send_stream_id,
            recv_stream_id: self.recv_stream_id,
            seqn: 0,
            ack_through: inner.last_received_sequence_number.unwrap_or(0),
            flags: 0,
            option_size: 0,
        }
        .ser(&mut buf);

        if self.send_packet_locked(inner, &buf).await {
            trace!("quick ack through #{} sent on stream {}", inner.last_received_sequence_number.unwrap_or(0), self.recv_stream_id);
        }
    }

    /// Wraps and submits one finished packet buffer. Returns whether it was handed to a
    ///  tunnel; every failure mode only affects this one packet.
    pub(crate) async fn send_packet(&self, packet_buf: &[u8]) -> bool {
        let mut inner = self.inner.write().await;
        self.send_packet_locked(&mut inner, packet_buf).await
    }

    async fn send_packet_locked(&self, inner: &mut StreamInner, packet_buf: &[u8]) -> bool {
        if inner.remote_lease_set.is_none() {
            self.update_current_remote_lease(inner);
        }
        let Some(remote_lease_set) = inner.remote_lease_set.clone() else {
            warn!("cannot send on stream {}: remote lease set unknown", self.recv_stream_id);
            return false;
        };

        let Some(local) = self.local.upgrade() else {
            warn!("cannot send on stream {}: local destination is gone", self.recv_stream_id);
            return false;
        };

        let bundled_lease_set = if self.lease_set_updated.load(Ordering::Relaxed) {
            let msg = local.lease_set_msg().await;
            // cleared only after the fetch - a refresh during the fetch re-raises the flag
            //  on every stream, this one included
            self.lease_set_updated.store(false, Ordering::Relaxed);
            Some(msg)
        } else {
            None
        };

        let data_msg = match codec::create_data_message(packet_buf) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("cannot build data message on stream {}: {:#}", self.recv_stream_id, e);
                return false;
            }
        };
        let msg = self.garlic.wrap_message(&remote_lease_set, data_msg, bundled_lease_set);

        let Some(tunnel) = local.tunnel_pool().next_outbound_tunnel() else {
            warn!("no outbound tunnels in the pool for stream {}", self.recv_stream_id);
            return false;
        };

        let now = now_millis();
        if inner.current_remote_lease.as_ref().map_or(true, |lease| now >= lease.end_date) {
            self.update_current_remote_lease(inner);
        }
        let Some(lease) = inner.current_remote_lease.clone().filter(|lease| now < lease.end_date) else {
            warn!("all leases are expired for stream {}", self.recv_stream_id);
            return false;
        };

        tunnel.send_tunnel_data_msg(&lease.tunnel_gateway, lease.tunnel_id, msg).await;
        true
    }

    /// Re-resolves the remote lease set if necessary and picks a fresh lease, uniformly at
    ///  random among the non-expired ones.
    fn update_current_remote_lease(&self, inner: &mut StreamInner) {
        if inner.remote_lease_set.is_none() {
            match &inner.remote_identity {
                Some(identity) => {
                    inner.remote_lease_set = self.netdb.find_lease_set(&identity.hash());
                    if inner.remote_lease_set.is_none() {
                        debug!("lease set for {} not found", identity.hash());
                    }
                }
                None => debug!("no remote identity known on stream {} yet", self.recv_stream_id),
            }
        }
        inner.current_remote_lease = inner.remote_lease_set.as_deref().and_then(pick_lease);
    }
}

fn pick_lease(lease_set: &LeaseSet) -> Option<Lease> {
    let leases = lease_set.non_expired_leases(now_millis());
    if leases.is_empty() {
        None
    } else {
        Some(leases[rand::thread_rng().gen_range(0..leases.len())].clone())
    }
}
