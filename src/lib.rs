//! Reliable, in-order, bidirectional byte streams over garlic-encrypted tunnels.
//!
//! The transport underneath is about as hostile as it gets: delivery is best effort,
//!  latency is high and variable (every packet crosses several multi-hop tunnels), and
//!  the peer's entry points ("leases") churn as tunnels are rebuilt. This crate layers
//!  conversations on top of that and hides the churn from the application.
//!
//! ## Design goals
//!
//! * The abstraction is a *byte stream* per conversation, multiplexed per local
//!   destination: one cryptographic identity terminates many streams, and inbound
//!   packets carry the receiver's stream id for demultiplexing.
//! * Streams are set up in-band: the first packet of an outgoing stream is a SYN that
//!   carries the sender's full identity and a signature, so the receiver learns who is
//!   talking without any out-of-band exchange.
//! * Buffer out-of-order packets and deliver payload strictly in sequence; every in-order
//!   delivery is acknowledged with a data-less "quick ack".
//! * A duplicate from the peer means our ack never arrived - most likely the outbound
//!   tunnel died. The response is to switch to another of the peer's leases and ack
//!   again, not to tear anything down.
//! * Lease sets are resolved through the network database on demand and never cached
//!   beyond the current send; the local lease set is rebuilt from the tunnel pool
//!   whenever a lease in it expires, and bundled to peers with the next packet.
//! * No retransmission and no congestion control in this layer: sequence numbers and
//!   acks are carried so that higher layers can build on them, but lost data packets are
//!   not resent here.
//!
//! ## Wire format
//!
//! Streaming packets travel gzip-compressed inside data messages. The packet itself,
//!  all numbers in network byte order (BE):
//!
//! ```ascii
//! 0:  send stream id (u32) - the *recipient's* stream id, 0 announces a new stream
//! 4:  recv stream id (u32) - the sender's stream id, echoed back by the peer
//! 8:  sequence number (u32) - 0 on data-less acks (and on the SYN of a fresh stream)
//! 12: ack through (u32) - highest contiguous sequence number received from the peer
//! 16: NACK count (u8), followed by 4 bytes per entry - never emitted, tolerated inbound
//! *:  resend delay (u8) - advisory, ignored
//! *:  flags (u16)
//! *:  option block size (u16)
//! *:  option block - FROM identity, advertised packet size, signature, in flag order
//! *:  payload
//! ```
//!
//! The compressed block inside a data message is prefixed with its length (u32), and two
//!  header fields of the gzip envelope are repurposed: MTIME carries the source and
//!  destination ports, the OS byte the payload protocol id (6 for streaming).
//!
//! ## Threading model
//!
//! All stream and destination state is driven by a single service thread: work enters
//!  through [`service::Service::post`] and runs strictly one task at a time, in posting
//!  order. The public APIs either run on that thread already (inbound dispatch) or post
//!  to it (sending, stream deletion).

pub mod codec;
pub mod config;
pub mod destination;
pub mod garlic;
pub mod i2np;
pub mod identity;
pub mod lease;
pub mod packet;
pub mod registry;
pub mod service;
pub mod stream;
pub mod tunnel;
