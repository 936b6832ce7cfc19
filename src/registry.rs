use crate::codec;
use crate::config::StreamingConfig;
use crate::destination::Destination;
use crate::garlic::Garlic;
use crate::identity::{create_random_keys, IdentHash, PrivateKeys};
use crate::lease::{LeaseSet, NetDb};
use crate::packet::Packet;
use crate::service::{Service, ServiceThread};
use crate::stream::Stream;
use crate::tunnel::TunnelPoolProvider;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, span, warn, Instrument, Level};
use uuid::Uuid;

/// The collection of local destinations, and the owner of the service thread all stream
///  work runs on. Inbound packets enter here, keyed by destination hash.
pub struct DestinationRegistry {
    inner: Arc<RegistryInner>,
    service_thread: ServiceThread,
}

struct RegistryInner {
    service: Service,
    destinations: RwLock<FxHashMap<IdentHash, Arc<Destination>>>,
    shared_local: Arc<Destination>,
}

impl DestinationRegistry {
    /// Brings up streaming: creates the shared local destination with fresh keys, loads
    ///  any persisted destinations from the data directory, and spawns the service thread.
    pub fn start(
        config: StreamingConfig,
        netdb: Arc<dyn NetDb>,
        garlic: Arc<dyn Garlic>,
        tunnel_pools: Arc<dyn TunnelPoolProvider>,
    ) -> anyhow::Result<DestinationRegistry> {
        config.validate()?;
        let config = Arc::new(config);

        let service_thread = ServiceThread::spawn()?;
        let service = service_thread.service();

        let shared_local = Destination::new(
            create_random_keys()?,
            config.clone(),
            service.clone(),
            netdb.clone(),
            garlic.clone(),
            tunnel_pools.as_ref(),
        )?;

        let mut destinations = FxHashMap::default();
        destinations.insert(*shared_local.ident_hash(), shared_local.clone());

        let loaded = load_local_destinations(
            &config,
            &service,
            &netdb,
            &garlic,
            tunnel_pools.as_ref(),
            &mut destinations,
        )?;
        if loaded > 0 {
            info!("{} local destinations loaded", loaded);
        }

        Ok(DestinationRegistry {
            inner: Arc::new(RegistryInner {
                service,
                destinations: RwLock::new(destinations),
                shared_local,
            }),
            service_thread,
        })
    }

    /// Runs all previously posted work, stops the service and joins its thread. The
    ///  destinations - and with them their streams and queued packets - are torn down
    ///  when the last reference goes away.
    pub fn stop(self) {
        self.service_thread.stop();
        info!("streaming stopped");
    }

    pub fn shared_local_destination(&self) -> Arc<Destination> {
        self.inner.shared_local.clone()
    }

    pub async fn destination(&self, ident_hash: &IdentHash) -> Option<Arc<Destination>> {
        self.inner.destinations.read().await.get(ident_hash).cloned()
    }

    pub async fn destination_count(&self) -> usize {
        self.inner.destinations.read().await.len()
    }

    /// Opens a stream from the shared local destination towards `remote_lease_set`.
    pub async fn create_client_stream(&self, remote_lease_set: Arc<LeaseSet>) -> Arc<Stream> {
        self.inner.shared_local.create_outgoing_stream(remote_lease_set).await
    }

    /// Removal is posted to the service so stream teardown has the same ordering
    ///  guarantees as the rest of the stream work.
    pub fn delete_stream(&self, stream: &Arc<Stream>) {
        let stream = stream.clone();
        self.inner.service.post(async move {
            if let Some(destination) = stream.local_destination() {
                destination.delete_stream(stream.recv_stream_id()).await;
            }
        });
    }

    /// Entry point for inbound data messages as delivered by the node's message
    ///  dispatcher.
    pub fn handle_data_message(&self, destination: IdentHash, buf: &[u8]) {
        match codec::parse_data_message(buf) {
            Ok(packet) => self.handle_next_packet(destination, packet),
            Err(e) => debug!("dropping data message for {}: {:#}", destination, e),
        }
    }

    pub fn handle_next_packet(&self, destination: IdentHash, packet: Packet) {
        let inner = self.inner.clone();
        let task = async move {
            let dest = inner.destinations.read().await.get(&destination).cloned();
            match dest {
                Some(dest) => dest.handle_next_packet(packet).await,
                None => debug!("local destination {} not found - dropping packet", destination),
            }
        };
        self.inner
            .service
            .post(task.instrument(span!(Level::TRACE, "packet_received", correlation_id = %Uuid::new_v4())));
    }
}

fn load_local_destinations(
    config: &Arc<StreamingConfig>,
    service: &Service,
    netdb: &Arc<dyn NetDb>,
    garlic: &Arc<dyn Garlic>,
    tunnel_pools: &dyn TunnelPoolProvider,
    destinations: &mut FxHashMap<IdentHash, Arc<Destination>>,
) -> anyhow::Result<usize> {
    let entries = match std::fs::read_dir(&config.data_dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!("cannot read data directory {:?}: {}", config.data_dir, e);
            return Ok(0);
        }
    };

    let mut count = 0;
    for entry in entries {
        let path = entry?.path();
        if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some(config.keys_file_extension.as_str()) {
            continue;
        }

        let keys = std::fs::read(&path)
            .map_err(anyhow::Error::from)
            .and_then(|buf| PrivateKeys::from_buffer(&buf));
        let keys = match keys {
            Ok(keys) => keys,
            Err(e) => {
                warn!("skipping key file {:?}: {:#}", path, e);
                continue;
            }
        };

        match Destination::new(
            keys,
            config.clone(),
            service.clone(),
            netdb.clone(),
            garlic.clone(),
            tunnel_pools,
        ) {
            Ok(destination) => {
                debug!("loaded local destination {} from {:?}", destination.ident_hash(), path);
                destinations.insert(*destination.ident_hash(), destination);
                count += 1;
            }
            Err(e) => warn!("skipping key file {:?}: {:#}", path, e),
        }
    }
    Ok(count)
}
