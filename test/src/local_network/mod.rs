//! In-memory transport for deterministic tests.
//! Routes frames between services sharing one [`LocalNetwork`] without any IO.

use std::{
    collections::{HashMap, VecDeque},
    net::SocketAddr,
    sync::Arc,
};

use log::trace;
use parking_lot::Mutex;

use actornet::{
    check_frame_size, ChannelError, ChannelInfo, ChannelState, Service, ServiceEvent,
};
use actornet_shared::{ChannelId, ChannelKind, ErrorCode, IdGenerator, TransportKind};

const FIRST_CLIENT_PORT: u16 = 40_000;

struct Endpoint {
    listening: bool,
    ids: Arc<dyn IdGenerator>,
    inbox: VecDeque<ServiceEvent>,
    // local channel -> (peer address, peer channel)
    peers: HashMap<ChannelId, (SocketAddr, ChannelId)>,
}

#[derive(Default)]
struct Hub {
    endpoints: HashMap<SocketAddr, Endpoint>,
    next_client_port: u16,
}

impl Hub {
    fn push(&mut self, address: SocketAddr, event: ServiceEvent) {
        if let Some(endpoint) = self.endpoints.get_mut(&address) {
            endpoint.inbox.push_back(event);
        }
    }

    fn disconnect(&mut self, address: SocketAddr, channel_id: ChannelId, error: ErrorCode) {
        let peer = self
            .endpoints
            .get_mut(&address)
            .and_then(|endpoint| endpoint.peers.remove(&channel_id));
        if let Some((peer_address, peer_channel)) = peer {
            if let Some(endpoint) = self.endpoints.get_mut(&peer_address) {
                endpoint.peers.remove(&peer_channel);
            }
            self.push(
                peer_address,
                ServiceEvent::Error {
                    channel_id: peer_channel,
                    error,
                },
            );
        }
    }
}

/// Shared switchboard. Cloning shares the same network.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// A service accepting connections on `address`
    pub fn listen(&self, address: SocketAddr, ids: Arc<dyn IdGenerator>) -> LocalService {
        self.attach(address, true, ids)
    }

    /// A service that only connects out, on a made-up address
    pub fn client(&self, ids: Arc<dyn IdGenerator>) -> LocalService {
        let port = {
            let mut hub = self.hub.lock();
            let port = FIRST_CLIENT_PORT + hub.next_client_port;
            hub.next_client_port += 1;
            port
        };
        self.attach(SocketAddr::from(([127, 0, 0, 1], port)), false, ids)
    }

    /// Fails every channel of `address` as if the peer host vanished
    pub fn crash(&self, address: SocketAddr) {
        let mut hub = self.hub.lock();
        let channels: Vec<ChannelId> = match hub.endpoints.get(&address) {
            Some(endpoint) => endpoint.peers.keys().copied().collect(),
            None => return,
        };
        for channel_id in channels {
            hub.disconnect(address, channel_id, ErrorCode::PEER_DISCONNECT);
        }
        hub.endpoints.remove(&address);
    }

    fn attach(&self, address: SocketAddr, listening: bool, ids: Arc<dyn IdGenerator>) -> LocalService {
        self.hub.lock().endpoints.insert(
            address,
            Endpoint {
                listening,
                ids: ids.clone(),
                inbox: VecDeque::new(),
                peers: HashMap::new(),
            },
        );
        LocalService {
            network: self.clone(),
            address,
            listening,
            ids,
            channels: HashMap::new(),
            max_frame_size: 64 * 1024,
            disposed: false,
        }
    }
}

/// [`Service`] over a [`LocalNetwork`]. Connects complete on the next `receive`.
pub struct LocalService {
    network: LocalNetwork,
    address: SocketAddr,
    listening: bool,
    ids: Arc<dyn IdGenerator>,
    channels: HashMap<ChannelId, ChannelInfo>,
    max_frame_size: usize,
    disposed: bool,
}

impl LocalService {
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    fn check_disposed(&self) -> Result<(), ChannelError> {
        if self.disposed {
            Err(ChannelError::ServiceDisposed)
        } else {
            Ok(())
        }
    }
}

impl Service for LocalService {
    fn kind(&self) -> TransportKind {
        TransportKind::Local
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        if self.listening {
            Some(self.address)
        } else {
            None
        }
    }

    fn connect_channel(&mut self, address: SocketAddr) -> Result<ChannelId, ChannelError> {
        self.check_disposed()?;
        let channel_id = self.ids.next_id();
        let mut info = ChannelInfo::new(channel_id, ChannelKind::Outgoing, address);
        info.transition(ChannelState::Connecting)?;
        self.channels.insert(channel_id, info);

        let mut hub = self.network.hub.lock();
        let peer_channel = match hub.endpoints.get_mut(&address) {
            Some(target) if target.listening => {
                let peer_channel = target.ids.next_id();
                target.peers.insert(peer_channel, (self.address, channel_id));
                target.inbox.push_back(ServiceEvent::Accepted {
                    channel_id: peer_channel,
                    remote: self.address,
                });
                Some(peer_channel)
            }
            _ => None,
        };
        let event = match peer_channel {
            Some(peer_channel) => {
                if let Some(endpoint) = hub.endpoints.get_mut(&self.address) {
                    endpoint.peers.insert(channel_id, (address, peer_channel));
                }
                ServiceEvent::Connected {
                    channel_id,
                    remote: address,
                }
            }
            None => ServiceEvent::Error {
                channel_id,
                error: ErrorCode::CONNECT_FAILED,
            },
        };
        hub.push(self.address, event);
        trace!("local channel {} connecting {} -> {}", channel_id, self.address, address);
        Ok(channel_id)
    }

    fn send(&mut self, channel_id: ChannelId, frame: &[u8]) -> Result<(), ChannelError> {
        self.check_disposed()?;
        let info = self
            .channels
            .get(&channel_id)
            .ok_or(ChannelError::NotFound { channel_id })?;
        info.check_writable()?;
        check_frame_size(frame, self.max_frame_size)?;

        let mut hub = self.network.hub.lock();
        let peer = hub
            .endpoints
            .get(&self.address)
            .and_then(|endpoint| endpoint.peers.get(&channel_id).copied());
        let Some((peer_address, peer_channel)) = peer else {
            return Err(ChannelError::Failed {
                channel_id,
                error: ErrorCode::PEER_DISCONNECT,
            });
        };
        hub.push(
            peer_address,
            ServiceEvent::Read {
                channel_id: peer_channel,
                frame: frame.to_vec(),
            },
        );
        Ok(())
    }

    fn remove(&mut self, channel_id: ChannelId) {
        if self.channels.remove(&channel_id).is_none() {
            return;
        }
        self.network
            .hub
            .lock()
            .disconnect(self.address, channel_id, ErrorCode::PEER_DISCONNECT);
    }

    fn receive(&mut self) -> Option<ServiceEvent> {
        loop {
            let event = {
                let mut hub = self.network.hub.lock();
                hub.endpoints.get_mut(&self.address)?.inbox.pop_front()?
            };
            match event {
                ServiceEvent::Accepted { channel_id, remote } => {
                    let mut info = ChannelInfo::new(channel_id, ChannelKind::Accepted, remote);
                    if info.open().is_ok() {
                        self.channels.insert(channel_id, info);
                        return Some(ServiceEvent::Accepted { channel_id, remote });
                    }
                }
                ServiceEvent::Connected { channel_id, remote } => {
                    if let Some(info) = self.channels.get_mut(&channel_id) {
                        if info.open().is_ok() {
                            return Some(ServiceEvent::Connected { channel_id, remote });
                        }
                    }
                }
                ServiceEvent::Read { channel_id, frame } => {
                    if self
                        .channels
                        .get(&channel_id)
                        .map_or(false, ChannelInfo::is_open)
                    {
                        return Some(ServiceEvent::Read { channel_id, frame });
                    }
                }
                ServiceEvent::Error { channel_id, error } => {
                    if let Some(info) = self.channels.get_mut(&channel_id) {
                        if info.fail(error) {
                            return Some(ServiceEvent::Error { channel_id, error });
                        }
                    }
                }
            }
        }
    }

    fn channel(&self, channel_id: ChannelId) -> Option<&ChannelInfo> {
        self.channels.get(&channel_id)
    }

    fn channel_ids(&self) -> Vec<ChannelId> {
        self.channels.keys().copied().collect()
    }

    fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        for channel_id in self.channel_ids() {
            self.remove(channel_id);
        }
        if let Some(endpoint) = self.network.hub.lock().endpoints.get_mut(&self.address) {
            endpoint.listening = false;
        }
    }

    fn is_disposed(&self) -> bool {
        self.disposed
    }
}
