//! Ordered, retransmitting messages over UDP.
//!
//! The socket is non-blocking and only touched from `update`, on the owning
//! fiber. Connection setup follows a SYN / ACK exchange keyed by random 32-bit
//! connection ids; an accepted channel stays in a wait list until the
//! connector's first MSG arrives.

mod link;
mod packet;

pub use link::{LinkError, LinkSettings, ReliableLink, MAX_FRAGMENTS};
pub use packet::{Packet, PacketError, Segment};

use std::{
    collections::{HashMap, VecDeque},
    io::ErrorKind,
    net::{SocketAddr, UdpSocket},
    sync::Arc,
};

use log::{debug, info, trace, warn};

use actornet_shared::{
    ChannelId, ChannelKind, ErrorCode, IdGenerator, Millis, ReliableConfig, TransportConfig,
    TransportKind,
};

use crate::{
    channel::{check_frame_size, ChannelError, ChannelInfo, ChannelState},
    service::{Service, ServiceEvent},
};

const RECV_BUFFER_SIZE: usize = 64 * 1024;

struct ReliableChannel {
    info: ChannelInfo,
    local_conn: u32,
    remote_conn: u32,
    link: ReliableLink,
    /// Stamped by the first `drive_channels` after creation, since a channel
    /// may be created before the service has seen any clock reading.
    created_at: Option<Millis>,
    last_syn: Option<Millis>,
}

pub struct ReliableService {
    socket: Option<UdpSocket>,
    local_addr: SocketAddr,
    ids: Arc<dyn IdGenerator>,
    settings: LinkSettings,
    max_frame_size: usize,
    connect_timeout: Millis,
    syn_interval: Millis,
    channels: HashMap<ChannelId, ReliableChannel>,
    by_conn: HashMap<u32, ChannelId>,
    events: VecDeque<ServiceEvent>,
    now: Millis,
    recv_buffer: Vec<u8>,
}

impl ReliableService {
    /// Binds the UDP socket. Every reliable service can both accept and connect;
    /// bind to port 0 for a connect-only endpoint.
    pub fn bind(
        address: SocketAddr,
        config: &TransportConfig,
        ids: Arc<dyn IdGenerator>,
    ) -> Result<Self, ChannelError> {
        let bind_error = |err: std::io::Error| ChannelError::Bind {
            address,
            message: err.to_string(),
        };
        let socket = UdpSocket::bind(address).map_err(bind_error)?;
        socket.set_nonblocking(true).map_err(bind_error)?;
        let local_addr = socket.local_addr().map_err(bind_error)?;
        info!("reliable service bound to {}", local_addr);

        let reliable: &ReliableConfig = &config.reliable;
        Ok(Self {
            socket: Some(socket),
            local_addr,
            ids,
            settings: LinkSettings::from_config(config),
            max_frame_size: config.max_frame_size,
            connect_timeout: config.connect_timeout.as_millis() as Millis,
            syn_interval: reliable.syn_interval.as_millis() as Millis,
            channels: HashMap::new(),
            by_conn: HashMap::new(),
            events: VecDeque::new(),
            now: 0,
            recv_buffer: vec![0u8; RECV_BUFFER_SIZE],
        })
    }

    fn new_conn_id(&self) -> u32 {
        loop {
            let conn = fastrand::u32(1..);
            if !self.by_conn.contains_key(&conn) {
                return conn;
            }
        }
    }

    fn transmit(&self, remote: SocketAddr, packet: &Packet) {
        let Some(socket) = &self.socket else {
            return;
        };
        if let Err(err) = socket.send_to(&packet.encode(), remote) {
            if err.kind() != ErrorKind::WouldBlock {
                debug!("reliable send to {} failed: {}", remote, err);
            }
        }
    }

    fn receive_datagrams(&mut self) {
        loop {
            let Some(socket) = &self.socket else {
                return;
            };
            let (length, remote) = match socket.recv_from(&mut self.recv_buffer) {
                Ok(received) => received,
                Err(err) if err.kind() == ErrorKind::WouldBlock => return,
                // ICMP port unreachable surfaces here on some platforms
                Err(err) => {
                    trace!("reliable recv failed: {}", err);
                    continue;
                }
            };
            match Packet::decode(&self.recv_buffer[..length]) {
                Ok(packet) => self.handle_packet(remote, packet),
                Err(err) => debug!("dropping datagram from {}: {}", remote, err),
            }
        }
    }

    fn handle_packet(&mut self, remote: SocketAddr, packet: Packet) {
        match packet {
            Packet::Syn { connector } => self.handle_syn(remote, connector),
            Packet::Ack {
                acceptor,
                connector,
            } => self.handle_ack(remote, acceptor, connector),
            Packet::Fin {
                sender, receiver, ..
            } => {
                if let Some(channel_id) = self.find_channel(remote, sender, receiver) {
                    self.fail_channel(channel_id, ErrorCode::PEER_DISCONNECT);
                }
            }
            Packet::Msg {
                sender,
                receiver,
                segment,
            } => self.handle_msg(remote, sender, receiver, segment),
        }
    }

    fn find_channel(&self, remote: SocketAddr, sender: u32, receiver: u32) -> Option<ChannelId> {
        let channel_id = *self.by_conn.get(&receiver)?;
        let channel = self.channels.get(&channel_id)?;
        if channel.remote_conn != sender || channel.info.remote != remote {
            return None;
        }
        Some(channel_id)
    }

    fn handle_syn(&mut self, remote: SocketAddr, connector: u32) {
        // a resent SYN for a channel we already accepted gets the same ACK
        let existing = self.channels.values().find(|channel| {
            channel.info.kind == ChannelKind::Accepted
                && channel.remote_conn == connector
                && channel.info.remote == remote
        });
        if let Some(channel) = existing {
            let ack = Packet::Ack {
                acceptor: channel.local_conn,
                connector,
            };
            self.transmit(remote, &ack);
            return;
        }

        let channel_id = self.ids.next_id();
        let local_conn = self.new_conn_id();
        let mut info = ChannelInfo::new(channel_id, ChannelKind::Accepted, remote);
        if info.transition(ChannelState::Connecting).is_err() {
            return;
        }
        debug!(
            "reliable channel {} waiting for first message from {}",
            channel_id, remote
        );
        self.channels.insert(
            channel_id,
            ReliableChannel {
                info,
                local_conn,
                remote_conn: connector,
                link: ReliableLink::new(self.settings),
                created_at: None,
                last_syn: None,
            },
        );
        self.by_conn.insert(local_conn, channel_id);
        self.transmit(
            remote,
            &Packet::Ack {
                acceptor: local_conn,
                connector,
            },
        );
    }

    fn handle_ack(&mut self, remote: SocketAddr, acceptor: u32, connector: u32) {
        let Some(&channel_id) = self.by_conn.get(&connector) else {
            return;
        };
        let Some(channel) = self.channels.get_mut(&channel_id) else {
            return;
        };
        if channel.info.kind != ChannelKind::Outgoing
            || channel.info.state() != ChannelState::Connecting
            || channel.info.remote != remote
        {
            return;
        }
        channel.remote_conn = acceptor;
        if channel.info.open().is_err() {
            return;
        }
        info!("reliable channel {} connected to {}", channel_id, remote);
        let hello = Packet::Msg {
            sender: channel.local_conn,
            receiver: acceptor,
            segment: Vec::new(),
        };
        self.transmit(remote, &hello);
        self.events.push_back(ServiceEvent::Connected {
            channel_id,
            remote,
        });
        self.flush_channel(channel_id);
    }

    fn handle_msg(&mut self, remote: SocketAddr, sender: u32, receiver: u32, segment: Vec<u8>) {
        let Some(channel_id) = self.find_channel(remote, sender, receiver) else {
            trace!("dropping message for unknown connection {}", receiver);
            return;
        };
        let now = self.now;
        let Some(channel) = self.channels.get_mut(&channel_id) else {
            return;
        };
        if channel.info.kind == ChannelKind::Accepted
            && channel.info.state() == ChannelState::Connecting
        {
            if channel.info.open().is_err() {
                return;
            }
            info!("reliable channel {} accepted from {}", channel_id, remote);
            self.events.push_back(ServiceEvent::Accepted {
                channel_id,
                remote,
            });
        }
        if !channel.info.is_open() || segment.is_empty() {
            return;
        }
        let result = channel.link.on_segment(&segment, now);
        while let Some(frame) = channel.link.pop_delivered() {
            self.events.push_back(ServiceEvent::Read { channel_id, frame });
        }
        match result {
            Ok(()) => self.flush_channel(channel_id),
            Err(err) => {
                warn!("reliable channel {} link failed: {}", channel_id, err);
                self.fail_channel(channel_id, err.error_code());
            }
        }
    }

    /// Sends every segment the link has ready
    fn flush_channel(&mut self, channel_id: ChannelId) {
        let now = self.now;
        let Some(channel) = self.channels.get_mut(&channel_id) else {
            return;
        };
        if !channel.info.is_open() {
            return;
        }
        channel.link.flush(now);
        let (local, remote_conn, remote) = (channel.local_conn, channel.remote_conn, channel.info.remote);
        let mut packets = Vec::new();
        while let Some(segment) = channel.link.pop_outgoing() {
            packets.push(Packet::Msg {
                sender: local,
                receiver: remote_conn,
                segment,
            });
        }
        for packet in packets {
            self.transmit(remote, &packet);
        }
    }

    fn fail_channel(&mut self, channel_id: ChannelId, error: ErrorCode) {
        let Some(channel) = self.channels.get_mut(&channel_id) else {
            return;
        };
        if channel.info.fail(error) {
            debug!("reliable channel {} failed: {}", channel_id, error);
            self.events
                .push_back(ServiceEvent::Error { channel_id, error });
        }
    }

    fn drive_channels(&mut self) {
        let now = self.now;
        let mut failures = Vec::new();
        let mut expired = Vec::new();
        let mut syns = Vec::new();
        let mut open = Vec::new();

        for (channel_id, channel) in self.channels.iter_mut() {
            match (channel.info.kind, channel.info.state()) {
                (ChannelKind::Outgoing, ChannelState::Connecting) => {
                    let created_at = *channel.created_at.get_or_insert(now);
                    let last_syn = *channel.last_syn.get_or_insert(now);
                    if now.saturating_sub(created_at) >= self.connect_timeout {
                        failures.push((*channel_id, ErrorCode::CONNECT_TIMEOUT));
                    } else if now.saturating_sub(last_syn) >= self.syn_interval {
                        channel.last_syn = Some(now);
                        syns.push((channel.info.remote, channel.local_conn));
                    }
                }
                (ChannelKind::Accepted, ChannelState::Connecting) => {
                    let created_at = *channel.created_at.get_or_insert(now);
                    if now.saturating_sub(created_at) >= self.connect_timeout {
                        expired.push(*channel_id);
                    }
                }
                (_, ChannelState::Open) => match channel.link.update(now) {
                    Ok(()) => open.push(*channel_id),
                    Err(err) => {
                        warn!("reliable channel {} link failed: {}", channel_id, err);
                        failures.push((*channel_id, err.error_code()));
                    }
                },
                _ => {}
            }
        }

        for (remote, connector) in syns {
            self.transmit(remote, &Packet::Syn { connector });
        }
        for (channel_id, error) in failures {
            self.fail_channel(channel_id, error);
        }
        for channel_id in expired {
            // never announced, so nobody owns it yet
            if let Some(channel) = self.channels.get_mut(&channel_id) {
                channel.info.fail(ErrorCode::ACCEPT_TIMEOUT);
                info!(
                    "reliable channel {} from {} dropped: {}",
                    channel_id,
                    channel.info.remote,
                    ErrorCode::ACCEPT_TIMEOUT
                );
            }
            self.forget(channel_id);
        }
        for channel_id in open {
            self.flush_channel(channel_id);
        }
    }

    fn forget(&mut self, channel_id: ChannelId) -> Option<ReliableChannel> {
        let channel = self.channels.remove(&channel_id)?;
        self.by_conn.remove(&channel.local_conn);
        Some(channel)
    }
}

impl Service for ReliableService {
    fn kind(&self) -> TransportKind {
        TransportKind::ReliableMessage
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local_addr)
    }

    fn connect_channel(&mut self, address: SocketAddr) -> Result<ChannelId, ChannelError> {
        if self.socket.is_none() {
            return Err(ChannelError::ServiceDisposed);
        }
        let channel_id = self.ids.next_id();
        let local_conn = self.new_conn_id();
        let mut info = ChannelInfo::new(channel_id, ChannelKind::Outgoing, address);
        info.transition(ChannelState::Connecting)?;
        self.channels.insert(
            channel_id,
            ReliableChannel {
                info,
                local_conn,
                remote_conn: 0,
                link: ReliableLink::new(self.settings),
                created_at: None,
                last_syn: None,
            },
        );
        self.by_conn.insert(local_conn, channel_id);
        self.transmit(address, &Packet::Syn { connector: local_conn });
        Ok(channel_id)
    }

    fn send(&mut self, channel_id: ChannelId, frame: &[u8]) -> Result<(), ChannelError> {
        if self.socket.is_none() {
            return Err(ChannelError::ServiceDisposed);
        }
        let channel = self
            .channels
            .get_mut(&channel_id)
            .ok_or(ChannelError::NotFound { channel_id })?;
        channel.info.check_writable()?;
        check_frame_size(frame, self.max_frame_size)?;
        channel
            .link
            .queue_message(frame)
            .map_err(|_| ChannelError::FrameTooLarge {
                length: frame.len(),
                max: self.settings.mss * MAX_FRAGMENTS,
            })?;
        self.flush_channel(channel_id);
        Ok(())
    }

    fn remove(&mut self, channel_id: ChannelId) {
        let Some(mut channel) = self.forget(channel_id) else {
            return;
        };
        if channel.info.close() {
            self.transmit(
                channel.info.remote,
                &Packet::Fin {
                    sender: channel.local_conn,
                    receiver: channel.remote_conn,
                    error: ErrorCode::PEER_DISCONNECT,
                },
            );
        }
        info!(
            "reliable channel {} to {} removed ({})",
            channel_id,
            channel.info.remote,
            channel.info.error()
        );
    }

    fn update(&mut self, now: Millis) {
        if self.socket.is_none() {
            return;
        }
        self.now = now;
        self.receive_datagrams();
        self.drive_channels();
    }

    fn receive(&mut self) -> Option<ServiceEvent> {
        self.events.pop_front()
    }

    fn channel(&self, channel_id: ChannelId) -> Option<&ChannelInfo> {
        self.channels.get(&channel_id).map(|channel| &channel.info)
    }

    fn channel_ids(&self) -> Vec<ChannelId> {
        self.channels.keys().copied().collect()
    }

    fn dispose(&mut self) {
        if self.socket.is_none() {
            return;
        }
        for channel_id in self.channel_ids() {
            self.remove(channel_id);
        }
        self.events.clear();
        self.socket = None;
    }

    fn is_disposed(&self) -> bool {
        self.socket.is_none()
    }
}
