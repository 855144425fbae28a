use std::{net::SocketAddr, sync::Arc, time::Duration};

use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
    runtime::Runtime,
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
};
use tokio_tungstenite::{
    tungstenite::{protocol::WebSocketConfig, Error as WsError, Message},
    WebSocketStream,
};

use actornet_shared::{
    ChannelId, ErrorCode, IdGenerator, TransportConfig, TransportKind, OPCODE_SIZE,
};

use super::task_bridge::{build_runtime, IoCommand, IoEvent, TaskChannels};
use crate::{
    channel::{ChannelError, ChannelInfo},
    service::{Service, ServiceEvent},
};

/// Caps incoming messages at the frame limit so the socket refuses an oversized
/// message before buffering it
fn socket_config(max_frame_size: usize) -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(max_frame_size);
    config.max_frame_size = Some(max_frame_size);
    config
}

/// One binary WebSocket message per frame, no length prefix
pub struct WebSocketService {
    runtime: Option<Runtime>,
    channels: TaskChannels,
    ids: Arc<dyn IdGenerator>,
    max_frame_size: usize,
    connect_timeout: Duration,
    local_addr: Option<SocketAddr>,
}

impl WebSocketService {
    pub fn client(config: &TransportConfig, ids: Arc<dyn IdGenerator>) -> Result<Self, ChannelError> {
        Ok(Self {
            runtime: Some(build_runtime()?),
            channels: TaskChannels::new(config.max_frame_size),
            ids,
            max_frame_size: config.max_frame_size,
            connect_timeout: config.connect_timeout,
            local_addr: None,
        })
    }

    /// Accepts WebSocket upgrades on `address`
    pub fn listen(
        address: SocketAddr,
        config: &TransportConfig,
        ids: Arc<dyn IdGenerator>,
    ) -> Result<Self, ChannelError> {
        let mut service = Self::client(config, ids)?;
        let bind_error = |err: std::io::Error| ChannelError::Bind {
            address,
            message: err.to_string(),
        };
        let listener = std::net::TcpListener::bind(address).map_err(bind_error)?;
        listener.set_nonblocking(true).map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;
        service.local_addr = Some(local_addr);

        let events = service.channels.event_sender();
        let ids = service.ids.clone();
        let max_frame_size = service.max_frame_size;
        if let Some(runtime) = &service.runtime {
            runtime.spawn(accept_loop(listener, events, ids, max_frame_size));
        }
        info!("websocket service listening on ws://{}/", local_addr);
        Ok(service)
    }
}

async fn accept_loop(
    listener: std::net::TcpListener,
    events: UnboundedSender<IoEvent>,
    ids: Arc<dyn IdGenerator>,
    max_frame_size: usize,
) {
    let listener = match TcpListener::from_std(listener) {
        Ok(listener) => listener,
        Err(err) => {
            warn!("websocket listener could not be registered: {}", err);
            return;
        }
    };
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                let events = events.clone();
                let ids = ids.clone();
                tokio::spawn(async move {
                    let socket = match tokio_tungstenite::accept_async_with_config(
                        stream,
                        Some(socket_config(max_frame_size)),
                    )
                    .await {
                        Ok(socket) => socket,
                        Err(err) => {
                            debug!("websocket handshake from {} failed: {}", remote, err);
                            return;
                        }
                    };
                    let channel_id = ids.next_id();
                    let (commands, receiver) = mpsc::unbounded_channel();
                    if events
                        .send(IoEvent::Accepted {
                            channel_id,
                            remote,
                            commands,
                        })
                        .is_err()
                    {
                        return;
                    }
                    run_socket(channel_id, socket, receiver, events, max_frame_size).await;
                });
            }
            Err(err) => warn!("websocket accept failed: {}", err),
        }
    }
}

async fn connect(
    channel_id: ChannelId,
    address: SocketAddr,
    commands: UnboundedReceiver<IoCommand>,
    events: UnboundedSender<IoEvent>,
    max_frame_size: usize,
    connect_timeout: Duration,
) {
    let url = format!("ws://{}/", address);
    let handshake = tokio_tungstenite::connect_async_with_config(
        url,
        Some(socket_config(max_frame_size)),
        false,
    );
    let socket = match tokio::time::timeout(connect_timeout, handshake).await {
        Ok(Ok((socket, _response))) => socket,
        Ok(Err(err)) => {
            debug!("websocket connect to {} failed: {}", address, err);
            let _ = events.send(IoEvent::Failed {
                channel_id,
                error: ErrorCode::CONNECT_FAILED,
            });
            return;
        }
        Err(_) => {
            let _ = events.send(IoEvent::Failed {
                channel_id,
                error: ErrorCode::CONNECT_TIMEOUT,
            });
            return;
        }
    };
    if events.send(IoEvent::Connected { channel_id }).is_err() {
        return;
    }
    run_socket(channel_id, socket, commands, events, max_frame_size).await;
}

async fn run_socket<S>(
    channel_id: ChannelId,
    socket: WebSocketStream<S>,
    mut commands: UnboundedReceiver<IoCommand>,
    events: UnboundedSender<IoEvent>,
    max_frame_size: usize,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut stream) = socket.split();

    let error = loop {
        tokio::select! {
            message = stream.next() => {
                match message {
                    Some(Ok(Message::Binary(data))) => {
                        let frame: Vec<u8> = data.into();
                        if frame.len() > max_frame_size {
                            warn!("websocket channel {} sent {} bytes, over the {} byte limit", channel_id, frame.len(), max_frame_size);
                            break ErrorCode::PACKET_TOO_LARGE;
                        }
                        if frame.len() < OPCODE_SIZE {
                            warn!("websocket channel {} sent a frame without an opcode", channel_id);
                            break ErrorCode::DECODE_FAILED;
                        }
                        if events.send(IoEvent::Read { channel_id, frame }).is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break ErrorCode::PEER_DISCONNECT,
                    Some(Ok(_)) => {}
                    Some(Err(WsError::Capacity(err))) => {
                        warn!("websocket channel {} refused a message: {}", channel_id, err);
                        break ErrorCode::PACKET_TOO_LARGE;
                    }
                    Some(Err(err)) => {
                        debug!("websocket channel {} read failed: {}", channel_id, err);
                        break ErrorCode::SOCKET_ERROR;
                    }
                }
            }
            command = commands.recv() => {
                match command {
                    Some(IoCommand::Send(frame)) => {
                        if let Err(err) = sink.send(Message::Binary(frame.into())).await {
                            debug!("websocket channel {} write failed: {}", channel_id, err);
                            break ErrorCode::SOCKET_ERROR;
                        }
                    }
                    Some(IoCommand::Close) | None => {
                        let _ = sink.send(Message::Close(None)).await;
                        return;
                    }
                }
            }
        }
    };
    let _ = events.send(IoEvent::Failed { channel_id, error });
}

impl Service for WebSocketService {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn connect_channel(&mut self, address: SocketAddr) -> Result<ChannelId, ChannelError> {
        let channel_id = self.ids.next_id();
        let commands = self.channels.open_outgoing(channel_id, address)?;
        let events = self.channels.event_sender();
        let runtime = self.runtime.as_ref().ok_or(ChannelError::ServiceDisposed)?;
        runtime.spawn(connect(
            channel_id,
            address,
            commands,
            events,
            self.max_frame_size,
            self.connect_timeout,
        ));
        Ok(channel_id)
    }

    fn send(&mut self, channel_id: ChannelId, frame: &[u8]) -> Result<(), ChannelError> {
        self.channels.send(channel_id, frame)
    }

    fn remove(&mut self, channel_id: ChannelId) {
        self.channels.remove(channel_id);
    }

    fn receive(&mut self) -> Option<ServiceEvent> {
        self.channels.receive()
    }

    fn channel(&self, channel_id: ChannelId) -> Option<&ChannelInfo> {
        self.channels.channel(channel_id)
    }

    fn channel_ids(&self) -> Vec<ChannelId> {
        self.channels.channel_ids()
    }

    fn dispose(&mut self) {
        self.channels.dispose();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }

    fn is_disposed(&self) -> bool {
        self.channels.is_disposed()
    }
}

impl Drop for WebSocketService {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}
