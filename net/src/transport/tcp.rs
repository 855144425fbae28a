use std::{net::SocketAddr, sync::Arc, time::Duration};

use log::{debug, info, warn};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    runtime::Runtime,
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
};

use actornet_shared::{
    write_frame, ChannelId, ErrorCode, FrameParser, IdGenerator, RingBuffer, TransportConfig,
    TransportKind,
};

use super::task_bridge::{build_runtime, IoCommand, IoEvent, TaskChannels};
use crate::{
    channel::{ChannelError, ChannelInfo},
    service::{Service, ServiceEvent},
};

#[derive(Clone, Copy)]
struct StreamSettings {
    max_frame_size: usize,
    chunk_size: usize,
    connect_timeout: Duration,
}

impl From<&TransportConfig> for StreamSettings {
    fn from(config: &TransportConfig) -> Self {
        Self {
            max_frame_size: config.max_frame_size,
            chunk_size: config.chunk_size,
            connect_timeout: config.connect_timeout,
        }
    }
}

/// Length-prefixed frames over TCP.
///
/// Each connection runs in a task on the service's own runtime, assembling
/// frames from a receive [`RingBuffer`] and batching queued sends through a
/// send ring buffer.
pub struct TcpService {
    runtime: Option<Runtime>,
    channels: TaskChannels,
    ids: Arc<dyn IdGenerator>,
    settings: StreamSettings,
    local_addr: Option<SocketAddr>,
}

impl TcpService {
    /// Service that only makes outgoing connections
    pub fn client(config: &TransportConfig, ids: Arc<dyn IdGenerator>) -> Result<Self, ChannelError> {
        Ok(Self {
            runtime: Some(build_runtime()?),
            channels: TaskChannels::new(config.max_frame_size),
            ids,
            settings: config.into(),
            local_addr: None,
        })
    }

    /// Service that accepts connections on `address` (port 0 picks a free port)
    pub fn listen(
        address: SocketAddr,
        config: &TransportConfig,
        ids: Arc<dyn IdGenerator>,
    ) -> Result<Self, ChannelError> {
        let mut service = Self::client(config, ids)?;
        let listener = bind_listener(address)?;
        let local_addr = listener.local_addr().map_err(|err| ChannelError::Bind {
            address,
            message: err.to_string(),
        })?;
        service.local_addr = Some(local_addr);

        let events = service.channels.event_sender();
        let ids = service.ids.clone();
        let settings = service.settings;
        if let Some(runtime) = &service.runtime {
            runtime.spawn(accept_loop(listener, events, ids, settings));
        }
        info!("tcp service listening on {}", local_addr);
        Ok(service)
    }
}

fn bind_listener(address: SocketAddr) -> Result<std::net::TcpListener, ChannelError> {
    let bind_error = |err: std::io::Error| ChannelError::Bind {
        address,
        message: err.to_string(),
    };
    let listener = std::net::TcpListener::bind(address).map_err(bind_error)?;
    listener.set_nonblocking(true).map_err(bind_error)?;
    Ok(listener)
}

async fn accept_loop(
    listener: std::net::TcpListener,
    events: UnboundedSender<IoEvent>,
    ids: Arc<dyn IdGenerator>,
    settings: StreamSettings,
) {
    let listener = match TcpListener::from_std(listener) {
        Ok(listener) => listener,
        Err(err) => {
            warn!("tcp listener could not be registered: {}", err);
            return;
        }
    };
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                let channel_id = ids.next_id();
                let (commands, receiver) = mpsc::unbounded_channel();
                // announced before the connection task can report reads
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
                tokio::spawn(run_stream(channel_id, stream, receiver, events.clone(), settings));
            }
            Err(err) => {
                warn!("tcp accept failed: {}", err);
            }
        }
    }
}

async fn connect(
    channel_id: ChannelId,
    address: SocketAddr,
    commands: UnboundedReceiver<IoCommand>,
    events: UnboundedSender<IoEvent>,
    settings: StreamSettings,
) {
    let stream = match tokio::time::timeout(settings.connect_timeout, TcpStream::connect(address)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            debug!("tcp connect to {} failed: {}", address, err);
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
    run_stream(channel_id, stream, commands, events, settings).await;
}

async fn run_stream(
    channel_id: ChannelId,
    stream: TcpStream,
    mut commands: UnboundedReceiver<IoCommand>,
    events: UnboundedSender<IoEvent>,
    settings: StreamSettings,
) {
    let _ = stream.set_nodelay(true);
    let (mut reader, mut writer) = stream.into_split();
    let mut recv_buffer = RingBuffer::with_chunk_size(settings.chunk_size);
    let mut send_buffer = RingBuffer::with_chunk_size(settings.chunk_size);
    let mut parser = FrameParser::new(settings.max_frame_size);
    let mut read_chunk = vec![0u8; settings.chunk_size];

    let error = loop {
        tokio::select! {
            read = reader.read(&mut read_chunk) => {
                match read {
                    Ok(0) => break ErrorCode::PEER_DISCONNECT,
                    Ok(count) => {
                        recv_buffer.write(&read_chunk[..count]);
                        if let Err(error) = drain_frames(channel_id, &mut parser, &mut recv_buffer, &events) {
                            break error;
                        }
                    }
                    Err(err) => {
                        debug!("tcp channel {} read failed: {}", channel_id, err);
                        break ErrorCode::SOCKET_ERROR;
                    }
                }
            }
            command = commands.recv() => {
                match command {
                    Some(IoCommand::Send(frame)) => {
                        let mut closing = false;
                        queue_frame(&mut send_buffer, &frame, settings.max_frame_size);
                        // batch everything already queued into one write
                        loop {
                            match commands.try_recv() {
                                Ok(IoCommand::Send(frame)) => {
                                    queue_frame(&mut send_buffer, &frame, settings.max_frame_size)
                                }
                                Ok(IoCommand::Close) => {
                                    closing = true;
                                    break;
                                }
                                Err(_) => break,
                            }
                        }
                        if let Err(err) = flush(&mut send_buffer, &mut writer).await {
                            debug!("tcp channel {} write failed: {}", channel_id, err);
                            break ErrorCode::SOCKET_ERROR;
                        }
                        if closing {
                            let _ = writer.shutdown().await;
                            return;
                        }
                    }
                    Some(IoCommand::Close) | None => {
                        let _ = writer.shutdown().await;
                        return;
                    }
                }
            }
        }
    };
    let _ = events.send(IoEvent::Failed { channel_id, error });
}

fn drain_frames(
    channel_id: ChannelId,
    parser: &mut FrameParser,
    buffer: &mut RingBuffer,
    events: &UnboundedSender<IoEvent>,
) -> Result<(), ErrorCode> {
    loop {
        match parser.parse(buffer) {
            Ok(Some(frame)) => {
                if events.send(IoEvent::Read { channel_id, frame }).is_err() {
                    return Err(ErrorCode::SERVICE_DISPOSED);
                }
            }
            Ok(None) => return Ok(()),
            Err(err) => {
                warn!("tcp channel {} sent a bad frame: {}", channel_id, err);
                return Err(err.error_code());
            }
        }
    }
}

fn queue_frame(buffer: &mut RingBuffer, frame: &[u8], max: usize) {
    // sizes were checked by `send` on the fiber
    if let Err(err) = write_frame(buffer, frame, max) {
        warn!("dropping unsendable frame: {}", err);
    }
}

async fn flush(
    buffer: &mut RingBuffer,
    writer: &mut tokio::net::tcp::OwnedWriteHalf,
) -> std::io::Result<()> {
    let mut bytes = Vec::with_capacity(buffer.len());
    buffer
        .read_to(&mut bytes, buffer.len())
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))?;
    writer.write_all(&bytes).await
}

impl Service for TcpService {
    fn kind(&self) -> TransportKind {
        TransportKind::Stream
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn connect_channel(&mut self, address: SocketAddr) -> Result<ChannelId, ChannelError> {
        let channel_id = self.ids.next_id();
        let commands = self.channels.open_outgoing(channel_id, address)?;
        let events = self.channels.event_sender();
        let runtime = self.runtime.as_ref().ok_or(ChannelError::ServiceDisposed)?;
        runtime.spawn(connect(channel_id, address, commands, events, self.settings));
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

impl Drop for TcpService {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}
