use std::{collections::HashMap, net::SocketAddr};

use log::{debug, info, trace};
use tokio::{
    runtime::Runtime,
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
};

use actornet_shared::{ChannelId, ChannelKind, ErrorCode};

use crate::{
    channel::{check_frame_size, ChannelError, ChannelInfo, ChannelState},
    service::ServiceEvent,
};

/// Reported by IO tasks to the fiber side of a socket service
pub(crate) enum IoEvent {
    Accepted {
        channel_id: ChannelId,
        remote: SocketAddr,
        commands: UnboundedSender<IoCommand>,
    },
    Connected {
        channel_id: ChannelId,
    },
    Read {
        channel_id: ChannelId,
        frame: Vec<u8>,
    },
    Failed {
        channel_id: ChannelId,
        error: ErrorCode,
    },
}

/// Sent from the fiber to the IO task of one connection
pub(crate) enum IoCommand {
    Send(Vec<u8>),
    Close,
}

/// Builds the runtime a socket service runs its IO tasks on
pub(crate) fn build_runtime() -> Result<Runtime, ChannelError> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .map_err(|err| ChannelError::Runtime {
            message: err.to_string(),
        })
}

struct TaskChannel {
    info: ChannelInfo,
    commands: UnboundedSender<IoCommand>,
}

/// Fiber-side channel table of a service whose connections live in tokio
/// tasks. Only ever polls its event queue, never blocks.
pub(crate) struct TaskChannels {
    max_frame_size: usize,
    channels: HashMap<ChannelId, TaskChannel>,
    events: UnboundedReceiver<IoEvent>,
    event_sender: UnboundedSender<IoEvent>,
    disposed: bool,
}

impl TaskChannels {
    pub fn new(max_frame_size: usize) -> Self {
        let (event_sender, events) = mpsc::unbounded_channel();
        Self {
            max_frame_size,
            channels: HashMap::new(),
            events,
            event_sender,
            disposed: false,
        }
    }

    pub fn event_sender(&self) -> UnboundedSender<IoEvent> {
        self.event_sender.clone()
    }

    pub fn check_disposed(&self) -> Result<(), ChannelError> {
        if self.disposed {
            Err(ChannelError::ServiceDisposed)
        } else {
            Ok(())
        }
    }

    /// Registers an outgoing channel in `Connecting` and returns the command
    /// queue its IO task will drain
    pub fn open_outgoing(
        &mut self,
        channel_id: ChannelId,
        remote: SocketAddr,
    ) -> Result<UnboundedReceiver<IoCommand>, ChannelError> {
        self.check_disposed()?;
        let mut info = ChannelInfo::new(channel_id, ChannelKind::Outgoing, remote);
        info.transition(ChannelState::Connecting)?;
        let (commands, receiver) = mpsc::unbounded_channel();
        self.channels
            .insert(channel_id, TaskChannel { info, commands });
        Ok(receiver)
    }

    pub fn send(&mut self, channel_id: ChannelId, frame: &[u8]) -> Result<(), ChannelError> {
        self.check_disposed()?;
        let channel = self
            .channels
            .get(&channel_id)
            .ok_or(ChannelError::NotFound { channel_id })?;
        channel.info.check_writable()?;
        check_frame_size(frame, self.max_frame_size)?;
        if channel
            .commands
            .send(IoCommand::Send(frame.to_vec()))
            .is_err()
        {
            // task already gone, its Failed event is queued
            trace!("channel {} dropped a frame after its task ended", channel_id);
        }
        Ok(())
    }

    pub fn remove(&mut self, channel_id: ChannelId) {
        if let Some(mut channel) = self.channels.remove(&channel_id) {
            // the task also needs the close to abandon a pending connect
            let orderly = channel.info.close();
            let _ = channel.commands.send(IoCommand::Close);
            info!(
                "channel {} to {} removed ({}, orderly: {})",
                channel_id,
                channel.info.remote,
                channel.info.error(),
                orderly
            );
        }
    }

    pub fn receive(&mut self) -> Option<ServiceEvent> {
        while let Ok(event) = self.events.try_recv() {
            match event {
                IoEvent::Accepted {
                    channel_id,
                    remote,
                    commands,
                } => {
                    if self.disposed {
                        let _ = commands.send(IoCommand::Close);
                        continue;
                    }
                    let mut info = ChannelInfo::new(channel_id, ChannelKind::Accepted, remote);
                    if let Err(err) = info.open() {
                        debug!("accepted channel {} not opened: {}", channel_id, err);
                        continue;
                    }
                    info!("channel {} accepted from {}", channel_id, remote);
                    self.channels
                        .insert(channel_id, TaskChannel { info, commands });
                    return Some(ServiceEvent::Accepted { channel_id, remote });
                }
                IoEvent::Connected { channel_id } => {
                    let Some(channel) = self.channels.get_mut(&channel_id) else {
                        continue;
                    };
                    if channel.info.open().is_err() {
                        continue;
                    }
                    info!("channel {} connected to {}", channel_id, channel.info.remote);
                    return Some(ServiceEvent::Connected {
                        channel_id,
                        remote: channel.info.remote,
                    });
                }
                IoEvent::Read { channel_id, frame } => {
                    match self.channels.get(&channel_id) {
                        Some(channel) if channel.info.state() != ChannelState::Closed => {
                            return Some(ServiceEvent::Read { channel_id, frame });
                        }
                        _ => trace!("dropping frame for closed channel {}", channel_id),
                    }
                }
                IoEvent::Failed { channel_id, error } => {
                    let Some(channel) = self.channels.get_mut(&channel_id) else {
                        continue;
                    };
                    if channel.info.fail(error) {
                        debug!("channel {} failed: {}", channel_id, error);
                        return Some(ServiceEvent::Error { channel_id, error });
                    }
                }
            }
        }
        None
    }

    pub fn channel(&self, channel_id: ChannelId) -> Option<&ChannelInfo> {
        self.channels.get(&channel_id).map(|channel| &channel.info)
    }

    pub fn channel_ids(&self) -> Vec<ChannelId> {
        self.channels.keys().copied().collect()
    }

    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        for channel_id in self.channel_ids() {
            self.remove(channel_id);
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }
}
