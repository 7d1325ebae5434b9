//! The two FIFO queues between the websocket transport and the rest of the
//! application. Nothing else crosses that boundary.
//!
//! Both directions are unbounded: producers never block, consumers either
//! await or drain without waiting.

use crate::commands::Command;
use crate::error::{HalError, HalResult};
use crate::state::StateSnapshot;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Raw status frame as received.
    Frame(Vec<u8>),
    /// Status already decoded by the producer.
    Snapshot(StateSnapshot),
}

/// Application side of the command queue.
#[derive(Debug, Clone)]
pub struct OutboundSender {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl OutboundSender {
    pub fn send(&self, command: &Command) -> HalResult<()> {
        debug!(
            subsystem = command.subsystem(),
            command = command.name(),
            device = ?command.device_id(),
            "queueing command"
        );
        self.send_frame(command.to_bytes())
    }

    pub fn send_frame(&self, frame: Vec<u8>) -> HalResult<()> {
        self.tx
            .send(frame)
            .map_err(|_| HalError::Transport("outbound queue closed".to_string()))
    }
}

/// Transport side of the command queue.
#[derive(Debug)]
pub struct OutboundReceiver {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl OutboundReceiver {
    /// Next queued frame, without waiting.
    pub fn try_recv(&mut self) -> Option<Vec<u8>> {
        self.rx.try_recv().ok()
    }

    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    /// Everything queued right now, oldest first.
    pub fn drain(&mut self) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        while let Some(frame) = self.try_recv() {
            frames.push(frame);
        }
        frames
    }
}

/// Transport side of the status queue.
#[derive(Debug, Clone)]
pub struct InboundSender {
    tx: mpsc::UnboundedSender<InboundMessage>,
}

impl InboundSender {
    pub fn push(&self, message: InboundMessage) -> HalResult<()> {
        self.tx
            .send(message)
            .map_err(|_| HalError::Transport("inbound queue closed".to_string()))
    }

    pub fn push_frame(&self, frame: Vec<u8>) -> HalResult<()> {
        self.push(InboundMessage::Frame(frame))
    }

    pub fn push_snapshot(&self, snapshot: StateSnapshot) -> HalResult<()> {
        self.push(InboundMessage::Snapshot(snapshot))
    }
}

/// Application side of the status queue.
#[derive(Debug)]
pub struct InboundReceiver {
    rx: mpsc::UnboundedReceiver<InboundMessage>,
}

impl InboundReceiver {
    pub async fn recv(&mut self) -> Option<InboundMessage> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<InboundMessage> {
        self.rx.try_recv().ok()
    }
}

/// The application's ends of both queues.
#[derive(Debug)]
pub struct HardwareLink {
    pub commands: OutboundSender,
    pub status: InboundReceiver,
}

/// The transport's ends of both queues.
#[derive(Debug)]
pub struct TransportQueues {
    pub outbound: OutboundReceiver,
    pub inbound: InboundSender,
}

/// Create both queues and split them between application and transport.
pub fn link() -> (HardwareLink, TransportQueues) {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    (
        HardwareLink {
            commands: OutboundSender { tx: out_tx },
            status: InboundReceiver { rx: in_rx },
        },
        TransportQueues {
            outbound: OutboundReceiver { rx: out_rx },
            inbound: InboundSender { tx: in_tx },
        },
    )
}
