// rust/kmeans-core/src/transport/mod.rs

//! Messaging channels between the coordinator and its workers.
//!
//! The coordinator sees four channels:
//!
//! - a load-balanced work channel (each pushed frame reaches one worker)
//! - a publish/subscribe control channel whose return path carries
//!   contributions and heartbeats
//! - a request/reply join channel
//! - an outbound reporter for the coordinator's own START/DONE lines
//!
//! Workers see the same channels through [`WorkerLink`]. Two implementations
//! exist: [`memory`] on tokio channels and [`tcp`] on length-prefixed frames.

pub mod frame;
pub mod memory;
pub mod tcp;

use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::oneshot;

use crate::error::Result;
use crate::protocol::{ControlMessage, Topic};

pub use memory::{MemoryHub, MemoryWorkerLink};
pub use tcp::{TcpTransport, TcpWorkerLink};

/// Result of a non-blocking send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// No receiver can take the frame right now. Retry on a later tick.
    Backpressure,
    Closed,
}

/// Coordinator side of the load-balanced work channel.
pub trait WorkChannel: Send {
    /// Push a frame to exactly one connected worker without blocking.
    fn try_push(&mut self, frame: Bytes) -> SendOutcome;

    /// Frames accepted by `try_push` that no worker has taken yet.
    fn queued(&self) -> usize;

    fn close(&mut self);
}

/// Coordinator side of the control channel and its return path.
#[async_trait]
pub trait ControlChannel: Send {
    /// Deliver `message` to every subscriber of its topic.
    ///
    /// Publishing to a topic nobody subscribes to is not an error.
    fn publish(&mut self, message: &ControlMessage) -> SendOutcome;

    /// Next upstream frame, if one is already waiting.
    fn try_recv(&mut self) -> Option<Bytes>;

    /// Wait for the next upstream frame until `deadline`.
    async fn recv_until(&mut self, deadline: Instant) -> Option<Bytes>;

    fn close(&mut self);
}

/// A line received on the join channel.
#[derive(Debug)]
pub struct JoinRequest {
    pub line: String,
    responder: Option<oneshot::Sender<String>>,
}

impl JoinRequest {
    pub fn new(line: impl Into<String>, responder: Option<oneshot::Sender<String>>) -> Self {
        Self {
            line: line.into(),
            responder,
        }
    }

    pub fn wants_reply(&self) -> bool {
        self.responder.is_some()
    }

    /// Answer the request. Returns false if no reply was expected or the
    /// requester has gone away.
    pub fn reply(&mut self, line: impl Into<String>) -> bool {
        match self.responder.take() {
            Some(tx) => tx.send(line.into()).is_ok(),
            None => false,
        }
    }
}

/// Coordinator side of the join channel.
pub trait JoinChannel: Send {
    fn try_recv(&mut self) -> Option<JoinRequest>;

    fn close(&mut self);
}

/// Sink for the coordinator's own `"<uid> START"` / `"<uid> DONE <n>"` lines.
#[async_trait]
pub trait Reporter: Send {
    async fn report(&mut self, line: String) -> Result<()>;
}

/// Reporter that only logs.
#[derive(Debug, Default)]
pub struct LogReporter;

#[async_trait]
impl Reporter for LogReporter {
    async fn report(&mut self, line: String) -> Result<()> {
        tracing::info!(report = %line, "Coordinator report");
        Ok(())
    }
}

/// The channels owned by one coordinator.
pub struct Transport {
    pub work: Box<dyn WorkChannel>,
    pub control: Box<dyn ControlChannel>,
    pub join: Box<dyn JoinChannel>,
    pub reporter: Box<dyn Reporter>,
}

impl Transport {
    pub fn new(
        work: Box<dyn WorkChannel>,
        control: Box<dyn ControlChannel>,
        join: Box<dyn JoinChannel>,
        reporter: Box<dyn Reporter>,
    ) -> Self {
        Self {
            work,
            control,
            join,
            reporter,
        }
    }

    /// Close every inbound and outbound channel.
    pub fn close(&mut self) {
        self.work.close();
        self.control.close();
        self.join.close();
    }
}

/// Something a worker receives.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// An encoded PointGroup from the work channel.
    Work(Bytes),
    /// A control frame for one of the subscribed topics.
    Control(Bytes),
}

/// Worker side of all channels.
#[async_trait]
pub trait WorkerLink: Send {
    /// Send a line on the join channel and wait for the reply.
    async fn request(&mut self, line: String) -> Result<String>;

    /// Send a line on the join channel without expecting a reply.
    async fn report(&mut self, line: String) -> Result<()>;

    /// Receive control frames for `topics` from now on.
    async fn subscribe(&mut self, topics: Vec<Topic>) -> Result<()>;

    /// Next work or control frame. Work is preferred when both are ready.
    /// `None` once both channels are closed.
    async fn next_event(&mut self) -> Option<WorkerEvent>;

    /// Send a frame on the control return path.
    async fn send_upstream(&mut self, frame: Bytes) -> Result<()>;
}
