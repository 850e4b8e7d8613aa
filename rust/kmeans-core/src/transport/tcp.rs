// rust/kmeans-core/src/transport/tcp.rs

//! TCP transport.
//!
//! Each channel listens on its own address and exchanges length-prefixed
//! frames (see [`super::frame`]). Connection tasks only move frames between
//! sockets and channels; all protocol decisions stay in the coordinator loop.
//!
//! - Work: every connection is a puller with its own bounded queue. Pushes
//!   round-robin across pullers and report backpressure when all are full.
//! - Control: a subscriber opens with `"SUB <topic>..."` and waits for
//!   `"ACK"`. Frames it sends afterwards form the return path.
//! - Join: each frame is one request; a reply frame is written only when the
//!   coordinator answers.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::frame::{read_frame, write_frame};
use super::{
    ControlChannel, JoinChannel, JoinRequest, LogReporter, Reporter, SendOutcome, Transport,
    WorkChannel, WorkerEvent, WorkerLink,
};
use crate::config::{NetworkConfig, WorkerConfig};
use crate::error::{ClusterError, Result};
use crate::protocol::{ControlMessage, Topic};

const SUBSCRIBE: &str = "SUB";
const ACK: &str = "ACK";

/// Coordinator transport bound to TCP listeners.
pub struct TcpTransport {
    transport: Transport,
    work_addr: SocketAddr,
    control_addr: SocketAddr,
    join_addr: SocketAddr,
}

impl TcpTransport {
    /// Bind all listeners and start accepting connections.
    ///
    /// Each work puller may hold up to `work_backlog` queued frames. The
    /// background tasks stop when `cancel` fires.
    pub async fn bind(
        network: &NetworkConfig,
        work_backlog: usize,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let max_frame_bytes = network.max_frame_bytes;

        let work_listener = bind(&network.work_address).await?;
        let control_listener = bind(&network.control_address).await?;
        let join_listener = bind(&network.join_address).await?;
        let work_addr = local_addr(&work_listener)?;
        let control_addr = local_addr(&control_listener)?;
        let join_addr = local_addr(&join_listener)?;

        let pullers = Arc::new(Mutex::new(PullerSet::default()));
        tokio::spawn(accept_pullers(
            work_listener,
            Arc::clone(&pullers),
            work_backlog.max(1),
            max_frame_bytes,
            cancel.clone(),
        ));

        let subscribers = Arc::new(Mutex::new(SubscriberSet::default()));
        let (upstream_tx, upstream_rx) = mpsc::unbounded_channel();
        tokio::spawn(accept_subscribers(
            control_listener,
            Arc::clone(&subscribers),
            upstream_tx,
            max_frame_bytes,
            cancel.clone(),
        ));

        let (join_tx, join_rx) = mpsc::unbounded_channel();
        tokio::spawn(accept_joiners(
            join_listener,
            join_tx,
            max_frame_bytes,
            cancel.clone(),
        ));

        let reporter: Box<dyn Reporter> = match &network.report_address {
            Some(address) => Box::new(TcpReporter {
                address: address.clone(),
                max_frame_bytes,
            }),
            None => Box::new(LogReporter),
        };

        info!(
            work = %work_addr,
            control = %control_addr,
            join = %join_addr,
            "Coordinator transport listening"
        );

        Ok(Self {
            transport: Transport::new(
                Box::new(TcpWork { pullers }),
                Box::new(TcpControl {
                    subscribers,
                    upstream_rx,
                }),
                Box::new(TcpJoin { rx: join_rx }),
                reporter,
            ),
            work_addr,
            control_addr,
            join_addr,
        })
    }

    pub fn work_addr(&self) -> SocketAddr {
        self.work_addr
    }

    pub fn control_addr(&self) -> SocketAddr {
        self.control_addr
    }

    pub fn join_addr(&self) -> SocketAddr {
        self.join_addr
    }

    pub fn into_transport(self) -> Transport {
        self.transport
    }
}

async fn bind(address: &str) -> Result<TcpListener> {
    TcpListener::bind(address).await.map_err(|e| {
        ClusterError::transport_with_source(format!("failed to bind {}", address), e)
    })
}

fn local_addr(listener: &TcpListener) -> Result<SocketAddr> {
    listener
        .local_addr()
        .map_err(|e| ClusterError::transport_with_source("failed to read local address", e))
}

// ---------------------------------------------------------------------------
// Work channel
// ---------------------------------------------------------------------------

struct Puller {
    peer: SocketAddr,
    tx: mpsc::Sender<Bytes>,
    in_flight: Arc<AtomicUsize>,
}

#[derive(Default)]
struct PullerSet {
    pullers: Vec<Puller>,
    next: usize,
    closed: bool,
}

async fn accept_pullers(
    listener: TcpListener,
    pullers: Arc<Mutex<PullerSet>>,
    backlog: usize,
    max_frame_bytes: usize,
    cancel: CancellationToken,
) {
    loop {
        let (stream, peer) = tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "Work accept failed");
                    continue;
                }
            },
        };

        let (tx, rx) = mpsc::channel(backlog);
        let in_flight = Arc::new(AtomicUsize::new(0));
        {
            let mut set = pullers.lock();
            if set.closed {
                continue;
            }
            set.pullers.push(Puller {
                peer,
                tx,
                in_flight: Arc::clone(&in_flight),
            });
        }
        debug!(%peer, "Work puller connected");
        tokio::spawn(write_work(
            stream,
            peer,
            rx,
            in_flight,
            max_frame_bytes,
            cancel.clone(),
        ));
    }
}

async fn write_work(
    mut stream: TcpStream,
    peer: SocketAddr,
    mut rx: mpsc::Receiver<Bytes>,
    in_flight: Arc<AtomicUsize>,
    max_frame_bytes: usize,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        let result = write_frame(&mut stream, &frame, max_frame_bytes).await;
        in_flight.fetch_sub(1, Ordering::SeqCst);
        if let Err(e) = result {
            warn!(%peer, error = %e, "Work puller disconnected");
            break;
        }
    }
    // Frames still queued for this puller are lost
    rx.close();
    let mut lost = 0;
    while rx.try_recv().is_ok() {
        lost += 1;
    }
    if lost > 0 {
        debug!(%peer, lost, "Dropped queued work frames");
    }
}

struct TcpWork {
    pullers: Arc<Mutex<PullerSet>>,
}

impl WorkChannel for TcpWork {
    fn try_push(&mut self, frame: Bytes) -> SendOutcome {
        let mut set = self.pullers.lock();
        if set.closed {
            return SendOutcome::Closed;
        }

        let count = set.pullers.len();
        let mut outcome = SendOutcome::Backpressure;
        let mut gone = Vec::new();
        for offset in 0..count {
            let index = (set.next + offset) % count;
            let puller = &set.pullers[index];
            // Counted before the send so the writer never decrements first
            puller.in_flight.fetch_add(1, Ordering::SeqCst);
            match puller.tx.try_send(frame.clone()) {
                Ok(()) => {
                    set.next = index + 1;
                    outcome = SendOutcome::Sent;
                    break;
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    puller.in_flight.fetch_sub(1, Ordering::SeqCst);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    puller.in_flight.fetch_sub(1, Ordering::SeqCst);
                    gone.push(index);
                }
            }
        }

        if !gone.is_empty() {
            let mut index = 0;
            set.pullers.retain(|p| {
                let keep = !gone.contains(&index);
                if !keep {
                    debug!(peer = %p.peer, "Removing closed work puller");
                }
                index += 1;
                keep
            });
        }
        outcome
    }

    fn queued(&self) -> usize {
        self.pullers
            .lock()
            .pullers
            .iter()
            .filter(|p| !p.tx.is_closed())
            .map(|p| p.in_flight.load(Ordering::SeqCst))
            .sum()
    }

    fn close(&mut self) {
        let mut set = self.pullers.lock();
        set.closed = true;
        set.pullers.clear();
    }
}

// ---------------------------------------------------------------------------
// Control channel
// ---------------------------------------------------------------------------

struct Subscriber {
    peer: SocketAddr,
    topics: Vec<Topic>,
    tx: mpsc::UnboundedSender<Bytes>,
}

#[derive(Default)]
struct SubscriberSet {
    subscribers: Vec<Subscriber>,
    closed: bool,
}

async fn accept_subscribers(
    listener: TcpListener,
    subscribers: Arc<Mutex<SubscriberSet>>,
    upstream_tx: mpsc::UnboundedSender<Bytes>,
    max_frame_bytes: usize,
    cancel: CancellationToken,
) {
    loop {
        let (stream, peer) = tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "Control accept failed");
                    continue;
                }
            },
        };
        tokio::spawn(serve_subscriber(
            stream,
            peer,
            Arc::clone(&subscribers),
            upstream_tx.clone(),
            max_frame_bytes,
            cancel.clone(),
        ));
    }
}

fn parse_subscribe(frame: &[u8]) -> Result<Vec<Topic>> {
    let line = std::str::from_utf8(frame)
        .map_err(|_| ClusterError::protocol(String::from_utf8_lossy(frame), "not UTF-8"))?;
    let mut parts = line.split_whitespace();
    if parts.next() != Some(SUBSCRIBE) {
        return Err(ClusterError::protocol(line, "expected subscription"));
    }
    parts.map(str::parse::<Topic>).collect()
}

async fn serve_subscriber(
    stream: TcpStream,
    peer: SocketAddr,
    subscribers: Arc<Mutex<SubscriberSet>>,
    upstream_tx: mpsc::UnboundedSender<Bytes>,
    max_frame_bytes: usize,
    cancel: CancellationToken,
) {
    let (mut reader, writer) = stream.into_split();

    let topics = match read_frame(&mut reader, max_frame_bytes).await {
        Ok(Some(frame)) => match parse_subscribe(&frame) {
            Ok(topics) => topics,
            Err(e) => {
                warn!(%peer, error = %e, "Rejecting control connection");
                return;
            }
        },
        Ok(None) => return,
        Err(e) => {
            warn!(%peer, error = %e, "Control handshake failed");
            return;
        }
    };

    let (tx, rx) = mpsc::unbounded_channel();
    // The ack goes first so the subscriber never sees a publication before it
    let _ = tx.send(Bytes::from_static(ACK.as_bytes()));
    {
        let mut set = subscribers.lock();
        if set.closed {
            return;
        }
        debug!(%peer, ?topics, "Control subscriber registered");
        set.subscribers.push(Subscriber { peer, topics, tx });
    }
    tokio::spawn(write_control(writer, peer, rx, max_frame_bytes));

    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => break,
            frame = read_frame(&mut reader, max_frame_bytes) => frame,
        };
        match frame {
            Ok(Some(frame)) => {
                if upstream_tx.send(frame).is_err() {
                    break;
                }
            }
            Ok(None) => {
                debug!(%peer, "Control subscriber disconnected");
                break;
            }
            Err(e) => {
                warn!(%peer, error = %e, "Control read failed");
                break;
            }
        }
    }
}

async fn write_control(
    mut writer: OwnedWriteHalf,
    peer: SocketAddr,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    max_frame_bytes: usize,
) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = write_frame(&mut writer, &frame, max_frame_bytes).await {
            warn!(%peer, error = %e, "Control write failed");
            break;
        }
    }
}

struct TcpControl {
    subscribers: Arc<Mutex<SubscriberSet>>,
    upstream_rx: mpsc::UnboundedReceiver<Bytes>,
}

#[async_trait]
impl ControlChannel for TcpControl {
    fn publish(&mut self, message: &ControlMessage) -> SendOutcome {
        let mut set = self.subscribers.lock();
        if set.closed {
            return SendOutcome::Closed;
        }
        let frame = message.encode();
        set.subscribers.retain(|s| {
            if !s.topics.iter().any(|t| t.matches(&message.topic)) {
                return true;
            }
            let delivered = s.tx.send(frame.clone()).is_ok();
            if !delivered {
                debug!(peer = %s.peer, "Removing closed control subscriber");
            }
            delivered
        });
        SendOutcome::Sent
    }

    fn try_recv(&mut self) -> Option<Bytes> {
        self.upstream_rx.try_recv().ok()
    }

    async fn recv_until(&mut self, deadline: Instant) -> Option<Bytes> {
        let deadline = tokio::time::Instant::from_std(deadline);
        tokio::time::timeout_at(deadline, self.upstream_rx.recv())
            .await
            .ok()
            .flatten()
    }

    fn close(&mut self) {
        let mut set = self.subscribers.lock();
        set.closed = true;
        // Writers flush what is queued, then shut down their half
        set.subscribers.clear();
    }
}

// ---------------------------------------------------------------------------
// Join channel
// ---------------------------------------------------------------------------

async fn accept_joiners(
    listener: TcpListener,
    join_tx: mpsc::UnboundedSender<JoinRequest>,
    max_frame_bytes: usize,
    cancel: CancellationToken,
) {
    loop {
        let (stream, peer) = tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "Join accept failed");
                    continue;
                }
            },
        };
        tokio::spawn(serve_joiner(
            stream,
            peer,
            join_tx.clone(),
            max_frame_bytes,
            cancel.clone(),
        ));
    }
}

async fn serve_joiner(
    mut stream: TcpStream,
    peer: SocketAddr,
    join_tx: mpsc::UnboundedSender<JoinRequest>,
    max_frame_bytes: usize,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => break,
            frame = read_frame(&mut stream, max_frame_bytes) => frame,
        };
        let frame = match frame {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                warn!(%peer, error = %e, "Join read failed");
                break;
            }
        };

        let line = String::from_utf8_lossy(&frame).into_owned();
        let (tx, rx) = oneshot::channel();
        if join_tx.send(JoinRequest::new(line, Some(tx))).is_err() {
            break;
        }
        // A dropped responder means the request needed no answer
        if let Ok(reply) = rx.await {
            if let Err(e) = write_frame(&mut stream, reply.as_bytes(), max_frame_bytes).await {
                warn!(%peer, error = %e, "Join reply failed");
                break;
            }
        }
    }
}

struct TcpJoin {
    rx: mpsc::UnboundedReceiver<JoinRequest>,
}

impl JoinChannel for TcpJoin {
    fn try_recv(&mut self) -> Option<JoinRequest> {
        self.rx.try_recv().ok()
    }

    fn close(&mut self) {
        self.rx.close();
    }
}

/// Sends each report as one frame on a fresh connection.
struct TcpReporter {
    address: String,
    max_frame_bytes: usize,
}

#[async_trait]
impl Reporter for TcpReporter {
    async fn report(&mut self, line: String) -> Result<()> {
        let mut stream = TcpStream::connect(&self.address).await.map_err(|e| {
            ClusterError::transport_with_source(format!("failed to connect to {}", self.address), e)
        })?;
        write_frame(&mut stream, line.as_bytes(), self.max_frame_bytes).await
    }
}

// ---------------------------------------------------------------------------
// Worker side
// ---------------------------------------------------------------------------

/// Worker endpoint connected to a [`TcpTransport`].
pub struct TcpWorkerLink {
    control_address: String,
    max_frame_bytes: usize,
    join: TcpStream,
    work_rx: mpsc::UnboundedReceiver<Bytes>,
    work_open: bool,
    control: Option<ControlConnection>,
    cancel: CancellationToken,
}

struct ControlConnection {
    writer: OwnedWriteHalf,
    rx: mpsc::UnboundedReceiver<Bytes>,
    open: bool,
}

impl TcpWorkerLink {
    /// Connect the join and work channels. The control channel connects on
    /// [`WorkerLink::subscribe`].
    pub async fn connect(config: &WorkerConfig) -> Result<Self> {
        let join = connect(&config.join_address).await?;
        let work = connect(&config.work_address).await?;
        let cancel = CancellationToken::new();

        let (work_tx, work_rx) = mpsc::unbounded_channel();
        let (reader, _writer) = work.into_split();
        tokio::spawn(forward_frames(
            reader,
            work_tx,
            config.max_frame_bytes,
            cancel.clone(),
        ));

        Ok(Self {
            control_address: config.control_address.clone(),
            max_frame_bytes: config.max_frame_bytes,
            join,
            work_rx,
            work_open: true,
            control: None,
            cancel,
        })
    }
}

impl Drop for TcpWorkerLink {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn connect(address: &str) -> Result<TcpStream> {
    TcpStream::connect(address).await.map_err(|e| {
        ClusterError::transport_with_source(format!("failed to connect to {}", address), e)
    })
}

async fn forward_frames<R>(
    mut reader: R,
    tx: mpsc::UnboundedSender<Bytes>,
    max_frame_bytes: usize,
    cancel: CancellationToken,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => break,
            frame = read_frame(&mut reader, max_frame_bytes) => frame,
        };
        match frame {
            Ok(Some(frame)) => {
                if tx.send(frame).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Worker link read failed");
                break;
            }
        }
    }
}

enum Step {
    Work(Option<Bytes>),
    Control(Option<Bytes>),
}

async fn next_control(control: &mut Option<ControlConnection>) -> Option<Bytes> {
    match control {
        Some(conn) => conn.rx.recv().await,
        None => None,
    }
}

#[async_trait]
impl WorkerLink for TcpWorkerLink {
    async fn request(&mut self, line: String) -> Result<String> {
        write_frame(&mut self.join, line.as_bytes(), self.max_frame_bytes).await?;
        let reply = read_frame(&mut self.join, self.max_frame_bytes)
            .await?
            .ok_or_else(|| ClusterError::transport("join channel closed before reply"))?;
        Ok(String::from_utf8_lossy(&reply).into_owned())
    }

    async fn report(&mut self, line: String) -> Result<()> {
        write_frame(&mut self.join, line.as_bytes(), self.max_frame_bytes).await
    }

    async fn subscribe(&mut self, topics: Vec<Topic>) -> Result<()> {
        let stream = connect(&self.control_address).await?;
        let (mut reader, mut writer) = stream.into_split();

        let mut line = SUBSCRIBE.to_string();
        for topic in &topics {
            line.push(' ');
            line.push_str(&topic.to_string());
        }
        write_frame(&mut writer, line.as_bytes(), self.max_frame_bytes).await?;

        match read_frame(&mut reader, self.max_frame_bytes).await? {
            Some(frame) if frame == ACK.as_bytes() => {}
            Some(frame) => {
                return Err(ClusterError::protocol(
                    String::from_utf8_lossy(&frame),
                    "expected subscription ack",
                ))
            }
            None => return Err(ClusterError::transport("control channel closed during subscribe")),
        }

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(forward_frames(
            reader,
            tx,
            self.max_frame_bytes,
            self.cancel.clone(),
        ));
        self.control = Some(ControlConnection {
            writer,
            rx,
            open: true,
        });
        Ok(())
    }

    async fn next_event(&mut self) -> Option<WorkerEvent> {
        loop {
            let control_open = self.control.as_ref().map(|c| c.open).unwrap_or(false);
            let step = tokio::select! {
                biased;
                frame = self.work_rx.recv(), if self.work_open => Step::Work(frame),
                frame = next_control(&mut self.control), if control_open => Step::Control(frame),
                else => return None,
            };
            match step {
                Step::Work(Some(frame)) => return Some(WorkerEvent::Work(frame)),
                Step::Control(Some(frame)) => return Some(WorkerEvent::Control(frame)),
                Step::Work(None) => self.work_open = false,
                Step::Control(None) => {
                    if let Some(conn) = self.control.as_mut() {
                        conn.open = false;
                    }
                }
            }
        }
    }

    async fn send_upstream(&mut self, frame: Bytes) -> Result<()> {
        let conn = self
            .control
            .as_mut()
            .ok_or_else(|| ClusterError::invalid_state("send_upstream before subscribe"))?;
        write_frame(&mut conn.writer, &frame, self.max_frame_bytes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Command;
    use std::time::Duration;

    fn loopback() -> NetworkConfig {
        NetworkConfig {
            work_address: "127.0.0.1:0".to_string(),
            control_address: "127.0.0.1:0".to_string(),
            join_address: "127.0.0.1:0".to_string(),
            report_address: None,
            ..NetworkConfig::default()
        }
    }

    fn worker_config(tcp: &TcpTransport) -> WorkerConfig {
        WorkerConfig {
            join_address: tcp.join_addr().to_string(),
            work_address: tcp.work_addr().to_string(),
            control_address: tcp.control_addr().to_string(),
            ..WorkerConfig::default()
        }
    }

    async fn wait_for<T>(mut poll: impl FnMut() -> Option<T>) -> T {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(value) = poll() {
                return value;
            }
            assert!(Instant::now() < deadline, "timed out waiting");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[test]
    fn test_parse_subscribe() {
        assert_eq!(
            parse_subscribe(b"SUB BROADCAST 4").unwrap(),
            vec![Topic::Broadcast, Topic::Worker(4)]
        );
        assert!(parse_subscribe(b"HELLO BROADCAST").is_err());
        assert!(parse_subscribe(b"SUB nobody").is_err());
    }

    #[tokio::test]
    async fn test_bind_failure_is_fatal() {
        let network = NetworkConfig {
            work_address: "not-an-address".to_string(),
            ..loopback()
        };
        let err = TcpTransport::bind(&network, 1, CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_work_without_pullers_is_backpressure() {
        let cancel = CancellationToken::new();
        let tcp = TcpTransport::bind(&loopback(), 1, cancel.clone()).await.unwrap();
        let mut transport = tcp.into_transport();
        assert_eq!(
            transport.work.try_push(Bytes::from_static(b"x")),
            SendOutcome::Backpressure
        );
        transport.work.close();
        assert_eq!(transport.work.try_push(Bytes::from_static(b"x")), SendOutcome::Closed);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_loopback_channels() {
        let cancel = CancellationToken::new();
        let tcp = TcpTransport::bind(&loopback(), 2, cancel.clone()).await.unwrap();
        let mut link = TcpWorkerLink::connect(&worker_config(&tcp)).await.unwrap();
        let mut transport = tcp.into_transport();

        // Join request and reply
        let requester = tokio::spawn(async move {
            let reply = link.request("-1 JOIN".to_string()).await.unwrap();
            (link, reply)
        });
        let mut request = wait_for(|| transport.join.try_recv()).await;
        assert_eq!(request.line, "-1 JOIN");
        request.reply("0 GOOD");
        let (mut link, reply) = requester.await.unwrap();
        assert_eq!(reply, "0 GOOD");

        // Subscription and routed publication
        link.subscribe(vec![Topic::Broadcast, Topic::Worker(0)]).await.unwrap();
        let ignored = ControlMessage::new(Topic::Worker(9), Command::Abort { iteration: 0 });
        let wanted = ControlMessage::new(Topic::Worker(0), Command::RequestCentroids { iteration: 0 });
        assert_eq!(transport.control.publish(&ignored), SendOutcome::Sent);
        assert_eq!(transport.control.publish(&wanted), SendOutcome::Sent);
        assert_eq!(
            link.next_event().await,
            Some(WorkerEvent::Control(wanted.encode()))
        );

        // Work reaches the single puller once it is registered
        wait_for(|| {
            (transport.work.try_push(Bytes::from_static(b"group")) == SendOutcome::Sent)
                .then_some(())
        })
        .await;
        assert_eq!(
            link.next_event().await,
            Some(WorkerEvent::Work(Bytes::from_static(b"group")))
        );
        wait_for(|| (transport.work.queued() == 0).then_some(())).await;

        // Return path
        link.send_upstream(Bytes::from_static(b"0 HEARTBEAT\n")).await.unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        assert_eq!(
            transport.control.recv_until(deadline).await.unwrap(),
            "0 HEARTBEAT\n"
        );

        // Closing ends the worker's event stream
        transport.close();
        assert_eq!(link.next_event().await, None);
        cancel.cancel();
    }
}
