// rust/kmeans-core/src/transport/memory.rs

//! In-process transport on tokio channels.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};

use super::{
    ControlChannel, JoinChannel, JoinRequest, Reporter, SendOutcome, Transport, WorkChannel,
    WorkerEvent, WorkerLink,
};
use crate::error::{ClusterError, Result};
use crate::protocol::{ControlMessage, Topic};

const CONTROL_CAPACITY: usize = 1024;

/// Shared endpoints used to create worker links.
pub struct MemoryHub {
    work_rx: Arc<Mutex<mpsc::Receiver<Bytes>>>,
    control_rx: broadcast::Receiver<(Topic, Bytes)>,
    upstream_tx: mpsc::UnboundedSender<Bytes>,
    join_tx: mpsc::UnboundedSender<JoinRequest>,
    reports_rx: mpsc::UnboundedReceiver<String>,
}

impl MemoryHub {
    /// Create a coordinator transport and the hub workers connect through.
    ///
    /// At most `work_backlog` frames wait in the work channel.
    pub fn new(work_backlog: usize) -> (Transport, MemoryHub) {
        let (work_tx, work_rx) = mpsc::channel(work_backlog.max(1));
        let (control_tx, control_rx) = broadcast::channel(CONTROL_CAPACITY);
        let (upstream_tx, upstream_rx) = mpsc::unbounded_channel();
        let (join_tx, join_rx) = mpsc::unbounded_channel();
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();

        let transport = Transport::new(
            Box::new(MemoryWork { tx: Some(work_tx) }),
            Box::new(MemoryControl {
                tx: Some(control_tx),
                upstream_rx,
            }),
            Box::new(MemoryJoin { rx: join_rx }),
            Box::new(MemoryReporter { tx: reports_tx }),
        );
        let hub = MemoryHub {
            work_rx: Arc::new(Mutex::new(work_rx)),
            control_rx,
            upstream_tx,
            join_tx,
            reports_rx,
        };
        (transport, hub)
    }

    /// A new worker endpoint. Control messages published from now on are
    /// visible to it once it subscribes.
    pub fn link(&self) -> MemoryWorkerLink {
        MemoryWorkerLink {
            work_rx: Arc::clone(&self.work_rx),
            work_open: true,
            control_rx: self.control_rx.resubscribe(),
            control_open: true,
            topics: Vec::new(),
            upstream_tx: self.upstream_tx.clone(),
            join_tx: self.join_tx.clone(),
        }
    }

    /// Pop one work frame without waiting.
    pub fn try_pull_work(&self) -> Option<Bytes> {
        self.work_rx.try_lock().ok()?.try_recv().ok()
    }

    /// Pop one coordinator report without waiting.
    pub fn try_report(&mut self) -> Option<String> {
        self.reports_rx.try_recv().ok()
    }
}

struct MemoryWork {
    tx: Option<mpsc::Sender<Bytes>>,
}

impl WorkChannel for MemoryWork {
    fn try_push(&mut self, frame: Bytes) -> SendOutcome {
        let Some(tx) = &self.tx else {
            return SendOutcome::Closed;
        };
        match tx.try_send(frame) {
            Ok(()) => SendOutcome::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => SendOutcome::Backpressure,
            Err(mpsc::error::TrySendError::Closed(_)) => SendOutcome::Closed,
        }
    }

    fn queued(&self) -> usize {
        self.tx
            .as_ref()
            .map(|tx| tx.max_capacity() - tx.capacity())
            .unwrap_or(0)
    }

    fn close(&mut self) {
        self.tx = None;
    }
}

struct MemoryControl {
    tx: Option<broadcast::Sender<(Topic, Bytes)>>,
    upstream_rx: mpsc::UnboundedReceiver<Bytes>,
}

#[async_trait]
impl ControlChannel for MemoryControl {
    fn publish(&mut self, message: &ControlMessage) -> SendOutcome {
        let Some(tx) = &self.tx else {
            return SendOutcome::Closed;
        };
        // An error only means there are no live receivers
        let _ = tx.send((message.topic, message.encode()));
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
        self.tx = None;
    }
}

struct MemoryJoin {
    rx: mpsc::UnboundedReceiver<JoinRequest>,
}

impl JoinChannel for MemoryJoin {
    fn try_recv(&mut self) -> Option<JoinRequest> {
        self.rx.try_recv().ok()
    }

    fn close(&mut self) {
        self.rx.close();
    }
}

struct MemoryReporter {
    tx: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl Reporter for MemoryReporter {
    async fn report(&mut self, line: String) -> Result<()> {
        // The hub may already be gone during shutdown
        let _ = self.tx.send(line);
        Ok(())
    }
}

/// Worker endpoint on a [`MemoryHub`].
pub struct MemoryWorkerLink {
    work_rx: Arc<Mutex<mpsc::Receiver<Bytes>>>,
    work_open: bool,
    control_rx: broadcast::Receiver<(Topic, Bytes)>,
    control_open: bool,
    topics: Vec<Topic>,
    upstream_tx: mpsc::UnboundedSender<Bytes>,
    join_tx: mpsc::UnboundedSender<JoinRequest>,
}

enum Step {
    Work(Option<Bytes>),
    Control(Option<Bytes>),
}

async fn pull_work(work_rx: &Mutex<mpsc::Receiver<Bytes>>) -> Option<Bytes> {
    work_rx.lock().await.recv().await
}

async fn next_control(
    control_rx: &mut broadcast::Receiver<(Topic, Bytes)>,
    topics: &[Topic],
) -> Option<Bytes> {
    loop {
        match control_rx.recv().await {
            Ok((topic, frame)) if topics.iter().any(|t| t.matches(&topic)) => return Some(frame),
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Worker link lagged behind control channel");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

#[async_trait]
impl WorkerLink for MemoryWorkerLink {
    async fn request(&mut self, line: String) -> Result<String> {
        let (tx, rx) = oneshot::channel();
        self.join_tx
            .send(JoinRequest::new(line, Some(tx)))
            .map_err(|_| ClusterError::transport("join channel closed"))?;
        rx.await
            .map_err(|_| ClusterError::transport("join request dropped without reply"))
    }

    async fn report(&mut self, line: String) -> Result<()> {
        self.join_tx
            .send(JoinRequest::new(line, None))
            .map_err(|_| ClusterError::transport("join channel closed"))
    }

    async fn subscribe(&mut self, topics: Vec<Topic>) -> Result<()> {
        self.topics = topics;
        Ok(())
    }

    async fn next_event(&mut self) -> Option<WorkerEvent> {
        loop {
            let step = tokio::select! {
                biased;
                frame = pull_work(&self.work_rx), if self.work_open => Step::Work(frame),
                frame = next_control(&mut self.control_rx, &self.topics), if self.control_open => {
                    Step::Control(frame)
                }
                else => return None,
            };
            match step {
                Step::Work(Some(frame)) => return Some(WorkerEvent::Work(frame)),
                Step::Control(Some(frame)) => return Some(WorkerEvent::Control(frame)),
                Step::Work(None) => self.work_open = false,
                Step::Control(None) => self.control_open = false,
            }
        }
    }

    async fn send_upstream(&mut self, frame: Bytes) -> Result<()> {
        self.upstream_tx
            .send(frame)
            .map_err(|_| ClusterError::transport("control return path closed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Command;
    use std::time::Duration;

    #[test]
    fn test_work_backpressure_and_queued() {
        let (mut transport, hub) = MemoryHub::new(2);
        assert_eq!(transport.work.try_push(Bytes::from_static(b"a")), SendOutcome::Sent);
        assert_eq!(transport.work.try_push(Bytes::from_static(b"b")), SendOutcome::Sent);
        assert_eq!(transport.work.queued(), 2);
        assert_eq!(
            transport.work.try_push(Bytes::from_static(b"c")),
            SendOutcome::Backpressure
        );

        assert_eq!(hub.try_pull_work().unwrap(), "a");
        assert_eq!(transport.work.queued(), 1);
        assert_eq!(transport.work.try_push(Bytes::from_static(b"c")), SendOutcome::Sent);

        transport.work.close();
        assert_eq!(transport.work.try_push(Bytes::from_static(b"d")), SendOutcome::Closed);
        assert_eq!(transport.work.queued(), 0);
    }

    #[tokio::test]
    async fn test_publish_routes_by_topic() {
        let (mut transport, hub) = MemoryHub::new(4);
        let mut one = hub.link();
        let mut two = hub.link();
        one.subscribe(vec![Topic::Broadcast, Topic::Worker(1)]).await.unwrap();
        two.subscribe(vec![Topic::Broadcast, Topic::Worker(2)]).await.unwrap();

        let direct = ControlMessage::new(Topic::Worker(2), Command::Abort { iteration: 0 });
        let all = ControlMessage::new(Topic::Broadcast, Command::Done { iteration: 0 });
        assert_eq!(transport.control.publish(&direct), SendOutcome::Sent);
        assert_eq!(transport.control.publish(&all), SendOutcome::Sent);

        assert_eq!(
            one.next_event().await,
            Some(WorkerEvent::Control(all.encode()))
        );
        assert_eq!(
            two.next_event().await,
            Some(WorkerEvent::Control(direct.encode()))
        );
        assert_eq!(
            two.next_event().await,
            Some(WorkerEvent::Control(all.encode()))
        );
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_sent() {
        let (mut transport, _hub) = MemoryHub::new(1);
        let msg = ControlMessage::new(Topic::Broadcast, Command::Done { iteration: 1 });
        assert_eq!(transport.control.publish(&msg), SendOutcome::Sent);
        transport.control.close();
        assert_eq!(transport.control.publish(&msg), SendOutcome::Closed);
    }

    #[tokio::test]
    async fn test_join_request_reply_roundtrip() {
        let (mut transport, hub) = MemoryHub::new(1);
        let mut link = hub.link();

        let requester = tokio::spawn(async move { link.request("-1 JOIN".to_string()).await });
        let mut request = loop {
            if let Some(r) = transport.join.try_recv() {
                break r;
            }
            tokio::task::yield_now().await;
        };
        assert_eq!(request.line, "-1 JOIN");
        assert!(request.reply("0 GOOD"));
        assert_eq!(requester.await.unwrap().unwrap(), "0 GOOD");
    }

    #[tokio::test]
    async fn test_upstream_and_closing() {
        let (mut transport, hub) = MemoryHub::new(1);
        let mut link = hub.link();
        link.subscribe(vec![Topic::Broadcast]).await.unwrap();

        link.send_upstream(Bytes::from_static(b"0 HEARTBEAT\n")).await.unwrap();
        let deadline = Instant::now() + Duration::from_secs(1);
        assert_eq!(
            transport.control.recv_until(deadline).await.unwrap(),
            "0 HEARTBEAT\n"
        );
        assert!(transport.control.try_recv().is_none());

        transport.close();
        drop(transport);
        assert_eq!(link.next_event().await, None);
    }

    #[tokio::test]
    async fn test_recv_until_times_out() {
        let (mut transport, _hub) = MemoryHub::new(1);
        let deadline = Instant::now() + Duration::from_millis(20);
        assert!(transport.control.recv_until(deadline).await.is_none());
    }
}
