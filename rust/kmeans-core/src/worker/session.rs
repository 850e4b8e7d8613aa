// rust/kmeans-core/src/worker/session.rs

//! Per-worker state and the event loop that drives it.

use std::collections::HashSet;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec;
use crate::config::WorkerConfig;
use crate::error::{ClusterError, Result};
use crate::kmeans::{accumulate, to_contributions, ClusterSum};
use crate::model::{CentroidSet, PartialContribution, PointGroup, WorkerId};
use crate::protocol::{parse_join_reply, Command, ControlMessage, JoinMessage, Topic, UpstreamMessage};
use crate::transport::{WorkerEvent, WorkerLink};

/// Everything one worker knows. Owned by its event loop.
pub struct WorkerSession<L: WorkerLink> {
    link: L,
    id: Option<WorkerId>,
    centroids: Option<CentroidSet>,
    sums: Vec<ClusterSum>,
    /// Group ids already accumulated for the current iteration.
    seen_groups: HashSet<String>,
    /// Groups that arrived before the centroids for their iteration.
    future_groups: Vec<PointGroup>,
    processed_points: u64,
    heartbeat_interval: Duration,
    max_frame_bytes: usize,
}

enum Step {
    Cancelled,
    Heartbeat,
    Event(Option<WorkerEvent>),
}

impl<L: WorkerLink> WorkerSession<L> {
    pub fn new(link: L, config: &WorkerConfig) -> Self {
        Self {
            link,
            id: None,
            centroids: None,
            sums: Vec::new(),
            seen_groups: HashSet::new(),
            future_groups: Vec::new(),
            processed_points: 0,
            heartbeat_interval: config.heartbeat_interval(),
            max_frame_bytes: config.max_frame_bytes,
        }
    }

    pub fn id(&self) -> Option<WorkerId> {
        self.id
    }

    pub fn centroids(&self) -> Option<&CentroidSet> {
        self.centroids.as_ref()
    }

    /// Unique points accumulated over the whole run.
    pub fn processed_points(&self) -> u64 {
        self.processed_points
    }

    /// Join the coordinator, subscribe to the control topics and announce START.
    pub async fn join(&mut self) -> Result<WorkerId> {
        let request = JoinMessage::Join { previous: self.id };
        let reply = self.link.request(request.to_string()).await?;
        let id = parse_join_reply(&reply)?;

        self.link
            .subscribe(vec![Topic::Broadcast, Topic::Worker(id)])
            .await?;
        self.link.report(JoinMessage::Start { id }.to_string()).await?;
        self.id = Some(id);
        info!(worker_id = id, "Joined coordinator");
        Ok(id)
    }

    /// Process events until DONE, channel closure or cancellation.
    ///
    /// Returns the number of points processed.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<u64> {
        let mut id = self
            .id
            .ok_or_else(|| ClusterError::invalid_state("worker must join before running"))?;
        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);

        loop {
            let step = tokio::select! {
                biased;
                () = cancel.cancelled() => Step::Cancelled,
                _ = heartbeat.tick() => Step::Heartbeat,
                event = self.link.next_event() => Step::Event(event),
            };

            match step {
                Step::Cancelled => {
                    info!(worker_id = id, "Worker cancelled");
                    break;
                }
                Step::Heartbeat => {
                    let frame = UpstreamMessage::Heartbeat { worker_id: id }.encode();
                    if let Err(e) = self.link.send_upstream(frame).await {
                        warn!(worker_id = id, error = %e, "Heartbeat failed");
                    }
                }
                Step::Event(Some(WorkerEvent::Work(frame))) => self.handle_work(&frame),
                Step::Event(Some(WorkerEvent::Control(frame))) => {
                    let running = self.handle_control(&frame).await;
                    // The id changes when the coordinator made us join again
                    id = self.id.unwrap_or(id);
                    if !running {
                        break;
                    }
                }
                Step::Event(None) => {
                    info!(worker_id = id, "Coordinator channels closed");
                    break;
                }
            }
        }

        let done = JoinMessage::Done {
            id,
            count: self.processed_points,
        };
        if let Err(e) = self.link.report(done.to_string()).await {
            debug!(worker_id = id, error = %e, "Could not report DONE");
        }
        info!(worker_id = id, processed = self.processed_points, "Worker finished");
        Ok(self.processed_points)
    }

    fn handle_work(&mut self, frame: &[u8]) {
        match codec::decode::<PointGroup>(frame) {
            Ok(group) => self.handle_group(group),
            Err(e) => warn!(error = %e, "Discarding undecodable work frame"),
        }
    }

    fn handle_group(&mut self, group: PointGroup) {
        let Some(current) = &self.centroids else {
            self.future_groups.push(group);
            return;
        };

        if group.iteration > current.iteration {
            self.future_groups.push(group);
        } else if group.iteration < current.iteration {
            debug!(group_id = %group.id, iteration = group.iteration, "Dropping stale group");
        } else if self.seen_groups.insert(group.id.clone()) {
            let positions = current.positions();
            accumulate(&positions, &group.points, &mut self.sums);
            self.processed_points += group.len() as u64;
        } else {
            debug!(group_id = %group.id, "Skipping duplicate group");
        }
    }

    /// Returns false when the run is over.
    async fn handle_control(&mut self, frame: &[u8]) -> bool {
        let message = match ControlMessage::decode(frame) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Discarding malformed control message");
                return true;
            }
        };

        match message.command {
            Command::RequestCentroids { iteration } => self.respond(iteration).await,
            Command::Centroids { iteration } => match codec::decode::<CentroidSet>(&message.payload) {
                Ok(set) if set.iteration == iteration => self.install(set),
                Ok(set) => warn!(
                    header = iteration,
                    payload = set.iteration,
                    "Centroid iteration mismatch"
                ),
                Err(e) => warn!(error = %e, "Discarding undecodable centroids"),
            },
            Command::Abort { iteration } => self.abort(iteration),
            Command::Evicted { iteration } => {
                // Notices for an id we already left behind are stale
                if self.id.map(Topic::Worker) == Some(message.topic) {
                    return self.rejoin(iteration).await;
                }
            }
            Command::Done { iteration } => {
                info!(iteration, "Coordinator finished");
                return false;
            }
        }
        true
    }

    /// Join again under a fresh id after the coordinator removed us.
    ///
    /// Accumulated work is kept and reported under the new id. Returns false
    /// if the coordinator cannot be reached.
    async fn rejoin(&mut self, iteration: u64) -> bool {
        let previous = self.id;
        warn!(worker_id = ?previous, iteration, "Evicted by coordinator, joining again");
        match self.join().await {
            Ok(id) => {
                info!(worker_id = id, previous = ?previous, "Rejoined coordinator");
                true
            }
            Err(e) => {
                warn!(worker_id = ?previous, error = %e, "Rejoin failed");
                false
            }
        }
    }

    /// Send the accumulated contributions for `iteration`, possibly none.
    ///
    /// A failed send is logged. The coordinator treats a missing response
    /// like a slow worker.
    async fn respond(&mut self, iteration: u64) {
        let Some(id) = self.id else {
            warn!(iteration, "Cannot respond before joining");
            return;
        };

        let current = self.centroids.as_ref().map(|c| c.iteration);
        let contributions: Vec<PartialContribution> = if current == Some(iteration) {
            to_contributions(id, iteration, &self.sums)
        } else {
            Vec::new()
        };
        self.sums.iter_mut().for_each(|s| *s = ClusterSum::default());

        let payload = match codec::encode(&contributions, self.max_frame_bytes) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(worker_id = id, error = %e, "Cannot encode contributions");
                return;
            }
        };
        debug!(worker_id = id, iteration, contributions = contributions.len(), "Responding");
        let frame = UpstreamMessage::Contribution {
            worker_id: id,
            iteration,
            payload,
        }
        .encode();
        if let Err(e) = self.link.send_upstream(frame).await {
            warn!(worker_id = id, iteration, error = %e, "Failed to send contributions");
        }
    }

    fn install(&mut self, set: CentroidSet) {
        if let Some(current) = &self.centroids {
            if set.iteration <= current.iteration {
                return;
            }
        }
        if set.is_empty() {
            warn!(iteration = set.iteration, "Ignoring empty centroid set");
            return;
        }

        debug!(iteration = set.iteration, "Installing centroids");
        self.sums = vec![ClusterSum::default(); set.len()];
        self.seen_groups.clear();
        self.centroids = Some(set);

        for group in std::mem::take(&mut self.future_groups) {
            self.handle_group(group);
        }
    }

    fn abort(&mut self, iteration: u64) {
        if self.centroids.as_ref().map(|c| c.iteration) == Some(iteration) {
            self.sums.iter_mut().for_each(|s| *s = ClusterSum::default());
        }
        self.future_groups.retain(|g| g.iteration > iteration);
        debug!(iteration, "Aborted iteration");
    }
}
