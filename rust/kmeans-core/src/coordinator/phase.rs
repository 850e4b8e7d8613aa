// rust/kmeans-core/src/coordinator/phase.rs

//! The coordinator's control loop.
//!
//! ```text
//! ADMITTING -> DISTRIBUTING -> COLLECTING -> BROADCASTING -> DISTRIBUTING
//!                                                         \-> DONE
//! ```
//!
//! Every tick drains the join channel and the control return path, sweeps
//! worker liveness, then performs one step of the current phase. The loop is
//! the only writer of the registry, the pending group and the centroids.

use std::collections::BTreeSet;
use std::time::Instant;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::aggregator::{ApplyOutcome, CentroidAggregator};
use super::distributor::{AdvanceOutcome, DistributorStats, TaskDistributor};
use super::registry::WorkerRegistry;
use crate::codec;
use crate::config::CoordinatorConfig;
use crate::error::{ClusterError, Result};
use crate::kmeans::max_displacement;
use crate::model::{CentroidSet, PartialContribution, WorkerId};
use crate::protocol::{
    join_reply, Command, ControlMessage, JoinMessage, Topic, UpstreamMessage, BAD_REPLY,
};
use crate::source::PointSource;
use crate::transport::{SendOutcome, Transport};

/// Observable phase of the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseKind {
    Admitting,
    Distributing,
    Collecting,
    Broadcasting,
    Done,
}

struct Collection {
    aggregator: CentroidAggregator,
    /// Workers active when the request went out.
    expected: BTreeSet<WorkerId>,
    deadline: Instant,
}

enum Phase {
    Admitting,
    Distributing {
        /// Set once the source is exhausted while groups are still queued.
        drain_deadline: Option<Instant>,
    },
    Collecting(Collection),
    Broadcasting(CentroidAggregator),
    Done,
}

impl Phase {
    fn kind(&self) -> PhaseKind {
        match self {
            Phase::Admitting => PhaseKind::Admitting,
            Phase::Distributing { .. } => PhaseKind::Distributing,
            Phase::Collecting(_) => PhaseKind::Collecting,
            Phase::Broadcasting(_) => PhaseKind::Broadcasting,
            Phase::Done => PhaseKind::Done,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CoordinatorStats {
    pub distribution: DistributorStats,
    /// Completed collect/broadcast rounds.
    pub iterations: u64,
    pub workers_joined: u64,
    pub workers_lost: u64,
    pub collection_timeouts: u64,
    pub contributions_applied: u64,
    pub contributions_duplicated: u64,
    /// Contributions that arrived outside their collection window.
    pub contributions_late: u64,
    pub malformed_messages: u64,
}

/// Outcome of a finished run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub centroids: CentroidSet,
    pub iterations: u64,
    /// False when the run stopped on the iteration cap or cancellation.
    pub converged: bool,
    pub stats: CoordinatorStats,
}

pub struct PhaseCoordinator {
    uid: String,
    config: CoordinatorConfig,
    source: Box<dyn PointSource>,
    transport: Transport,
    registry: WorkerRegistry,
    distributor: TaskDistributor,
    centroids: CentroidSet,
    phase: Phase,
    converged: bool,
    stats: CoordinatorStats,
}

impl PhaseCoordinator {
    /// Create a coordinator in the ADMITTING phase.
    ///
    /// Fails if the configuration is invalid or the source cannot provide
    /// the starting centroids.
    pub fn new(
        config: CoordinatorConfig,
        mut source: Box<dyn PointSource>,
        transport: Transport,
    ) -> Result<Self> {
        config.validate()?;

        let k = config.convergence.k;
        let starting = source.starting_centroids(k)?;
        if starting.len() != k {
            return Err(ClusterError::invalid_state(format!(
                "source returned {} starting centroids, expected {}",
                starting.len(),
                k
            )));
        }

        let distributor = TaskDistributor::new(
            config.distribution.group_size,
            config.distribution.redundancy,
            config.network.max_frame_bytes,
        )?;
        if config.distribution.has_redundant_copies() {
            warn!(
                redundancy = config.distribution.redundancy,
                "Copies of a group processed by different workers are all counted"
            );
        }
        let uid = if config.uid.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            config.uid.clone()
        };

        info!(
            uid = %uid,
            k,
            group_size = config.distribution.group_size,
            redundancy = config.distribution.redundancy,
            "Coordinator created"
        );

        Ok(Self {
            uid,
            config,
            source,
            transport,
            registry: WorkerRegistry::new(),
            distributor,
            centroids: CentroidSet::from_points(0, &starting),
            phase: Phase::Admitting,
            converged: false,
            stats: CoordinatorStats::default(),
        })
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn phase(&self) -> PhaseKind {
        self.phase.kind()
    }

    /// The latest broadcast centroid set (the starting set before the first
    /// round completes).
    pub fn centroids(&self) -> &CentroidSet {
        &self.centroids
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    pub fn stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            distribution: self.distributor.stats(),
            ..self.stats
        }
    }

    pub fn summary(&self) -> RunSummary {
        let stats = self.stats();
        RunSummary {
            centroids: self.centroids.clone(),
            iterations: stats.iterations,
            converged: self.converged,
            stats,
        }
    }

    /// Run one pass of the control loop at time `now`.
    ///
    /// An error is fatal: the coordinator is left in the DONE phase.
    pub fn tick(&mut self, now: Instant) -> Result<PhaseKind> {
        if matches!(self.phase, Phase::Done) {
            return Ok(PhaseKind::Done);
        }

        self.drain_joins(now)?;
        while let Some(frame) = self.transport.control.try_recv() {
            self.handle_upstream(&frame, now);
        }
        let lost = self
            .registry
            .sweep(now, self.config.collection.worker_timeout());
        self.stats.workers_lost += lost.len() as u64;
        for id in lost {
            self.notify_evicted(id);
        }

        let phase = std::mem::replace(&mut self.phase, Phase::Done);
        self.phase = match phase {
            Phase::Admitting => self.admit()?,
            Phase::Distributing { drain_deadline } => self.distribute(drain_deadline, now)?,
            Phase::Collecting(collection) => self.collect(collection, now)?,
            Phase::Broadcasting(aggregator) => self.broadcast(aggregator)?,
            Phase::Done => Phase::Done,
        };
        Ok(self.phase.kind())
    }

    /// Drive the loop until DONE or until `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<RunSummary> {
        self.report(format!("{} START", self.uid)).await;

        let mut interval = tokio::time::interval(self.config.collection.tick());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            match self.tick(Instant::now()) {
                Ok(PhaseKind::Done) => break,
                Ok(_) => {}
                Err(e) => {
                    self.transport.close();
                    return Err(e);
                }
            }

            let cancelled = tokio::select! {
                () = cancel.cancelled() => true,
                () = self.wait(&mut interval) => false,
            };
            if cancelled {
                info!(phase = ?self.phase(), "Coordinator cancelled");
                self.finish();
                break;
            }
        }

        let processed = self.stats().distribution.points_distributed;
        self.report(format!("{} DONE {}", self.uid, processed)).await;
        let summary = self.summary();
        info!(
            iterations = summary.iterations,
            converged = summary.converged,
            points = processed,
            "Coordinator finished"
        );
        Ok(summary)
    }

    /// Sleep until the next tick. While collecting, wake early for upstream
    /// frames, never past the collection deadline.
    async fn wait(&mut self, interval: &mut tokio::time::Interval) {
        let deadline = match &self.phase {
            Phase::Collecting(collection) => Some(collection.deadline),
            _ => None,
        };
        match deadline {
            Some(deadline) => {
                let until = deadline.min(Instant::now() + self.config.collection.tick());
                if let Some(frame) = self.transport.control.recv_until(until).await {
                    self.handle_upstream(&frame, Instant::now());
                }
            }
            None => {
                interval.tick().await;
            }
        }
    }

    async fn report(&mut self, line: String) {
        if let Err(e) = self.transport.reporter.report(line).await {
            warn!(error = %e, "Failed to send coordinator report");
        }
    }

    /// Announce DONE to workers and close the channels.
    fn finish(&mut self) {
        if !matches!(self.phase, Phase::Done) {
            let done = ControlMessage::new(
                Topic::Broadcast,
                Command::Done {
                    iteration: self.centroids.iteration,
                },
            );
            if self.transport.control.publish(&done) == SendOutcome::Closed {
                debug!("Control channel already closed");
            }
            self.phase = Phase::Done;
        }
        self.transport.close();
    }

    fn drain_joins(&mut self, now: Instant) -> Result<()> {
        while let Some(mut request) = self.transport.join.try_recv() {
            match JoinMessage::parse(&request.line) {
                Ok(JoinMessage::Join { previous }) => {
                    let id = self.registry.join(now);
                    self.stats.workers_joined += 1;
                    if let Some(previous) = previous {
                        info!(worker_id = id, previous, "Worker rejoined under a new id");
                    }
                    if !request.reply(join_reply(id)) {
                        warn!(worker_id = id, "Joining worker left before the reply");
                    }
                }
                Ok(JoinMessage::Start { id }) => {
                    if self.registry.mark_seen(id, now) {
                        // Mid-run joiners need the current centroids before any work
                        let message = self.centroid_message(Topic::Worker(id))?;
                        self.publish(&message)?;
                    } else {
                        warn!(worker_id = id, "START from unknown worker");
                    }
                }
                Ok(JoinMessage::Done { id, count }) => {
                    self.registry.mark_seen(id, now);
                    info!(worker_id = id, processed = count, "Worker reported DONE");
                }
                Err(e) => {
                    self.stats.malformed_messages += 1;
                    warn!(error = %e, "Discarding malformed join request");
                    if request.wants_reply() {
                        request.reply(BAD_REPLY);
                    }
                }
            }
        }
        Ok(())
    }

    fn handle_upstream(&mut self, frame: &[u8], now: Instant) {
        let message = match UpstreamMessage::decode(frame) {
            Ok(message) => message,
            Err(e) => {
                self.stats.malformed_messages += 1;
                warn!(error = %e, "Discarding malformed upstream message");
                return;
            }
        };

        let worker = message.worker_id();
        let known = self.registry.mark_seen(worker, now);
        if !known && self.registry.was_removed(worker) {
            self.notify_evicted(worker);
        }
        match message {
            UpstreamMessage::Heartbeat { .. } => {
                if !known {
                    debug!(worker_id = worker, "Heartbeat from unknown worker");
                }
            }
            UpstreamMessage::Contribution {
                iteration, payload, ..
            } => self.handle_contribution(worker, known, iteration, &payload),
        }
    }

    fn handle_contribution(&mut self, worker: WorkerId, known: bool, iteration: u64, payload: &[u8]) {
        let collection = match &mut self.phase {
            Phase::Collecting(collection)
                if known && collection.aggregator.iteration() == iteration =>
            {
                collection
            }
            _ => {
                self.stats.contributions_late += 1;
                debug!(worker_id = worker, iteration, "Discarding late contribution");
                return;
            }
        };

        if collection.aggregator.has_responded(worker) {
            self.stats.contributions_duplicated += 1;
            debug!(worker_id = worker, iteration, "Worker already responded");
            return;
        }

        let contributions: Vec<PartialContribution> = match codec::decode(payload) {
            Ok(contributions) => contributions,
            Err(e) => {
                self.stats.malformed_messages += 1;
                warn!(worker_id = worker, error = %e, "Discarding undecodable contribution");
                return;
            }
        };

        collection.aggregator.mark_responded(worker);
        for contribution in &contributions {
            if contribution.worker_id != worker {
                self.stats.malformed_messages += 1;
                warn!(
                    worker_id = worker,
                    claimed = contribution.worker_id,
                    "Contribution carries another worker's id"
                );
                continue;
            }
            match collection.aggregator.apply(contribution) {
                ApplyOutcome::Applied => self.stats.contributions_applied += 1,
                ApplyOutcome::Duplicate => self.stats.contributions_duplicated += 1,
                ApplyOutcome::WrongIteration | ApplyOutcome::UnknownCentroid => {
                    self.stats.malformed_messages += 1;
                    warn!(
                        worker_id = worker,
                        centroid = contribution.centroid_index,
                        iteration = contribution.iteration,
                        "Contribution does not fit this collection"
                    );
                }
            }
        }
        debug!(
            worker_id = worker,
            iteration,
            contributions = contributions.len(),
            "Worker responded"
        );
    }

    fn admit(&mut self) -> Result<Phase> {
        let active = self.registry.active_workers().len();
        if active < self.config.collection.min_workers {
            return Ok(Phase::Admitting);
        }
        info!(workers = active, "Starting distribution");
        let message = self.centroid_message(Topic::Broadcast)?;
        self.publish(&message)?;
        self.start_iteration()
    }

    fn start_iteration(&mut self) -> Result<Phase> {
        self.source.rewind()?;
        self.distributor.begin_iteration(self.centroids.iteration);
        info!(iteration = self.centroids.iteration, "Distributing");
        Ok(Phase::Distributing {
            drain_deadline: None,
        })
    }

    fn distribute(&mut self, drain_deadline: Option<Instant>, now: Instant) -> Result<Phase> {
        for _ in 0..self.config.distribution.max_advances_per_tick {
            match self
                .distributor
                .advance(self.source.as_mut(), self.transport.work.as_mut())?
            {
                AdvanceOutcome::Pushed { .. } | AdvanceOutcome::Dropped { .. } => {}
                AdvanceOutcome::Backpressure | AdvanceOutcome::Exhausted => break,
                AdvanceOutcome::Closed => {
                    return Err(ClusterError::transport("work channel closed"));
                }
            }
        }

        if !self.distributor.is_exhausted() {
            return Ok(Phase::Distributing { drain_deadline });
        }

        // Let queued groups reach workers before asking for results, but
        // never wait longer than one collection timeout
        let expected = self.registry.active_workers();
        let queued = self.transport.work.queued();
        if queued > 0 && !expected.is_empty() {
            let deadline =
                drain_deadline.unwrap_or_else(|| now + self.config.collection.timeout());
            if now < deadline {
                return Ok(Phase::Distributing {
                    drain_deadline: Some(deadline),
                });
            }
            warn!(queued, "Work queue did not drain, collecting anyway");
        }

        let iteration = self.centroids.iteration;
        self.publish(&ControlMessage::new(
            Topic::Broadcast,
            Command::RequestCentroids { iteration },
        ))?;
        info!(iteration, expected = expected.len(), "Collecting contributions");
        Ok(Phase::Collecting(Collection {
            aggregator: CentroidAggregator::new(iteration, self.centroids.len()),
            expected,
            deadline: now + self.config.collection.timeout(),
        }))
    }

    fn collect(&mut self, collection: Collection, now: Instant) -> Result<Phase> {
        let outstanding: Vec<WorkerId> = collection
            .expected
            .iter()
            .copied()
            .filter(|id| !collection.aggregator.has_responded(*id) && self.registry.contains(*id))
            .collect();

        if outstanding.is_empty() {
            return Ok(Phase::Broadcasting(collection.aggregator));
        }
        if now < collection.deadline {
            return Ok(Phase::Collecting(collection));
        }

        let iteration = collection.aggregator.iteration();
        warn!(iteration, missing = ?outstanding, "Collection timed out");
        for id in &outstanding {
            if self.registry.mark_dead(*id) {
                self.stats.workers_lost += 1;
                self.notify_evicted(*id);
            }
        }
        self.stats.collection_timeouts += 1;
        self.publish(&ControlMessage::new(
            Topic::Broadcast,
            Command::Abort { iteration },
        ))?;
        Ok(Phase::Broadcasting(collection.aggregator))
    }

    fn broadcast(&mut self, aggregator: CentroidAggregator) -> Result<Phase> {
        let next = aggregator.finish(&self.centroids);
        let displacement = max_displacement(&self.centroids, &next);

        self.source.store_result(&next)?;
        self.centroids = next;
        let message = self.centroid_message(Topic::Broadcast)?;
        self.publish(&message)?;
        self.stats.iterations += 1;

        let iteration = self.centroids.iteration;
        info!(
            iteration,
            displacement,
            contributions = aggregator.applied(),
            "Centroids broadcast"
        );

        let converged =
            aggregator.applied() > 0 && displacement < self.config.convergence.threshold;
        if !converged && iteration < self.config.convergence.max_iterations {
            return self.start_iteration();
        }

        self.converged = converged;
        self.publish(&ControlMessage::new(
            Topic::Broadcast,
            Command::Done { iteration },
        ))?;
        self.transport.close();
        info!(iteration, converged, "Clustering complete");
        Ok(Phase::Done)
    }

    /// Tell a removed worker to join again under a fresh id.
    fn notify_evicted(&mut self, id: WorkerId) {
        let message = ControlMessage::new(
            Topic::Worker(id),
            Command::Evicted {
                iteration: self.centroids.iteration,
            },
        );
        if self.transport.control.publish(&message) != SendOutcome::Sent {
            debug!(worker_id = id, "Could not deliver eviction notice");
        }
    }

    fn centroid_message(&self, topic: Topic) -> Result<ControlMessage> {
        let payload = codec::encode(&self.centroids, self.config.network.max_frame_bytes)?;
        Ok(ControlMessage::with_payload(
            topic,
            Command::Centroids {
                iteration: self.centroids.iteration,
            },
            payload,
        ))
    }

    fn publish(&mut self, message: &ControlMessage) -> Result<()> {
        match self.transport.control.publish(message) {
            SendOutcome::Sent => Ok(()),
            SendOutcome::Backpressure => {
                warn!(topic = %message.topic, command = %message.command, "Control publish refused");
                Ok(())
            }
            SendOutcome::Closed => Err(ClusterError::transport("control channel closed")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kmeans::ClusterSum;
    use crate::model::Point;
    use crate::protocol::parse_join_reply;
    use crate::source::MemorySource;
    use crate::transport::{MemoryHub, MemoryWorkerLink, WorkerEvent, WorkerLink};
    use bytes::Bytes;
    use std::time::Duration;

    fn config(k: usize, group_size: usize, redundancy: u32, min_workers: usize) -> CoordinatorConfig {
        let mut config = CoordinatorConfig::default();
        config.uid = "100".to_string();
        config.convergence.k = k;
        config.convergence.max_iterations = 1;
        config.distribution.group_size = group_size;
        config.distribution.redundancy = redundancy;
        config.distribution.work_backlog = 64;
        config.collection.min_workers = min_workers;
        config
    }

    fn dataset() -> Vec<Point> {
        (0..12).map(|i| Point::new(i as f64, 2.0 * i as f64)).collect()
    }

    async fn join(coordinator: &mut PhaseCoordinator, link: MemoryWorkerLink) -> (MemoryWorkerLink, WorkerId) {
        let mut link = link;
        link.subscribe(vec![Topic::Broadcast]).await.unwrap();
        let handle = tokio::spawn(async move {
            let reply = link.request("-1 JOIN".to_string()).await;
            (link, reply)
        });
        while !handle.is_finished() {
            coordinator.tick(Instant::now()).unwrap();
            tokio::task::yield_now().await;
        }
        let (link, reply) = handle.await.unwrap();
        (link, parse_join_reply(&reply.unwrap()).unwrap())
    }

    fn contribution_frame(worker_id: WorkerId, sums: &[(usize, &[Point])]) -> Bytes {
        let contributions: Vec<PartialContribution> = sums
            .iter()
            .map(|(index, points)| {
                let mut sum = ClusterSum::default();
                points.iter().for_each(|p| sum.add_point(p));
                PartialContribution {
                    worker_id,
                    iteration: 0,
                    centroid_index: *index,
                    sum_x: sum.sum_x,
                    sum_y: sum.sum_y,
                    count: sum.count,
                }
            })
            .collect();
        UpstreamMessage::Contribution {
            worker_id,
            iteration: 0,
            payload: codec::encode(&contributions, 1 << 20).unwrap(),
        }
        .encode()
    }

    fn tick_until(coordinator: &mut PhaseCoordinator, target: PhaseKind, now: Instant) {
        for _ in 0..100 {
            if coordinator.tick(now).unwrap() == target {
                return;
            }
        }
        panic!("never reached {:?}, stuck in {:?}", target, coordinator.phase());
    }

    #[tokio::test]
    async fn test_three_workers_twelve_points() {
        let (transport, hub) = MemoryHub::new(64);
        let source = MemorySource::new(dataset());
        let mut coordinator =
            PhaseCoordinator::new(config(2, 4, 2, 3), Box::new(source), transport).unwrap();
        assert_eq!(coordinator.uid(), "100");
        assert_eq!(coordinator.phase(), PhaseKind::Admitting);

        let mut links = Vec::new();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let (link, id) = join(&mut coordinator, hub.link()).await;
            links.push(link);
            ids.push(id);
        }
        assert_eq!(ids, vec![0, 1, 2]);

        tick_until(&mut coordinator, PhaseKind::Distributing, Instant::now());
        coordinator.tick(Instant::now()).unwrap();
        // Groups stay queued, so collection has not started
        assert_eq!(coordinator.phase(), PhaseKind::Distributing);

        let mut frames = Vec::new();
        while let Some(frame) = hub.try_pull_work() {
            frames.push(codec::decode::<crate::model::PointGroup>(&frame).unwrap());
        }
        assert_eq!(frames.len(), 6);
        for id in ["0", "1", "2"] {
            assert_eq!(frames.iter().filter(|g| g.id == id).count(), 2);
        }
        assert!(frames.iter().all(|g| g.len() == 4 && g.iteration == 0));

        tick_until(&mut coordinator, PhaseKind::Collecting, Instant::now());

        // Counts {7, 5}: points 0..7 in cluster 0, 7..12 in cluster 1
        let points = dataset();
        let upstream = [
            contribution_frame(0, &[(0, &points[0..3])]),
            contribution_frame(1, &[(0, &points[3..7]), (1, &points[7..9])]),
            contribution_frame(2, &[(1, &points[9..12])]),
        ];
        for (link, frame) in links.iter_mut().zip(upstream.iter()) {
            link.send_upstream(frame.clone()).await.unwrap();
        }
        // A redundant copy of worker 1's response is ignored
        links[1].send_upstream(upstream[1].clone()).await.unwrap();

        tick_until(&mut coordinator, PhaseKind::Done, Instant::now());

        let centroids = coordinator.centroids();
        assert_eq!(centroids.iteration, 1);
        assert_eq!(centroids.centroids[0].position, Point::new(3.0, 6.0));
        assert_eq!(centroids.centroids[1].position, Point::new(9.0, 18.0));

        let stats = coordinator.stats();
        assert_eq!(stats.distribution.groups_created, 3);
        assert_eq!(stats.distribution.pushes, 6);
        assert_eq!(stats.distribution.points_distributed, 12);
        assert_eq!(stats.contributions_applied, 4);
        assert_eq!(stats.contributions_duplicated, 1);
        assert_eq!(stats.iterations, 1);

        // Workers saw the request, the new centroids and DONE
        let mut commands = Vec::new();
        while let Some(WorkerEvent::Control(frame)) = links[0].next_event().await {
            commands.push(ControlMessage::decode(&frame).unwrap().command);
        }
        assert_eq!(
            commands,
            vec![
                Command::Centroids { iteration: 0 },
                Command::RequestCentroids { iteration: 0 },
                Command::Centroids { iteration: 1 },
                Command::Done { iteration: 1 },
            ]
        );
    }

    #[tokio::test]
    async fn test_late_contribution_from_dead_worker_is_discarded() {
        let (transport, hub) = MemoryHub::new(64);
        let source = MemorySource::new(dataset());
        let mut coordinator =
            PhaseCoordinator::new(config(2, 12, 1, 2), Box::new(source), transport).unwrap();

        let (mut fast, fast_id) = join(&mut coordinator, hub.link()).await;
        let (mut slow, slow_id) = join(&mut coordinator, hub.link()).await;
        slow.subscribe(vec![Topic::Broadcast, Topic::Worker(slow_id)])
            .await
            .unwrap();

        tick_until(&mut coordinator, PhaseKind::Distributing, Instant::now());
        coordinator.tick(Instant::now()).unwrap();
        while hub.try_pull_work().is_some() {}

        let start = Instant::now();
        tick_until(&mut coordinator, PhaseKind::Collecting, start);

        let points = dataset();
        fast.send_upstream(contribution_frame(fast_id, &[(0, &points[0..2])]))
            .await
            .unwrap();
        coordinator.tick(start).unwrap();
        assert_eq!(coordinator.phase(), PhaseKind::Collecting);

        // Past the deadline the silent worker is dropped
        let after = start + Duration::from_secs(6);
        assert_eq!(coordinator.tick(after).unwrap(), PhaseKind::Broadcasting);
        assert!(!coordinator.registry().contains(slow_id));
        assert_eq!(coordinator.stats().collection_timeouts, 1);

        slow.send_upstream(contribution_frame(slow_id, &[(1, &points[2..12])]))
            .await
            .unwrap();
        assert_eq!(coordinator.tick(after).unwrap(), PhaseKind::Done);

        let centroids = coordinator.centroids();
        assert_eq!(centroids.centroids[0].position, Point::new(0.5, 1.0));
        // Only the late worker touched cluster 1, so it keeps its start position
        assert_eq!(centroids.centroids[1].position, Point::new(1.0, 2.0));
        assert_eq!(coordinator.stats().contributions_late, 1);

        // The removed worker was told to join again
        let mut notices = Vec::new();
        while let Some(event) = slow.next_event().await {
            if let WorkerEvent::Control(frame) = event {
                let message = ControlMessage::decode(&frame).unwrap();
                if message.topic == Topic::Worker(slow_id) {
                    notices.push(message.command);
                }
            }
        }
        assert!(!notices.is_empty());
        assert!(notices.iter().all(|c| *c == Command::Evicted { iteration: 0 }));
    }

    /// Reports one frame queued forever, like a puller that stopped reading.
    struct StuckWork;

    impl crate::transport::WorkChannel for StuckWork {
        fn try_push(&mut self, _frame: Bytes) -> SendOutcome {
            SendOutcome::Sent
        }

        fn queued(&self) -> usize {
            1
        }

        fn close(&mut self) {}
    }

    #[tokio::test]
    async fn test_undrained_work_queue_does_not_block_collection() {
        let (mut transport, hub) = MemoryHub::new(4);
        transport.work = Box::new(StuckWork);
        let mut coordinator = PhaseCoordinator::new(
            config(2, 12, 1, 1),
            Box::new(MemorySource::new(dataset())),
            transport,
        )
        .unwrap();
        let (_link, _id) = join(&mut coordinator, hub.link()).await;

        let start = Instant::now();
        tick_until(&mut coordinator, PhaseKind::Distributing, start);
        assert_eq!(coordinator.tick(start).unwrap(), PhaseKind::Distributing);
        assert!(coordinator.stats().distribution.pushes >= 1);

        let before = start + Duration::from_secs(4);
        assert_eq!(coordinator.tick(before).unwrap(), PhaseKind::Distributing);

        let after = start + Duration::from_secs(6);
        assert_eq!(coordinator.tick(after).unwrap(), PhaseKind::Collecting);
    }

    #[tokio::test]
    async fn test_malformed_join_gets_bad_reply() {
        let (transport, hub) = MemoryHub::new(4);
        let mut coordinator = PhaseCoordinator::new(
            config(2, 4, 1, 1),
            Box::new(MemorySource::new(dataset())),
            transport,
        )
        .unwrap();

        let mut link = hub.link();
        let handle = tokio::spawn(async move { link.request("hello there".to_string()).await });
        while !handle.is_finished() {
            coordinator.tick(Instant::now()).unwrap();
            tokio::task::yield_now().await;
        }
        assert_eq!(handle.await.unwrap().unwrap(), BAD_REPLY);
        assert_eq!(coordinator.stats().malformed_messages, 1);
        assert!(coordinator.registry().is_empty());
        assert_eq!(coordinator.phase(), PhaseKind::Admitting);
    }

    #[test]
    fn test_too_few_points_for_k_is_fatal() {
        let (transport, _hub) = MemoryHub::new(4);
        let result = PhaseCoordinator::new(
            config(20, 4, 1, 1),
            Box::new(MemorySource::new(dataset())),
            transport,
        );
        assert!(result.err().unwrap().is_fatal());
    }

    #[test]
    fn test_uid_defaults_to_uuid() {
        let (transport, _hub) = MemoryHub::new(4);
        let mut config = config(2, 4, 1, 1);
        config.uid = String::new();
        let coordinator =
            PhaseCoordinator::new(config, Box::new(MemorySource::new(dataset())), transport)
                .unwrap();
        assert!(Uuid::parse_str(coordinator.uid()).is_ok());
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let (transport, mut hub) = MemoryHub::new(4);
        let coordinator = PhaseCoordinator::new(
            config(2, 4, 1, 1),
            Box::new(MemorySource::new(dataset())),
            transport,
        )
        .unwrap();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(coordinator.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();

        let summary = handle.await.unwrap().unwrap();
        assert!(!summary.converged);
        assert_eq!(summary.iterations, 0);
        assert_eq!(hub.try_report().as_deref(), Some("100 START"));
        assert_eq!(hub.try_report().as_deref(), Some("100 DONE 0"));
    }
}
