//! Durable event sink
//!
//! Writes events to a partitioned append log keyed by `instance_id`:
//! all events for one resource land in the same partition, in publish
//! order. Batches up to `batch_max` events or the linger interval,
//! whichever fires first, and flushes each batch as a gzip block.
//! Failed flushes are retried with backoff; a batch that still fails is
//! logged and dropped, so the provisioning path never stalls on
//! telemetry.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use backoff::ExponentialBackoffBuilder;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::{EventConfiguration, SystemConfiguration};

use super::InfrastructureEvent;

/// Queue depth between the bus and the sink task
const INTAKE_DEPTH: usize = 1024;

/// Queue depth between the sink task and the consumer
const COMMITTED_DEPTH: usize = 1024;

/// A batch gets exactly this many write attempts before it is dropped
const MAX_WRITE_ATTEMPTS: u32 = 3;

/// Partitioned, compressed append log for infrastructure events.
#[derive(Clone)]
pub struct DurableEventSink {
    dir: PathBuf,
    topic: String,
    partitions: u32,
    batch_max: usize,
    linger: Duration,
}

impl DurableEventSink {
    pub fn new(events: &EventConfiguration, system: &SystemConfiguration) -> Self {
        Self {
            dir: events.log_directory(system),
            topic: events.topic.clone(),
            partitions: events.partitions.max(1),
            batch_max: events.batch_max_events.max(1),
            linger: events.batch_linger(),
        }
    }

    #[cfg(test)]
    pub fn for_tests(dir: PathBuf) -> Self {
        Self {
            dir,
            topic: "test-events".to_string(),
            partitions: 4,
            batch_max: 100,
            linger: Duration::from_millis(10),
        }
    }

    /// Partition assignment: stable hash of the instance id.
    pub fn partition_for(&self, instance_id: &str) -> u32 {
        let mut hasher = DefaultHasher::new();
        instance_id.hash(&mut hasher);
        (hasher.finish() % self.partitions as u64) as u32
    }

    /// Start the writer task.
    ///
    /// Returns the intake sender (attach to the bus) and the committed
    /// receiver (feed to the consumer). Events appear on the committed
    /// channel only after their batch is on disk.
    pub fn spawn(
        &self,
        shutdown: CancellationToken,
    ) -> (
        mpsc::Sender<InfrastructureEvent>,
        mpsc::Receiver<InfrastructureEvent>,
    ) {
        let (intake_tx, intake_rx) = mpsc::channel(INTAKE_DEPTH);
        let (committed_tx, committed_rx) = mpsc::channel(COMMITTED_DEPTH);

        let sink = self.clone();
        tokio::spawn(async move {
            sink.run(intake_rx, committed_tx, shutdown).await;
        });

        (intake_tx, committed_rx)
    }

    async fn run(
        &self,
        mut rx: mpsc::Receiver<InfrastructureEvent>,
        committed_tx: mpsc::Sender<InfrastructureEvent>,
        shutdown: CancellationToken,
    ) {
        info!(
            topic = %self.topic,
            partitions = self.partitions,
            "durable event sink started"
        );

        loop {
            // Wait for the first event of the next batch
            let first = tokio::select! {
                _ = shutdown.cancelled() => {
                    // Drain whatever is still queued, then flush once
                    let mut tail = Vec::new();
                    while let Ok(event) = rx.try_recv() {
                        tail.push(event);
                    }
                    if !tail.is_empty() {
                        self.flush_with_retry(tail, &committed_tx).await;
                    }
                    info!("durable event sink stopped");
                    return;
                }
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => return,
                },
            };

            let mut batch = vec![first];
            let deadline = tokio::time::Instant::now() + self.linger;

            while batch.len() < self.batch_max {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => break,
                    event = rx.recv() => match event {
                        Some(event) => batch.push(event),
                        None => break,
                    },
                }
            }

            self.flush_with_retry(batch, &committed_tx).await;
        }
    }

    async fn flush_with_retry(
        &self,
        batch: Vec<InfrastructureEvent>,
        committed_tx: &mpsc::Sender<InfrastructureEvent>,
    ) {
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(50))
            .with_max_elapsed_time(None)
            .build();

        // The cutoff is attempt-counted, not time-based: the third
        // failure is final
        let attempts = AtomicU32::new(0);
        let result = backoff::future::retry(policy, || {
            let sink = self.clone();
            let batch = batch.clone();
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                sink.write_batch(batch).await.map_err(|e| {
                    if attempt >= MAX_WRITE_ATTEMPTS {
                        backoff::Error::permanent(e)
                    } else {
                        backoff::Error::transient(e)
                    }
                })
            }
        })
        .await;

        match result {
            Ok(()) => {
                debug!(count = batch.len(), "flushed event batch");
                for event in batch {
                    // The consumer is in-process; if it ever stops
                    // draining, provisioning still proceeds because
                    // this send only parks the sink task.
                    if committed_tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                error!(count = batch.len(), "dropping event batch after retries: {}", e);
            }
        }
    }

    /// Group by partition and append one gzip block per partition.
    async fn write_batch(&self, batch: Vec<InfrastructureEvent>) -> std::io::Result<()> {
        let mut by_partition: BTreeMap<u32, Vec<InfrastructureEvent>> = BTreeMap::new();
        for event in batch {
            let partition = self.partition_for(&event.instance_id);
            by_partition.entry(partition).or_default().push(event);
        }

        let dir = self.dir.clone();
        let topic = self.topic.clone();

        tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&dir)?;

            for (partition, events) in by_partition {
                let mut lines = Vec::new();
                for event in &events {
                    serde_json::to_writer(&mut lines, event)
                        .map_err(std::io::Error::other)?;
                    lines.push(b'\n');
                }

                let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(&lines)?;
                let block = encoder.finish()?;

                let path = dir.join(format!("{}-{:04}.log", topic, partition));
                let mut file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)?;

                file.write_all(&(block.len() as u32).to_be_bytes())?;
                file.write_all(&block)?;
                file.sync_data()?;
            }

            Ok(())
        })
        .await
        .map_err(|e| std::io::Error::other(format!("flush task panicked: {}", e)))?
    }

    /// Read one partition back in append order.
    pub fn read_partition(&self, partition: u32) -> std::io::Result<Vec<InfrastructureEvent>> {
        let path = self.dir.join(format!("{}-{:04}.log", self.topic, partition));
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut events = Vec::new();
        let mut offset = 0usize;

        while offset + 4 <= data.len() {
            let len = u32::from_be_bytes([
                data[offset],
                data[offset + 1],
                data[offset + 2],
                data[offset + 3],
            ]) as usize;
            offset += 4;

            if offset + len > data.len() {
                // Torn tail from an interrupted flush; everything before
                // it is intact
                break;
            }

            let mut decoder = GzDecoder::new(&data[offset..offset + len]);
            let mut text = String::new();
            decoder.read_to_string(&mut text)?;
            offset += len;

            for line in text.lines().filter(|l| !l.is_empty()) {
                match serde_json::from_str::<InfrastructureEvent>(line) {
                    Ok(event) => events.push(event),
                    Err(e) => {
                        error!(partition, "skipping unreadable event record: {}", e);
                    }
                }
            }
        }

        Ok(events)
    }

    /// Read the events for one resource, in publish order.
    pub fn read_instance(&self, instance_id: &str) -> std::io::Result<Vec<InfrastructureEvent>> {
        let partition = self.partition_for(instance_id);
        Ok(self
            .read_partition(partition)?
            .into_iter()
            .filter(|e| e.instance_id == instance_id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventAction;
    use crate::resource::ResourceKind;

    fn event(instance: &str, action: EventAction) -> InfrastructureEvent {
        InfrastructureEvent::new(instance, "owner", ResourceKind::PostgresCluster, action)
    }

    #[test]
    fn test_partition_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DurableEventSink::for_tests(dir.path().to_path_buf());

        let p1 = sink.partition_for("infra-abc");
        let p2 = sink.partition_for("infra-abc");
        assert_eq!(p1, p2);
        assert!(p1 < 4);
    }

    #[tokio::test]
    async fn test_events_round_trip_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DurableEventSink::for_tests(dir.path().to_path_buf());
        let shutdown = CancellationToken::new();

        let (tx, mut committed) = sink.spawn(shutdown.clone());

        let actions = [
            EventAction::StopRequested,
            EventAction::Die,
            EventAction::StartRequested,
            EventAction::Start,
        ];
        for action in actions {
            tx.send(event("infra-1", action)).await.unwrap();
        }

        // All four must come back committed, in order
        for expected in actions {
            let got = committed.recv().await.unwrap();
            assert_eq!(got.action, expected);
        }

        let replayed = sink.read_instance("infra-1").unwrap();
        let replayed_actions: Vec<_> = replayed.iter().map(|e| e.action).collect();
        assert_eq!(replayed_actions, actions);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_large_batch_splits_and_persists_everything() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DurableEventSink::for_tests(dir.path().to_path_buf());
        let shutdown = CancellationToken::new();

        let (tx, mut committed) = sink.spawn(shutdown.clone());

        for _ in 0..250 {
            tx.send(event("infra-9", EventAction::HealthStatus))
                .await
                .unwrap();
        }

        for _ in 0..250 {
            committed.recv().await.unwrap();
        }

        let replayed = sink.read_instance("infra-9").unwrap();
        assert_eq!(replayed.len(), 250);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_unwritable_log_drops_batch_after_bounded_attempts() {
        let dir = tempfile::tempdir().unwrap();

        // A regular file where the log directory should be makes every
        // write attempt fail
        let blocked = dir.path().join("blocked");
        std::fs::write(&blocked, b"not a directory").unwrap();

        let sink = DurableEventSink::for_tests(blocked);
        let shutdown = CancellationToken::new();
        let (tx, mut committed) = sink.spawn(shutdown.clone());

        tx.send(event("infra-1", EventAction::Start)).await.unwrap();

        // Three attempts with short backoff finish fast; the batch is
        // dropped, never committed
        let got = tokio::time::timeout(Duration::from_secs(2), committed.recv()).await;
        assert!(got.is_err());

        // The sink task survives and keeps accepting batches
        tx.send(event("infra-1", EventAction::Die)).await.unwrap();
        let got = tokio::time::timeout(Duration::from_secs(2), committed.recv()).await;
        assert!(got.is_err());

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_instances_do_not_interleave_within_partition_read() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DurableEventSink::for_tests(dir.path().to_path_buf());
        let shutdown = CancellationToken::new();

        let (tx, mut committed) = sink.spawn(shutdown.clone());

        tx.send(event("a", EventAction::ResourceCreated)).await.unwrap();
        tx.send(event("b", EventAction::ResourceCreated)).await.unwrap();
        tx.send(event("a", EventAction::ResourceDeleted)).await.unwrap();

        for _ in 0..3 {
            committed.recv().await.unwrap();
        }

        let a_events = sink.read_instance("a").unwrap();
        assert_eq!(a_events.len(), 2);
        assert_eq!(a_events[0].action, EventAction::ResourceCreated);
        assert_eq!(a_events[1].action, EventAction::ResourceDeleted);

        shutdown.cancel();
    }
}
