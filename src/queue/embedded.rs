use async_trait::async_trait;
use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use futures_util::StreamExt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::message::{self, DeadLetter};
use super::{Deliveries, QueueChannel, QueueError, QueueStats, Result};
use crate::model::JobMessage;

const NEXT_SEQ: &[u8] = b"next_seq";
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Queue channel backed by an embedded Fjall keyspace
///
/// Architecture:
/// - `ready` partition: u64 (big-endian) seq → job JSON, consumed in key order
/// - `inflight` partition: job_id → job JSON, delivered but not yet acked
/// - `dead_letter` partition: u64 seq → [`DeadLetter`] JSON
/// - `metadata` partition: "next_seq" → u64 counter
///
/// Moving a job from `ready` to `inflight` is a single batch, so a crash
/// never loses or duplicates it. Jobs still in `inflight` when the keyspace
/// is reopened are redelivered with `attempt` incremented.
///
/// Only one process may open a keyspace at a time.
#[derive(Clone)]
pub struct FjallChannel {
    inner: Arc<Inner>,
}

struct Inner {
    keyspace: Keyspace,
    ready: PartitionHandle,
    inflight: PartitionHandle,
    dead_letter: PartitionHandle,
    metadata: PartitionHandle,
    seq_counter: AtomicU64,
    /// Serializes pops so two consumers never take the same job
    pop_lock: Mutex<()>,
    notify: Notify,
    max_deliveries: u32,
    persistent: bool,
}

impl FjallChannel {
    /// Open or create a keyspace at `path`, recovering unacknowledged jobs
    pub fn open<P: AsRef<Path>>(path: P, max_deliveries: u32, persistent: bool) -> Result<Self> {
        info!("Opening embedded queue at: {}", path.as_ref().display());

        let keyspace = Config::new(path).open()?;
        let ready = keyspace.open_partition("ready", PartitionCreateOptions::default())?;
        let inflight = keyspace.open_partition("inflight", PartitionCreateOptions::default())?;
        let dead_letter = keyspace.open_partition("dead_letter", PartitionCreateOptions::default())?;
        let metadata = keyspace.open_partition("metadata", PartitionCreateOptions::default())?;

        let current_seq = metadata
            .get(NEXT_SEQ)?
            .and_then(|bytes| <[u8; 8]>::try_from(bytes.as_ref()).ok())
            .map(u64::from_be_bytes)
            .unwrap_or(0);

        let inner = Inner {
            keyspace,
            ready,
            inflight,
            dead_letter,
            metadata,
            seq_counter: AtomicU64::new(current_seq),
            pop_lock: Mutex::new(()),
            notify: Notify::new(),
            max_deliveries: max_deliveries.max(1),
            persistent,
        };

        let recovered = inner.recover_inflight()?;
        info!(current_seq, recovered, "Embedded queue opened");

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Dead-lettered entries, oldest first
    pub fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        let mut results = Vec::new();
        for item in self.inner.dead_letter.iter().take(limit) {
            let (_, value) = item?;
            match serde_json::from_slice(&value) {
                Ok(entry) => results.push(entry),
                Err(e) => warn!(error = %e, "Skipping unreadable dead-letter entry"),
            }
        }
        Ok(results)
    }

    /// Store a raw payload as-is; used to exercise malformed-message handling
    pub fn publish_raw(&self, payload: &[u8]) -> Result<()> {
        self.inner.append_ready(payload)?;
        self.inner.notify.notify_one();
        Ok(())
    }
}

impl Inner {
    fn next_seq_key(&self) -> ([u8; 8], [u8; 8]) {
        let seq = self.seq_counter.fetch_add(1, Ordering::SeqCst);
        (seq.to_be_bytes(), (seq + 1).to_be_bytes())
    }

    fn append_ready(&self, payload: &[u8]) -> Result<()> {
        let (key, next) = self.next_seq_key();
        let mut batch = self.keyspace.batch();
        batch.insert(&self.ready, &key[..], payload);
        batch.insert(&self.metadata, NEXT_SEQ, &next[..]);
        batch.commit()?;
        self.sync()
    }

    fn sync(&self) -> Result<()> {
        if self.persistent {
            self.keyspace.persist(PersistMode::SyncAll)?;
        }
        Ok(())
    }

    fn dead_letter_entry(&self, entry: &DeadLetter) -> Result<()> {
        let (key, next) = self.next_seq_key();
        let mut batch = self.keyspace.batch();
        batch.insert(&self.dead_letter, &key[..], entry.to_bytes()?);
        batch.insert(&self.metadata, NEXT_SEQ, &next[..]);
        batch.commit()?;
        Ok(())
    }

    /// Move every inflight job back to `ready`, counting the lost delivery
    fn recover_inflight(&self) -> Result<usize> {
        let mut recovered = 0;
        let entries: Vec<_> = self.inflight.iter().collect::<std::result::Result<_, _>>()?;

        for (job_key, value) in entries {
            match message::decode(&value) {
                Ok(msg) => self.requeue(&job_key, msg.next_attempt())?,
                Err(e) => {
                    self.dead_letter_entry(&DeadLetter::malformed(&value, &e))?;
                    self.inflight.remove(&*job_key)?;
                }
            }
            recovered += 1;
        }

        self.sync()?;
        Ok(recovered)
    }

    /// Remove `job_key` from inflight and either re-append `next` to ready
    /// or dead-letter it when it is past the delivery limit
    fn requeue(&self, job_key: &[u8], next: JobMessage) -> Result<()> {
        let (key, seq) = self.next_seq_key();
        let mut batch = self.keyspace.batch();
        batch.remove(&self.inflight, job_key);

        if next.attempt > self.max_deliveries {
            warn!(job_id = %next.job_id, attempt = next.attempt, "Delivery limit reached, dead-lettering");
            let entry = DeadLetter::exhausted(next, self.max_deliveries);
            batch.insert(&self.dead_letter, &key[..], entry.to_bytes()?);
        } else {
            debug!(job_id = %next.job_id, attempt = next.attempt, "Job requeued");
            batch.insert(&self.ready, &key[..], message::encode(&next)?);
        }

        batch.insert(&self.metadata, NEXT_SEQ, &seq[..]);
        batch.commit()?;
        Ok(())
    }

    /// Take the oldest ready job and mark it inflight
    fn pop(&self) -> Result<Option<JobMessage>> {
        let _guard = self
            .pop_lock
            .lock()
            .map_err(|_| QueueError::Unavailable("queue lock poisoned".to_string()))?;

        while let Some((key, value)) = self.ready.first_key_value()? {
            match message::decode(&value) {
                Ok(msg) => {
                    let mut batch = self.keyspace.batch();
                    batch.remove(&self.ready, &*key);
                    batch.insert(&self.inflight, &msg.job_id.as_bytes()[..], &*value);
                    batch.commit()?;
                    self.sync()?;
                    return Ok(Some(msg));
                }
                Err(e) => {
                    warn!(error = %e, "Dead-lettering malformed payload");
                    self.dead_letter_entry(&DeadLetter::malformed(&value, &e))?;
                    self.ready.remove(&*key)?;
                    self.sync()?;
                }
            }
        }

        Ok(None)
    }

    fn take_inflight(&self, job_id: Uuid) -> Result<JobMessage> {
        let value = self
            .inflight
            .get(job_id.as_bytes())?
            .ok_or(QueueError::UnknownDelivery(job_id))?;
        Ok(message::decode(&value)?)
    }
}

#[async_trait]
impl QueueChannel for FjallChannel {
    async fn publish(&self, message: &JobMessage) -> Result<()> {
        self.inner.append_ready(&message::encode(message)?)?;
        self.inner.notify.notify_one();
        debug!(job_id = %message.job_id, target_name = %message.target.name, "Job enqueued");
        Ok(())
    }

    async fn consume(&self) -> Result<Deliveries> {
        let stream = futures_util::stream::unfold(self.inner.clone(), |inner| async move {
            loop {
                match inner.pop() {
                    Ok(Some(msg)) => return Some((Ok(msg), inner)),
                    Ok(None) => {
                        // Notify covers local publishers; polling covers a
                        // publish that raced the empty check
                        tokio::select! {
                            _ = inner.notify.notified() => {}
                            _ = tokio::time::sleep(POLL_INTERVAL) => {}
                        }
                    }
                    Err(e) => return Some((Err(e), inner)),
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn ack(&self, job_id: Uuid) -> Result<()> {
        // Existence check first so a double ack is reported
        self.inner.take_inflight(job_id)?;
        self.inner.inflight.remove(&job_id.as_bytes()[..])?;
        self.inner.sync()?;
        debug!(%job_id, "Job acknowledged");
        Ok(())
    }

    async fn nack(&self, job_id: Uuid, requeue: bool) -> Result<()> {
        let msg = self.inner.take_inflight(job_id)?;
        let job_key = job_id.as_bytes();

        if requeue {
            self.inner.requeue(job_key, msg.next_attempt())?;
            self.inner.notify.notify_one();
        } else {
            self.inner.dead_letter_entry(&DeadLetter::rejected(msg))?;
            self.inner.inflight.remove(&job_key[..])?;
        }

        self.inner.sync()?;
        Ok(())
    }

    async fn stats(&self) -> Result<QueueStats> {
        Ok(QueueStats {
            ready: self.inner.ready.len()? as u64,
            unacked: Some(self.inner.inflight.len()? as u64),
            dead_lettered: Some(self.inner.dead_letter.len()? as u64),
            consumers: None,
        })
    }

    async fn close(&self) -> Result<()> {
        self.inner.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }
}
