//! An in-memory `Source`/`Sink` pair backed by bounded channels.
//!
//! Used by the engine's own integration tests (no live broker or store is
//! available in CI) and safe as a starting template for a real adapter, with
//! one caveat documented on [`ChannelSource`]: it tracks committed ids in a
//! `HashSet`, which only works because nothing here requires strictly
//! contiguous offsets. A broker that does (e.g. a single Kafka partition)
//! needs its own commit bookkeeping.
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{Closer, Error, Message, Record, Sink, Source};

/// Commit handle for [`ChannelSource`]/[`ChannelSink`]: just the message id,
/// since this reference source has no partition/offset concept.
pub type ChannelHandle = String;

/// Feeds pre-built [`Message`]s to a [`ChannelSource`] from test or CLI code.
///
/// Cloning a producer and calling [`ChannelProducer::send`] from multiple
/// tasks is safe; the underlying channel is `flume`.
#[derive(Clone)]
pub struct ChannelProducer {
    tx: flume::Sender<Record>,
}

impl ChannelProducer {
    /// Enqueues a record for a paired [`ChannelSource`] to read. Blocks if
    /// the channel is full.
    pub async fn send(&self, record: Record) -> Result<(), Error> {
        self.tx
            .send_async(record)
            .await
            .map_err(|err| Error::ChannelSend(err.to_string()))
    }
}

/// A `Source` that reads [`Record`]s handed to it by a [`ChannelProducer`].
///
/// Tracks which message ids have been committed in a `HashSet` rather than a
/// contiguous high-water mark — adequate for tests and demos, not a template
/// for a strictly-ordered, contiguous-offset broker (see module docs).
pub struct ChannelSource {
    rx: flume::Receiver<Record>,
    committed: Arc<std::sync::Mutex<HashSet<ChannelHandle>>>,
    close_count: Arc<AtomicU64>,
}

impl ChannelSource {
    /// Builds a bounded channel of the given capacity and returns the
    /// `Source` half alongside a cloneable producer for the other end.
    pub fn new(capacity: usize) -> (Self, ChannelProducer) {
        let (tx, rx) = flume::bounded(capacity);
        (
            ChannelSource {
                rx,
                committed: Arc::new(std::sync::Mutex::new(HashSet::new())),
                close_count: Arc::new(AtomicU64::new(0)),
            },
            ChannelProducer { tx },
        )
    }

    /// A handle that observes commits without needing `&self`, so it can be
    /// kept around after the `Source` itself has been moved into an
    /// [`crate::Engine`].
    pub fn committed_observer(&self) -> CommittedObserver {
        CommittedObserver {
            committed: self.committed.clone(),
        }
    }

    /// A handle that reports how many times `close` has been called.
    pub fn close_observer(&self) -> CloseObserver {
        CloseObserver {
            count: self.close_count.clone(),
        }
    }
}

/// Read-only view onto how many times a reference `Source`/`Sink`'s `close`
/// has run.
#[derive(Clone)]
pub struct CloseObserver {
    count: Arc<AtomicU64>,
}

impl CloseObserver {
    /// Number of completed `close` calls.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }
}

/// Read-only view onto the set of ids a [`ChannelSource`] has committed.
#[derive(Clone)]
pub struct CommittedObserver {
    committed: Arc<std::sync::Mutex<HashSet<ChannelHandle>>>,
}

impl CommittedObserver {
    /// Number of distinct ids committed so far.
    pub fn count(&self) -> usize {
        self.committed.lock().expect("committed set lock poisoned").len()
    }

    /// Whether `id` has been committed.
    pub fn contains(&self, id: &str) -> bool {
        self.committed
            .lock()
            .expect("committed set lock poisoned")
            .contains(id)
    }
}

#[async_trait]
impl Closer for ChannelSource {
    async fn close(&mut self) -> Result<(), Error> {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl Source for ChannelSource {
    type Handle = ChannelHandle;

    async fn read(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Message<Self::Handle>, Error> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Source("cancelled".into())),
            result = self.rx.recv_async() => {
                let record = result?;
                let handle = record.id.clone();
                Ok(Message { record, handle })
            }
        }
    }

    async fn commit(
        &mut self,
        _cancel: &CancellationToken,
        batch: &[Message<Self::Handle>],
    ) -> Result<(), Error> {
        let mut committed = self.committed.lock().expect("committed set lock poisoned");
        for message in batch {
            committed.insert(message.handle.clone());
        }
        Ok(())
    }
}

/// A `Sink` that appends every written batch to a shared in-memory log.
///
/// `fail_first_n` batches return an error before succeeding, to exercise the
/// "sink failure -> no commit" path in tests.
pub struct ChannelSink {
    written: Arc<std::sync::Mutex<Vec<Vec<Message<ChannelHandle>>>>>,
    fail_first_n: usize,
    attempts: AtomicU64,
    close_count: Arc<AtomicU64>,
}

impl ChannelSink {
    /// Builds a sink that always succeeds.
    pub fn new() -> Self {
        ChannelSink {
            written: Arc::new(std::sync::Mutex::new(Vec::new())),
            fail_first_n: 0,
            attempts: AtomicU64::new(0),
            close_count: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Builds a sink whose first `n` `write_batch` calls fail before it
    /// starts succeeding.
    pub fn failing_first(n: usize) -> Self {
        ChannelSink {
            written: Arc::new(std::sync::Mutex::new(Vec::new())),
            fail_first_n: n,
            attempts: AtomicU64::new(0),
            close_count: Arc::new(AtomicU64::new(0)),
        }
    }

    /// A handle that reports how many times `close` has been called.
    pub fn close_observer(&self) -> CloseObserver {
        CloseObserver {
            count: self.close_count.clone(),
        }
    }

    /// All batches successfully written so far, for test assertions.
    pub fn written_batches(&self) -> Vec<Vec<Message<ChannelHandle>>> {
        self.written
            .lock()
            .expect("written batches lock poisoned")
            .clone()
    }

    /// A handle that observes written batches without needing `&self`, so it
    /// can be kept around after the `Sink` itself has been moved into an
    /// [`crate::Engine`].
    pub fn written_observer(&self) -> WrittenObserver {
        WrittenObserver {
            written: self.written.clone(),
        }
    }
}

/// Read-only view onto the batches a [`ChannelSink`] has written.
#[derive(Clone)]
pub struct WrittenObserver {
    written: Arc<std::sync::Mutex<Vec<Vec<Message<ChannelHandle>>>>>,
}

impl WrittenObserver {
    /// All batches written so far.
    pub fn batches(&self) -> Vec<Vec<Message<ChannelHandle>>> {
        self.written
            .lock()
            .expect("written batches lock poisoned")
            .clone()
    }

    /// Number of batches written so far.
    pub fn batch_count(&self) -> usize {
        self.written.lock().expect("written batches lock poisoned").len()
    }

    /// Total messages across all written batches.
    pub fn message_count(&self) -> usize {
        self.batches().iter().map(Vec::len).sum()
    }
}

impl Default for ChannelSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Closer for ChannelSink {
    async fn close(&mut self) -> Result<(), Error> {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl Sink for ChannelSink {
    type Handle = ChannelHandle;

    async fn write_batch(
        &mut self,
        _cancel: &CancellationToken,
        batch: &[Message<Self::Handle>],
    ) -> Result<(), Error> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if (attempt as usize) < self.fail_first_n {
            return Err(Error::Sink(format!("simulated failure on attempt {attempt}")));
        }
        self.written
            .lock()
            .expect("written batches lock poisoned")
            .push(batch.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Value;

    #[tokio::test]
    async fn commit_tracks_ids() {
        let (mut source, producer) = ChannelSource::new(4);
        let observer = source.committed_observer();
        let cancel = CancellationToken::new();

        producer
            .send(Record {
                id: "a".into(),
                data: Value::map(),
                metadata: Default::default(),
            })
            .await
            .unwrap();

        let message = source.read(&cancel).await.unwrap();
        source.commit(&cancel, &[message]).await.unwrap();

        assert!(observer.contains("a"));
        assert_eq!(observer.count(), 1);
    }

    #[tokio::test]
    async fn sink_fails_then_succeeds() {
        let mut sink = ChannelSink::failing_first(1);
        let cancel = CancellationToken::new();
        let batch = vec![Message {
            record: Record::new("a"),
            handle: "a".to_string(),
        }];

        assert!(sink.write_batch(&cancel, &batch).await.is_err());
        assert!(sink.write_batch(&cancel, &batch).await.is_ok());
        assert_eq!(sink.written_batches().len(), 1);
    }
}
