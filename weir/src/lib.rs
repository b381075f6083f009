//! Concurrent streaming pipeline execution engine.
//!
//! Coordinates a single source reader, a pool of stateless processing
//! workers, and a batching sink writer with commit-after-persist semantics,
//! providing at-least-once delivery with batched, transactional sinks.
//!
//! The engine is generic over a source-defined commit handle
//! ([`Source::Handle`]) so no dynamic cast is needed at commit time, and
//! over the processor chain, which is a fixed `Vec` of trait objects built
//! by the caller rather than a string-keyed runtime plugin registry.
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

pub mod config;
pub mod engine;
pub mod refs;
mod value;

pub use engine::{Engine, EngineHandle};
pub use value::Value;

/// The handle-free projection of a [`Message`] that [`Processor`]s operate on.
///
/// Processors never see the commit handle: per the engine's contract they
/// only transform `data`/`metadata`, they never acknowledge delivery.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Record {
    /// Opaque identifier used only for logging correlation.
    pub id: String,
    /// Mutable, dynamically-typed payload. Processors mutate this in place
    /// or replace it wholesale.
    pub data: Value,
    /// Immutable source-provided context (topic, partition, offset, ...).
    pub metadata: std::collections::HashMap<String, String>,
}

impl Record {
    /// Builds a new record with an empty map `data` and no metadata.
    pub fn new(id: impl Into<String>) -> Self {
        Record {
            id: id.into(),
            data: Value::map(),
            metadata: std::collections::HashMap::new(),
        }
    }
}

/// A [`Record`] paired with the opaque, source-defined token needed to
/// acknowledge it once its batch has been durably written.
///
/// The engine never inspects `handle`; it only ferries it from [`Source::read`]
/// to the batcher and back to [`Source::commit`].
#[derive(Clone, Debug)]
pub struct Message<H> {
    /// The mutable, processor-visible payload.
    pub record: Record,
    /// Opaque commit token from the source that produced this message.
    pub handle: H,
}

/// An ordered sequence of [`Message`]s accumulated by the batcher and
/// flushed together to a [`Sink`].
pub type Batch<H> = Vec<Message<H>>;

/// Optional graceful-shutdown hook for [`Source`] and [`Sink`] implementations.
///
/// Mirrors the teacher crate's `Closer` trait: most drivers have nothing to
/// release and can rely on the default no-op.
#[async_trait]
pub trait Closer {
    /// Releases resources held by this driver. Called exactly once, after
    /// the engine has finished draining.
    async fn close(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

/// Reads messages from, and acknowledges them to, an external system (a
/// message-broker topic in the canonical deployment).
///
/// `read` and `commit` are only ever called from their own dedicated tasks
/// (the Reader and the Batcher respectively) and never concurrently with
/// each other by the engine, so implementations do not need interior
/// synchronization for that reason alone.
#[async_trait]
pub trait Source: Closer + Send {
    /// Opaque, source-owned commit token. The engine parameterizes itself by
    /// this type instead of performing a dynamic cast at commit time.
    type Handle: Send + Sync + 'static;

    /// Blocks until the next message is available, or returns an error.
    ///
    /// A `read` that returns because `cancel` was observed is treated by
    /// the Reader as a normal shutdown signal, not a fault: no back-off is
    /// applied and the Reader loop exits immediately.
    async fn read(&mut self, cancel: &CancellationToken) -> Result<Message<Self::Handle>, Error>;

    /// Acknowledges the supplied batch's handles as durably processed.
    ///
    /// Best-effort: the engine logs failures here but does not propagate
    /// them, since the messages have already been written to the sink and
    /// the only consequence of a failed commit is re-delivery (duplication),
    /// which the engine's at-least-once contract already allows for.
    async fn commit(
        &mut self,
        cancel: &CancellationToken,
        batch: &[Message<Self::Handle>],
    ) -> Result<(), Error>;
}

/// Persists a batch of messages to an external store (a bulk database
/// loader or search-index bulk indexer in the canonical deployment).
///
/// `write_batch` is only ever called from the single Batcher task.
#[async_trait]
pub trait Sink: Closer + Send {
    /// Must match the paired [`Source::Handle`] for the engine they share.
    type Handle: Send + Sync + 'static;

    /// Persists `batch` atomically, or with all-or-nothing semantics at the
    /// sink's own granularity. Returning `Ok` means it is safe for the
    /// engine to commit the source.
    async fn write_batch(
        &mut self,
        cancel: &CancellationToken,
        batch: &[Message<Self::Handle>],
    ) -> Result<(), Error>;
}

/// A single stage in the fixed, per-record processing chain run by every worker.
///
/// Implementations are called concurrently, from any worker, with different
/// records, and must not hold state shared across records without their own
/// synchronization — the engine treats processors as pure functions.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Transforms `record`, or returns an error to signal "drop this message".
    ///
    /// On error the remaining stages in the chain are skipped and the
    /// message is dropped: not forwarded, not retried, not sent to a
    /// dead-letter sink.
    async fn process(&self, record: Record) -> Result<Record, Error>;
}

/// Errors surfaced by the engine and its collaborators.
///
/// Per-message failures (`Source`/`Processor`/`Sink`/commit errors) are
/// recovered locally by the engine (retry, drop, or decline-to-commit) and
/// never reach [`Engine::run`]'s caller; only supervisor-level failures
/// (a task panicked, configuration was invalid, a `Closer::close` failed)
/// propagate out.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// `Source::read` failed.
    #[error("source read error: {0}")]
    Source(String),

    /// A processor in the chain returned an error for a given record.
    #[error("processor error: {0}")]
    Processing(String),

    /// `Sink::write_batch` failed.
    #[error("sink write error: {0}")]
    Sink(String),

    /// `Source::commit` failed.
    #[error("commit error: {0}")]
    Commit(String),

    /// `Source::close` or `Sink::close` failed.
    #[error("close error: {0}")]
    Close(String),

    /// Engine configuration failed validation.
    #[error("configuration error: {0}")]
    Config(String),

    /// A supervised task ended unexpectedly (panicked or was aborted).
    #[error("task failure: {0}")]
    TaskFailure(String),

    /// Failure to send to an internal channel between engine tasks.
    #[error("pipeline channel send error: {0}")]
    ChannelSend(String),

    /// YAML parsing error surfaced while loading an [`config::EngineConfig`].
    #[error("unable to parse YAML configuration")]
    Yaml(
        #[from]
        #[source]
        serde_yaml::Error,
    ),

    /// JSON parsing error surfaced by reference processors/drivers.
    #[error("unable to parse JSON payload")]
    Json(
        #[from]
        #[source]
        serde_json::Error,
    ),

    /// A `flume` channel was disconnected while a reference `Source`/`Sink`
    /// was receiving from it.
    #[error("channel receive error")]
    Recv(
        #[from]
        #[source]
        flume::RecvError,
    ),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_new_has_empty_map_data() {
        let r = Record::new("abc");
        assert_eq!(r.id, "abc");
        assert_eq!(r.data, Value::map());
        assert!(r.metadata.is_empty());
    }
}
