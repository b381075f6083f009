//! The pipeline execution engine: Reader, Worker pool, Batcher, and the
//! supervisor that wires them together behind a single [`CancellationToken`].
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::config::EngineConfig;
use crate::{Batch, Closer, Error, Message, Processor, Sink, Source};

const READ_BACKOFF: Duration = Duration::from_millis(100);

/// A commit request sent from the Batcher to the Reader, which is the sole
/// owner of the `Source`. The Reader answers on `respond_to` once
/// `Source::commit` returns.
struct CommitRequest<H> {
    batch: Batch<H>,
    respond_to: oneshot::Sender<Result<(), Error>>,
}

/// Coordinates a [`Source`], a fixed processor chain, and a [`Sink`] sharing
/// the same commit handle type.
///
/// Constructed once per run; `worker_count`/`batch_size`/`batch_timeout` are
/// fixed for the lifetime of the engine (no dynamic reconfiguration).
pub struct Engine<S, K>
where
    S: Source,
    K: Sink<Handle = S::Handle>,
{
    source: S,
    sink: K,
    processors: Vec<Arc<dyn Processor>>,
    config: EngineConfig,
    cancel: CancellationToken,
}

impl<S, K> Engine<S, K>
where
    S: Source + 'static,
    K: Sink<Handle = S::Handle> + 'static,
{
    /// Builds an engine from its collaborators and configuration. Does not
    /// start any task; call [`Engine::run`] or [`Engine::spawn`] for that.
    pub fn new(
        source: S,
        sink: K,
        processors: Vec<Arc<dyn Processor>>,
        config: EngineConfig,
    ) -> Self {
        Engine {
            source,
            sink,
            processors,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// The token that shuts this engine down cooperatively. Clone it before
    /// calling [`Engine::run`] if you need to cancel from elsewhere (e.g. on
    /// `Ctrl+C`); [`Engine::spawn`] does this for you.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Spawns the engine onto its own supervisor task and returns a handle
    /// used to cancel it and wait for shutdown.
    pub fn spawn(self) -> EngineHandle {
        let cancel = self.cancel.clone();
        let join = tokio::spawn(self.run());
        EngineHandle { cancel, join }
    }

    /// Runs Reader, Worker pool, and Batcher to completion.
    ///
    /// Returns once the cancellation token is cancelled and every task has
    /// drained and exited, or once an unrecoverable supervisor-level error
    /// occurs (a task panicked). Per-message failures — a failed read, a
    /// processor dropping a message, a failed write or commit — are handled
    /// internally and never surface here.
    ///
    /// A message dropped by a processor never reaches the Batcher, so its
    /// handle is never committed; this is accepted as-is rather than treated
    /// as a defect (the source will not re-deliver it, since the engine
    /// never acknowledges it, but it also never re-enters the pipeline —
    /// see the design notes on handle loss).
    pub async fn run(self) -> Result<(), Error> {
        let worker_count = self.config.worker_count;
        let batch_size = self.config.batch_size;
        let ingress_capacity = 2 * worker_count;
        let egress_capacity = 2 * batch_size;

        let (ingress_tx, ingress_rx) = flume::bounded::<Message<S::Handle>>(ingress_capacity);
        let (egress_tx, egress_rx) = flume::bounded::<Message<S::Handle>>(egress_capacity);
        // Capacity 1: the Batcher is single-writer and awaits each commit's
        // response before flushing again, so only one request is ever
        // in-flight at a time.
        let (commit_tx, commit_rx) = mpsc::channel::<CommitRequest<S::Handle>>(1);

        let mut tasks: JoinSet<Result<(), Error>> = JoinSet::new();

        let reader_cancel = self.cancel.clone();
        tasks.spawn(run_reader(self.source, ingress_tx, commit_rx, reader_cancel));

        for worker_id in 0..worker_count {
            let worker_cancel = self.cancel.clone();
            let processors = self.processors.clone();
            let worker_ingress = ingress_rx.clone();
            let worker_egress = egress_tx.clone();
            tasks.spawn(async move {
                run_worker(
                    worker_id,
                    processors,
                    worker_ingress,
                    worker_egress,
                    &worker_cancel,
                )
                .await;
                Ok(())
            });
        }
        // Drop the supervisor's own copies so the egress queue closes once
        // every worker (the only remaining senders) has exited.
        drop(ingress_rx);
        drop(egress_tx);

        let batcher_cancel = self.cancel.clone();
        let mut sink = self.sink;
        let batch_timeout = self.config.batch_timeout;
        tasks.spawn(async move {
            run_batcher(
                commit_tx,
                &mut sink,
                egress_rx,
                batch_size,
                batch_timeout,
                &batcher_cancel,
            )
            .await;
            close_sink(&mut sink).await
        });

        let mut first_error = None;
        while let Some(result) = tasks.join_next().await {
            let result = match result {
                Ok(result) => result,
                Err(join_err) => Err(Error::TaskFailure(join_err.to_string())),
            };
            if let Err(err) = result {
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

async fn close_sink<K: Sink>(sink: &mut K) -> Result<(), Error> {
    sink.close().await.map_err(|err| {
        error!(error = %err, "sink close failed");
        Error::Close(err.to_string())
    })
}

/// Owns the `Source` for the lifetime of the engine: it is the only task
/// that ever holds `&mut Source`. Commits, requested by the Batcher over
/// `commit_rx`, are serviced as a select-arm alongside reads rather than
/// behind a lock held across the (potentially indefinitely blocking) read —
/// a commit request arriving mid-read simply wins the race, the pending
/// read future is dropped (reads are not expected to buffer partial state
/// across an `.await` boundary, so nothing is lost), and reading resumes on
/// the next loop iteration.
async fn run_reader<S>(
    mut source: S,
    ingress_tx: flume::Sender<Message<S::Handle>>,
    mut commit_rx: mpsc::Receiver<CommitRequest<S::Handle>>,
    cancel: CancellationToken,
) -> Result<(), Error>
where
    S: Source,
{
    loop {
        if cancel.is_cancelled() {
            debug!("reader observed cancellation, exiting read loop");
            break;
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("reader cancelled, exiting read loop");
                break;
            }
            maybe_request = commit_rx.recv() => {
                match maybe_request {
                    Some(request) => service_commit(&mut source, &cancel, request).await,
                    None => {
                        debug!("batcher gone before cancellation, exiting read loop");
                        break;
                    }
                }
            }
            read_result = source.read(&cancel) => {
                match read_result {
                    Ok(message) => {
                        trace!(message_id = %message.record.id, "reader read message");
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => {
                                debug!("reader cancelled while publishing to ingress, dropping message");
                                break;
                            }
                            send_result = ingress_tx.send_async(message) => {
                                if send_result.is_err() {
                                    debug!("ingress queue closed, reader exiting");
                                    break;
                                }
                            }
                        }
                    }
                    Err(err) => {
                        if cancel.is_cancelled() {
                            debug!("reader error after cancellation, treating as shutdown");
                            break;
                        }
                        warn!(error = %err, "source read failed, backing off");
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(READ_BACKOFF) => {}
                        }
                    }
                }
            }
        }
    }
    drop(ingress_tx);

    // The Batcher may still need one final commit (its own cancellation-
    // triggered flush) after we stop reading; keep servicing requests until
    // it drops its sender.
    while let Some(request) = commit_rx.recv().await {
        service_commit(&mut source, &cancel, request).await;
    }

    source.close().await.map_err(|err| {
        error!(error = %err, "source close failed");
        Error::Close(err.to_string())
    })
}

async fn service_commit<S: Source>(
    source: &mut S,
    cancel: &CancellationToken,
    request: CommitRequest<S::Handle>,
) {
    let result = source.commit(cancel, &request.batch).await;
    let _ = request.respond_to.send(result);
}

async fn run_worker<H>(
    worker_id: usize,
    processors: Vec<Arc<dyn Processor>>,
    ingress_rx: flume::Receiver<Message<H>>,
    egress_tx: flume::Sender<Message<H>>,
    cancel: &CancellationToken,
) where
    H: Send + Sync + 'static,
{
    loop {
        let recv_result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(worker_id, "worker cancelled, exiting");
                break;
            }
            result = ingress_rx.recv_async() => result,
        };

        let message = match recv_result {
            Ok(message) => message,
            Err(_) => {
                debug!(worker_id, "ingress queue closed, worker exiting");
                break;
            }
        };

        let message_id = message.record.id.clone();
        let Message { mut record, handle } = message;

        let mut dropped = false;
        for processor in &processors {
            match processor.process(record).await {
                Ok(next) => record = next,
                Err(err) => {
                    warn!(worker_id, message_id = %message_id, error = %err, "processor dropped message");
                    dropped = true;
                    break;
                }
            }
        }
        if dropped {
            continue;
        }

        let processed = Message { record, handle };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(worker_id, message_id = %message_id, "worker cancelled while publishing to egress, dropping message");
                break;
            }
            send_result = egress_tx.send_async(processed) => {
                if send_result.is_err() {
                    debug!(worker_id, "egress queue closed, worker exiting");
                    break;
                }
            }
        }
    }
    drop(egress_tx);
}

enum BatcherEvent<H> {
    Message(Message<H>),
    Tick,
    Cancelled,
    Closed,
}

async fn run_batcher<S, K>(
    commit_tx: mpsc::Sender<CommitRequest<S::Handle>>,
    sink: &mut K,
    egress_rx: flume::Receiver<Message<S::Handle>>,
    batch_size: usize,
    batch_timeout: Duration,
    cancel: &CancellationToken,
) where
    S: Source,
    K: Sink<Handle = S::Handle>,
{
    let mut batch: Batch<S::Handle> = Vec::with_capacity(batch_size);
    let mut ticker = tokio::time::interval(batch_timeout);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.reset();

    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => BatcherEvent::Cancelled,
            _ = ticker.tick() => BatcherEvent::Tick,
            recv = egress_rx.recv_async() => match recv {
                Ok(message) => BatcherEvent::Message(message),
                Err(_) => BatcherEvent::Closed,
            },
        };

        match event {
            BatcherEvent::Message(message) => {
                batch.push(message);
                if batch.len() >= batch_size {
                    flush(&commit_tx, sink, &mut batch, cancel).await;
                }
            }
            BatcherEvent::Tick => {
                flush(&commit_tx, sink, &mut batch, cancel).await;
            }
            BatcherEvent::Cancelled => {
                debug!("batcher observed cancellation, performing final flush");
                flush(&commit_tx, sink, &mut batch, cancel).await;
                break;
            }
            BatcherEvent::Closed => {
                debug!("egress queue closed, performing final flush");
                flush(&commit_tx, sink, &mut batch, cancel).await;
                break;
            }
        }
    }
    // Dropping commit_tx tells the Reader there will be no more commit
    // requests, so it can finish draining and exit.
}

async fn flush<S, K>(
    commit_tx: &mpsc::Sender<CommitRequest<S::Handle>>,
    sink: &mut K,
    batch: &mut Batch<S::Handle>,
    cancel: &CancellationToken,
) where
    S: Source,
    K: Sink<Handle = S::Handle>,
{
    if batch.is_empty() {
        return;
    }

    trace!(batch_size = batch.len(), "flushing batch");
    match sink.write_batch(cancel, batch.as_slice()).await {
        Ok(()) => {
            let batch_size = batch.len();
            let committed_batch = std::mem::take(batch);
            let (respond_to, response) = oneshot::channel();
            if commit_tx
                .send(CommitRequest {
                    batch: committed_batch,
                    respond_to,
                })
                .await
                .is_err()
            {
                error!(batch_size, "reader gone, cannot commit batch; duplicates possible on re-delivery");
            } else {
                match response.await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        error!(error = %err, batch_size, "commit failed after successful write; duplicates possible on re-delivery");
                    }
                    Err(_) => {
                        error!(batch_size, "reader dropped before answering commit request");
                    }
                }
            }
        }
        Err(err) => {
            warn!(error = %err, batch_size = batch.len(), "sink write failed; batch left uncommitted for upstream re-delivery");
        }
    }
    batch.clear();
}

/// A running [`Engine`], detached onto its own supervisor task.
///
/// Obtained from [`Engine::spawn`]. Dropping a handle does not cancel the
/// engine; call [`EngineHandle::cancel`] explicitly, then
/// [`EngineHandle::join`] to wait for a clean shutdown.
pub struct EngineHandle {
    cancel: CancellationToken,
    join: tokio::task::JoinHandle<Result<(), Error>>,
}

impl EngineHandle {
    /// Requests cooperative shutdown. Safe to call more than once.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits for the engine's supervisor task to finish.
    pub async fn join(self) -> Result<(), Error> {
        self.join
            .await
            .map_err(|err| Error::TaskFailure(err.to_string()))?
    }
}
