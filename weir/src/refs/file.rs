//! A line-delimited-JSON file `Source` and `Sink`, used by the CLI for a
//! runnable default pipeline without external services.
use std::collections::HashSet;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter, Lines};
use tokio_util::sync::CancellationToken;

use crate::{Closer, Error, Message, Record, Sink, Source, Value};

/// Commit handle for [`FileSource`]/[`FileSink`]: the zero-based line number
/// a message was read from.
pub type FileHandle = u64;

/// Reads one JSON object per line from a file, in order, until EOF.
///
/// `read` after EOF returns `Error::Source` so the Reader's retry loop backs
/// off rather than busy-spinning; point this at a FIFO or growing file if
/// you want `read` to keep blocking for new lines instead.
pub struct FileSource {
    lines: Lines<BufReader<File>>,
    next_line_no: u64,
    committed: HashSet<FileHandle>,
}

impl FileSource {
    /// Opens `path` for line-delimited JSON reading.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, Error> {
        let file = File::open(path.into())
            .await
            .map_err(|err| Error::Source(err.to_string()))?;
        Ok(FileSource {
            lines: BufReader::new(file).lines(),
            next_line_no: 0,
            committed: HashSet::new(),
        })
    }
}

#[async_trait]
impl Closer for FileSource {}

#[async_trait]
impl Source for FileSource {
    type Handle = FileHandle;

    async fn read(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Message<Self::Handle>, Error> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Source("cancelled".into())),
            next = self.lines.next_line() => {
                let line = next
                    .map_err(|err| Error::Source(err.to_string()))?
                    .ok_or_else(|| Error::Source("end of file".into()))?;

                let parsed: serde_json::Value = serde_json::from_str(&line)?;
                let line_no = self.next_line_no;
                self.next_line_no += 1;

                let record = Record {
                    id: line_no.to_string(),
                    data: Value::from(parsed),
                    metadata: Default::default(),
                };
                Ok(Message { record, handle: line_no })
            }
        }
    }

    async fn commit(
        &mut self,
        _cancel: &CancellationToken,
        batch: &[Message<Self::Handle>],
    ) -> Result<(), Error> {
        for message in batch {
            self.committed.insert(message.handle);
        }
        Ok(())
    }
}

/// Appends one JSON object per line to a file, flushing after every batch.
pub struct FileSink {
    writer: BufWriter<File>,
}

impl FileSink {
    /// Opens (creating if needed, truncating existing contents) `path` for
    /// line-delimited JSON writes.
    pub async fn create(path: impl Into<PathBuf>) -> Result<Self, Error> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path.into())
            .await
            .map_err(|err| Error::Sink(err.to_string()))?;
        Ok(FileSink {
            writer: BufWriter::new(file),
        })
    }
}

#[async_trait]
impl Closer for FileSink {
    async fn close(&mut self) -> Result<(), Error> {
        self.writer
            .flush()
            .await
            .map_err(|err| Error::Close(err.to_string()))
    }
}

#[async_trait]
impl Sink for FileSink {
    type Handle = FileHandle;

    async fn write_batch(
        &mut self,
        _cancel: &CancellationToken,
        batch: &[Message<Self::Handle>],
    ) -> Result<(), Error> {
        for message in batch {
            let json = serde_json::to_string(&message.record.data)?;
            self.writer
                .write_all(json.as_bytes())
                .await
                .map_err(|err| Error::Sink(err.to_string()))?;
            self.writer
                .write_all(b"\n")
                .await
                .map_err(|err| Error::Sink(err.to_string()))?;
        }
        self.writer
            .flush()
            .await
            .map_err(|err| Error::Sink(err.to_string()))
    }
}
