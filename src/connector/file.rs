//! File-backed connectors, used for bootstrap & test traffic.

use std::collections::VecDeque;
use std::io::{ErrorKind, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};

use crate::connector::{token_mismatch, ConnectorStats, ResumptionToken, RetryPolicy};
use crate::error::ConnectorError;
use crate::models::{FileTransport, FormatConfig};

fn io_error(what: &str, path: &PathBuf, err: std::io::Error) -> ConnectorError {
    let msg = format!("error {} {}: {}", what, path.display(), err);
    match err.kind() {
        ErrorKind::NotFound | ErrorKind::Interrupted | ErrorKind::TimedOut | ErrorKind::WouldBlock => ConnectorError::Transient(msg),
        _ => ConnectorError::Permanent(msg),
    }
}

/// How records are delimited within a file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordFraming {
    /// Every newline ends a record.
    Lines,
    /// A newline ends a record only outside of a double-quoted field.
    QuotedLines,
}

impl RecordFraming {
    pub fn for_format(format: &FormatConfig) -> Self {
        match format {
            FormatConfig::Csv(_) => Self::QuotedLines,
            FormatConfig::Json | FormatConfig::Binary => Self::Lines,
        }
    }

    /// Check if the given newline-terminated bytes hold a whole record.
    fn is_complete(self, record: &[u8]) -> bool {
        match self {
            Self::Lines => true,
            Self::QuotedLines => record.iter().filter(|b| **b == b'"').count() % 2 == 0,
        }
    }
}

/// An input connector reading newline-terminated records from a file.
pub struct FileInput {
    path: PathBuf,
    follow: bool,
    framing: RecordFraming,
    max_batch_records: usize,
    watermark: usize,
    retry: RetryPolicy,
    stats: Arc<ConnectorStats>,
    reader: Option<BufReader<File>>,
    /// The position from which the next batch is read.
    position: u64,
    /// The position up to which batches have been acked.
    committed: u64,
    /// The end positions of batches which have been polled but not yet acked.
    in_flight: VecDeque<u64>,
}

impl FileInput {
    pub fn new(transport: &FileTransport, framing: RecordFraming, watermark: usize, retry: RetryPolicy, stats: Arc<ConnectorStats>) -> Self {
        Self {
            path: PathBuf::from(&transport.path),
            follow: transport.follow,
            framing,
            max_batch_records: transport.max_batch_records.max(1),
            watermark: watermark.max(1),
            retry,
            stats,
            reader: None,
            position: 0,
            committed: 0,
            in_flight: VecDeque::new(),
        }
    }

    pub fn unacked(&self) -> usize {
        self.in_flight.len()
    }

    pub fn saturated(&self) -> bool {
        self.in_flight.len() >= self.watermark
    }

    pub fn capacity(&self) -> usize {
        self.watermark
    }

    async fn open(&mut self) -> Result<&mut BufReader<File>, ConnectorError> {
        if self.reader.is_none() {
            let path = &self.path;
            let mut file = File::open(path).await.map_err(|err| io_error("opening", path, err))?;
            file.seek(SeekFrom::Start(self.position)).await.map_err(|err| io_error("seeking", path, err))?;
            self.reader = Some(BufReader::new(file));
        }
        match self.reader.as_mut() {
            Some(reader) => Ok(reader),
            None => Err(ConnectorError::Permanent("file reader unavailable".into())),
        }
    }

    /// Read up to `max_batch_records` records, returning `None` after waiting out the timeout at EOF.
    ///
    /// Transient errors while opening or reading the file are retried from the last batch boundary.
    pub async fn poll(&mut self, timeout: Duration) -> Result<Option<(Vec<u8>, ResumptionToken)>, ConnectorError> {
        if self.saturated() {
            return Ok(None);
        }
        let mut attempt = 1;
        let batch = loop {
            match self.read_batch().await {
                Ok(batch) => break batch,
                Err(err) => {
                    self.reader = None;
                    self.retry.backoff_or_fail(&self.stats, "file read", attempt, err).await?;
                    attempt += 1;
                }
            }
        };

        let Some(buf) = batch else {
            tokio::time::sleep(timeout).await;
            return Ok(None);
        };
        self.position += buf.len() as u64;
        self.in_flight.push_back(self.position);
        Ok(Some((buf, ResumptionToken::File { position: self.position })))
    }

    /// A single attempt at reading the next batch starting from the current position.
    async fn read_batch(&mut self) -> Result<Option<Vec<u8>>, ConnectorError> {
        let (follow, framing, max_records, start) = (self.follow, self.framing, self.max_batch_records, self.position);
        let path = self.path.clone();
        let reader = self.open().await?;

        // `complete` is the length of `buf` covered by whole records.
        let (mut buf, mut records, mut complete) = (Vec::new(), 0, 0usize);
        while records < max_records {
            let read = reader.read_until(b'\n', &mut buf).await.map_err(|err| io_error("reading", &path, err))?;
            if read > 0 {
                if buf.last() == Some(&b'\n') && framing.is_complete(&buf[complete..]) {
                    complete = buf.len();
                    records += 1;
                }
                continue;
            }
            if buf.len() > complete {
                if follow {
                    // The writer has not finished this record yet.
                    buf.truncate(complete);
                    reader
                        .seek(SeekFrom::Start(start + complete as u64))
                        .await
                        .map_err(|err| io_error("seeking", &path, err))?;
                } else {
                    complete = buf.len();
                    records += 1;
                }
            }
            break;
        }

        if records == 0 {
            return Ok(None);
        }
        Ok(Some(buf))
    }
    pub fn ack(&mut self, token: &ResumptionToken) -> Result<(), ConnectorError> {
        let position = match token {
            ResumptionToken::File { position } => *position,
            other => return Err(token_mismatch(other, "file")),
        };
        if position <= self.committed {
            return Ok(());
        }
        self.committed = position;
        while self.in_flight.front().map(|end| *end <= position).unwrap_or(false) {
            self.in_flight.pop_front();
        }
        Ok(())
    }

    pub async fn seek(&mut self, token: &ResumptionToken) -> Result<(), ConnectorError> {
        let position = match token {
            ResumptionToken::File { position } => *position,
            other => return Err(token_mismatch(other, "file")),
        };
        self.position = position;
        self.committed = position;
        self.in_flight.clear();
        self.reader = None;
        Ok(())
    }

    pub fn checkpoint(&self) -> ResumptionToken {
        ResumptionToken::File { position: self.committed }
    }
}

/// An output connector appending to a file.
///
/// Bytes past the end of the last successful append are treated as a torn write and are
/// truncated before the next append.
pub struct FileOutput {
    path: PathBuf,
    retry: RetryPolicy,
    stats: Arc<ConnectorStats>,
    /// The file length after the last successful append, unknown until the first append.
    len: Option<u64>,
}

impl FileOutput {
    pub fn new(transport: &FileTransport, retry: RetryPolicy, stats: Arc<ConnectorStats>) -> Self {
        Self {
            path: PathBuf::from(&transport.path),
            retry,
            stats,
            len: None,
        }
    }

    pub async fn send(&mut self, bytes: Vec<u8>) -> Result<(), ConnectorError> {
        let (path, bytes, expected) = (&self.path, &bytes, self.len);
        let len = self
            .retry
            .run(&self.stats, "file append", || async move {
                let mut file = OpenOptions::new()
                    .create(true)
                    .write(true)
                    .open(path)
                    .await
                    .map_err(|err| io_error("opening", path, err))?;
                let actual = file.metadata().await.map_err(|err| io_error("reading metadata of", path, err))?.len();
                let end = expected.map_or(actual, |len| len.min(actual));
                if actual > end {
                    tracing::warn!(path = %path.display(), expected = end, actual, "truncating partially written batch");
                    file.set_len(end).await.map_err(|err| io_error("truncating", path, err))?;
                }
                file.seek(SeekFrom::Start(end)).await.map_err(|err| io_error("seeking", path, err))?;
                file.write_all(bytes).await.map_err(|err| io_error("writing", path, err))?;
                file.flush().await.map_err(|err| io_error("writing", path, err))?;
                Ok(end + bytes.len() as u64)
            })
            .await?;
        self.len = Some(len);
        Ok(())
    }
    pub async fn flush(&mut self) -> Result<(), ConnectorError> {
        let path = &self.path;
        self.retry
            .run(&self.stats, "file sync", || async move {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await
                    .map_err(|err| io_error("opening", path, err))?;
                file.sync_data().await.map_err(|err| io_error("syncing", path, err))
            })
            .await
    }
}
