//! Named-pipe sink writer (C4, receiver only).
//!
//! Grounded on `examples/original_source/src/server/fifo.c`: reopen on
//! `ENXIO`/any error with a 10-second retry, a byte-quota queue that
//! tail-drops on overflow, and escalation to a uniquely named temp file
//! plus a `PROCESS_FILE` follow-up command once a batch exceeds
//! `PIPE_BUF`. The original's POSIX-AIO-vs-idle-watcher split (§4.4 /
//! §9) collapses here to a single `spawn_blocking` call: the design
//! notes explicitly sanction a dedicated blocking-I/O worker as the
//! modern equivalent of both variants, and since this sink runs as one
//! task draining one channel, "exactly one dump in flight" falls out of
//! that task never starting a second `drain()` before the first
//! `.await`s its completion — no extra semaphore is needed.

use crate::buffer::ByteBuffer;
use crate::protocol::{self, PIPE_BUF};
use log::warn;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::pipe;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const REOPEN_RETRY: Duration = Duration::from_secs(10);

pub struct SinkConfig {
    pub path: PathBuf,
    pub temp_directory: PathBuf,
    pub max_queue_size: usize,
}

/// Handle used by receiver connections to submit authorized payloads.
#[derive(Clone)]
pub struct SinkHandle {
    tx: mpsc::Sender<Vec<u8>>,
}

impl SinkHandle {
    pub async fn send(&self, payload: Vec<u8>) -> Result<(), mpsc::error::SendError<Vec<u8>>> {
        self.tx.send(payload).await
    }
}

impl From<mpsc::Sender<Vec<u8>>> for SinkHandle {
    /// Lets tests wire a `ReceiverContext` directly to a plain channel
    /// receiver instead of spawning the full sink task.
    fn from(tx: mpsc::Sender<Vec<u8>>) -> Self {
        SinkHandle { tx }
    }
}

/// Owns the sink task's join handle. Dropping the last `SinkHandle` closes
/// the channel, but the task itself keeps running until it has made a
/// best-effort attempt to flush whatever was still queued (spec §5's
/// buffer→tls_server→fifo teardown order puts the fifo last); callers
/// that want to observe that flush complete before exiting await
/// `shutdown()`.
pub struct SinkTask {
    handle: JoinHandle<()>,
}

impl SinkTask {
    /// Waits for the sink task to finish its shutdown drain. The caller
    /// must have already dropped every `SinkHandle` clone (directly or by
    /// dropping whatever owns them), otherwise the channel never closes
    /// and this never resolves.
    pub async fn shutdown(self) {
        if let Err(e) = self.handle.await {
            warn!("sink task panicked during shutdown: {}", e);
        }
    }
}

pub fn spawn(config: SinkConfig) -> (SinkHandle, SinkTask) {
    let (tx, rx) = mpsc::channel(64);
    let handle = tokio::spawn(run(config, rx));
    (SinkHandle { tx }, SinkTask { handle })
}

struct Sink {
    path: PathBuf,
    temp_directory: PathBuf,
    max_queue_size: usize,
    queue: ByteBuffer,
    writer: Option<pipe::Sender>,
}

async fn run(config: SinkConfig, mut rx: mpsc::Receiver<Vec<u8>>) {
    let mut sink = Sink {
        path: config.path,
        temp_directory: config.temp_directory,
        max_queue_size: config.max_queue_size,
        queue: ByteBuffer::new(),
        writer: None,
    };
    let mut retry = tokio::time::interval(REOPEN_RETRY);
    retry.tick().await; // first tick fires immediately; consume it

    loop {
        tokio::select! {
            payload = rx.recv() => {
                match payload {
                    Some(p) => sink.accept(p).await,
                    None => break,
                }
            }
            _ = retry.tick(), if sink.writer.is_none() && !sink.queue.is_empty() => {
                sink.drain().await;
            }
        }
    }

    sink.close().await;
}

impl Sink {
    async fn accept(&mut self, payload: Vec<u8>) {
        if self.queue.size() + payload.len() > self.max_queue_size {
            warn!(
                "sink queue would exceed {} bytes, dropping {} queued bytes",
                self.max_queue_size,
                self.queue.size()
            );
            self.queue.slurp();
        }
        self.queue.append(&payload);
        self.drain().await;
    }

    /// Pushes as much of the queue toward the pipe as currently
    /// possible, escalating to a temp-file dump when the queue exceeds
    /// the atomic-write limit.
    async fn drain(&mut self) {
        loop {
            if self.queue.is_empty() {
                return;
            }
            if self.queue.size() > PIPE_BUF {
                if !self.dump_to_file().await {
                    return;
                }
                continue;
            }
            if self.writer.is_none() && !self.try_open().await {
                return;
            }
            if !self.try_write().await {
                return;
            }
        }
    }

    async fn try_open(&mut self) -> bool {
        match pipe::OpenOptions::new().open_sender(&self.path) {
            Ok(sender) => {
                self.writer = Some(sender);
                true
            }
            Err(e) => {
                if e.raw_os_error() == Some(libc::ENXIO) {
                    warn!("sink pipe {} has no reader, queueing", self.path.display());
                } else {
                    warn!("failed to open sink pipe {}: {}", self.path.display(), e);
                }
                false
            }
        }
    }

    /// Writes everything currently queued (guaranteed by the caller to
    /// be `<= PIPE_BUF` bytes) in one atomic pipe write.
    async fn try_write(&mut self) -> bool {
        let data = self.queue.slurp();
        let writer = self.writer.as_mut().expect("writer checked by caller");
        match writer.write_all(&data).await {
            Ok(()) => true,
            Err(e) => {
                warn!("sink pipe write failed, reopening: {}", e);
                self.writer = None;
                self.queue.append(&data);
                false
            }
        }
    }

    /// Joins the whole pending queue into one payload, writes it to a
    /// uniquely named temp file, and on success replaces the queue with
    /// the `PROCESS_FILE` follow-up command. Returns whether the dump
    /// succeeded (and therefore whether `drain` should keep looping).
    async fn dump_to_file(&mut self) -> bool {
        let payload = self.queue.slurp();
        let temp_directory = self.temp_directory.clone();
        let result = tokio::task::spawn_blocking(move || -> std::io::Result<PathBuf> {
            let mut file = tempfile::Builder::new()
                .prefix("nsca.")
                .rand_bytes(6)
                .tempfile_in(&temp_directory)?;
            file.write_all(&payload)?;
            file.flush()?;
            let (_, path) = file.keep().map_err(|e| e.error)?;
            Ok(path)
        })
        .await;

        match result {
            Ok(Ok(path)) => {
                let cmd = protocol::format_process_file(&path.to_string_lossy());
                self.queue.append(&cmd);
                true
            }
            Ok(Err(e)) => {
                warn!("failed to dump oversized batch to temp file: {}", e);
                false
            }
            Err(e) => {
                warn!("temp file dump task panicked: {}", e);
                false
            }
        }
    }

    /// Runs once, after the channel has closed because every `SinkHandle`
    /// was dropped (process shutdown). Makes a best-effort attempt to
    /// hand whatever is still queued to an already-open or newly-openable
    /// reader; if none shows up, forces a temp-file dump of the remainder
    /// regardless of `PIPE_BUF` so the data lands on disk instead of
    /// being silently discarded, then logs the file it landed in.
    async fn close(&mut self) {
        if self.queue.is_empty() {
            return;
        }
        self.drain().await;
        if self.queue.is_empty() {
            return;
        }

        warn!(
            "sink shutting down with {} bytes still queued and no reader, dumping to a temp file",
            self.queue.size()
        );
        if !self.dump_to_file().await {
            warn!(
                "failed to dump queued data during shutdown, {} bytes lost",
                self.queue.size()
            );
            return;
        }
        // `dump_to_file` replaced the queue with the short PROCESS_FILE
        // follow-up command; try once more in case a reader appeared, and
        // log the outcome either way so the dumped file's path is never
        // only reachable through a command nobody received.
        self.drain().await;
        if !self.queue.is_empty() {
            let lost = self.queue.slurp();
            warn!(
                "sink closed without a reader; dumped file's PROCESS_FILE command was never \
                 delivered: {}",
                String::from_utf8_lossy(&lost).trim_end()
            );
        }
    }
}
