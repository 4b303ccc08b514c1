//! Batched forwarding of live process output
//!
//! Supervisors push chunks into a channel; a consumer task echoes them to the
//! console and ships them to the control plane in small batches. Delivery is
//! best effort and never holds up the process being supervised.

use std::io::Write;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use agent_core::client::{OutputChunk, OutputStream};
use agent_core::OutputSink;

/// Flush once the buffer holds this many chunks after a stdout chunk
pub const STDOUT_FLUSH_THRESHOLD: usize = 5;
/// Flush once the buffer holds this many chunks after a stderr chunk
pub const STDERR_FLUSH_THRESHOLD: usize = 3;

/// Producer side handed to supervisors
pub type ChunkSender = mpsc::UnboundedSender<OutputChunk>;

/// Consumer that buffers chunks and flushes them to an [`OutputSink`]
pub struct OutputStreamer {
    task_id: String,
    sink: Option<Arc<dyn OutputSink>>,
    echo: bool,
    buffer: Vec<OutputChunk>,
    in_flight: Vec<JoinHandle<()>>,
}

impl OutputStreamer {
    pub fn new(task_id: impl Into<String>, sink: Option<Arc<dyn OutputSink>>) -> Self {
        Self {
            task_id: task_id.into(),
            sink,
            echo: true,
            buffer: Vec::new(),
            in_flight: Vec::new(),
        }
    }

    /// Toggle echoing chunks to this process's stdout/stderr
    pub fn echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    /// Start consuming; the consumer ends once every sender is dropped
    pub fn spawn(self) -> (ChunkSender, StreamerHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let join = tokio::spawn(self.run(rx));
        (tx, StreamerHandle { join })
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<OutputChunk>) -> usize {
        let mut total = 0;

        while let Some(chunk) = rx.recv().await {
            total += 1;
            if self.echo {
                echo(&chunk);
            }

            let threshold = match chunk.stream {
                OutputStream::Stdout => STDOUT_FLUSH_THRESHOLD,
                OutputStream::Stderr => STDERR_FLUSH_THRESHOLD,
            };
            self.buffer.push(chunk);
            if self.buffer.len() >= threshold {
                self.flush();
            }
        }

        self.flush();
        for handle in self.in_flight.drain(..) {
            let _ = handle.await;
        }
        total
    }

    fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.buffer);
        let Some(sink) = self.sink.clone() else {
            return;
        };
        let task_id = self.task_id.clone();

        self.in_flight.retain(|handle| !handle.is_finished());
        self.in_flight.push(tokio::spawn(async move {
            if let Err(e) = sink.send_output(&task_id, &batch).await {
                debug!(
                    "Failed to stream {} output chunks for task {}: {}",
                    batch.len(),
                    task_id,
                    e
                );
            }
        }));
    }
}

fn echo(chunk: &OutputChunk) {
    let _ = match chunk.stream {
        OutputStream::Stdout => std::io::stdout().write_all(chunk.data.as_bytes()),
        OutputStream::Stderr => std::io::stderr().write_all(chunk.data.as_bytes()),
    };
}

/// Handle used to wait for the final flush
pub struct StreamerHandle {
    join: JoinHandle<usize>,
}

impl StreamerHandle {
    /// Wait until the channel is drained and every flush has settled;
    /// returns the number of chunks seen
    pub async fn finish(self) -> usize {
        match self.join.await {
            Ok(total) => total,
            Err(e) => {
                warn!("Output streamer stopped abnormally: {}", e);
                0
            }
        }
    }
}
