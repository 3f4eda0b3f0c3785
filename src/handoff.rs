// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! The byte-handoff: a bounded, backpressured SPSC byte pipe between the
//! download stage and the upload stage.
//!
//! This is the only large-memory buffer in the pipeline; its capacity caps
//! resident memory independent of clip size. It generalizes the
//! `mpsc::channel<VideoBuffer>(128)` pattern used elsewhere in this codebase
//! for bounding memory by *message count*. A fixed message
//! count doesn't bound bytes when chunk sizes vary, so here a
//! `tokio::sync::Semaphore` tracks bytes directly: the producer acquires
//! permits equal to a chunk's length (capped at total capacity so a chunk
//! larger than the whole buffer can still be sent — the consumer drains
//! concurrently, so this never deadlocks) before sending, and permits are
//! returned to the semaphore once the consumer has read the chunk.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, Semaphore};

/// One item flowing over the handoff: either a chunk of clip bytes (tagged
/// with the permit count actually acquired for it, so the reader releases
/// exactly that many back, not `bytes.len()`), or a terminal error that means
/// the uploader must discard whatever it has received and never touch the
/// ledger.
enum Item {
    Chunk(Bytes, u32),
    Error(String),
}

/// Producer half, owned exclusively by the download stage.
pub struct HandoffWriter {
    tx: mpsc::Sender<Item>,
    permits: Arc<Semaphore>,
    capacity: usize,
}

/// Consumer half, owned exclusively by the upload stage.
pub struct HandoffReader {
    rx: mpsc::Receiver<Item>,
    permits: Arc<Semaphore>,
}

/// Returned by [`HandoffReader::read`]: a chunk, clean EOF, or an error
/// flag raised by the producer.
pub enum ReadOutcome {
    Chunk(Bytes),
    Eof,
    Error(String),
}

/// Create a bounded byte-handoff of `capacity` bytes.
pub fn channel(capacity: usize) -> (HandoffWriter, HandoffReader) {
    // Channel depth of 1: the semaphore is what actually bounds bytes
    // resident in the pipe, not the channel depth.
    let (tx, rx) = mpsc::channel(1);
    let permits = Arc::new(Semaphore::new(capacity.max(1)));
    (
        HandoffWriter { tx, permits: permits.clone(), capacity: capacity.max(1) },
        HandoffReader { rx, permits },
    )
}

impl HandoffWriter {
    /// Send one chunk, blocking until enough of the byte budget is free.
    /// Returns `Err(())` if the reader has gone away (upload stage shut
    /// down or cancelled).
    pub async fn write(&self, chunk: Bytes) -> Result<(), ()> {
        let want = chunk.len().min(self.capacity).max(1) as u32;
        let permit = self.permits.clone().acquire_many_owned(want).await.map_err(|_| ())?;
        // The permit is forgotten (not dropped) here: ownership of "bytes
        // currently resident" transfers to the reader, which releases the
        // permits once it has consumed and dropped the chunk.
        permit.forget();
        self.tx.send(Item::Chunk(chunk, want)).await.map_err(|_| ())
    }

    /// Close the handoff cleanly: the reader observes EOF.
    pub async fn finish(self) {
        drop(self.tx);
    }

    /// Close the handoff with an error flag: the reader must discard
    /// anything received so far and never write to the ledger.
    pub async fn abort(self, reason: impl Into<String>) {
        let _ = self.tx.send(Item::Error(reason.into())).await;
    }
}

impl HandoffReader {
    /// Read the next chunk, or the terminal EOF/Error outcome.
    pub async fn read(&mut self) -> ReadOutcome {
        match self.rx.recv().await {
            Some(Item::Chunk(bytes, held)) => {
                // Release exactly what the writer acquired for this chunk,
                // not `bytes.len()` — the two differ whenever a chunk is
                // larger than the buffer's total capacity.
                self.permits.add_permits(held as usize);
                ReadOutcome::Chunk(bytes)
            }
            Some(Item::Error(reason)) => ReadOutcome::Error(reason),
            None => ReadOutcome::Eof,
        }
    }

    /// Adapt this reader into a byte stream suitable for
    /// `tokio_util::io::StreamReader`, so the upload stage can hand the
    /// remote-storage transfer adapter a plain `AsyncRead` without knowing
    /// anything about the handoff's internal framing.
    pub fn into_stream(mut self) -> impl futures::Stream<Item = std::io::Result<Bytes>> {
        async_stream::stream! {
            loop {
                match self.read().await {
                    ReadOutcome::Chunk(b) => yield Ok(b),
                    ReadOutcome::Eof => break,
                    ReadOutcome::Error(reason) => {
                        yield Err(std::io::Error::new(std::io::ErrorKind::Other, reason));
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn clean_eof_after_all_chunks_read() {
        let (writer, mut reader) = channel(1024);
        writer.write(Bytes::from_static(b"hello")).await.unwrap();
        writer.finish().await;

        match reader.read().await {
            ReadOutcome::Chunk(b) => assert_eq!(&b[..], b"hello"),
            _ => panic!("expected chunk"),
        }
        assert!(matches!(reader.read().await, ReadOutcome::Eof));
    }

    #[tokio::test]
    async fn error_flag_propagates_to_reader() {
        let (writer, mut reader) = channel(1024);
        writer.abort("download failed").await;
        match reader.read().await {
            ReadOutcome::Error(reason) => assert_eq!(reason, "download failed"),
            _ => panic!("expected error"),
        }
    }

    #[tokio::test]
    async fn clip_larger_than_buffer_does_not_deadlock() {
        // buffer is 16 bytes; total payload is 10x that, split into chunks
        // bigger than the buffer itself to exercise the capacity clamp.
        let (writer, mut reader) = channel(16);
        let total_chunks = 10;
        let chunk = vec![0xABu8; 32];

        let producer = tokio::spawn({
            let chunk = chunk.clone();
            async move {
                for _ in 0..total_chunks {
                    writer.write(Bytes::from(chunk.clone())).await.unwrap();
                }
                writer.finish().await;
            }
        });

        let mut received = 0usize;
        loop {
            match reader.read().await {
                ReadOutcome::Chunk(b) => received += b.len(),
                ReadOutcome::Eof => break,
                ReadOutcome::Error(_) => panic!("unexpected error"),
            }
        }
        producer.await.unwrap();
        assert_eq!(received, total_chunks * chunk.len());
    }

    #[tokio::test]
    async fn into_stream_yields_chunks_then_ends() {
        use futures::StreamExt;

        let (writer, reader) = channel(1024);
        writer.write(Bytes::from_static(b"ab")).await.unwrap();
        writer.write(Bytes::from_static(b"cd")).await.unwrap();
        writer.finish().await;

        let mut stream = Box::pin(reader.into_stream());
        let mut collected = Vec::new();
        while let Some(chunk) = stream.next().await {
            collected.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(collected, b"abcd");
    }
}
