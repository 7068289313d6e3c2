//! Bounded in-memory pipe coupling the tar packer to the HTTP uploader.
//!
//! The producer blocks once the channel is full, so the whole tar is
//! never buffered. Dropping the writer ends the stream cleanly; a
//! writer poisoned with an error makes the reader fail instead of
//! reporting a clean end-of-stream. Dropping the reader breaks the
//! writer, which aborts the producer.

use std::io::{self, Read, Write};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};

/// Chunks in flight before the producer blocks.
const PIPE_DEPTH: usize = 16;

type Chunk = Result<Vec<u8>, String>;

pub fn pipe() -> (PipeWriter, PipeReader) {
    let (tx, rx) = sync_channel::<Chunk>(PIPE_DEPTH);
    (
        PipeWriter { tx },
        PipeReader {
            rx,
            pending: Vec::new(),
            offset: 0,
        },
    )
}

pub struct PipeWriter {
    tx: SyncSender<Chunk>,
}

impl PipeWriter {
    /// End the stream with an error the reader will observe instead of
    /// a clean EOF.
    pub fn poison(self, message: String) {
        let _ = self.tx.send(Err(message));
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.tx
            .send(Ok(buf.to_vec()))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipe reader gone"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub struct PipeReader {
    rx: Receiver<Chunk>,
    pending: Vec<u8>,
    offset: usize,
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.offset >= self.pending.len() {
            match self.rx.recv() {
                Ok(Ok(chunk)) => {
                    self.pending = chunk;
                    self.offset = 0;
                }
                Ok(Err(message)) => return Err(io::Error::other(message)),
                // Writer dropped after a successful pack.
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len() - self.offset);
        buf[..n].copy_from_slice(&self.pending[self.offset..self.offset + n]);
        self.offset += n;
        Ok(n)
    }
}
