// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Single-producer single-consumer byte pipe with error propagation.

Connects the container build driver to the tar decoder on the publishing
side. Buffering is bounded, so a slow consumer applies back-pressure to the
producer. A producer that fails mid-stream hands its error to the consumer
with [PipeWriter::close_with_error]; the consumer drains already buffered
chunks and then observes the error instead of a clean EOF.

Closing consumes the writer, so there is exactly one close per pipe.
*/

use std::{
    io::{self, Read, Write},
    sync::mpsc::{sync_channel, Receiver, SyncSender},
};

enum Chunk {
    Data(Vec<u8>),
    Failed(io::Error),
}

/// Create a pipe buffering at most `capacity` in-flight chunks.
pub fn pipe(capacity: usize) -> (PipeWriter, PipeReader) {
    let (tx, rx) = sync_channel(capacity);

    (
        PipeWriter { tx: Some(tx) },
        PipeReader {
            rx,
            buffer: vec![],
            position: 0,
            terminated: false,
        },
    )
}

/// Write end of a pipe.
///
/// Dropping the writer without an explicit close is a clean EOF.
pub struct PipeWriter {
    tx: Option<SyncSender<Chunk>>,
}

impl PipeWriter {
    /// Close the pipe, delivering `error` to the reader after buffered data.
    pub fn close_with_error(mut self, error: io::Error) {
        if let Some(tx) = self.tx.take() {
            // The reader may already be gone; nobody is left to care.
            let _ = tx.send(Chunk::Failed(error));
        }
    }

    /// Close the pipe cleanly; the reader observes EOF after buffered data.
    pub fn close(mut self) {
        self.tx.take();
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "pipe writer closed"))?;

        tx.send(Chunk::Data(buf.to_vec()))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipe reader dropped"))?;

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Read end of a pipe.
pub struct PipeReader {
    rx: Receiver<Chunk>,
    buffer: Vec<u8>,
    position: usize,
    terminated: bool,
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.position < self.buffer.len() {
                let n = std::cmp::min(buf.len(), self.buffer.len() - self.position);
                buf[..n].copy_from_slice(&self.buffer[self.position..self.position + n]);
                self.position += n;

                return Ok(n);
            }

            if self.terminated {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "pipe already failed",
                ));
            }

            match self.rx.recv() {
                Ok(Chunk::Data(data)) => {
                    self.buffer = data;
                    self.position = 0;
                }
                Ok(Chunk::Failed(error)) => {
                    self.terminated = true;

                    return Err(error);
                }
                // All writers gone: EOF.
                Err(_) => return Ok(0),
            }
        }
    }
}
