// SPDX-FileCopyrightText: 2024 Sven Wiltink
// SPDX-License-Identifier: GPL-3.0-only

//! Bounded handoff between a producer thread and a pull-based consumer.
//!
//! [`pipe`] returns a connected [`PipeWriter`] and [`PipeReader`] backed by a
//! bounded channel. Errors travel in both directions: the producer can close
//! the pipe with an error that the consumer receives from [`Read::read`], and
//! a consumer that goes away makes the next write fail with
//! [`io::ErrorKind::BrokenPipe`].

use std::{
    io::{self, Read, Write},
    sync::mpsc::{self, Receiver, SyncSender},
    thread::{self, JoinHandle},
};

use tracing::debug;

use crate::util::NumBytes;

/// Size of the chunks sent by [`spawn_producer`].
pub const CHUNK_SIZE: usize = 256 * 1024;

enum Message {
    Data(Vec<u8>),
    Error(io::Error),
    Eof,
}

/// Create a pipe that allows up to `depth` chunks to be in flight. With a
/// depth of 0, every write blocks until the reader receives it.
pub fn pipe(depth: usize) -> (PipeWriter, PipeReader) {
    let (sender, receiver) = mpsc::sync_channel(depth);

    let writer = PipeWriter { sender };
    let reader = PipeReader {
        receiver,
        chunk: Vec::new(),
        pos: 0,
        state: ReaderState::Open,
    };

    (writer, reader)
}

fn broken_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "Pipe reader was dropped")
}

/// Producer half of a [`pipe`]. The writer must be finished with
/// [`PipeWriter::close`] or [`PipeWriter::close_with_error`]. Dropping it
/// otherwise is reported to the reader as an error.
#[derive(Debug)]
pub struct PipeWriter {
    sender: SyncSender<Message>,
}

impl PipeWriter {
    /// Send an owned chunk without copying it. Empty chunks are ignored.
    pub fn send_chunk(&mut self, chunk: Vec<u8>) -> io::Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }

        self.sender
            .send(Message::Data(chunk))
            .map_err(|_| broken_pipe())
    }

    /// Signal a successful end of the stream.
    pub fn close(self) -> io::Result<()> {
        self.sender.send(Message::Eof).map_err(|_| broken_pipe())
    }

    /// Abort the stream. The reader receives `error` after all chunks that
    /// were sent before it.
    pub fn close_with_error(self, error: io::Error) {
        // Nobody to report to if the reader is gone.
        let _ = self.sender.send(Message::Error(error));
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.send_chunk(buf.to_vec())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ReaderState {
    Open,
    Eof,
    Failed,
}

/// Consumer half of a [`pipe`].
#[derive(Debug)]
pub struct PipeReader {
    receiver: Receiver<Message>,
    chunk: Vec<u8>,
    pos: usize,
    state: ReaderState,
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        while self.pos == self.chunk.len() {
            match self.state {
                ReaderState::Open => {}
                ReaderState::Eof => return Ok(0),
                ReaderState::Failed => {
                    return Err(io::Error::other("Pipe was closed with an error"));
                }
            }

            match self.receiver.recv() {
                Ok(Message::Data(chunk)) => {
                    self.chunk = chunk;
                    self.pos = 0;
                }
                Ok(Message::Eof) => self.state = ReaderState::Eof,
                Ok(Message::Error(e)) => {
                    self.state = ReaderState::Failed;
                    return Err(e);
                }
                Err(_) => {
                    self.state = ReaderState::Failed;
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "Pipe writer was dropped without closing",
                    ));
                }
            }
        }

        let n = (self.chunk.len() - self.pos).min(buf.len());
        buf[..n].copy_from_slice(&self.chunk[self.pos..self.pos + n]);
        self.pos += n;

        Ok(n)
    }
}

/// Pump everything from `reader` into `writer` in [`CHUNK_SIZE`] chunks.
fn pump(mut reader: impl Read, writer: &mut PipeWriter) -> io::Result<u64> {
    let mut total = 0;

    loop {
        let mut chunk = vec![0u8; CHUNK_SIZE];

        let n = match reader.read(&mut chunk) {
            Ok(0) => return Ok(total),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };

        chunk.truncate(n);
        writer.send_chunk(chunk)?;

        total += n as u64;
    }
}

/// Run `reader` (typically an [`crate::encoder::Encoder`]) on a dedicated
/// thread, returning a [`PipeReader`] that yields the same bytes. If the
/// returned reader is dropped, the producer stops at its next write. Joining
/// the thread hands `reader` back.
pub fn spawn_producer<R: Read + Send + 'static>(
    mut reader: R,
    depth: usize,
) -> io::Result<(PipeReader, JoinHandle<R>)> {
    let (mut writer, pipe_reader) = pipe(depth);

    let handle = thread::Builder::new()
        .name("producer".to_owned())
        .spawn(move || {
            match pump(&mut reader, &mut writer) {
                Ok(n) => {
                    debug!("Producer finished after {}", NumBytes(n));
                    // Fails only if the reader is already gone.
                    let _ = writer.close();
                }
                Err(e) => {
                    debug!("Producer failed: {e}");
                    writer.close_with_error(e);
                }
            }

            reader
        })?;

    Ok((pipe_reader, handle))
}
