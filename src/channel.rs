// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::error::{PoolError, Result};
use crate::task::{Task, WireMessage};

/// Default cap on a single frame's declared length (spec.md §4.2).
pub const MAX_FRAME_BYTES: u64 = 1 << 30;

/// The write half of a duplex message transport. Split from [`ChannelRx`]
/// so a `Context`'s sends (triggered by `Worker::enqueue`) and its one
/// outstanding receive (driven by the worker's receive loop) are two
/// independently-owned objects rather than one object requiring `&mut
/// self` from two call sites — see DESIGN.md for why this departs from a
/// single combined `Channel` type.
#[async_trait::async_trait]
pub trait ChannelTx<T: Task>: Send {
    async fn send(&mut self, msg: WireMessage<T>) -> Result<()>;
}

/// The read half of a duplex message transport. A `recv` reads exactly
/// one frame.
#[async_trait::async_trait]
pub trait ChannelRx<T: Task>: Send {
    async fn recv(&mut self) -> Result<WireMessage<T>>;
}

/// Length-prefixed framing over an `AsyncWrite`: an 8-byte big-endian
/// length prefix, then that many bytes of `bincode`-serialized payload.
/// One frame is written atomically (prefix + payload) per `send`.
pub struct PipeTx<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin + Send> PipeTx<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

#[async_trait::async_trait]
impl<W: AsyncWrite + Unpin + Send, T: Task> ChannelTx<T> for PipeTx<W> {
    async fn send(&mut self, msg: WireMessage<T>) -> Result<()> {
        let payload = bincode::serialize(&msg)?;
        let len = payload.len() as u64;
        self.writer
            .write_all(&len.to_be_bytes())
            .await
            .map_err(PoolError::from)?;
        self.writer.write_all(&payload).await.map_err(PoolError::from)?;
        self.writer.flush().await.map_err(PoolError::from)?;
        Ok(())
    }
}

/// Read half matching [`PipeTx`]'s framing.
pub struct PipeRx<R> {
    reader: R,
    max_frame_bytes: u64,
}

impl<R: AsyncRead + Unpin + Send> PipeRx<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            max_frame_bytes: MAX_FRAME_BYTES,
        }
    }

    pub fn with_max_frame_bytes(mut self, max: u64) -> Self {
        self.max_frame_bytes = max;
        self
    }
}

#[async_trait::async_trait]
impl<R: AsyncRead + Unpin + Send, T: Task> ChannelRx<T> for PipeRx<R> {
    async fn recv(&mut self) -> Result<WireMessage<T>> {
        let mut len_buf = [0u8; 8];
        self.reader.read_exact(&mut len_buf).await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::UnexpectedEof {
                PoolError::context("channel closed before a full frame was read")
            } else {
                PoolError::from(err)
            }
        })?;
        let len = u64::from_be_bytes(len_buf);
        if len > self.max_frame_bytes {
            return Err(PoolError::context(format!(
                "frame length {len} exceeds cap {}",
                self.max_frame_bytes
            )));
        }
        let mut payload = vec![0u8; len as usize];
        self.reader.read_exact(&mut payload).await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::UnexpectedEof {
                PoolError::context("short read: declared frame length exceeds available bytes")
            } else {
                PoolError::from(err)
            }
        })?;
        let msg = bincode::deserialize(&payload)?;
        Ok(msg)
    }
}

/// Builds a length-prefixed pipe channel pair from a duplex byte stream's
/// writer and reader halves, e.g. a child process's `(stdin, stdout)`.
pub fn pipe_channel<W, R>(writer: W, reader: R) -> (PipeTx<W>, PipeRx<R>)
where
    W: AsyncWrite + Unpin + Send,
    R: AsyncRead + Unpin + Send,
{
    (PipeTx::new(writer), PipeRx::new(reader))
}

/// In-process transport built from an `mpsc` queue: messages cross as
/// owned Rust values, no framing or serialization needed. Used by
/// thread-backed contexts.
pub struct MemoryTx<T: Task> {
    tx: mpsc::Sender<WireMessage<T>>,
}

#[async_trait::async_trait]
impl<T: Task> ChannelTx<T> for MemoryTx<T> {
    async fn send(&mut self, msg: WireMessage<T>) -> Result<()> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| PoolError::context("peer end of memory channel dropped"))
    }
}

pub struct MemoryRx<T: Task> {
    rx: mpsc::Receiver<WireMessage<T>>,
}

#[async_trait::async_trait]
impl<T: Task> ChannelRx<T> for MemoryRx<T> {
    async fn recv(&mut self) -> Result<WireMessage<T>> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| PoolError::context("peer end of memory channel dropped"))
    }
}

/// Builds two connected in-memory duplex ends: `(parent_half, child_half)`,
/// each a `(tx, rx)` pair.
pub fn memory_channel<T: Task>(
    buffer: usize,
) -> ((MemoryTx<T>, MemoryRx<T>), (MemoryTx<T>, MemoryRx<T>)) {
    let (tx_a, rx_b) = mpsc::channel(buffer);
    let (tx_b, rx_a) = mpsc::channel(buffer);
    (
        (MemoryTx { tx: tx_a }, MemoryRx { rx: rx_a }),
        (MemoryTx { tx: tx_b }, MemoryRx { rx: rx_b }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::Environment;
    use crate::error::TaskFailure;
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, Serialize, Deserialize)]
    struct Echo(String);

    impl Task for Echo {
        type Output = String;

        fn run(&self, _env: &Environment) -> Result<String, TaskFailure> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn pipe_channel_round_trips_a_job() {
        let (client_write, server_read) = tokio::io::duplex(4096);
        let (server_write, client_read) = tokio::io::duplex(4096);

        let (mut client_tx, _client_rx) = pipe_channel(client_write, client_read);
        let (_server_tx, mut server_rx) = pipe_channel(server_write, server_read);

        let job = crate::task::Job::new(Echo("hello".into()));
        let id = job.id;
        client_tx.send(WireMessage::Job(job)).await.unwrap();

        match server_rx.recv().await.unwrap() {
            WireMessage::Job(got) => {
                assert_eq!(got.id, id);
                assert_eq!(got.task.0, "hello");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn pipe_channel_rejects_oversized_frame() {
        let (mut raw_write, server_read) = tokio::io::duplex(4096);
        let mut server_rx: PipeRx<_> = PipeRx::new(server_read).with_max_frame_bytes(8);

        raw_write.write_all(&64u64.to_be_bytes()).await.unwrap();

        let result: Result<WireMessage<Echo>> = server_rx.recv().await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn memory_channel_round_trips_a_result() {
        let (mut parent, mut child) = memory_channel::<Echo>(8);
        let id = uuid::Uuid::new_v4();
        child
            .0
            .send(WireMessage::Result(crate::task::TaskResult::ok(
                id,
                "done".to_string(),
            )))
            .await
            .unwrap();
        match parent.1.recv().await.unwrap() {
            WireMessage::Result(r) => {
                assert_eq!(r.id, id);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
