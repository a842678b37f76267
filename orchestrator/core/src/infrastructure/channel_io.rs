// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Byte pumps between channels and async readers/writers.
//!
//! Channels are message oriented. These helpers turn a byte stream (process
//! stdio, a unix socket) into binary frames and back, honouring the channel's
//! cancellation token.

use crate::domain::channel::{ChannelConn, ChannelError, ChannelSink, ChannelStream};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

const CHUNK_SIZE: usize = 32 * 1024;

fn io_error(e: std::io::Error) -> ChannelError {
    ChannelError::Transport(e.to_string())
}

/// Copy `reader` into `sink` as binary frames, closing the sink at EOF.
pub async fn copy_reader_to_sink<R>(
    mut reader: R,
    sink: &mut ChannelSink,
    cancel: &CancellationToken,
    name: &str,
) -> Result<u64, ChannelError>
where
    R: AsyncRead + Unpin,
{
    let mut total = 0u64;
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => return Err(ChannelError::Cancelled(name.to_string())),
            n = reader.read(&mut buf) => n.map_err(io_error)?,
        };
        if n == 0 {
            break;
        }
        total += n as u64;
        let frame = Bytes::copy_from_slice(&buf[..n]);
        tokio::select! {
            _ = cancel.cancelled() => return Err(ChannelError::Cancelled(name.to_string())),
            res = sink.send(frame) => res?,
        }
    }
    sink.close().await?;
    Ok(total)
}

/// Copy frames from `stream` into `writer` until the peer closes, then shut
/// the writer down.
pub async fn copy_stream_to_writer<W>(
    stream: &mut ChannelStream,
    mut writer: W,
    cancel: &CancellationToken,
    name: &str,
) -> Result<u64, ChannelError>
where
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return Err(ChannelError::Cancelled(name.to_string())),
            frame = stream.next() => frame,
        };
        let Some(frame) = frame.transpose()? else {
            break;
        };
        total += frame.len() as u64;
        writer.write_all(&frame).await.map_err(io_error)?;
    }
    writer.flush().await.map_err(io_error)?;
    // The reading process may already be gone.
    let _ = writer.shutdown().await;
    Ok(total)
}

/// Full-duplex copy until both directions reach end-of-stream.
pub async fn bridge<R, W>(conn: &mut ChannelConn, reader: R, writer: W) -> Result<(), ChannelError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let name = conn.name().to_string();
    let (sink, stream, cancel) = conn.parts_mut();
    let cancel = cancel.clone();
    tokio::try_join!(
        copy_reader_to_sink(reader, sink, &cancel, &name),
        copy_stream_to_writer(stream, writer, &cancel, &name),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bridge_moves_bytes_both_ways() {
        let (mut local, mut remote) = ChannelConn::pair("fs", 8);

        // local side: a duplex pipe stands in for a process' stdio
        let (proc_end, bridge_end) = tokio::io::duplex(1024);
        let (bridge_read, bridge_write) = tokio::io::split(bridge_end);
        let bridge_task = tokio::spawn(async move {
            bridge(&mut local, bridge_read, bridge_write).await
        });

        let (mut proc_read, mut proc_write) = tokio::io::split(proc_end);
        proc_write.write_all(b"outbound").await.unwrap();
        proc_write.shutdown().await.unwrap();
        drop(proc_write);

        assert_eq!(remote.recv().await.unwrap(), Some(Bytes::from_static(b"outbound")));
        assert_eq!(remote.recv().await.unwrap(), None);

        remote.send(Bytes::from_static(b"inbound")).await.unwrap();
        remote.close().await.unwrap();

        let mut got = Vec::new();
        proc_read.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"inbound");

        bridge_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_cancel_stops_pump() {
        let (local, _remote) = ChannelConn::pair("fs", 1);
        let token = CancellationToken::new();
        let mut local = local.with_cancel(token.clone());
        let (_keep, reader) = tokio::io::duplex(16);
        let writer = tokio::io::sink();

        token.cancel();
        assert!(matches!(
            bridge(&mut local, reader, writer).await,
            Err(ChannelError::Cancelled(_))
        ));
    }
}
