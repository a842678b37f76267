// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Hidden `lodge netcat <socket>`.
//!
//! rsync runs this as its remote shell. Stdin goes to the unix socket the
//! migrating daemon listens on, and the socket's output goes to stdout.
//! Nothing else may be written to stdout.

use anyhow::{Context, Result};
use std::path::Path;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;

pub async fn run(socket: &Path) -> Result<()> {
    let stream = UnixStream::connect(socket)
        .await
        .with_context(|| format!("Failed to connect to {:?}", socket))?;
    relay(stream, tokio::io::stdin(), tokio::io::stdout()).await
}

/// Ends when the socket side closes; stdin may stay open forever.
async fn relay<S, R, W>(stream: S, mut input: R, mut output: W) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let upload = tokio::spawn(async move {
        tokio::io::copy(&mut input, &mut writer).await?;
        writer.shutdown().await
    });

    tokio::io::copy(&mut reader, &mut output)
        .await
        .context("Failed to copy socket to stdout")?;
    output.flush().await?;
    upload.abort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_relay_copies_both_ways() {
        let (ours, theirs) = tokio::io::duplex(1024);
        let (stdin_src, mut stdin_feed) = tokio::io::duplex(1024);
        let (stdout_sink, mut stdout_read) = tokio::io::duplex(1024);

        let relayed = tokio::spawn(relay(ours, stdin_src, stdout_sink));

        stdin_feed.write_all(b"request").await.unwrap();
        let (mut peer_read, mut peer_write) = tokio::io::split(theirs);
        let mut buf = [0u8; 7];
        peer_read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"request");

        peer_write.write_all(b"reply").await.unwrap();
        peer_write.shutdown().await.unwrap();
        drop(peer_write);
        drop(peer_read);

        relayed.await.unwrap().unwrap();
        let mut out = Vec::new();
        stdout_read.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"reply");
    }
}
