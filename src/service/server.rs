//! Line-oriented server loop.

use std::future::Future;
use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{error, info};

use super::handler::WardenService;
use crate::error::Result;
use crate::ratelimit::CounterStore;

/// Reads commands line by line and writes one reply line per command.
pub struct LineServer<S: CounterStore> {
    service: Arc<WardenService<S>>,
}

impl<S: CounterStore> LineServer<S> {
    pub fn new(service: Arc<WardenService<S>>) -> Self {
        Self { service }
    }

    /// Serve until the input ends.
    pub async fn serve<R, W>(self, reader: R, writer: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        self.serve_with_shutdown(reader, writer, std::future::pending())
            .await
    }

    /// Serve until the input ends or `signal` resolves.
    ///
    /// A command already being handled when the signal fires is finished
    /// and its reply written before returning.
    pub async fn serve_with_shutdown<R, W, F>(self, reader: R, mut writer: W, signal: F) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
        F: Future<Output = ()>,
    {
        info!("Serving JSON-lines commands");

        let mut lines = reader.lines();
        tokio::pin!(signal);

        loop {
            let line = tokio::select! {
                _ = &mut signal => break,
                line = lines.next_line() => line.map_err(|e| {
                    error!(error = %e, "Failed to read command");
                    e
                })?,
            };
            let Some(line) = line else {
                info!("Input closed");
                break;
            };
            if line.trim().is_empty() {
                continue;
            }

            let reply = self.service.handle_line(&line).await;
            let mut encoded = serde_json::to_vec(&reply)?;
            encoded.push(b'\n');
            writer.write_all(&encoded).await?;
            writer.flush().await?;
        }

        writer.flush().await?;
        Ok(())
    }
}
