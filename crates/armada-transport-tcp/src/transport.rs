use armada_core::error::TransportError;
use armada_core::traits::FramedTransport;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::config::TcpConfig;

/// One frame is one JSON object terminated by `\n`. The newline is the
/// frame delimiter and never appears inside a compactly encoded object, so
/// no length prefix is needed.
pub struct TcpTransport {
    reader: Mutex<BufReader<ReadHalf<TcpStream>>>,
    writer: Mutex<WriteHalf<TcpStream>>,
    config: TcpConfig,
}

impl TcpTransport {
    #[must_use]
    pub fn new(stream: TcpStream) -> Self {
        Self::with_config(stream, TcpConfig::default())
    }

    #[must_use]
    pub fn with_config(stream: TcpStream, config: TcpConfig) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(BufReader::new(reader)),
            writer: Mutex::new(writer),
            config,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &TcpConfig {
        &self.config
    }
}

impl FramedTransport for TcpTransport {
    async fn send_frame(&self, frame: &[u8]) -> Result<(), TransportError> {
        if frame.len() > self.config.max_frame_size {
            return Err(TransportError::SendFailed(format!(
                "Frame size {} exceeds limit {}",
                frame.len(),
                self.config.max_frame_size
            )));
        }
        if frame.contains(&b'\n') {
            return Err(TransportError::SendFailed(
                "Frame contains the line delimiter".to_string(),
            ));
        }

        let mut writer = self.writer.lock().await;

        let write_future = async {
            writer.write_all(frame).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
            Ok::<(), std::io::Error>(())
        };

        if let Some(timeout) = self.config.write_timeout {
            tokio::time::timeout(timeout, write_future)
                .await
                .map_err(|_| TransportError::Timeout {
                    operation: "send_frame".to_string(),
                    duration: timeout,
                })?
                .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        } else {
            write_future
                .await
                .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        }

        Ok(())
    }

    async fn recv_frame(&self) -> Result<Vec<u8>, TransportError> {
        let mut reader = self.reader.lock().await;
        // One past the limit so an oversize line is distinguishable from a
        // line that is exactly at it.
        let limit = self.config.max_frame_size as u64 + 1;

        let read_future = async {
            let mut line = Vec::new();
            let mut limited = (&mut *reader).take(limit);
            let n = limited
                .read_until(b'\n', &mut line)
                .await
                .map_err(|e| TransportError::RecvFailed(e.to_string()))?;

            if n == 0 {
                return Err(TransportError::Closed);
            }
            if line.last() != Some(&b'\n') {
                if line.len() as u64 >= limit {
                    return Err(TransportError::RecvFailed(format!(
                        "Frame exceeds limit of {} bytes",
                        self.config.max_frame_size
                    )));
                }
                // EOF in the middle of a line.
                return Err(TransportError::Closed);
            }

            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            Ok(line)
        };

        if let Some(timeout) = self.config.read_timeout {
            tokio::time::timeout(timeout, read_future)
                .await
                .map_err(|_| TransportError::Timeout {
                    operation: "recv_frame".to_string(),
                    duration: timeout,
                })?
        } else {
            read_future.await
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        writer
            .shutdown()
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
