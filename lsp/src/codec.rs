//! Base-protocol framing for worker communication.
//!
//! Every message travels as `Content-Length: N\r\n\r\n{json}` over the byte
//! channel. This module provides [`FrameReader`] and [`FrameWriter`], which
//! move opaque frame bodies; they never look inside the JSON.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::transport::ChannelError;

/// Maximum frame size (4 MiB) to prevent unbounded memory allocation.
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Reads frames from an async reader.
///
/// Parses `Content-Length` headers and reads exactly that many bytes.
pub struct FrameReader<R> {
    reader: BufReader<R>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
        }
    }

    /// Read the next frame body.
    ///
    /// Returns `Ok(None)` on EOF between frames (clean end of stream).
    /// EOF inside a frame is [`ChannelError::PeerClosed`]; malformed headers
    /// and oversized frames are faults because the stream cannot be resynced.
    pub async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, ChannelError> {
        let content_length = match self.read_headers().await? {
            Some(len) => len,
            None => return Ok(None),
        };

        if content_length > MAX_FRAME_BYTES {
            return Err(ChannelError::TooLarge {
                len: content_length,
                max: MAX_FRAME_BYTES,
            });
        }

        let mut body = vec![0u8; content_length];
        self.reader
            .read_exact(&mut body)
            .await
            .map_err(ChannelError::from_read)?;

        Ok(Some(body))
    }

    /// Parse headers until the empty line separator.
    ///
    /// Returns the `Content-Length` value, or `None` on EOF.
    async fn read_headers(&mut self) -> Result<Option<usize>, ChannelError> {
        let mut content_length: Option<usize> = None;
        let mut line = String::new();
        let mut saw_any_header_bytes = false;

        loop {
            line.clear();
            let bytes_read = self
                .reader
                .read_line(&mut line)
                .await
                .map_err(ChannelError::from_read)?;

            if bytes_read == 0 {
                // Only a clean end of stream if no header byte was consumed.
                if !saw_any_header_bytes {
                    return Ok(None);
                }
                return Err(ChannelError::PeerClosed);
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                // Tolerate stray blank lines before a header block.
                if !saw_any_header_bytes {
                    continue;
                }
                break;
            }
            saw_any_header_bytes = true;

            let Some((key, value)) = trimmed.split_once(':') else {
                return Err(ChannelError::Header(format!(
                    "header line without a colon: {trimmed:?}"
                )));
            };
            if key.trim().eq_ignore_ascii_case("Content-Length") {
                let len = value.trim().parse::<usize>().map_err(|e| {
                    ChannelError::Header(format!("invalid Content-Length value: {e}"))
                })?;
                content_length = Some(len);
            }
            // Other headers (e.g. Content-Type) carry nothing we act on.
        }

        match content_length {
            Some(len) => Ok(Some(len)),
            None => Err(ChannelError::Header(
                "missing Content-Length header".to_string(),
            )),
        }
    }
}

/// Writes frames to an async writer.
///
/// Prepends the `Content-Length` header (and `Content-Type`, when set).
pub struct FrameWriter<W> {
    writer: W,
    content_type: Option<String>,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            content_type: None,
        }
    }

    /// Also emit a `Content-Type` header on every frame.
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Write one frame and flush it.
    pub async fn write_frame(&mut self, body: &[u8]) -> Result<(), ChannelError> {
        let mut header = format!("Content-Length: {}\r\n", body.len());
        if let Some(content_type) = &self.content_type {
            header.push_str(&format!("Content-Type: {content_type}\r\n"));
        }
        header.push_str("\r\n");

        self.writer.write_all(header.as_bytes()).await?;
        self.writer.write_all(body).await?;
        self.writer.flush().await?;

        Ok(())
    }

    /// Close the write half so the peer observes end of stream.
    pub async fn shutdown(&mut self) -> Result<(), ChannelError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}
