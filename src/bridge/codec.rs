//! Message framing over a byte stream: one JSON document per line, or
//! `Content-Length` headers followed by the body.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::AppError;

/// Frames larger than this are treated as a broken stream.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Framing {
    #[default]
    Lines,
    ContentLength,
}

fn transport(message: impl Into<String>) -> AppError {
    AppError::Transport {
        message: message.into(),
    }
}

pub struct FrameReader<R> {
    inner: R,
    framing: Framing,
    buf: Vec<u8>,
    max_frame: usize,
}

impl<R: AsyncBufRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, framing: Framing) -> Self {
        Self {
            inner,
            framing,
            buf: Vec::new(),
            max_frame: MAX_FRAME_BYTES,
        }
    }

    #[must_use]
    pub fn with_max_frame(mut self, max_frame: usize) -> Self {
        self.max_frame = max_frame;
        self
    }

    /// Next frame body, or `None` at end of stream. Not cancel-safe.
    pub async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, AppError> {
        match self.framing {
            Framing::Lines => self.read_line_frame().await,
            Framing::ContentLength => self.read_length_frame().await,
        }
    }

    /// Read one line into `buf`, never buffering more than the frame limit.
    async fn read_bounded_line(&mut self) -> Result<usize, AppError> {
        self.buf.clear();
        let limit = u64::try_from(self.max_frame).unwrap_or(u64::MAX).saturating_add(1);
        let n = (&mut self.inner)
            .take(limit)
            .read_until(b'\n', &mut self.buf)
            .await
            .map_err(|e| transport(format!("read failed: {e}")))?;
        if self.buf.len() > self.max_frame && !self.buf.ends_with(b"\n") {
            return Err(transport(format!("frame exceeds {} bytes", self.max_frame)));
        }
        Ok(n)
    }

    async fn read_line_frame(&mut self) -> Result<Option<Vec<u8>>, AppError> {
        loop {
            if self.read_bounded_line().await? == 0 {
                return Ok(None);
            }
            let body = self.buf.trim_ascii();
            if !body.is_empty() {
                return Ok(Some(body.to_vec()));
            }
        }
    }

    async fn read_length_frame(&mut self) -> Result<Option<Vec<u8>>, AppError> {
        let mut content_length: Option<usize> = None;
        let mut saw_header = false;
        loop {
            if self.read_bounded_line().await? == 0 {
                if saw_header {
                    return Err(transport("stream ended inside frame headers"));
                }
                return Ok(None);
            }
            let line = String::from_utf8_lossy(&self.buf);
            let line = line.trim();
            if line.is_empty() {
                if saw_header {
                    break;
                }
                continue;
            }
            saw_header = true;
            if let Some((name, value)) = line.split_once(':') {
                if name.trim().eq_ignore_ascii_case("content-length") {
                    content_length = Some(
                        value
                            .trim()
                            .parse()
                            .map_err(|_| transport(format!("bad Content-Length: {}", value.trim())))?,
                    );
                }
            }
        }

        let length = content_length.ok_or_else(|| transport("missing Content-Length"))?;
        if length > self.max_frame {
            return Err(transport(format!("frame exceeds {} bytes", self.max_frame)));
        }
        let mut body = vec![0u8; length];
        self.inner
            .read_exact(&mut body)
            .await
            .map_err(|e| transport(format!("truncated frame: {e}")))?;
        Ok(Some(body))
    }
}

pub struct FrameWriter<W> {
    inner: W,
    framing: Framing,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W, framing: Framing) -> Self {
        Self { inner, framing }
    }

    pub async fn write_frame(&mut self, body: &str) -> Result<(), AppError> {
        let framed = match self.framing {
            Framing::Lines => format!("{body}\n"),
            Framing::ContentLength => format!("Content-Length: {}\r\n\r\n{body}", body.len()),
        };
        self.inner
            .write_all(framed.as_bytes())
            .await
            .map_err(|e| transport(format!("write failed: {e}")))?;
        self.inner
            .flush()
            .await
            .map_err(|e| transport(format!("flush failed: {e}")))
    }

    pub async fn shutdown(&mut self) {
        let _ = self.inner.shutdown().await;
    }
}
