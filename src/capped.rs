use std::io;
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::AsyncWrite;

/// Maximum number of bytes captured from any sandboxed stream.
pub const MAX_CAPTURE_SIZE: u64 = 1024 * 1024;

/// A writer that silently drops everything past a byte budget.
///
/// Untrusted programs may produce unbounded output. The wrapper always
/// reports the full caller-provided length as written so the producer does
/// not stall on a short write, but only the first `remaining` bytes ever
/// reach the underlying sink.
pub struct CappedWriter<W> {
    inner: W,
    remaining: u64,
}

impl<W> CappedWriter<W> {
    pub fn new(inner: W, limit: u64) -> Self {
        Self {
            inner,
            remaining: limit,
        }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for CappedWriter<W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let me = &mut *self;
        let take = (me.remaining as usize).min(buf.len());
        if take == 0 {
            // Budget exhausted: swallow the chunk but claim success.
            return Poll::Ready(Ok(buf.len()));
        }
        match Pin::new(&mut me.inner).poll_write(cx, &buf[..take]) {
            Poll::Ready(Ok(n)) => {
                me.remaining -= n as u64;
                if n == take {
                    Poll::Ready(Ok(buf.len()))
                } else {
                    Poll::Ready(Ok(n))
                }
            }
            other => other,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Reads a captured file, eliding the middle of oversized content.
///
/// Files above [`MAX_CAPTURE_SIZE`] keep their first and last quarter with a
/// marker stating how many bytes were skipped, so failure reports stay
/// renderable no matter what the submission printed.
pub fn read_capped(path: impl AsRef<Path>) -> io::Result<Vec<u8>> {
    let content = std::fs::read(path)?;
    Ok(elide_middle(content))
}

pub fn read_capped_to_string(path: impl AsRef<Path>) -> io::Result<String> {
    read_capped(path).map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
}

fn elide_middle(content: Vec<u8>) -> Vec<u8> {
    let max = MAX_CAPTURE_SIZE as usize;
    if content.len() <= max {
        return content;
    }
    let marker = format!(
        "\n... [Output too long, skipping {} bytes] ... \n",
        content.len() - max / 2
    );
    let mut elided = Vec::with_capacity(max / 2 + marker.len());
    elided.extend_from_slice(&content[..max / 4]);
    elided.extend_from_slice(marker.as_bytes());
    elided.extend_from_slice(&content[content.len() - max / 4..]);
    elided
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn reports_full_length_past_the_cap() {
        let mut writer = CappedWriter::new(Vec::new(), 4);
        let written = writer.write(b"abcdef").await.unwrap();
        assert_eq!(written, 6);
        let written = writer.write(b"ghi").await.unwrap();
        assert_eq!(written, 3);
        assert_eq!(writer.into_inner(), b"abcd");
    }

    #[tokio::test]
    async fn passes_small_writes_through() {
        let mut writer = CappedWriter::new(Vec::new(), 1024);
        writer.write_all(b"hello\n").await.unwrap();
        writer.write_all(b"world\n").await.unwrap();
        assert_eq!(writer.into_inner(), b"hello\nworld\n");
    }

    #[tokio::test]
    async fn sink_never_exceeds_the_cap() {
        let mut writer = CappedWriter::new(Vec::new(), 10);
        for _ in 0..100 {
            let written = writer.write(b"0123456789abcdef").await.unwrap();
            assert_eq!(written, 16);
        }
        assert_eq!(writer.into_inner().len(), 10);
    }

    #[test]
    fn elides_the_middle_of_oversized_content() {
        let max = MAX_CAPTURE_SIZE as usize;
        let content = vec![b'x'; max + 100];
        let elided = elide_middle(content);
        assert!(elided.len() < max);
        let text = String::from_utf8_lossy(&elided);
        assert!(text.contains("Output too long"));
        assert!(text.contains(&format!("skipping {} bytes", max + 100 - max / 2)));
    }

    #[test]
    fn keeps_small_content_untouched() {
        let content = b"short output".to_vec();
        assert_eq!(elide_middle(content.clone()), content);
    }
}
