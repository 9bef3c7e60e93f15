/// Capturing passthrough sink: forwards every write to a destination stream
/// while keeping a private copy of everything seen.
use tokio::io::{AsyncWrite, AsyncWriteExt};

pub struct CaptureSink<W> {
    buf: Vec<u8>,
    dest: W,
}

impl<W: AsyncWrite + Unpin> CaptureSink<W> {
    pub fn new(dest: W) -> Self {
        Self {
            buf: Vec::new(),
            dest,
        }
    }

    /// Append `bytes` to the private buffer, then forward them to the destination.
    ///
    /// The bytes are retained even when forwarding fails, so a broken terminal
    /// never costs us the captured output.
    pub async fn write(&mut self, bytes: &[u8]) -> std::io::Result<usize> {
        self.buf.extend_from_slice(bytes);
        self.dest.write_all(bytes).await?;
        Ok(bytes.len())
    }

    pub async fn flush(&mut self) -> std::io::Result<()> {
        self.dest.flush().await
    }
}

impl<W> CaptureSink<W> {
    /// Everything written so far, in order.
    pub fn snapshot(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Split into the captured bytes and the destination.
    pub fn into_parts(self) -> (Vec<u8>, W) {
        (self.buf, self.dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    /// Destination that rejects every write.
    struct BrokenPipe;

    impl AsyncWrite for BrokenPipe {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Poll::Ready(Err(std::io::Error::from(std::io::ErrorKind::BrokenPipe)))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_write_forwards_and_captures() {
        let mut sink = CaptureSink::new(Vec::new());
        let n = sink.write(b"hello\n").await.unwrap();
        assert_eq!(n, 6);
        assert_eq!(sink.snapshot(), b"hello\n");

        let (captured, forwarded) = sink.into_parts();
        assert_eq!(captured, b"hello\n");
        assert_eq!(forwarded, b"hello\n");
    }

    #[tokio::test]
    async fn test_writes_keep_order() {
        let mut sink = CaptureSink::new(Vec::new());
        sink.write(b"one ").await.unwrap();
        sink.write(b"two ").await.unwrap();
        sink.write(b"three").await.unwrap();
        assert_eq!(sink.len(), 13);

        let (captured, forwarded) = sink.into_parts();
        assert_eq!(captured, b"one two three");
        assert_eq!(captured, forwarded);
    }

    #[tokio::test]
    async fn test_empty_write_is_noop() {
        let mut sink = CaptureSink::new(Vec::new());
        assert_eq!(sink.write(b"").await.unwrap(), 0);
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_forwarding_failure_still_captures() {
        let mut sink = CaptureSink::new(BrokenPipe);
        let err = sink.write(b"kept").await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::BrokenPipe);
        assert_eq!(sink.snapshot(), b"kept");

        // Later writes keep accumulating after a failure.
        let _ = sink.write(b" anyway").await;
        assert_eq!(sink.snapshot(), b"kept anyway");
    }

    #[tokio::test]
    async fn test_large_write_is_not_truncated() {
        let data = vec![b'a'; 1024 * 1024];
        let mut sink = CaptureSink::new(Vec::new());
        for chunk in data.chunks(8192) {
            sink.write(chunk).await.unwrap();
        }
        let (captured, forwarded) = sink.into_parts();
        assert_eq!(captured.len(), 1024 * 1024);
        assert_eq!(captured, data);
        assert_eq!(forwarded, data);
    }
}
