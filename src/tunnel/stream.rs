//! Cipher stream: frame codec + AEAD over one transport connection
//!
//! The reader and writer halves are cancellation safe. Ciphertext pulled
//! off the transport stays buffered in the reader until a whole frame is
//! available, and a sealed frame stays queued in the writer until every
//! byte reached the transport. Dropping an in-flight read or write future
//! therefore never leaves the byte stream misaligned.

use super::frame::{decode_body, decode_header, sealed_body_len, sealed_header_len};
use super::{Flags, Frame, FrameHeader, FrameType, TunnelError, MAX_PAYLOAD_SIZE};
use crate::crypto::Cipher;
use crate::transport::Reusable;
use bytes::{Buf, Bytes, BytesMut};
use std::future::poll_fn;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf, ReadHalf, WriteHalf};
use tracing::{debug, trace};

/// Bytes pulled from the transport per read
const READ_CHUNK: usize = 8192;

/// Decrypting half of a cipher stream
pub struct CipherReader<R> {
    inner: R,
    cipher: Arc<Cipher>,
    /// Raw ciphertext not yet decoded
    inbuf: BytesMut,
    /// Header of the frame whose body is still in flight
    header: Option<FrameHeader>,
    /// Decoded data not yet handed to the caller
    plain: Bytes,
}

impl<R: AsyncRead + Unpin> CipherReader<R> {
    pub fn new(inner: R, cipher: Arc<Cipher>) -> Self {
        Self {
            inner,
            cipher,
            inbuf: BytesMut::with_capacity(READ_CHUNK),
            header: None,
            plain: Bytes::new(),
        }
    }

    /// Poll for the next complete frame
    ///
    /// A clean end of stream on a frame boundary yields
    /// [`TunnelError::ConnectionClosed`]; anywhere else it is an
    /// `UnexpectedEof` I/O error.
    pub fn poll_frame(&mut self, cx: &mut Context<'_>) -> Poll<Result<Frame, TunnelError>> {
        loop {
            match self.header {
                None => {
                    let need = sealed_header_len(&self.cipher);
                    if self.inbuf.len() >= need {
                        let header = decode_header(&self.cipher, &self.inbuf[..need])?;
                        self.inbuf.advance(need);
                        self.header = Some(header);
                        continue;
                    }
                }
                Some(header) => {
                    let need = sealed_body_len(&self.cipher, header.length);
                    if self.inbuf.len() >= need {
                        self.header = None;
                        let frame = decode_body(&self.cipher, &header, &self.inbuf[..need]);
                        self.inbuf.advance(need);
                        let frame = frame?;
                        trace!(
                            "Received frame type {:?} flags {:?} ({} bytes payload)",
                            frame.frame_type,
                            frame.flags,
                            frame.payload.len()
                        );
                        return Poll::Ready(Ok(frame));
                    }
                }
            }

            if ready!(self.poll_fill(cx))? == 0 {
                if self.inbuf.is_empty() && self.header.is_none() {
                    return Poll::Ready(Err(TunnelError::ConnectionClosed));
                }
                return Poll::Ready(Err(TunnelError::Io(io::ErrorKind::UnexpectedEof.into())));
            }
        }
    }

    /// Receive the next frame, whatever its type
    pub async fn read_frame(&mut self) -> Result<Frame, TunnelError> {
        poll_fn(|cx| self.poll_frame(cx)).await
    }

    /// Poll for session data
    ///
    /// Ping frames are consumed silently. FIN and ACK signals come back as
    /// [`TunnelError::FinReceived`] and [`TunnelError::AckReceived`].
    /// Leaves `buf` untouched at a clean end of stream.
    pub fn poll_read_data(
        &mut self,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<Result<(), TunnelError>> {
        loop {
            if !self.plain.is_empty() {
                let n = self.plain.len().min(buf.remaining());
                buf.put_slice(&self.plain[..n]);
                self.plain.advance(n);
                return Poll::Ready(Ok(()));
            }

            let frame = match ready!(self.poll_frame(cx)) {
                Ok(frame) => frame,
                Err(TunnelError::ConnectionClosed) => return Poll::Ready(Ok(())),
                Err(e) => return Poll::Ready(Err(e)),
            };

            match frame.frame_type {
                FrameType::Data => self.plain = frame.payload,
                FrameType::Ping => trace!("Ping consumed"),
                FrameType::Reset if frame.flags.contains(Flags::FIN) => {
                    return Poll::Ready(Err(TunnelError::FinReceived))
                }
                FrameType::Reset if frame.flags.contains(Flags::ACK) => {
                    return Poll::Ready(Err(TunnelError::AckReceived))
                }
                other => {
                    return Poll::Ready(Err(TunnelError::UnexpectedFrame(format!(
                        "{:?} with flags {:?}",
                        other, frame.flags
                    ))))
                }
            }
        }
    }

    /// Read session data into `buf`, returning 0 at a clean end of stream
    ///
    /// One call returns at most the remainder of one frame; the rest of a
    /// frame is kept for the next call.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TunnelError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut read_buf = ReadBuf::new(buf);
        poll_fn(|cx| self.poll_read_data(cx, &mut read_buf)).await?;
        Ok(read_buf.filled().len())
    }

    /// Drop decoded data that was not handed out yet
    pub fn discard_buffered(&mut self) -> usize {
        let n = self.plain.len();
        self.plain = Bytes::new();
        n
    }

    /// True when bytes beyond the last complete frame were pulled off the wire
    pub fn has_buffered_ciphertext(&self) -> bool {
        !self.inbuf.is_empty() || self.header.is_some()
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    fn poll_fill(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<usize>> {
        let mut chunk = [0u8; READ_CHUNK];
        let mut read_buf = ReadBuf::new(&mut chunk);
        ready!(Pin::new(&mut self.inner).poll_read(cx, &mut read_buf))?;
        let filled = read_buf.filled();
        self.inbuf.extend_from_slice(filled);
        Poll::Ready(Ok(filled.len()))
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for CipherReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.get_mut().poll_read_data(cx, buf).map_err(io::Error::from)
    }
}

/// Encrypting half of a cipher stream
pub struct CipherWriter<W> {
    inner: W,
    cipher: Arc<Cipher>,
    /// Protocol flag stamped on every data frame
    protocol: Flags,
    /// Sealed bytes not yet accepted by the transport
    pending: BytesMut,
}

impl<W: AsyncWrite + Unpin> CipherWriter<W> {
    pub fn new(inner: W, cipher: Arc<Cipher>, protocol: Flags) -> Self {
        Self {
            inner,
            cipher,
            protocol,
            pending: BytesMut::new(),
        }
    }

    pub fn protocol(&self) -> Flags {
        self.protocol
    }

    pub fn set_protocol(&mut self, protocol: Flags) {
        self.protocol = protocol;
    }

    /// Seal `frame` into the outgoing queue without touching the transport
    pub fn queue_frame(&mut self, frame: &Frame) -> Result<(), TunnelError> {
        frame.encode_into(&self.cipher, &mut self.pending)?;
        trace!(
            "Queued frame type {:?} flags {:?} ({} bytes pending)",
            frame.frame_type,
            frame.flags,
            self.pending.len()
        );
        Ok(())
    }

    /// Push queued bytes to the transport
    pub fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.pending.is_empty() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.pending))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.pending.advance(n);
        }
        Poll::Ready(Ok(()))
    }

    /// Write one frame and flush the transport
    ///
    /// Sealing failures come back as [`TunnelError::Encrypt`], transport
    /// failures as [`TunnelError::Io`].
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), TunnelError> {
        poll_fn(|cx| self.poll_drain(cx)).await?;
        self.queue_frame(frame)?;
        poll_fn(|cx| self.poll_drain(cx)).await?;
        poll_fn(|cx| Pin::new(&mut self.inner).poll_flush(cx)).await?;
        Ok(())
    }

    /// Write session data as one or more data frames
    pub async fn write(&mut self, data: &[u8]) -> Result<usize, TunnelError> {
        for chunk in data.chunks(MAX_PAYLOAD_SIZE) {
            let frame = Frame::data(self.protocol, Bytes::copy_from_slice(chunk));
            self.write_frame(&frame).await?;
        }
        Ok(data.len())
    }

    /// True when part of a sealed frame has not reached the transport yet
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for CipherWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let n = buf.len().min(MAX_PAYLOAD_SIZE);
        let frame = Frame::data(this.protocol, Bytes::copy_from_slice(&buf[..n]));
        this.queue_frame(&frame).map_err(io::Error::from)?;

        // The frame is accepted; remaining bytes go out on the next call or flush
        if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

/// Encrypted, framed session stream over one transport connection
///
/// Usable as a plain `AsyncRead + AsyncWrite` byte stream; the framing,
/// padding and close signalling stay invisible to callers.
pub struct CipherStream<T> {
    reader: CipherReader<ReadHalf<T>>,
    writer: CipherWriter<WriteHalf<T>>,
    unusable: AtomicBool,
}

impl<T> CipherStream<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap `transport` for a session of the given protocol (`Flags::TCP`,
    /// `Flags::UDP` or `Flags::ICMP`)
    pub fn new(transport: T, cipher: Arc<Cipher>, protocol: Flags) -> Self {
        let (read_half, write_half) = tokio::io::split(transport);
        Self {
            reader: CipherReader::new(read_half, Arc::clone(&cipher)),
            writer: CipherWriter::new(write_half, cipher, protocol),
            unusable: AtomicBool::new(false),
        }
    }

    pub fn protocol(&self) -> Flags {
        self.writer.protocol()
    }

    /// Switch the protocol flag for the next session on this connection
    pub fn set_protocol(&mut self, protocol: Flags) {
        self.writer.set_protocol(protocol);
    }

    /// Borrow both halves at once for concurrent reading and writing
    pub fn halves(&mut self) -> (&mut CipherReader<ReadHalf<T>>, &mut CipherWriter<WriteHalf<T>>) {
        (&mut self.reader, &mut self.writer)
    }

    pub async fn read_frame(&mut self) -> Result<Frame, TunnelError> {
        self.reader.read_frame().await
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TunnelError> {
        self.reader.read(buf).await
    }

    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), TunnelError> {
        self.writer.write_frame(frame).await
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<usize, TunnelError> {
        self.writer.write(data).await
    }

    /// Send a liveness probe; the peer consumes it silently
    pub async fn ping(&mut self) -> Result<(), TunnelError> {
        self.writer.write_frame(&Frame::ping()).await
    }

    /// Hand the transport connection back
    ///
    /// The connection is flagged unusable when this stream was, or when
    /// frame bytes are still buffered on either side.
    pub fn into_inner(self) -> T
    where
        T: Reusable,
    {
        if self.reader.has_buffered_ciphertext() || self.writer.has_pending() {
            debug!("Transport returned with unframed bytes in flight");
            self.mark_unusable();
        }

        let unusable = self.is_unusable();
        let transport = self.reader.into_inner().unsplit(self.writer.into_inner());
        if unusable {
            transport.mark_unusable();
        }
        transport
    }
}

impl<T> Reusable for CipherStream<T> {
    fn mark_unusable(&self) {
        if !self.unusable.swap(true, Ordering::AcqRel) {
            debug!("Cipher stream marked unusable");
        }
    }

    fn is_unusable(&self) -> bool {
        self.unusable.load(Ordering::Acquire)
    }
}

impl<T> AsyncRead for CipherStream<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().reader).poll_read(cx, buf)
    }
}

impl<T> AsyncWrite for CipherStream<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().writer).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().writer).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().writer).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Method;
    use crate::transport::PooledConnection;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    fn cipher(method: Method) -> Arc<Cipher> {
        Arc::new(Cipher::from_password(method, "stream-test").unwrap())
    }

    #[tokio::test]
    async fn test_hello_world() {
        let cipher = cipher(Method::Aes256Gcm);
        let (a, b) = duplex(64 * 1024);
        let mut client = CipherStream::new(a, Arc::clone(&cipher), Flags::TCP);
        let mut server = CipherStream::new(b, cipher, Flags::TCP);

        client.write(b"Hello world!").await.unwrap();

        let mut buf = [0u8; 64];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(n, 12);
        assert_eq!(&buf[..n], b"Hello world!");
    }

    #[tokio::test]
    async fn test_short_reads_keep_remainder() {
        let cipher = cipher(Method::ChaCha20Poly1305);
        let (a, b) = duplex(64 * 1024);
        let mut client = CipherStream::new(a, Arc::clone(&cipher), Flags::TCP);
        let mut server = CipherStream::new(b, cipher, Flags::TCP);

        let payload: Vec<u8> = (0..200u8).collect();
        client.write(&payload).await.unwrap();

        let mut received = Vec::new();
        let mut buf = [0u8; 7];
        while received.len() < payload.len() {
            let n = server.read(&mut buf).await.unwrap();
            assert!(n > 0 && n <= 7);
            received.extend_from_slice(&buf[..n]);
        }
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn test_signals_and_ping() {
        let cipher = cipher(Method::Aes256Gcm);
        let (a, b) = duplex(64 * 1024);
        let mut client = CipherStream::new(a, Arc::clone(&cipher), Flags::TCP);
        let mut server = CipherStream::new(b, cipher, Flags::TCP);

        client.ping().await.unwrap();
        client.write(b"data").await.unwrap();
        client.write_frame(&Frame::fin()).await.unwrap();
        client.write_frame(&Frame::ack()).await.unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(server.read(&mut buf).await.unwrap(), 4);
        assert!(matches!(
            server.read(&mut buf).await,
            Err(TunnelError::FinReceived)
        ));
        assert!(matches!(
            server.read(&mut buf).await,
            Err(TunnelError::AckReceived)
        ));
    }

    #[tokio::test]
    async fn test_async_read_write_traits() {
        let cipher = cipher(Method::Aes256Gcm);
        let (a, b) = duplex(1024);
        let mut client = CipherStream::new(a, Arc::clone(&cipher), Flags::TCP);
        let mut server = CipherStream::new(b, cipher, Flags::TCP);

        let payload = vec![0x5au8; 100_000];
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            client.write_all(&payload).await.unwrap();
            client.flush().await.unwrap();
            client.shutdown().await.unwrap();
        });

        let mut received = Vec::new();
        server.read_to_end(&mut received).await.unwrap();
        writer.await.unwrap();
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_large_write_is_split() {
        let cipher = cipher(Method::Aes256Gcm);
        let (a, b) = duplex(256 * 1024);
        let mut client = CipherStream::new(a, Arc::clone(&cipher), Flags::UDP);
        let mut server = CipherStream::new(b, cipher, Flags::UDP);

        let payload = vec![1u8; MAX_PAYLOAD_SIZE * 2 + 10];
        client.write(&payload).await.unwrap();

        let sizes = [MAX_PAYLOAD_SIZE, MAX_PAYLOAD_SIZE, 10];
        for size in sizes {
            let frame = server.read_frame().await.unwrap();
            assert_eq!(frame.frame_type, FrameType::Data);
            assert!(frame.flags.contains(Flags::UDP));
            assert_eq!(frame.payload.len(), size);
        }
    }

    #[tokio::test]
    async fn test_wrong_password_fails_authentication() {
        let (a, b) = duplex(64 * 1024);
        let mut client = CipherStream::new(
            a,
            Arc::new(Cipher::from_password(Method::Aes256Gcm, "one").unwrap()),
            Flags::TCP,
        );
        let mut server = CipherStream::new(
            b,
            Arc::new(Cipher::from_password(Method::Aes256Gcm, "two").unwrap()),
            Flags::TCP,
        );

        client.write(b"secret").await.unwrap();
        let mut buf = [0u8; 16];
        let err = server.read(&mut buf).await.unwrap_err();
        assert!(err.is_crypto());
    }

    #[tokio::test]
    async fn test_clean_eof() {
        let cipher = cipher(Method::Aes256Gcm);
        let (a, b) = duplex(1024);
        let mut server = CipherStream::new(b, cipher, Flags::TCP);
        drop(a);

        let mut buf = [0u8; 16];
        assert_eq!(server.read(&mut buf).await.unwrap(), 0);
        assert!(matches!(
            server.read_frame().await,
            Err(TunnelError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_truncated_frame_is_unexpected_eof() {
        let cipher = cipher(Method::Aes256Gcm);
        let (mut a, b) = duplex(1024);
        let mut server = CipherStream::new(b, Arc::clone(&cipher), Flags::TCP);

        let encoded = Frame::data(Flags::TCP, Bytes::from_static(b"cut"))
            .encode(&cipher)
            .unwrap();
        a.write_all(&encoded[..encoded.len() - 3]).await.unwrap();
        drop(a);

        match server.read_frame().await {
            Err(TunnelError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("unexpected {:?}", other.map(|f| f.frame_type)),
        }
    }

    #[tokio::test]
    async fn test_cancelled_read_keeps_alignment() {
        let cipher = cipher(Method::Aes256Gcm);
        let (mut a, b) = duplex(64 * 1024);
        let mut server = CipherStream::new(b, Arc::clone(&cipher), Flags::TCP);

        let encoded = Frame::data(Flags::TCP, Bytes::from_static(b"aligned"))
            .encode(&cipher)
            .unwrap();
        let (first, second) = encoded.split_at(10);
        a.write_all(first).await.unwrap();

        // Read starts, sees half a header, and is dropped
        let mut buf = [0u8; 32];
        let attempt =
            tokio::time::timeout(std::time::Duration::from_millis(20), server.read(&mut buf)).await;
        assert!(attempt.is_err());

        a.write_all(second).await.unwrap();
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"aligned");
    }

    #[tokio::test]
    async fn test_into_inner_propagates_unusable() {
        let cipher = cipher(Method::Aes256Gcm);
        let (a, _b) = duplex(1024);
        let stream = CipherStream::new(PooledConnection::new(a), cipher, Flags::TCP);
        stream.mark_unusable();
        stream.mark_unusable();

        let conn = stream.into_inner();
        assert!(conn.is_unusable());
    }
}
