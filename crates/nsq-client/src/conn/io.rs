// Framed IO over the transport stream, with optional compression beneath
// the frame codec.
use bytes::{Bytes, BytesMut};
use nsq_transport::{Codec, Compression, Stream, TlsOptions};
use nsq_wire::{Command, Frame, FrameDecoder};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{Error, Result};

const READ_CHUNK: usize = 16 * 1024;

pub(crate) struct ConnIo {
    stream: Option<Stream>,
    decoder: FrameDecoder,
    // Raw socket bytes; compressed once a codec is active.
    rx: BytesMut,
    // Decompressed bytes the frame decoder consumes.
    plain: BytesMut,
    codec: Option<Codec>,
}

impl ConnIo {
    pub(crate) fn new(stream: Stream, max_frame_bytes: usize) -> Self {
        Self {
            stream: Some(stream),
            decoder: FrameDecoder::new(max_frame_bytes),
            rx: BytesMut::with_capacity(READ_CHUNK),
            plain: BytesMut::with_capacity(READ_CHUNK),
            codec: None,
        }
    }

    /// Read the next complete frame, waiting for more bytes as needed.
    ///
    /// Cancellation-safe: partial frames live in the internal buffers, not
    /// in the future.
    pub(crate) async fn read_frame(&mut self) -> Result<Frame> {
        loop {
            if let Some(frame) = self.decoder.decode(&mut self.plain)? {
                return Ok(frame);
            }
            let stream = self.stream.as_mut().ok_or(Error::Closed)?;
            self.rx.reserve(READ_CHUNK);
            let n = stream.read_buf(&mut self.rx).await?;
            if n == 0 {
                return Err(Error::ClosedByPeer);
            }
            let chunk = self.rx.split();
            match &mut self.codec {
                Some(codec) => codec.decode(&chunk, &mut self.plain)?,
                None => self.plain.extend_from_slice(&chunk),
            }
        }
    }

    pub(crate) async fn send_command(&mut self, command: &Command) -> Result<()> {
        self.write_all(&command.to_bytes()).await
    }

    pub(crate) async fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        let payload = match &mut self.codec {
            Some(codec) => {
                let mut out = BytesMut::with_capacity(bytes.len());
                codec.encode(bytes, &mut out)?;
                out.freeze()
            }
            None => Bytes::copy_from_slice(bytes),
        };
        let stream = self.stream.as_mut().ok_or(Error::Closed)?;
        stream.write_all(&payload).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Swap the plaintext TCP stream for a TLS session.
    ///
    /// The server stays silent between its IDENTIFY response and our
    /// ClientHello, so any buffered bytes here mean a protocol violation.
    pub(crate) async fn upgrade_tls(&mut self, host: &str, options: &TlsOptions) -> Result<()> {
        if !self.plain.is_empty() || !self.rx.is_empty() {
            return Err(Error::integrity(
                "TLS upgrade",
                "unexpected bytes buffered before the TLS handshake",
            ));
        }
        let stream = self.stream.take().ok_or(Error::Closed)?;
        self.stream = Some(stream.upgrade_tls(host, options).await?);
        Ok(())
    }

    /// Activate a compression transform.
    ///
    /// Everything the server sends after its IDENTIFY response is already
    /// compressed, so bytes buffered past that frame are replayed through
    /// the new decoder.
    pub(crate) fn enable_compression(&mut self, compression: Compression) -> Result<()> {
        let mut codec = Codec::new(compression);
        let mut buffered = self.plain.split();
        buffered.extend_from_slice(&self.rx.split());
        if !buffered.is_empty() {
            codec.decode(&buffered, &mut self.plain)?;
        }
        self.codec = Some(codec);
        Ok(())
    }
}
