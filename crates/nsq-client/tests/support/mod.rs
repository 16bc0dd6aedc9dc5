// Scripted in-process nsqd: a real TCP listener speaking just enough of
// the V2 protocol to drive the client under test.
#![allow(dead_code)]

use bytes::{BufMut, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::time::timeout;

pub const FRAME_RESPONSE: u32 = 0;
pub const FRAME_ERROR: u32 = 1;
pub const FRAME_MESSAGE: u32 = 2;

const IO_TIMEOUT: Duration = Duration::from_secs(30);

/// `RUST_LOG=nsq_client=debug cargo test` shows the client's tracing.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

pub async fn listen() -> (TcpListener, String) {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr").to_string();
    (listener, addr)
}

pub struct MockNsqd {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl MockNsqd {
    pub async fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = timeout(IO_TIMEOUT, listener.accept())
            .await
            .expect("accept timed out")
            .expect("accept");
        let (reader, writer) = stream.into_split();
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    pub async fn expect_magic(&mut self) {
        let mut magic = [0u8; 4];
        timeout(IO_TIMEOUT, self.reader.read_exact(&mut magic))
            .await
            .expect("magic timed out")
            .expect("magic");
        assert_eq!(&magic, b"  V2");
    }

    /// Read one command line; body-carrying verbs also consume the
    /// length-prefixed body.
    pub async fn read_command(&mut self) -> (String, Option<Vec<u8>>) {
        let mut line = Vec::new();
        let n = timeout(IO_TIMEOUT, self.reader.read_until(b'\n', &mut line))
            .await
            .expect("command timed out")
            .expect("command read");
        assert!(n > 0, "connection closed while waiting for a command");
        assert_eq!(line.pop(), Some(b'\n'));
        let line = String::from_utf8(line).expect("ascii command");
        let verb = line.split(' ').next().unwrap_or("");
        let body = if matches!(verb, "IDENTIFY" | "AUTH" | "PUB" | "MPUB" | "DPUB") {
            let mut len = [0u8; 4];
            self.reader.read_exact(&mut len).await.expect("body length");
            let mut body = vec![0u8; u32::from_be_bytes(len) as usize];
            self.reader.read_exact(&mut body).await.expect("body");
            Some(body)
        } else {
            None
        };
        (line, body)
    }

    /// Consume magic + IDENTIFY and answer with a negotiation payload.
    pub async fn handshake(&mut self) {
        self.handshake_with(br#"{"max_rdy_count":2500,"version":"1.2.1"}"#)
            .await;
    }

    pub async fn handshake_with(&mut self, identify_response: &[u8]) {
        self.expect_magic().await;
        let (line, body) = self.read_command().await;
        assert_eq!(line, "IDENTIFY");
        assert!(body.is_some());
        self.send_response(identify_response).await;
    }

    pub async fn expect_sub(&mut self, topic: &str, channel: &str) {
        let (line, _) = self.read_command().await;
        assert_eq!(line, format!("SUB {topic} {channel}"));
        self.send_response(b"OK").await;
    }

    pub async fn send_frame(&mut self, frame_type: u32, payload: &[u8]) {
        let mut buf = BytesMut::with_capacity(8 + payload.len());
        buf.put_u32(payload.len() as u32 + 4);
        buf.put_u32(frame_type);
        buf.extend_from_slice(payload);
        self.writer.write_all(&buf).await.expect("frame write");
    }

    pub async fn send_response(&mut self, payload: &[u8]) {
        self.send_frame(FRAME_RESPONSE, payload).await;
    }

    pub async fn send_error(&mut self, payload: &[u8]) {
        self.send_frame(FRAME_ERROR, payload).await;
    }

    pub async fn send_message(&mut self, id: &[u8; 16], body: &[u8], attempts: u16) {
        let mut payload = BytesMut::with_capacity(26 + body.len());
        payload.put_i64(1_700_000_000_000_000_000);
        payload.put_u16(attempts);
        payload.extend_from_slice(id);
        payload.extend_from_slice(body);
        self.send_frame(FRAME_MESSAGE, &payload).await;
    }
}
