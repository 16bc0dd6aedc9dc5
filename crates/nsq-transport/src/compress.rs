// Incremental Snappy / DEFLATE stream transforms.
//
// Both directions operate on byte buffers: the conn loop feeds received
// bytes through `decode` before framing, and runs encoded commands through
// `encode` before writing. Partial chunks are buffered internally, so
// arbitrary split points in the inbound stream are safe.
use bytes::{Buf, BufMut, BytesMut};
use flate2::{Compress, Decompress, FlushCompress, FlushDecompress, Status};

use crate::{Error, Result};

/// Negotiated compression for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Deflate { level: u32 },
    Snappy,
}

/// A live transform instance for one direction pair.
pub enum Codec {
    Deflate(DeflateCodec),
    Snappy(SnappyCodec),
}

impl Codec {
    pub fn new(compression: Compression) -> Self {
        match compression {
            Compression::Deflate { level } => Codec::Deflate(DeflateCodec::new(level)),
            Compression::Snappy => Codec::Snappy(SnappyCodec::new()),
        }
    }

    /// Compress outgoing plaintext into `out`.
    pub fn encode(&mut self, input: &[u8], out: &mut BytesMut) -> Result<()> {
        match self {
            Codec::Deflate(codec) => codec.encode(input, out),
            Codec::Snappy(codec) => codec.encode(input, out),
        }
    }

    /// Feed received compressed bytes; append any decodable plaintext to `out`.
    pub fn decode(&mut self, input: &[u8], out: &mut BytesMut) -> Result<()> {
        match self {
            Codec::Deflate(codec) => codec.decode(input, out),
            Codec::Snappy(codec) => codec.decode(input, out),
        }
    }
}

fn deflate_error(err: impl std::fmt::Display) -> Error {
    Error::Compression {
        codec: "deflate",
        detail: err.to_string(),
    }
}

fn snappy_error(detail: impl Into<String>) -> Error {
    Error::Compression {
        codec: "snappy",
        detail: detail.into(),
    }
}

/// Raw DEFLATE (no zlib header), sync-flushed per write so the broker can
/// parse each command without waiting for more output.
pub struct DeflateCodec {
    compress: Compress,
    decompress: Decompress,
}

impl DeflateCodec {
    pub fn new(level: u32) -> Self {
        Self {
            compress: Compress::new(flate2::Compression::new(level), false),
            decompress: Decompress::new(false),
        }
    }

    fn encode(&mut self, mut input: &[u8], out: &mut BytesMut) -> Result<()> {
        let mut buf = Vec::with_capacity(input.len() / 2 + 64);
        while !input.is_empty() {
            buf.reserve(4096);
            let before = self.compress.total_in();
            self.compress
                .compress_vec(input, &mut buf, FlushCompress::None)
                .map_err(deflate_error)?;
            let consumed = (self.compress.total_in() - before) as usize;
            input = &input[consumed..];
        }
        loop {
            buf.reserve(4096);
            self.compress
                .compress_vec(&[], &mut buf, FlushCompress::Sync)
                .map_err(deflate_error)?;
            if buf.len() < buf.capacity() {
                break;
            }
        }
        out.extend_from_slice(&buf);
        Ok(())
    }

    fn decode(&mut self, mut input: &[u8], out: &mut BytesMut) -> Result<()> {
        let mut buf = Vec::with_capacity(input.len() * 3 + 64);
        loop {
            buf.reserve(4096);
            let before = self.decompress.total_in();
            let status = self
                .decompress
                .decompress_vec(input, &mut buf, FlushDecompress::None)
                .map_err(deflate_error)?;
            let consumed = (self.decompress.total_in() - before) as usize;
            input = &input[consumed..];
            if matches!(status, Status::StreamEnd) {
                break;
            }
            if input.is_empty() && buf.len() < buf.capacity() {
                break;
            }
            if consumed == 0 && buf.len() < buf.capacity() {
                break;
            }
        }
        out.extend_from_slice(&buf);
        Ok(())
    }
}

// Snappy framing format chunk types.
const CHUNK_COMPRESSED: u8 = 0x00;
const CHUNK_UNCOMPRESSED: u8 = 0x01;
const CHUNK_PADDING: u8 = 0xfe;
const CHUNK_STREAM_IDENT: u8 = 0xff;

const STREAM_IDENT: &[u8] = &[0xff, 0x06, 0x00, 0x00, b's', b'N', b'a', b'P', b'p', b'Y'];

/// Maximum uncompressed payload of one frame-format chunk.
const MAX_CHUNK: usize = 65536;

/// Snappy framing format: a stream identifier followed by checksummed
/// compressed or uncompressed chunks.
pub struct SnappyCodec {
    encoder: snap::raw::Encoder,
    decoder: snap::raw::Decoder,
    wrote_stream_ident: bool,
    pending: BytesMut,
}

impl SnappyCodec {
    pub fn new() -> Self {
        Self {
            encoder: snap::raw::Encoder::new(),
            decoder: snap::raw::Decoder::new(),
            wrote_stream_ident: false,
            pending: BytesMut::new(),
        }
    }

    fn encode(&mut self, input: &[u8], out: &mut BytesMut) -> Result<()> {
        if !self.wrote_stream_ident {
            out.extend_from_slice(STREAM_IDENT);
            self.wrote_stream_ident = true;
        }
        for chunk in input.chunks(MAX_CHUNK) {
            let crc = masked_crc32c(chunk);
            let compressed = self
                .encoder
                .compress_vec(chunk)
                .map_err(|e| snappy_error(e.to_string()))?;
            // Fall back to a literal chunk when compression does not help.
            let (chunk_type, payload) = if compressed.len() < chunk.len() {
                (CHUNK_COMPRESSED, compressed.as_slice())
            } else {
                (CHUNK_UNCOMPRESSED, chunk)
            };
            let len = 4 + payload.len();
            out.put_u8(chunk_type);
            out.extend_from_slice(&(len as u32).to_le_bytes()[..3]);
            out.put_u32_le(crc);
            out.extend_from_slice(payload);
        }
        Ok(())
    }

    fn decode(&mut self, input: &[u8], out: &mut BytesMut) -> Result<()> {
        self.pending.extend_from_slice(input);
        loop {
            if self.pending.len() < 4 {
                return Ok(());
            }
            let chunk_type = self.pending[0];
            let len = u32::from_le_bytes([self.pending[1], self.pending[2], self.pending[3], 0])
                as usize;
            if self.pending.len() < 4 + len {
                return Ok(());
            }
            self.pending.advance(4);
            let chunk = self.pending.split_to(len);
            match chunk_type {
                CHUNK_STREAM_IDENT => {
                    if chunk.as_ref() != b"sNaPpY" {
                        return Err(snappy_error("bad stream identifier"));
                    }
                }
                CHUNK_COMPRESSED => {
                    let (crc, data) = split_checksum(&chunk)?;
                    let decompressed = self
                        .decoder
                        .decompress_vec(data)
                        .map_err(|e| snappy_error(e.to_string()))?;
                    if masked_crc32c(&decompressed) != crc {
                        return Err(snappy_error("checksum mismatch in compressed chunk"));
                    }
                    out.extend_from_slice(&decompressed);
                }
                CHUNK_UNCOMPRESSED => {
                    let (crc, data) = split_checksum(&chunk)?;
                    if masked_crc32c(data) != crc {
                        return Err(snappy_error("checksum mismatch in uncompressed chunk"));
                    }
                    out.extend_from_slice(data);
                }
                CHUNK_PADDING | 0x80..=0xfd => {}
                reserved => {
                    return Err(snappy_error(format!(
                        "reserved unskippable chunk type {reserved:#04x}"
                    )));
                }
            }
        }
    }
}

impl Default for SnappyCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn split_checksum(chunk: &[u8]) -> Result<(u32, &[u8])> {
    if chunk.len() < 4 {
        return Err(snappy_error("chunk shorter than its checksum"));
    }
    let crc = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    Ok((crc, &chunk[4..]))
}

const CASTAGNOLI: u32 = 0x82F6_3B78;

const CRC_TABLE: [u32; 256] = {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut j = 0;
        while j < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ CASTAGNOLI
            } else {
                crc >> 1
            };
            j += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
};

fn crc32c(data: &[u8]) -> u32 {
    let mut crc = !0u32;
    for &byte in data {
        crc = (crc >> 8) ^ CRC_TABLE[((crc ^ byte as u32) & 0xFF) as usize];
    }
    !crc
}

/// Checksums in the framing format are masked so that data containing its
/// own CRC does not defeat the check.
fn masked_crc32c(data: &[u8]) -> u32 {
    let crc = crc32c(data);
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32c_test_vector() {
        // Standard check value for CRC-32/Castagnoli.
        assert_eq!(crc32c(b"123456789"), 0xE306_9283);
    }

    #[test]
    fn deflate_round_trip() {
        let mut sender = Codec::new(Compression::Deflate { level: 6 });
        let mut receiver = Codec::new(Compression::Deflate { level: 6 });

        let mut wire = BytesMut::new();
        sender.encode(b"RDY 100\n", &mut wire).expect("encode");
        assert!(!wire.is_empty());

        let mut plain = BytesMut::new();
        receiver.decode(&wire, &mut plain).expect("decode");
        assert_eq!(plain.as_ref(), b"RDY 100\n");
    }

    #[test]
    fn deflate_decodes_across_writes() {
        let mut sender = Codec::new(Compression::Deflate { level: 6 });
        let mut receiver = Codec::new(Compression::Deflate { level: 6 });

        let mut wire = BytesMut::new();
        sender.encode(b"first ", &mut wire).expect("encode");
        sender.encode(b"second", &mut wire).expect("encode");

        // Feed one byte at a time to exercise partial-input handling.
        let mut plain = BytesMut::new();
        for byte in wire.as_ref() {
            receiver
                .decode(std::slice::from_ref(byte), &mut plain)
                .expect("decode");
        }
        assert_eq!(plain.as_ref(), b"first second");
    }

    #[test]
    fn snappy_round_trip() {
        let mut sender = Codec::new(Compression::Snappy);
        let mut receiver = Codec::new(Compression::Snappy);

        let payload = b"the quick brown fox jumps over the lazy dog".repeat(10);
        let mut wire = BytesMut::new();
        sender.encode(&payload, &mut wire).expect("encode");
        assert_eq!(&wire[..STREAM_IDENT.len()], STREAM_IDENT);

        let mut plain = BytesMut::new();
        receiver.decode(&wire, &mut plain).expect("decode");
        assert_eq!(plain.as_ref(), payload.as_slice());
    }

    #[test]
    fn snappy_decodes_partial_chunks() {
        let mut sender = Codec::new(Compression::Snappy);
        let mut receiver = Codec::new(Compression::Snappy);

        let mut wire = BytesMut::new();
        sender.encode(b"hello", &mut wire).expect("encode");
        sender.encode(b" world", &mut wire).expect("encode");

        let mut plain = BytesMut::new();
        for byte in wire.as_ref() {
            receiver
                .decode(std::slice::from_ref(byte), &mut plain)
                .expect("decode");
        }
        assert_eq!(plain.as_ref(), b"hello world");
    }

    #[test]
    fn snappy_incompressible_data_uses_literal_chunks() {
        let mut sender = Codec::new(Compression::Snappy);
        let mut receiver = Codec::new(Compression::Snappy);

        // Short inputs cannot shrink; the encoder must emit a literal chunk.
        let mut wire = BytesMut::new();
        sender.encode(b"x", &mut wire).expect("encode");
        assert_eq!(wire[STREAM_IDENT.len()], CHUNK_UNCOMPRESSED);

        let mut plain = BytesMut::new();
        receiver.decode(&wire, &mut plain).expect("decode");
        assert_eq!(plain.as_ref(), b"x");
    }

    #[test]
    fn snappy_rejects_corrupt_checksum() {
        let mut sender = Codec::new(Compression::Snappy);
        let mut receiver = Codec::new(Compression::Snappy);

        let mut wire = BytesMut::new();
        sender.encode(b"payload", &mut wire).expect("encode");
        let idx = STREAM_IDENT.len() + 4; // first checksum byte of the data chunk
        wire[idx] ^= 0xFF;

        let mut plain = BytesMut::new();
        let err = receiver.decode(&wire, &mut plain).expect_err("corrupt");
        assert!(matches!(err, Error::Compression { codec: "snappy", .. }));
    }
}
