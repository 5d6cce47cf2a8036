//! HPACK header compression (RFC 7541)
//!
//! [`HeaderCodec`] owns one encoder (for header blocks we send) and one
//! decoder (for blocks the peer sends). Both carry dynamic-table state that
//! lives as long as the connection, so a codec is never shared between
//! connections and every block must pass through it in wire order.
//!
//! `hpack::Encoder` always indexes into a 4096-byte table. A peer that
//! advertises a smaller SETTINGS_HEADER_TABLE_SIZE gets literal fields
//! without indexing from then on, after a table size update to 0.

use super::error::{Error, Result};
use super::headers::HeaderList;
use super::DEFAULT_HEADER_TABLE_SIZE;
use ::hpack::{Decoder, Encoder};
use bytes::{BufMut, Bytes, BytesMut};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EncodeMode {
    Indexed,
    /// `size_update` is set until the first block has told the peer to
    /// empty its table
    Literal { size_update: bool },
}

/// Stateful header block encoder/decoder for one connection
pub struct HeaderCodec {
    encoder: Encoder<'static>,
    decoder: Decoder<'static>,
    mode: EncodeMode,
}

impl HeaderCodec {
    /// Create a codec with empty dynamic tables
    pub fn new() -> Self {
        HeaderCodec {
            encoder: Encoder::new(),
            decoder: Decoder::new(),
            mode: EncodeMode::Indexed,
        }
    }

    /// Apply the peer's SETTINGS_HEADER_TABLE_SIZE
    ///
    /// Below 4096 the encoder stops indexing for the rest of the
    /// connection.
    pub fn set_peer_table_size(&mut self, size: u32) {
        if size < DEFAULT_HEADER_TABLE_SIZE && self.mode == EncodeMode::Indexed {
            self.mode = EncodeMode::Literal { size_update: true };
        }
    }

    /// Whether blocks are encoded without the dynamic table
    pub fn is_literal(&self) -> bool {
        self.mode != EncodeMode::Indexed
    }

    /// Encode a header list into a header block
    pub fn encode(&mut self, headers: &HeaderList) -> Result<Bytes> {
        if let EncodeMode::Literal { size_update } = self.mode {
            self.mode = EncodeMode::Literal { size_update: false };
            return Ok(encode_literal(headers, size_update));
        }
        let mut block = Vec::new();
        self.encoder
            .encode_into(headers.as_pairs(), &mut block)
            .map_err(|e| Error::Internal(format!("HPACK encode failed: {}", e)))?;
        Ok(Bytes::from(block))
    }

    /// Decode a complete header block
    ///
    /// A failure leaves the decoder's dynamic table in an unknown state.
    pub fn decode(&mut self, block: &[u8]) -> Result<HeaderList> {
        self.decoder
            .decode(block)
            .map(HeaderList::from_pairs)
            .map_err(|e| Error::Compression(format!("HPACK decode failed: {:?}", e)))
    }
}

impl Default for HeaderCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Literal header fields without indexing, new names, no Huffman coding
/// (RFC 7541 Section 6.2.2)
fn encode_literal(headers: &HeaderList, size_update: bool) -> Bytes {
    let mut block = BytesMut::new();
    if size_update {
        encode_integer(0, 5, 0x20, &mut block);
    }
    for (name, value) in headers.iter() {
        block.put_u8(0x00);
        encode_string(name, &mut block);
        encode_string(value, &mut block);
    }
    block.freeze()
}

fn encode_string(data: &[u8], block: &mut BytesMut) {
    encode_integer(data.len(), 7, 0x00, block);
    block.put_slice(data);
}

/// Prefix-coded integer (RFC 7541 Section 5.1); `flags` fills the bits
/// above the prefix
fn encode_integer(value: usize, prefix_bits: u32, flags: u8, block: &mut BytesMut) {
    let limit = (1usize << prefix_bits) - 1;
    if value < limit {
        block.put_u8(flags | value as u8);
        return;
    }
    block.put_u8(flags | limit as u8);
    let mut rest = value - limit;
    while rest >= 0x80 {
        block.put_u8((rest & 0x7f) as u8 | 0x80);
        rest >>= 7;
    }
    block.put_u8(rest as u8);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_keeps_order() {
        let mut sender = HeaderCodec::new();
        let mut receiver = HeaderCodec::new();

        let headers = HeaderList::new()
            .with(":method", "GET")
            .with(":scheme", "https")
            .with(":path", "/index.html")
            .with("set-cookie", "a=1")
            .with("set-cookie", "b=2");

        let block = sender.encode(&headers).unwrap();
        assert_eq!(receiver.decode(&block).unwrap(), headers);
    }

    #[test]
    fn test_dynamic_table_stays_in_step() {
        let mut sender = HeaderCodec::new();
        let mut receiver = HeaderCodec::new();

        for i in 0..5 {
            let headers = HeaderList::new()
                .with(":status", "200")
                .with("x-request", format!("req-{}", i))
                .with("server", "h2engine");
            let block = sender.encode(&headers).unwrap();
            assert_eq!(receiver.decode(&block).unwrap(), headers);
        }
    }

    #[test]
    fn test_small_peer_table_disables_indexing() {
        let mut sender = HeaderCodec::new();
        let mut receiver = HeaderCodec::new();
        let headers = HeaderList::new()
            .with(":status", "200")
            .with("x-long", "v".repeat(200));

        // Indexed first, so the peer's table holds entries
        let block = sender.encode(&headers).unwrap();
        assert_eq!(receiver.decode(&block).unwrap(), headers);

        sender.set_peer_table_size(0);
        assert!(sender.is_literal());
        let first = sender.encode(&headers).unwrap();
        assert_eq!(first[0], 0x20);
        assert_eq!(first[1], 0x00);
        assert_eq!(receiver.decode(&first).unwrap(), headers);

        let second = sender.encode(&headers).unwrap();
        assert_eq!(second[0], 0x00);
        assert_eq!(second.len(), first.len() - 1);
        assert_eq!(receiver.decode(&second).unwrap(), headers);

        sender.set_peer_table_size(4096);
        assert!(sender.is_literal());
    }

    #[test]
    fn test_integer_prefix_coding() {
        let mut block = BytesMut::new();
        encode_integer(10, 5, 0x00, &mut block);
        assert_eq!(&block[..], [0x0a]);

        // RFC 7541 Appendix C.1.2
        let mut block = BytesMut::new();
        encode_integer(1337, 5, 0x00, &mut block);
        assert_eq!(&block[..], [0x1f, 0x9a, 0x0a]);

        let mut block = BytesMut::new();
        encode_integer(127, 7, 0x00, &mut block);
        assert_eq!(&block[..], [0x7f, 0x00]);
    }

    #[test]
    fn test_garbage_is_compression_error() {
        let mut codec = HeaderCodec::new();
        // Indexed field 62 with an empty dynamic table
        let err = codec.decode(&[0xbe]).unwrap_err();
        assert!(matches!(err, Error::Compression(_)));
    }
}
