//! Binary relay protocol: frame codec and the splitter/decompressor.

pub mod frame;
pub mod splitter;

use bytes::Bytes;

use crate::RoomId;

pub use frame::{Encoding, Frame, FrameHeader, HEADER_LEN, Operation, encode, encode_with};
pub use splitter::split;

/// One outer frame (header + payload) exactly as read from a room's socket.
#[derive(Debug, Clone)]
pub struct RawBuffer {
    pub room_id: RoomId,
    pub data: Bytes,
}

/// A plain frame tagged with the room it arrived on.
#[derive(Debug, Clone)]
pub struct Packet {
    pub room_id: RoomId,
    pub frame: Frame,
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::io::Write;

    use flate2::Compression;
    use flate2::write::ZlibEncoder;

    pub(crate) fn zlib_compress(data: &[u8]) -> Vec<u8> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    pub(crate) fn brotli_compress(data: &[u8]) -> Vec<u8> {
        let mut writer = brotli::CompressorWriter::new(Vec::new(), 4096, 5, 22);
        writer.write_all(data).unwrap();
        writer.into_inner()
    }
}
