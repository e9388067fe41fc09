//! Frame splitting and decompression.
//!
//! A raw buffer read from the relay may carry several concatenated frames, and a
//! compressed frame inflates into yet another multiplexed buffer. [`split`]
//! flattens all of that into plain frames in receipt order.

use std::io::Read;

use bytes::Bytes;
use flate2::read::ZlibDecoder;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::frame::{Encoding, Frame, FrameHeader, HEADER_LEN};
use super::{Packet, RawBuffer};
use crate::error::{DanmakuError, Result};

/// Compressed frames nested deeper than this are rejected.
const MAX_NESTING: usize = 8;

/// Split a raw buffer into plain frames.
///
/// Empty frames are discarded. Compressed payloads are inflated and split
/// again. A truncated frame or a payload that fails to inflate fails the
/// whole buffer.
pub fn split(data: &[u8]) -> Result<Vec<Frame>> {
    let mut frames = Vec::new();
    split_into(data, 0, &mut frames)?;
    Ok(frames)
}

fn split_into(data: &[u8], depth: usize, frames: &mut Vec<Frame>) -> Result<()> {
    if depth > MAX_NESTING {
        return Err(DanmakuError::protocol(format!(
            "compressed frames nested deeper than {}",
            MAX_NESTING
        )));
    }

    let mut offset = 0;
    while offset < data.len() {
        let header = FrameHeader::parse(&data[offset..])?;
        let end = offset + header.total_len as usize;
        if end > data.len() {
            return Err(DanmakuError::protocol(format!(
                "frame declares {} bytes but only {} remain",
                header.total_len,
                data.len() - offset
            )));
        }

        let payload = &data[offset + HEADER_LEN..end];
        offset = end;

        if payload.is_empty() {
            continue;
        }

        match header.encoding {
            Encoding::Deflate => split_into(&decompress_zlib(payload)?, depth + 1, frames)?,
            Encoding::Brotli => split_into(&decompress_brotli(payload)?, depth + 1, frames)?,
            Encoding::Plain | Encoding::PlainAck => {
                frames.push(Frame::new(
                    header.operation,
                    Bytes::copy_from_slice(payload),
                ));
            }
            Encoding::Unknown(tag) => {
                debug!(tag, "skipping frame with unknown encoding");
            }
        }
    }

    Ok(())
}

/// Decompress zlib data.
fn decompress_zlib(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(data);
    let mut decompressed = Vec::new();
    decoder
        .read_to_end(&mut decompressed)
        .map_err(|e| DanmakuError::protocol(format!("zlib decompression failed: {}", e)))?;
    Ok(decompressed)
}

/// Decompress brotli data.
fn decompress_brotli(data: &[u8]) -> Result<Vec<u8>> {
    let mut decompressed = Vec::new();
    brotli::BrotliDecompress(&mut std::io::Cursor::new(data), &mut decompressed)
        .map_err(|e| DanmakuError::protocol(format!("brotli decompression failed: {}", e)))?;
    Ok(decompressed)
}

/// Splitter task: drains raw buffers from every session and pushes plain
/// frames onto the bounded dispatcher queue.
pub(crate) async fn run(
    mut raw_rx: mpsc::Receiver<RawBuffer>,
    frame_tx: flume::Sender<Packet>,
    cancel: CancellationToken,
) {
    debug!("splitter started");

    loop {
        let raw = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            raw = raw_rx.recv() => match raw {
                Some(raw) => raw,
                None => break,
            },
        };

        let frames = match split(&raw.data) {
            Ok(frames) => frames,
            Err(e) => {
                warn!(room_id = raw.room_id, "dropping raw buffer: {}", e);
                continue;
            }
        };

        trace!(room_id = raw.room_id, count = frames.len(), "split raw buffer");

        for frame in frames {
            let packet = Packet {
                room_id: raw.room_id,
                frame,
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                sent = frame_tx.send_async(packet) => {
                    if sent.is_err() {
                        debug!("frame queue closed, splitter stopping");
                        return;
                    }
                }
            }
        }
    }

    debug!("splitter stopped");
}
