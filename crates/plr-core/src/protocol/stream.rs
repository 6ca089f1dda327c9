//! Inbound frame reassembly
//!
//! The transport hands over arbitrary chunks: half a frame, several frames,
//! or a frame tail followed by the next frame's head. `PlrCodec` cuts the
//! accumulated bytes at frame boundaries using the header length fields and
//! decodes each complete frame.

use std::sync::Arc;

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

use super::checksum::ChecksumEngine;
use super::frame::{self, Frame};
use super::{ProtocolError, MAX_FRAME_SIZE};

/// An inbound frame that failed to decode
#[derive(Debug)]
pub struct RejectedFrame {
    /// The header marked it as a response, so it still answers a request
    pub response: bool,
    /// Why it was rejected
    pub error: ProtocolError,
}

impl RejectedFrame {
    fn garbage(error: ProtocolError) -> Self {
        Self {
            response: false,
            error,
        }
    }
}

/// Frame splitter/decoder for the inbound byte stream.
///
/// Frame-level failures are yielded as `Err` items so one bad frame never
/// ends the stream. A rejected frame keeps its response shape so the
/// correlator can still retire the request it answers.
#[derive(Debug, Clone)]
pub struct PlrCodec {
    checksums: Arc<ChecksumEngine>,
    verify_checksums: bool,
}

impl PlrCodec {
    /// Codec sharing the session's checksum engine
    pub fn new(checksums: Arc<ChecksumEngine>, verify_checksums: bool) -> Self {
        Self {
            checksums,
            verify_checksums,
        }
    }
}

impl Decoder for PlrCodec {
    type Item = Result<Frame, RejectedFrame>;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let len = match frame::encoded_len(src) {
            Ok(Some(len)) => len,
            Ok(None) => return Ok(None),
            Err(e) => {
                // Resync on the next byte
                tracing::warn!("dropping byte {:#04x}: {}", src[0], e);
                src.advance(1);
                return Ok(Some(Err(RejectedFrame::garbage(e))));
            }
        };

        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }

        let bytes = src.split_to(len);
        tracing::trace!("frame complete: {:02x?}", &bytes[..]);
        let decoded = frame::decode_with(&self.checksums, &bytes, self.verify_checksums);
        Ok(Some(decoded.map_err(|error| RejectedFrame {
            response: frame::is_response(bytes[0]),
            error,
        })))
    }
}

/// Accumulates transport chunks and yields complete frames
#[derive(Debug)]
pub struct FrameAssembler {
    buffer: BytesMut,
    codec: PlrCodec,
}

impl FrameAssembler {
    /// Empty assembler around `codec`
    pub fn new(codec: PlrCodec) -> Self {
        Self {
            buffer: BytesMut::with_capacity(MAX_FRAME_SIZE),
            codec,
        }
    }

    /// Append a chunk and drain every frame it completes
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<Frame, RejectedFrame>> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        // The codec never returns an outer error; items carry the failures
        while let Ok(Some(item)) = self.codec.decode(&mut self.buffer) {
            frames.push(item);
        }
        frames
    }

    /// Bytes waiting for the rest of their frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}
