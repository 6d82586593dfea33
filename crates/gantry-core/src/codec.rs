//! Pass-through codec for proxied services.
//!
//! [`PassThroughCodec`] plugs into `tonic`'s generic server and client in
//! place of the protobuf codec. Both its encode and decode items are
//! [`Bytes`]: an inbound message is surfaced exactly as it was framed on the
//! wire, and an outbound message is written back unchanged. `tonic` still
//! performs length-prefixed framing, compression negotiation, message size
//! limits and status handling; only schema decoding is skipped, leaving it to
//! the workers.
//!
//! Because the associated types are fixed to [`Bytes`], the codec cannot be
//! asked to carry a typed application message. That mismatch is a compile
//! error rather than a runtime failure.

use bytes::{Buf, BufMut, Bytes};
use tonic::{
    Status,
    codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder},
};

/// Identity codec over raw message bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThroughCodec;

impl Codec for PassThroughCodec {
    type Encode = Bytes;
    type Decode = Bytes;
    type Encoder = RawEncoder;
    type Decoder = RawDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        RawEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        RawDecoder
    }
}

/// Writes a message's bytes into the outbound frame unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawEncoder;

impl Encoder for RawEncoder {
    type Item = Bytes;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, dst: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
        dst.reserve(item.len());
        dst.put(item);
        Ok(())
    }
}

/// Takes the whole inbound frame as the message.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawDecoder;

impl Decoder for RawDecoder {
    type Item = Bytes;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
        Ok(Some(src.copy_to_bytes(src.remaining())))
    }
}
