use bytes::{Buf, BufMut, Bytes};
use tonic::Status;
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};

/// Passthrough codec: frames cross the gateway as opaque byte buffers, so no
/// schema is consulted on the proxy path.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl Codec for RawCodec {
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

#[derive(Debug)]
pub struct RawEncoder;

impl Encoder for RawEncoder {
	type Item = Bytes;
	type Error = Status;

	fn encode(&mut self, item: Bytes, dst: &mut EncodeBuf<'_>) -> Result<(), Status> {
		dst.put(item);
		Ok(())
	}
}

#[derive(Debug)]
pub struct RawDecoder;

impl Decoder for RawDecoder {
	type Item = Bytes;
	type Error = Status;

	fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Bytes>, Status> {
		let len = src.remaining();
		Ok(Some(src.copy_to_bytes(len)))
	}
}
