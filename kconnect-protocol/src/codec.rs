//! Packet Codec
//!
//! Newline-delimited JSON framing for packet streams.
//!
//! [`PacketCodec`] plugs into `tokio_util::codec::FramedRead` /
//! `FramedWrite`. The decoder keeps the offset it has already scanned, so a
//! frame split over several socket reads is only searched once and decodes
//! to the same packet as if it had arrived whole.
//!
//! Decoded items are `Result<Packet, DecodeError>`: a malformed frame is
//! reported as an item and the stream carries on. Only I/O failures and
//! oversized frames end the stream.

use crate::error::DecodeError;
use crate::packet::{PACKET_TYPE_IDENTITY, PACKET_TYPE_PAIR};
use crate::{Packet, ProtocolError, Result};
use bytes::BytesMut;
use std::collections::HashSet;
use std::sync::{Arc, OnceLock};
use tokio_util::codec::{Decoder, Encoder};

/// Maximum size of a single frame (10 MiB)
pub const MAX_PACKET_SIZE: usize = 10 * 1024 * 1024;

/// Encode a packet into a self-delimited frame
pub fn encode(packet: &Packet) -> Result<Vec<u8>> {
    packet.to_bytes()
}

/// Decode the first frame in `bytes`
///
/// Fails with `TruncatedFrame` when no delimiter is present yet.
pub fn decode(bytes: &[u8]) -> std::result::Result<Packet, DecodeError> {
    match bytes.iter().position(|b| *b == b'\n') {
        Some(newline) => decode_frame(&bytes[..newline], &default_known_types()),
        None => Err(DecodeError::TruncatedFrame {
            buffered: bytes.len(),
        }),
    }
}

/// Packet types understood by the built-in plugins plus identity and pair
pub fn default_known_types() -> Arc<HashSet<String>> {
    static KNOWN: OnceLock<Arc<HashSet<String>>> = OnceLock::new();
    KNOWN
        .get_or_init(|| {
            let mut types: HashSet<String> = crate::plugins::builtin_packet_types()
                .into_iter()
                .map(str::to_string)
                .collect();
            types.insert(PACKET_TYPE_IDENTITY.to_string());
            types.insert(PACKET_TYPE_PAIR.to_string());
            Arc::new(types)
        })
        .clone()
}

fn decode_frame(
    frame: &[u8],
    known_types: &HashSet<String>,
) -> std::result::Result<Packet, DecodeError> {
    let frame = frame.strip_suffix(b"\r").unwrap_or(frame);

    let packet: Packet = serde_json::from_slice(frame)
        .map_err(|e| DecodeError::MalformedPacket(e.to_string()))?;

    if packet.packet_type.is_empty() {
        return Err(DecodeError::MalformedPacket("empty packet type".to_string()));
    }

    if !known_types.contains(&packet.packet_type) {
        return Err(DecodeError::UnknownType {
            packet: Box::new(packet),
        });
    }

    Ok(packet)
}

/// Incremental newline-delimited JSON codec
#[derive(Debug, Clone)]
pub struct PacketCodec {
    /// Bytes of the current buffer already searched for a delimiter
    next_index: usize,
    max_length: usize,
    known_types: Arc<HashSet<String>>,
}

impl PacketCodec {
    /// Codec recognising the built-in packet types
    pub fn new() -> Self {
        Self::with_known_types(default_known_types())
    }

    /// Codec recognising a custom set of packet types
    pub fn with_known_types(known_types: Arc<HashSet<String>>) -> Self {
        Self {
            next_index: 0,
            max_length: MAX_PACKET_SIZE,
            known_types,
        }
    }

    /// Override the maximum frame length
    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length;
        self
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for PacketCodec {
    type Item = std::result::Result<Packet, DecodeError>;
    type Error = ProtocolError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            let read_to = buf.len().min(self.max_length.saturating_add(1));
            let newline = buf[self.next_index..read_to]
                .iter()
                .position(|b| *b == b'\n');

            match newline {
                Some(offset) => {
                    let newline = self.next_index + offset;
                    self.next_index = 0;
                    let line = buf.split_to(newline + 1);
                    let frame = &line[..newline];

                    // keepalive blank lines
                    if frame.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }

                    return Ok(Some(decode_frame(frame, &self.known_types)));
                }
                None if buf.len() > self.max_length => {
                    return Err(ProtocolError::PacketSizeExceeded(
                        buf.len(),
                        self.max_length,
                    ));
                }
                None => {
                    self.next_index = read_to;
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>> {
        if let Some(item) = self.decode(buf)? {
            return Ok(Some(item));
        }

        self.next_index = 0;
        if buf.iter().all(u8::is_ascii_whitespace) {
            buf.clear();
            return Ok(None);
        }

        let buffered = buf.len();
        buf.clear();
        Ok(Some(Err(DecodeError::TruncatedFrame { buffered })))
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = ProtocolError;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<()> {
        let bytes = packet.to_bytes()?;
        dst.reserve(bytes.len());
        dst.extend_from_slice(&bytes);
        Ok(())
    }
}
