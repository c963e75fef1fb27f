//! NGTP frame wire format: `u32 payload_length || u16 tid || u16 packet_type || payload`, all
//! big-endian. See the frame layout in the crate-level docs for the on-wire picture.

/// Size of the fixed frame header, before the payload.
pub const HEADER_SIZE: usize = 8;

/// Largest payload length this client will buffer for. The wire format allows a 32-bit
/// length, but a declared length beyond this is treated as malformed wire data rather than
/// something worth growing the read buffer to accommodate — it's either a corrupted stream or
/// a peer that isn't speaking NGTP.
pub const MAX_PAYLOAD: u32 = 16 * 1024 * 1024;

/// The fixed packet-type set this client understands. Any other `u16` value decodes to
/// [`DecodeResult::UnknownType`] rather than an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum PacketType {
    Ping = 0,
    Order = 1,
    OrderConfirm = 2,
    Logs = 3,
    DataStream = 4,
    DataStreamConfirm = 5,
    DataStreamReject = 6,
    SyncBaobRequest = 7,
    SyncBaobResponse = 8,
}

impl PacketType {
    fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            0 => Self::Ping,
            1 => Self::Order,
            2 => Self::OrderConfirm,
            3 => Self::Logs,
            4 => Self::DataStream,
            5 => Self::DataStreamConfirm,
            6 => Self::DataStreamReject,
            7 => Self::SyncBaobRequest,
            8 => Self::SyncBaobResponse,
            _ => return None,
        })
    }
}

/// A fully decoded frame, borrowing its payload from the caller's buffer.
#[derive(Debug, PartialEq, Eq)]
pub struct Frame<'a> {
    pub tid: u16,
    pub packet_type: PacketType,
    pub payload: &'a [u8],
    /// Number of bytes of the input buffer this frame consumed.
    pub consumed: usize,
}

#[derive(Debug, PartialEq, Eq)]
pub enum DecodeResult<'a> {
    /// Fewer than `HEADER_SIZE + payload_length` bytes are available yet.
    NeedMore,
    Frame(Frame<'a>),
    /// A complete frame was present but its `packet_type` isn't one we know. Not an error —
    /// the caller drops it and logs a warning. `consumed` lets the caller advance the buffer.
    UnknownType { packet_type: u16, consumed: usize },
    /// The declared payload length exceeds [`MAX_PAYLOAD`]. A protocol violation: the caller
    /// should drop the connection rather than wait for (or buffer) that many bytes.
    TooLarge(u32),
}

/// Encode a frame for the wire. Never allocates beyond the returned `Vec`.
pub fn encode(tid: u16, packet_type: PacketType, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&tid.to_be_bytes());
    buf.extend_from_slice(&(packet_type as u16).to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Decode a single frame from the front of `buf`, if a full one is present.
///
/// Never mutates `buf`; the caller is responsible for draining `consumed` bytes once it is
/// done with the borrowed payload.
pub fn decode(buf: &[u8]) -> DecodeResult<'_> {
    if buf.len() < HEADER_SIZE {
        return DecodeResult::NeedMore;
    }
    let length_raw = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if length_raw > MAX_PAYLOAD {
        return DecodeResult::TooLarge(length_raw);
    }
    let length = length_raw as usize;
    let tid = u16::from_be_bytes([buf[4], buf[5]]);
    let packet_type_raw = u16::from_be_bytes([buf[6], buf[7]]);

    if buf.len() < HEADER_SIZE + length {
        return DecodeResult::NeedMore;
    }
    let consumed = HEADER_SIZE + length;

    match PacketType::from_u16(packet_type_raw) {
        Some(packet_type) => {
            DecodeResult::Frame(Frame { tid, packet_type, payload: &buf[HEADER_SIZE..consumed], consumed })
        }
        None => DecodeResult::UnknownType { packet_type: packet_type_raw, consumed },
    }
}
