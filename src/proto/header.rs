use num_enum::TryFromPrimitive;

/// The protocol version spoken by this implementation. A peer announcing any other version
///  is disconnected as a protocol violation.
pub const PROTOCOL_VERSION: u8 = 0;

/// Correlation ids occupy twelve bits of the header word, so at most 4096 correlated
///  exchanges can be told apart at a time.
pub const MAX_CORRELATION_ID: u16 = 0xfff;

/// The closed set of message shapes a frame can carry. `Reserved` never appears on the
///  wire from a conforming peer; it is rejected at dispatch time like any unknown tag.
#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum MessageKind {
    Reserved = 0,
    Index = 1,
    Request = 2,
    Response = 3,
    Ping = 4,
    Pong = 5,
}

/// Per-message envelope, packed into a single u32 on the wire: version in bits 28..32,
///  correlation id in bits 16..28, kind tag in the low byte.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Header {
    pub version: u8,
    pub id: u16,
    pub kind: MessageKind,
}

impl Header {
    pub fn new(id: u16, kind: MessageKind) -> Header {
        Header {
            version: PROTOCOL_VERSION,
            id,
            kind,
        }
    }

    pub fn encode(&self) -> u32 {
        ((self.version as u32 & 0xf) << 28)
            | ((self.id as u32 & 0xfff) << 16)
            | (self.kind as u8 as u32)
    }
}

/// A decoded header word. The kind is kept as the raw tag because an out-of-range tag is
///  not a decoding error - it is the dispatcher's job to treat it as a protocol violation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RawHeader {
    pub version: u8,
    pub id: u16,
    pub kind_tag: u8,
}

impl RawHeader {
    pub fn decode(word: u32) -> RawHeader {
        RawHeader {
            version: ((word >> 28) & 0xf) as u8,
            id: ((word >> 16) & 0xfff) as u16,
            kind_tag: (word & 0xff) as u8,
        }
    }

    pub fn kind(&self) -> Option<MessageKind> {
        MessageKind::try_from_primitive(self.kind_tag).ok()
    }
}
