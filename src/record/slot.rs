use crate::error::{Result, SelvaError};

/// Size in bytes of the fixed header in front of every stored record.
pub const RECORD_HEADER_SIZE: usize = 8;

/// Size in bytes of the continuation pointer inside a link fragment.
pub const LINK_POINTER_SIZE: usize = 6;

/// Discriminates the payload stored in a record slot.
///
/// Chained records spell `Link (head) → Cont* → Tail`; unchained records
/// are a single `Data` slot. Head kinds (`Data`, `Link`) are what id
/// resolution may land on; continuation kinds are only reachable by
/// following a chain.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RecordKind {
    /// Reclaimable slot holding no live data.
    Free = 0x00,
    /// Complete record stored in a single slot.
    Data = 0x01,
    /// Chain head; payload is a continuation pointer plus the first fragment.
    Link = 0x02,
    /// Middle fragment; payload is a continuation pointer plus fragment bytes.
    Cont = 0x03,
    /// Final fragment of a chain; payload is fragment bytes only.
    Tail = 0x04,
}

impl RecordKind {
    /// Decodes a kind byte.
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0x00 => Ok(Self::Free),
            0x01 => Ok(Self::Data),
            0x02 => Ok(Self::Link),
            0x03 => Ok(Self::Cont),
            0x04 => Ok(Self::Tail),
            other => Err(SelvaError::Corruption(format!(
                "unknown record kind: 0x{other:02X}"
            ))),
        }
    }

    /// Encodes the kind as its byte value.
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// True for kinds that start a logical record.
    pub fn is_head(self) -> bool {
        matches!(self, Self::Data | Self::Link)
    }

    /// True for kinds carrying a continuation pointer prefix.
    pub fn has_continuation(self) -> bool {
        matches!(self, Self::Link | Self::Cont)
    }
}

/// Header preceding every record payload inside a page.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct RecordHeader {
    /// Kind of the slot contents.
    pub kind: RecordKind,
    /// Length in bytes of the payload following the header.
    pub payload_length: u32,
}

impl RecordHeader {
    /// Creates a header.
    pub fn new(kind: RecordKind, payload_length: u32) -> Self {
        Self {
            kind,
            payload_length,
        }
    }

    /// Decodes a header from the start of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < RECORD_HEADER_SIZE {
            return Err(SelvaError::Corruption("record header truncated".into()));
        }
        let kind = RecordKind::from_byte(bytes[0])?;
        let payload_length =
            u32::from_le_bytes(bytes[4..8].try_into().expect("slice has exactly 4 bytes"));
        Ok(Self {
            kind,
            payload_length,
        })
    }

    /// Writes the header to the start of `bytes`.
    pub fn write_to(&self, bytes: &mut [u8]) -> Result<()> {
        if bytes.len() < RECORD_HEADER_SIZE {
            return Err(SelvaError::Corruption(
                "destination slice shorter than header".into(),
            ));
        }
        bytes[0] = self.kind.to_byte();
        bytes[1..4].fill(0);
        bytes[4..8].copy_from_slice(&self.payload_length.to_le_bytes());
        Ok(())
    }
}

/// Encodes a record as header + payload bytes.
pub fn encode_record(kind: RecordKind, payload: &[u8]) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(RECORD_HEADER_SIZE + payload.len());
    buffer.push(kind.to_byte());
    buffer.extend_from_slice(&[0; 3]);
    buffer.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buffer.extend_from_slice(payload);
    buffer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let header = RecordHeader::new(RecordKind::Link, 777);
        let mut buf = [0u8; RECORD_HEADER_SIZE];
        header.write_to(&mut buf).expect("write header");
        assert_eq!(RecordHeader::from_bytes(&buf).expect("read header"), header);
    }

    #[test]
    fn unknown_kind_is_corruption() {
        let err = RecordKind::from_byte(0x7F).unwrap_err();
        assert!(matches!(err, SelvaError::Corruption(_)));
    }

    #[test]
    fn encode_record_lays_out_header_then_payload() {
        let encoded = encode_record(RecordKind::Data, b"abc");
        assert_eq!(encoded.len(), RECORD_HEADER_SIZE + 3);
        let header = RecordHeader::from_bytes(&encoded).expect("header");
        assert_eq!(header.kind, RecordKind::Data);
        assert_eq!(header.payload_length, 3);
        assert_eq!(&encoded[RECORD_HEADER_SIZE..], b"abc");
    }
}
