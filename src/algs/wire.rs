//! Fixed, versioned, little-endian wire types for staged messages.

use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;
use std::mem::size_of;

/// Bump when the layout or semantics change in incompatible ways.
pub const WIRE_VERSION: u16 = 1;

/// Chunk kinds carried in [`WireChunkHdr::kind`].
pub const KIND_MESSAGE: u16 = 1;

// All multi-byte integers in these structs are **little-endian** on the wire.
// We store them pre-LE with `.to_le()` and decode with `.from_le()`.

/// Header of the first chunk of a two-phase message.
///
/// `first_len` payload bytes follow the header in the same chunk; the
/// remaining `total_len - first_len` bytes arrive in a second chunk.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct WireChunkHdr {
    pub version_le: u16,
    pub kind_le: u16,
    pub first_len_le: u32,
    pub total_len_le: u64,
}

impl WireChunkHdr {
    pub const SIZE: usize = 16;

    pub fn new(first_len: usize, total_len: usize) -> Self {
        Self {
            version_le: WIRE_VERSION.to_le(),
            kind_le: KIND_MESSAGE.to_le(),
            first_len_le: (first_len as u32).to_le(),
            total_len_le: (total_len as u64).to_le(),
        }
    }
    pub fn version(&self) -> u16 {
        u16::from_le(self.version_le)
    }
    pub fn kind(&self) -> u16 {
        u16::from_le(self.kind_le)
    }
    pub fn first_len(&self) -> usize {
        u32::from_le(self.first_len_le) as usize
    }
    pub fn total_len(&self) -> usize {
        u64::from_le(self.total_len_le) as usize
    }

    /// Split a received first chunk into its header and payload.
    pub fn parse(chunk: &[u8]) -> Result<(Self, &[u8]), String> {
        if chunk.len() < Self::SIZE {
            return Err(format!(
                "expected at least {} bytes for chunk header, got {}",
                Self::SIZE,
                chunk.len()
            ));
        }
        let hdr: Self = bytemuck::pod_read_unaligned(&chunk[..Self::SIZE]);
        if hdr.version() != WIRE_VERSION {
            return Err(format!("unsupported wire version {}", hdr.version()));
        }
        if hdr.kind() != KIND_MESSAGE {
            return Err(format!("unexpected chunk kind {}", hdr.kind()));
        }
        let payload = &chunk[Self::SIZE..];
        expect_exact_len(payload.len(), hdr.first_len())?;
        if hdr.first_len() > hdr.total_len() {
            return Err(format!(
                "first chunk carries {} bytes of a {}-byte message",
                hdr.first_len(),
                hdr.total_len()
            ));
        }
        Ok((hdr, payload))
    }
}

pub fn expect_exact_len(actual: usize, expected: usize) -> Result<(), String> {
    if actual == expected {
        Ok(())
    } else {
        Err(format!("expected {expected} bytes, got {actual}"))
    }
}

/// Summary of a group's work, exchanged between contacts while combining
/// children.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct WireGroupSummary {
    pub work_bits_le: u64,
    pub group_may_supply: u8,
    pub process_may_supply: u8,
    pub _pad: [u8; 6],
}

impl WireGroupSummary {
    pub const SIZE: usize = 16;

    pub fn new(work: f64, group_may_supply: bool, process_may_supply: bool) -> Self {
        Self {
            work_bits_le: work.to_bits().to_le(),
            group_may_supply: group_may_supply as u8,
            process_may_supply: process_may_supply as u8,
            _pad: [0; 6],
        }
    }
    pub fn work(&self) -> f64 {
        f64::from_bits(u64::from_le(self.work_bits_le))
    }
    pub fn group_may_supply(&self) -> bool {
        self.group_may_supply != 0
    }
    pub fn process_may_supply(&self) -> bool {
        self.process_may_supply != 0
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        bytemuck::bytes_of(self).to_vec()
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, String> {
        expect_exact_len(data.len(), Self::SIZE)?;
        Ok(bytemuck::pod_read_unaligned(data))
    }
}

/// A single `f64` carried on the wire (all-reduce partials).
#[repr(transparent)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct WireF64(pub u64);

impl WireF64 {
    pub fn of(v: f64) -> Self {
        Self(v.to_bits().to_le())
    }
    pub fn get(&self) -> f64 {
        f64::from_bits(u64::from_le(self.0))
    }
}

// ===== Compile-time sanity checks =========================================

const_assert_eq!(size_of::<WireChunkHdr>(), WireChunkHdr::SIZE);
const_assert_eq!(size_of::<WireGroupSummary>(), WireGroupSummary::SIZE);
const_assert_eq!(size_of::<WireF64>(), 8);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_preserves_flags_and_work() {
        let s = WireGroupSummary::new(12.5, true, false);
        let back = WireGroupSummary::from_bytes(&s.to_bytes()).unwrap();
        assert_eq!(back.work(), 12.5);
        assert!(back.group_may_supply());
        assert!(!back.process_may_supply());
    }

    #[test]
    fn summary_rejects_short_buffer() {
        assert!(WireGroupSummary::from_bytes(&[0u8; 9]).is_err());
    }

    #[test]
    fn chunk_header_parse() {
        let mut chunk = bytemuck::bytes_of(&WireChunkHdr::new(3, 10)).to_vec();
        chunk.extend_from_slice(&[7, 8, 9]);
        let (hdr, payload) = WireChunkHdr::parse(&chunk).unwrap();
        assert_eq!(hdr.total_len(), 10);
        assert_eq!(payload, &[7, 8, 9]);
    }

    #[test]
    fn chunk_header_rejects_bad_version() {
        let mut hdr = WireChunkHdr::new(0, 0);
        hdr.version_le = 99u16.to_le();
        assert!(WireChunkHdr::parse(bytemuck::bytes_of(&hdr)).is_err());
    }

    #[test]
    fn chunk_header_rejects_truncated_payload() {
        let mut chunk = bytemuck::bytes_of(&WireChunkHdr::new(4, 4)).to_vec();
        chunk.push(1);
        assert!(WireChunkHdr::parse(&chunk).is_err());
    }
}
