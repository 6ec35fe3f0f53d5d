// Copyright 2024 Kevin Ludwig
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::borrow::Cow;

use gotek_err::{Result, SelectorError};
use zerocopy::{
    little_endian::{U16, U32},
    transmute, FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout,
};

/// Absolute offset of the stats header inside selector.adf.
pub const STATS_OFFSET: u64 = 0x29416;
pub const STATS_SIZE: usize = 8;
/// Absolute offset of the first slot record.
pub const REC_OFFSET: u64 = 0x29880;
pub const REC_SIZE: usize = 128;
pub const MAX_SLOTS: u16 = 999;

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct RawStats {
    n_images: U16,
    default_slot: u8,
    /// Upper byte of what may once have been a 16-bit slot number; kept
    /// verbatim.
    default_slot_hi: u8,
    unk1: u8,
    unk2: u8,
    unk3: u8,
    unk4: u8,
}

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct RawSlotRecord {
    /// 8.3 short name, NUL-padded. A zero first byte means the whole slot
    /// is unused.
    short_name: [u8; 11],
    reserved1: u8,
    reserved2: u8,
    /// First cluster of the image on the stick.
    start_cluster: U32,
    file_size: U32,
    /// Original filename, NUL-padded.
    file_name: [u8; 41],
    zeros: [u8; 66],
}

/// The 8-byte stats header. Only the default slot is understood; the rest
/// rides along untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stats {
    pub n_images: u16,
    pub default_slot: u8,
    pub default_slot_hi: u8,
    /// Trailing bytes of unknown meaning.
    pub unknown: [u8; 4],
}

impl Stats {
    pub fn decode(raw: &[u8; STATS_SIZE]) -> Self {
        let raw: RawStats = transmute!(*raw);
        Self {
            n_images: raw.n_images.get(),
            default_slot: raw.default_slot,
            default_slot_hi: raw.default_slot_hi,
            unknown: [raw.unk1, raw.unk2, raw.unk3, raw.unk4],
        }
    }
}

/// One record of the slot table, plus bookkeeping that never hits the
/// disk: the 1-based slot number, the cleared flag, and the path the start
/// cluster resolved to.
///
/// Both names are raw bytes; the medium predates any text encoding
/// guarantee. They only become strings for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub num: u16,
    /// Write this slot back as all zeros.
    pub cleared: bool,
    pub short_name: Vec<u8>,
    pub start_cluster: u32,
    pub file_size: u32,
    pub file_name: Vec<u8>,
    pub disk_file_name: Option<String>,
}

impl Slot {
    /// Decodes a 128-byte record; `None` when the slot is not present.
    /// Present records with non-zero reserved bytes are refused, so format
    /// drift cannot slip through unnoticed.
    pub fn decode(num: u16, raw: &[u8; REC_SIZE]) -> Result<Option<Self>> {
        if raw[0] == 0 {
            return Ok(None);
        }
        let record: RawSlotRecord = transmute!(*raw);
        if record.reserved1 != 0
            || record.reserved2 != 0
            || record.zeros.iter().any(|&byte| byte != 0)
        {
            return Err(SelectorError::RecordInvariant(num).into());
        }
        Ok(Some(Self {
            num,
            cleared: false,
            short_name: trim_nuls(&record.short_name),
            start_cluster: record.start_cluster.get(),
            file_size: record.file_size.get(),
            file_name: trim_nuls(&record.file_name),
            disk_file_name: None,
        }))
    }

    /// Encodes back into a 128-byte record; cleared slots become all
    /// zeros. Names are truncated or NUL-padded to their fixed widths.
    pub fn encode(&self) -> [u8; REC_SIZE] {
        if self.cleared {
            return [0; REC_SIZE];
        }
        let mut record = RawSlotRecord::new_zeroed();
        pad(&mut record.short_name, &self.short_name);
        record.start_cluster = U32::new(self.start_cluster);
        record.file_size = U32::new(self.file_size);
        pad(&mut record.file_name, &self.file_name);
        transmute!(record)
    }

    pub fn cleared_record(num: u16) -> Self {
        Self {
            num,
            cleared: true,
            short_name: Vec::new(),
            start_cluster: 0,
            file_size: 0,
            file_name: Vec::new(),
            disk_file_name: None,
        }
    }

    pub fn file_name_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.file_name)
    }
}

fn trim_nuls(bytes: &[u8]) -> Vec<u8> {
    let end = bytes
        .iter()
        .rposition(|&byte| byte != 0)
        .map_or(0, |at| at + 1);
    bytes[..end].to_vec()
}

fn pad(field: &mut [u8], value: &[u8]) {
    let len = value.len().min(field.len());
    field[..len].copy_from_slice(&value[..len]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_layout_is_fixed() {
        assert_eq!(size_of::<RawSlotRecord>(), REC_SIZE);
        assert_eq!(size_of::<RawStats>(), STATS_SIZE);
    }

    #[test]
    fn encode_decode_is_identity() {
        let slot = Slot {
            num: 7,
            cleared: false,
            short_name: b"TURRIC~1ADF".to_vec(),
            start_cluster: 0x0001_2345,
            file_size: 901_120,
            file_name: b"Turrican II.adf".to_vec(),
            disk_file_name: None,
        };
        let decoded = Slot::decode(7, &slot.encode()).unwrap().unwrap();
        assert_eq!(decoded, slot);
    }

    #[test]
    fn interior_nuls_survive_the_round_trip() {
        let slot = Slot {
            num: 1,
            cleared: false,
            short_name: b"A\0B".to_vec(),
            start_cluster: 2,
            file_size: 1,
            file_name: b"a\0b\0c".to_vec(),
            disk_file_name: None,
        };
        assert_eq!(Slot::decode(1, &slot.encode()).unwrap().unwrap(), slot);
    }

    #[test]
    fn long_names_are_truncated_to_their_fields() {
        let slot = Slot {
            num: 1,
            cleared: false,
            short_name: vec![b'S'; 64],
            start_cluster: 2,
            file_size: 1,
            file_name: vec![b'L'; 64],
            disk_file_name: None,
        };
        let raw = slot.encode();
        let decoded = Slot::decode(1, &raw).unwrap().unwrap();
        assert_eq!(decoded.short_name.len(), 11);
        assert_eq!(decoded.file_name.len(), 41);
        assert!(raw[62..].iter().all(|&byte| byte == 0));
    }

    #[test]
    fn cleared_slots_encode_to_zeros() {
        let raw = Slot::cleared_record(42).encode();
        assert_eq!(raw, [0; REC_SIZE]);
        assert!(Slot::decode(42, &raw).unwrap().is_none());
    }

    #[test]
    fn dirty_reserved_bytes_are_refused() {
        let mut raw = Slot {
            num: 3,
            cleared: false,
            short_name: b"X".to_vec(),
            start_cluster: 5,
            file_size: 10,
            file_name: b"x.adf".to_vec(),
            disk_file_name: None,
        }
        .encode();
        raw[100] = 0xAA;
        assert!(Slot::decode(3, &raw).is_err());
        raw[100] = 0;
        raw[11] = 1;
        assert!(Slot::decode(3, &raw).is_err());
    }

    #[test]
    fn stats_header_decodes() {
        let stats = Stats::decode(&[0x2A, 0x00, 0x03, 0x00, 0xE5, 0x01, 0x00, 0x07]);
        assert_eq!(stats.n_images, 42);
        assert_eq!(stats.default_slot, 3);
        assert_eq!(stats.unknown, [0xE5, 0x01, 0x00, 0x07]);
    }
}
