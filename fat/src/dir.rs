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

use std::collections::VecDeque;

use gotek_ds::DataStorage;
use gotek_err::Result;
use log::warn;
use zerocopy::{
    little_endian::{U16, U32},
    FromBytes, Immutable, IntoBytes, KnownLayout,
};

use crate::{FatVariant, FatVolume, RootDirectory};

/// Directory entry attribute byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attributes(pub u8);

impl Attributes {
    pub const READ_ONLY: u8 = 0x01;
    pub const HIDDEN: u8 = 0x02;
    pub const SYSTEM: u8 = 0x04;
    pub const LABEL: u8 = 0x08;
    pub const DIRECTORY: u8 = 0x10;
    pub const ARCHIVE: u8 = 0x20;
    /// All four low bits at once mark a long-name slot.
    pub const LONG_NAME: u8 = 0x0F;

    pub fn is_directory(self) -> bool {
        self.0 & Self::DIRECTORY != 0
    }

    pub fn is_long_name(self) -> bool {
        self.0 & Self::LONG_NAME == Self::LONG_NAME
    }

    pub fn is_volume_label(self) -> bool {
        self.0 & Self::LABEL != 0 && self.0 & Self::READ_ONLY == 0
    }
}

/// Calendar date as packed into the 16-bit FAT date fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FatDate {
    pub year: u16,
    pub month: u8,
    pub day: u8,
}

impl FatDate {
    /// `(year - 1980) << 9 | month << 5 | day`. Out-of-range month/day
    /// values are clamped rather than rejected.
    pub fn from_raw(value: u16) -> Self {
        Self {
            year: 1980 + (value >> 9),
            month: ((value >> 5) & 0x0F).clamp(1, 12) as u8,
            day: (value & 0x1F).clamp(1, 31) as u8,
        }
    }
}

/// Timestamp with 2-second granularity, refined to 10 ms for creation
/// times by the extra centiseconds byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FatDateTime {
    pub date: FatDate,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub micros: u32,
}

impl FatDateTime {
    /// `time` is `hour << 11 | minute << 5 | second / 2`; `centiseconds`
    /// counts 10 ms units and carries the odd second when 100 or more.
    pub fn from_raw(centiseconds: u8, time: u16, date: u16) -> Self {
        let mut second = ((time & 0x1F) * 2) as u8;
        let mut centiseconds = centiseconds;
        if centiseconds >= 100 {
            second += 1;
            centiseconds -= 100;
        }
        Self {
            date: FatDate::from_raw(date),
            hour: ((time >> 11) & 0x1F) as u8,
            minute: ((time >> 5) & 0x3F) as u8,
            second,
            micros: centiseconds as u32 * 10_000,
        }
    }
}

/// A parsed directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Long filename when one was attached, the normalized short name
    /// otherwise.
    pub name: String,
    pub attributes: Attributes,
    pub created: FatDateTime,
    pub last_accessed: FatDate,
    pub modified: FatDateTime,
    /// First cluster of the entry's chain; 0 for empty files.
    pub cluster: u32,
    pub size: u32,
    /// Byte offset of the 32-byte record this entry was parsed from.
    pub offset: u64,
}

/// Checksum of an 8.3 short name, stored in every long-name slot that
/// belongs to it.
pub fn lfn_checksum(short_name: &[u8; 11]) -> u8 {
    short_name.iter().fold(0u8, |sum, &byte| {
        ((sum & 1) << 7).wrapping_add(sum >> 1).wrapping_add(byte)
    })
}

fn normalize_short_name(short_name: &[u8; 11]) -> String {
    let trim = |bytes: &[u8]| -> String {
        let end = bytes
            .iter()
            .rposition(|&byte| byte != b' ')
            .map_or(0, |at| at + 1);
        String::from_utf8_lossy(&bytes[..end]).into_owned()
    };
    let base = trim(&short_name[..8]);
    let extension = trim(&short_name[8..]);
    if extension.is_empty() {
        base
    } else {
        format!("{base}.{extension}")
    }
}

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct RawDirEntry {
    /// 8.3 short name; the first byte doubles as the entry state (0x00 end
    /// of directory, 0xE5 deleted).
    dir_name: [u8; 11],
    dir_attr: u8,
    dir_ntres: u8,
    /// Creation time, tenths of a second (0..=199).
    dir_crttimetenth: u8,
    dir_crttime: U16,
    dir_crtdate: U16,
    dir_lstaccdate: U16,
    /// High word of the first cluster; meaningful on FAT32 only.
    dir_fstclushi: U16,
    dir_wrttime: U16,
    dir_wrtdate: U16,
    dir_fstcluslo: U16,
    dir_filesize: U32,
}

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct RawLfnEntry {
    /// Sequence number; 0x40 is set on the last slot of the set, which is
    /// stored first.
    ldir_ord: u8,
    /// Name characters 1-5, UTF-16LE.
    ldir_name1: [U16; 5],
    /// Always 0x0F.
    ldir_attr: u8,
    ldir_type: u8,
    /// Checksum of the companion short name.
    ldir_chksum: u8,
    /// Name characters 6-11.
    ldir_name2: [U16; 6],
    /// Always 0.
    ldir_fstcluslo: U16,
    /// Name characters 12-13.
    ldir_name3: [U16; 2],
}

/// Accumulates 32-byte directory records into parsed entries, carrying
/// long-name state across cluster boundaries.
struct DirWalker {
    variant: FatVariant,
    entries: Vec<DirEntry>,
    fragments: VecDeque<Vec<u16>>,
    next_seq: Option<u8>,
    checksum: Option<u8>,
}

impl DirWalker {
    fn new(variant: FatVariant) -> Self {
        Self {
            variant,
            entries: Vec::new(),
            fragments: VecDeque::new(),
            next_seq: None,
            checksum: None,
        }
    }

    /// Consumes one region of records. Returns false once the 0x00
    /// end-of-directory marker was seen.
    fn feed(&mut self, region: &[u8], base: u64) -> bool {
        for (index, raw) in region.chunks_exact(size_of::<RawDirEntry>()).enumerate() {
            if raw[0] == 0x00 {
                return false;
            }
            if raw[0] == 0xE5 {
                self.reset();
                continue;
            }
            let attributes = Attributes(raw[11]);
            if attributes.is_long_name() {
                self.push_long_name(raw);
                continue;
            }
            if attributes.is_volume_label() {
                continue;
            }
            let Ok(entry) = RawDirEntry::read_from_bytes(raw) else {
                break;
            };
            let offset = base + (index * size_of::<RawDirEntry>()) as u64;
            self.emit(&entry, offset);
        }
        true
    }

    fn finish(self) -> Vec<DirEntry> {
        self.entries
    }

    fn reset(&mut self) {
        self.fragments.clear();
        self.next_seq = None;
        self.checksum = None;
    }

    fn push_long_name(&mut self, raw: &[u8]) {
        let Ok(slot) = RawLfnEntry::read_from_bytes(raw) else {
            return;
        };
        let seq = slot.ldir_ord;
        if seq & 0x40 != 0 {
            self.fragments.clear();
            self.next_seq = Some((seq & !0x40).wrapping_sub(1));
        } else if self.next_seq == Some(seq) {
            self.next_seq = Some(seq.wrapping_sub(1));
        } else {
            warn!(
                "bad LFN sequence number: expected {:?}, found {seq}",
                self.next_seq
            );
        }
        self.checksum = Some(slot.ldir_chksum);

        // Slots arrive tail first, so each one is prepended.
        let mut units = Vec::with_capacity(13);
        units.extend(slot.ldir_name1.iter().map(|unit| unit.get()));
        units.extend(slot.ldir_name2.iter().map(|unit| unit.get()));
        units.extend(slot.ldir_name3.iter().map(|unit| unit.get()));
        self.fragments.push_front(units);
    }

    fn take_long_name(&mut self, short_name: &[u8; 11]) -> Option<String> {
        if let Some(expected) = self.checksum.take() {
            let actual = lfn_checksum(short_name);
            if actual != expected {
                warn!("LFN checksum mismatch for {short_name:?}: {actual:#04x} != {expected:#04x}");
            }
        }
        self.next_seq = None;
        if self.fragments.is_empty() {
            return None;
        }

        let mut fragments: Vec<Vec<u16>> = self.fragments.drain(..).collect();
        for fragment in &mut fragments {
            while fragment.last() == Some(&0xFFFF) {
                fragment.pop();
            }
        }
        // The name proper ends with a single 0x0000 terminator before the
        // 0xFFFF fill, sitting in the tail fragment.
        if let Some(last) = fragments.last_mut() {
            if last.last() == Some(&0x0000) {
                last.pop();
            }
        }
        let name = String::from_utf16_lossy(&fragments.concat());
        (!name.is_empty()).then_some(name)
    }

    fn emit(&mut self, entry: &RawDirEntry, offset: u64) {
        let mut cluster = entry.dir_fstcluslo.get() as u32;
        if self.variant == FatVariant::Fat32 {
            cluster |= (entry.dir_fstclushi.get() as u32) << 16;
        }
        let name = self
            .take_long_name(&entry.dir_name)
            .unwrap_or_else(|| normalize_short_name(&entry.dir_name));
        self.entries.push(DirEntry {
            name,
            attributes: Attributes(entry.dir_attr),
            created: FatDateTime::from_raw(
                entry.dir_crttimetenth,
                entry.dir_crttime.get(),
                entry.dir_crtdate.get(),
            ),
            last_accessed: FatDate::from_raw(entry.dir_lstaccdate.get()),
            modified: FatDateTime::from_raw(0, entry.dir_wrttime.get(), entry.dir_wrtdate.get()),
            cluster,
            size: entry.dir_filesize.get(),
            offset,
        });
    }
}

impl<DS: DataStorage> FatVolume<DS> {
    /// Entries of the root directory.
    pub fn read_root(&self) -> Result<Vec<DirEntry>> {
        match self.root_dir {
            RootDirectory::Region { offset, entries } => {
                let mut region = vec![0; entries as usize * size_of::<RawDirEntry>()];
                self.storage.read(offset, &mut region)?;
                let mut walker = DirWalker::new(self.variant);
                walker.feed(&region, offset);
                Ok(walker.finish())
            }
            RootDirectory::Chain(cluster) => self.read_dir(cluster),
        }
    }

    /// Entries of the directory whose chain starts at `cluster`.
    pub fn read_dir(&self, cluster: u32) -> Result<Vec<DirEntry>> {
        let mut walker = DirWalker::new(self.variant);
        for cluster in self.cluster_chain(cluster)? {
            let region = self.read_cluster(cluster)?;
            if !walker.feed(&region, self.cluster_to_offset(cluster)) {
                break;
            }
        }
        Ok(walker.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn short_entry(name: &[u8; 11], attr: u8, cluster: u16, size: u32) -> [u8; 32] {
        let mut raw = [0; 32];
        raw[..11].copy_from_slice(name);
        raw[11] = attr;
        raw[26..28].copy_from_slice(&cluster.to_le_bytes());
        raw[28..32].copy_from_slice(&size.to_le_bytes());
        raw
    }

    fn lfn_slot(seq: u8, units: &[u16; 13], checksum: u8) -> [u8; 32] {
        let mut raw = [0; 32];
        raw[0] = seq;
        raw[11] = 0x0F;
        raw[13] = checksum;
        for (at, unit) in [1, 3, 5, 7, 9, 14, 16, 18, 20, 22, 24, 28, 30]
            .into_iter()
            .zip(units)
        {
            raw[at..at + 2].copy_from_slice(&unit.to_le_bytes());
        }
        raw
    }

    fn lfn_units(name: &str, take: usize, skip: usize) -> [u16; 13] {
        let mut units = [0xFFFF; 13];
        let encoded: Vec<u16> = name.encode_utf16().chain([0x0000]).collect();
        for (unit, value) in units.iter_mut().zip(encoded.iter().skip(skip).take(take)) {
            *unit = *value;
        }
        units
    }

    #[test]
    fn records_are_32_bytes() {
        assert_eq!(size_of::<RawDirEntry>(), 32);
        assert_eq!(size_of::<RawLfnEntry>(), 32);
    }

    #[test]
    fn checksum_rolls_right() {
        assert_eq!(lfn_checksum(b"A          "), 128);
        assert_eq!(lfn_checksum(&[0; 11]), 0);
    }

    #[test]
    fn short_names_normalize() {
        assert_eq!(normalize_short_name(b"FOO     BAR"), "FOO.BAR");
        assert_eq!(normalize_short_name(b"FOO        "), "FOO");
        assert_eq!(normalize_short_name(b"AB      C  "), "AB.C");
    }

    #[test]
    fn dates_clamp_instead_of_failing() {
        let date = FatDate::from_raw((44 << 9) | (0 << 5) | 0);
        assert_eq!((date.year, date.month, date.day), (2024, 1, 1));
        let date = FatDate::from_raw((5 << 9) | (13 << 5) | 31);
        assert_eq!((date.year, date.month, date.day), (1985, 12, 31));
    }

    #[test]
    fn creation_centiseconds_carry_the_odd_second() {
        let time = (13 << 11) | (37 << 5) | (24 / 2);
        let stamp = FatDateTime::from_raw(150, time, (20 << 9) | (6 << 5) | 15);
        assert_eq!((stamp.hour, stamp.minute, stamp.second), (13, 37, 25));
        assert_eq!(stamp.micros, 500_000);
        assert_eq!((stamp.date.year, stamp.date.month, stamp.date.day), (2000, 6, 15));
    }

    #[test]
    fn walker_reassembles_two_slot_names() {
        let name = "LongFileName.adf";
        let short = b"LONGFI~1ADF";
        let sum = lfn_checksum(short);

        let mut region = Vec::new();
        region.extend_from_slice(&short_entry(b"STICK      ", Attributes::LABEL, 0, 0));
        region.extend_from_slice(&lfn_slot(0x42, &lfn_units(name, 13, 13), sum));
        region.extend_from_slice(&lfn_slot(0x01, &lfn_units(name, 13, 0), sum));
        region.extend_from_slice(&short_entry(short, Attributes::ARCHIVE, 2, 901_120));
        region.extend_from_slice(&{
            let mut deleted = short_entry(b"GONE    ADF", Attributes::ARCHIVE, 9, 1);
            deleted[0] = 0xE5;
            deleted
        });
        region.extend_from_slice(&short_entry(b"B       ADF", Attributes::ARCHIVE, 3, 512));
        region.extend_from_slice(&[0; 32]);
        // Records after the terminator must never surface.
        region.extend_from_slice(&short_entry(b"GHOST   ADF", Attributes::ARCHIVE, 7, 1));

        let mut walker = DirWalker::new(FatVariant::Fat12);
        assert!(!walker.feed(&region, 0x800));
        let entries = walker.finish();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "LongFileName.adf");
        assert_eq!(entries[0].cluster, 2);
        assert_eq!(entries[0].size, 901_120);
        assert_eq!(entries[0].offset, 0x800 + 3 * 32);
        assert_eq!(entries[1].name, "B.ADF");
        assert_eq!(entries[1].cluster, 3);
    }

    #[test]
    fn walker_takes_single_slot_names() {
        let short = b"README  TXT";
        let sum = lfn_checksum(short);
        let mut region = Vec::new();
        region.extend_from_slice(&lfn_slot(0x41, &lfn_units("ReadMe.txt", 13, 0), sum));
        region.extend_from_slice(&short_entry(short, Attributes::ARCHIVE, 5, 42));
        region.extend_from_slice(&[0; 32]);

        let mut walker = DirWalker::new(FatVariant::Fat16);
        walker.feed(&region, 0);
        let entries = walker.finish();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "ReadMe.txt");
    }

    #[test]
    fn walker_accepts_checksum_mismatch() {
        let short = b"MISMATCHADF";
        let mut region = Vec::new();
        region.extend_from_slice(&lfn_slot(0x41, &lfn_units("Mismatch.adf", 13, 0), 0xAB));
        region.extend_from_slice(&short_entry(short, Attributes::ARCHIVE, 8, 1));
        region.extend_from_slice(&[0; 32]);

        let mut walker = DirWalker::new(FatVariant::Fat16);
        walker.feed(&region, 0);
        let entries = walker.finish();
        assert_eq!(entries[0].name, "Mismatch.adf");
    }

    #[test]
    fn fat32_high_cluster_word_is_combined() {
        let mut raw = short_entry(b"BIG     ADF", Attributes::ARCHIVE, 0x0002, 1);
        raw[20..22].copy_from_slice(&1u16.to_le_bytes());

        let mut walker = DirWalker::new(FatVariant::Fat32);
        walker.feed(&raw, 0);
        assert_eq!(walker.finish()[0].cluster, 0x0001_0002);

        // The same word is reserved junk on FAT12/16.
        let mut walker = DirWalker::new(FatVariant::Fat16);
        walker.feed(&raw, 0);
        assert_eq!(walker.finish()[0].cluster, 0x0002);
    }
}
