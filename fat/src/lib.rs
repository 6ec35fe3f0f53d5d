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

use std::collections::HashSet;

use gotek_ds::DataStorage;
use gotek_err::{Error, Result, VolumeError};
use log::debug;
use zerocopy::{
    little_endian::{U16, U32},
    FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout,
};

pub mod dir;
pub mod inventory;

pub use dir::{Attributes, DirEntry, FatDate, FatDateTime};
pub use inventory::{Inventory, InventoryEntry};

/// FAT flavor. Decided by the cluster count alone, never by the label
/// strings in the boot sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatVariant {
    Fat12,
    Fat16,
    Fat32,
}

impl FatVariant {
    pub fn from_cluster_count(clusters: u32) -> Self {
        if clusters < 4085 {
            Self::Fat12
        } else if clusters < 65525 {
            Self::Fat16
        } else {
            Self::Fat32
        }
    }

    /// Any FAT cell value at or above this sentinel terminates a chain.
    pub fn end_of_chain(self) -> u32 {
        match self {
            Self::Fat12 => 0x0FF8,
            Self::Fat16 => 0xFFF8,
            Self::Fat32 => 0x0FFF_FFF8,
        }
    }
}

/// Where the root directory lives: a fixed region between the FATs and the
/// data area on FAT12/16, an ordinary cluster chain on FAT32.
#[derive(Debug, Clone, Copy)]
pub enum RootDirectory {
    Region { offset: u64, entries: u32 },
    Chain(u32),
}

/// A mounted (read-only) FAT volume.
pub struct FatVolume<DS: DataStorage> {
    storage: DS,
    variant: FatVariant,
    bytes_per_sector: u64,
    sectors_per_cluster: u64,
    fat_start: u64,
    data_start: u64,
    root_dir: RootDirectory,
    num_clusters: u32,
}

impl<DS: DataStorage> FatVolume<DS> {
    /// Parses the boot sector found at `start` and lays out the volume.
    pub fn new(storage: DS, start: u64) -> Result<Self> {
        let mut boot_sector = BootSector::new_zeroed();
        storage.read(start, boot_sector.as_mut_bytes())?;

        if boot_sector.signature_word != [0x55, 0xAA] {
            return Err(VolumeError::BootSector("bad signature word").into());
        }
        let bytes_per_sector = boot_sector.bpb_bytspersec.get() as u64;
        if !bytes_per_sector.is_power_of_two() || !(512..=4096).contains(&bytes_per_sector) {
            return Err(VolumeError::BootSector("bytes per sector").into());
        }
        let sectors_per_cluster = boot_sector.bpb_secperclus as u64;
        if !sectors_per_cluster.is_power_of_two() {
            return Err(VolumeError::BootSector("sectors per cluster").into());
        }
        let num_fats = boot_sector.bpb_numfats as u64;
        if num_fats != 1 && num_fats != 2 {
            return Err(VolumeError::BootSector("number of FATs").into());
        }
        let total_sectors = if boot_sector.bpb_totsec16.get() != 0 {
            boot_sector.bpb_totsec16.get() as u64
        } else {
            boot_sector.bpb_totsec32.get() as u64
        };
        if total_sectors == 0 {
            return Err(VolumeError::BootSector("total sectors").into());
        }
        // Zero in both fields means the BPB region is blank, which is what
        // exFAT media look like from here.
        let sectors_per_fat = if boot_sector.bpb_fatsz16.get() != 0 {
            boot_sector.bpb_fatsz16.get() as u64
        } else {
            boot_sector.bpb_fatsz32.get() as u64
        };
        if sectors_per_fat == 0 {
            return Err(VolumeError::BootSector("sectors per FAT").into());
        }

        let reserved_sectors = boot_sector.bpb_rsvdseccnt.get() as u64;
        let root_entries = boot_sector.bpb_rootentcnt.get() as u64;

        let fat_start = start + reserved_sectors * bytes_per_sector;
        let root_dir_sectors = (root_entries * 32 + bytes_per_sector - 1) / bytes_per_sector;
        let data_sectors = total_sectors
            .checked_sub(reserved_sectors + num_fats * sectors_per_fat + root_dir_sectors)
            .ok_or(VolumeError::BootSector("data region underflow"))?;
        let num_clusters = (data_sectors / sectors_per_cluster) as u32;
        let variant = FatVariant::from_cluster_count(num_clusters);
        debug!("{variant:?} volume, {num_clusters} clusters");

        let (data_start, root_dir) = match variant {
            FatVariant::Fat12 | FatVariant::Fat16 => {
                let offset = fat_start + num_fats * sectors_per_fat * bytes_per_sector;
                (
                    offset + 32 * root_entries,
                    RootDirectory::Region {
                        offset,
                        entries: root_entries as u32,
                    },
                )
            }
            FatVariant::Fat32 => (
                fat_start + num_fats * sectors_per_fat * bytes_per_sector,
                RootDirectory::Chain(boot_sector.bpb_rootclus.get()),
            ),
        };
        debug!("FAT at {fat_start:#x}, data at {data_start:#x}, root {root_dir:?}");

        Ok(Self {
            storage,
            variant,
            bytes_per_sector,
            sectors_per_cluster,
            fat_start,
            data_start,
            root_dir,
            num_clusters,
        })
    }

    pub fn variant(&self) -> FatVariant {
        self.variant
    }

    pub fn num_clusters(&self) -> u32 {
        self.num_clusters
    }

    /// Byte offset of `cluster` within the data region. Meaningful for
    /// cluster numbers from 2 up.
    pub fn cluster_to_offset(&self, cluster: u32) -> u64 {
        debug_assert!(cluster >= 2);
        self.data_start + (cluster as u64 - 2) * self.sectors_per_cluster * self.bytes_per_sector
    }

    /// Reads the FAT cell for `cluster` and returns the chain's next link.
    pub fn next_cluster(&self, cluster: u32) -> Result<u32> {
        match self.variant {
            // Cells are packed two per three bytes; odd cluster numbers sit
            // in the upper 12 bits of the 16-bit read.
            FatVariant::Fat12 => {
                let mut cell = [0; 2];
                self.storage
                    .read(self.fat_start + cluster as u64 + cluster as u64 / 2, &mut cell)?;
                let value = u16::from_le_bytes(cell);
                Ok(if cluster & 1 != 0 {
                    (value >> 4) as u32
                } else {
                    (value & 0x0FFF) as u32
                })
            }
            FatVariant::Fat16 => {
                let mut cell = [0; 2];
                self.storage
                    .read(self.fat_start + cluster as u64 * 2, &mut cell)?;
                Ok(u16::from_le_bytes(cell) as u32)
            }
            // The upper 4 bits of a FAT32 cell are reserved.
            FatVariant::Fat32 => {
                let mut cell = [0; 4];
                self.storage
                    .read(self.fat_start + cluster as u64 * 4, &mut cell)?;
                Ok(u32::from_le_bytes(cell) & 0x0FFF_FFFF)
            }
        }
    }

    /// Iterator over the chain starting at `cluster`; see [`ClusterChain`].
    pub fn clusters(&self, cluster: u32) -> ClusterChain<'_, DS> {
        ClusterChain::new(self, cluster)
    }

    /// Collects the chain starting at `cluster`. A start of 0 stands for
    /// "no data" and yields `[0]`.
    pub fn cluster_chain(&self, cluster: u32) -> Result<Vec<u32>> {
        if cluster == 0 {
            return Ok(vec![0]);
        }
        self.clusters(cluster).collect()
    }

    /// The raw contents of `cluster`; empty for the reserved clusters 0 and 1.
    pub fn read_cluster(&self, cluster: u32) -> Result<Vec<u8>> {
        if cluster < 2 {
            return Ok(Vec::new());
        }
        let mut data = vec![0; (self.sectors_per_cluster * self.bytes_per_sector) as usize];
        self.storage.read(self.cluster_to_offset(cluster), &mut data)?;
        Ok(data)
    }

    /// The volume label stored in the first root directory slot.
    // TODO: scan the root directory for the LABEL attribute instead of
    // trusting slot 0.
    pub fn label(&self) -> Result<String> {
        let offset = match self.root_dir {
            RootDirectory::Region { offset, .. } => offset,
            RootDirectory::Chain(cluster) => self.cluster_to_offset(cluster),
        };
        let mut label = [0; 11];
        self.storage.read(offset, &mut label)?;
        Ok(String::from_utf8_lossy(&label)
            .trim_matches(|c: char| c == ' ' || c == '\0')
            .to_string())
    }

    /// Reads the file at `path` (case-insensitive, `/`-separated) in full.
    pub fn read_file(&self, inventory: &Inventory, path: &str) -> Result<Vec<u8>> {
        let wanted = path.to_lowercase();
        let entry = inventory
            .entries()
            .iter()
            .find(|candidate| candidate.path.to_lowercase() == wanted)
            .ok_or_else(|| VolumeError::FileNotFound(path.to_string()))?;
        let size = entry.entry.size as usize;
        let mut data = Vec::with_capacity(size);
        for cluster in self.cluster_chain(entry.entry.cluster)? {
            data.extend_from_slice(&self.read_cluster(cluster)?);
            if data.len() >= size {
                break;
            }
        }
        data.truncate(size);
        Ok(data)
    }
}

/// Walks a FAT chain, yielding each cluster in order.
///
/// The walk ends cleanly at the end-of-chain sentinel. A link that revisits
/// a cluster or points into the reserved range below 2 ends it with
/// [`VolumeError::ChainCorrupt`] after the last good cluster.
pub struct ClusterChain<'volume, DS: DataStorage> {
    volume: &'volume FatVolume<DS>,
    cluster: Option<u32>,
    pending: Option<Error>,
    visited: HashSet<u32>,
}

impl<'volume, DS: DataStorage> ClusterChain<'volume, DS> {
    fn new(volume: &'volume FatVolume<DS>, cluster: u32) -> Self {
        let mut chain = Self {
            volume,
            cluster: None,
            pending: None,
            visited: HashSet::new(),
        };
        if cluster < 2 {
            chain.pending = Some(VolumeError::ChainCorrupt(cluster).into());
        } else {
            chain.cluster = Some(cluster);
            chain.visited.insert(cluster);
        }
        chain
    }
}

impl<DS: DataStorage> Iterator for ClusterChain<'_, DS> {
    type Item = Result<u32>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(error) = self.pending.take() {
            return Some(Err(error));
        }
        let cluster = self.cluster.take()?;
        match self.volume.next_cluster(cluster) {
            Ok(next) if next >= self.volume.variant.end_of_chain() => {}
            Ok(next) => {
                if next < 2 || !self.visited.insert(next) {
                    self.pending = Some(VolumeError::ChainCorrupt(next).into());
                } else {
                    self.cluster = Some(next);
                }
            }
            Err(error) => self.pending = Some(error),
        }
        Some(Ok(cluster))
    }
}

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct BootSector {
    /// x86 jump to the bootstrap code; 0xEB or 0xE9 forms.
    bs_jmpboot: [u8; 3],
    /// Free-form marker of whatever formatted the volume.
    bs_oemname: [u8; 8],

    /// Bytes per logical sector: 512, 1024, 2048 or 4096.
    bpb_bytspersec: U16,
    /// Sectors per allocation unit, a power of two up to 128.
    bpb_secperclus: u8,
    /// Sectors before the first FAT, counting the boot sector itself.
    bpb_rsvdseccnt: U16,
    /// FAT copies on the volume, normally 2.
    bpb_numfats: u8,
    /// Slots in the fixed root directory; 0 on FAT32, where the root is a
    /// regular cluster chain instead.
    bpb_rootentcnt: U16,
    /// 16-bit total sector count; 0 means the count lives in
    /// `bpb_totsec32`.
    bpb_totsec16: U16,
    /// Media descriptor, 0xF8 fixed / 0xF0 removable.
    bpb_media: u8,
    /// 16-bit sectors per FAT; 0 means the count lives in `bpb_fatsz32`
    /// (always the case on FAT32).
    bpb_fatsz16: U16,

    /// CHS geometry leftovers, irrelevant for LBA access.
    bpb_secpertrk: U16,
    bpb_numheads: U16,
    /// Sectors preceding this partition; zero on unpartitioned media.
    bpb_hiddsec: U32,

    /// 32-bit total sector count, used when `bpb_totsec16` is 0.
    bpb_totsec32: U32,

    // Everything from here to the boot code carries the FAT32 extended BPB
    // layout; on FAT12/16 media these bytes hold the short EBPB instead and
    // must not be interpreted.
    /// 32-bit sectors per FAT.
    bpb_fatsz32: U32,
    /// FAT mirroring flags.
    bpb_extflags: U16,
    /// Format revision, 0.0 everywhere in practice.
    bpb_fsver: U16,
    /// First cluster of the root directory, usually 2.
    bpb_rootclus: U32,
    /// Sector of the FSINFO structure, usually 1.
    bpb_fsinfo: U16,
    /// First sector of the backup boot record, or 0.
    bpb_bkbootsec: U16,
    bpb_reserved: [u8; 12],

    /// INT 13h drive number.
    bs_drvnum: u8,
    bs_reserved1: u8,
    /// 0x29 when the id/label/type fields below are present.
    bs_bootsig: u8,
    /// Volume serial, typically derived from the format date and time.
    bs_volid: U32,
    /// Copy of the root directory's volume label entry.
    bs_vollab: [u8; 11],
    /// Informational "FAT32   " string; never authoritative for the
    /// variant.
    bs_filsystype: [u8; 8],

    bs_boot: [u8; 420],
    /// 0x55 0xAA at byte offset 510.
    signature_word: [u8; 2],
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variant_thresholds() {
        assert_eq!(FatVariant::from_cluster_count(0), FatVariant::Fat12);
        assert_eq!(FatVariant::from_cluster_count(4084), FatVariant::Fat12);
        assert_eq!(FatVariant::from_cluster_count(4085), FatVariant::Fat16);
        assert_eq!(FatVariant::from_cluster_count(65524), FatVariant::Fat16);
        assert_eq!(FatVariant::from_cluster_count(65525), FatVariant::Fat32);
    }

    #[test]
    fn end_of_chain_sentinels() {
        assert_eq!(FatVariant::Fat12.end_of_chain(), 0x0FF8);
        assert_eq!(FatVariant::Fat16.end_of_chain(), 0xFFF8);
        assert_eq!(FatVariant::Fat32.end_of_chain(), 0x0FFF_FFF8);
    }

    #[test]
    fn boot_sector_is_one_sector() {
        assert_eq!(size_of::<BootSector>(), 512);
    }
}
