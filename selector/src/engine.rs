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

use std::{
    collections::BTreeMap,
    fs,
    path::PathBuf,
};

use gotek_ds::DataStorage;
use gotek_ds_std::FileStorage;
use gotek_err::{Result, SelectorError};
use gotek_fat::Inventory;
use log::{info, warn};

use crate::{
    probe,
    records::{Slot, Stats, MAX_SLOTS, REC_OFFSET, REC_SIZE, STATS_OFFSET, STATS_SIZE},
};

impl Slot {
    /// Points `start_cluster` at whatever `disk_file_name` resolves to on
    /// the volume. Returns whether it resolved.
    pub fn map(&mut self, inventory: &Inventory) -> bool {
        let Some(path) = self.disk_file_name.as_deref().filter(|path| !path.is_empty()) else {
            return false;
        };
        match inventory.starting_cluster(path) {
            Some(cluster) => {
                self.start_cluster = cluster;
                true
            }
            None => false,
        }
    }
}

/// The slot table engine. Holds the decoded stats, the slot map and the
/// volume inventory; mutations stay in memory until an explicit
/// write-back. The selector file itself is only open for the duration of
/// each operation.
pub struct Selector {
    mountpoint: PathBuf,
    adf: PathBuf,
    inventory: Inventory,
    pub stats: Stats,
    pub slots: BTreeMap<u16, Slot>,
}

impl Selector {
    pub fn open(mountpoint: impl Into<PathBuf>, inventory: Inventory) -> Result<Self> {
        let mountpoint = mountpoint.into();
        let adf = mountpoint.join("selector.adf");
        if !adf.is_file() {
            return Err(SelectorError::SelectorMissing.into());
        }
        Ok(Self {
            mountpoint,
            adf,
            inventory,
            stats: Stats::default(),
            slots: BTreeMap::new(),
        })
    }

    fn slot_offset(num: u16) -> u64 {
        REC_OFFSET + (num as u64 - 1) * REC_SIZE as u64
    }

    /// Decodes the stats header and every present slot, resolving each
    /// start cluster to a path on the volume where possible.
    pub fn scan(&mut self) -> Result<()> {
        let storage = FileStorage::open(&self.adf)?;
        let mut raw = [0; STATS_SIZE];
        storage.read(STATS_OFFSET, &mut raw)?;
        self.stats = Stats::decode(&raw);

        self.slots.clear();
        let mut offset = REC_OFFSET;
        for num in 1..=MAX_SLOTS {
            assert!(offset == Self::slot_offset(num), "slot table position drifted");
            let mut raw = [0; REC_SIZE];
            storage.read(offset, &mut raw)?;
            if let Some(mut slot) = Slot::decode(num, &raw)? {
                slot.disk_file_name = self
                    .inventory
                    .file_at_cluster(slot.start_cluster)
                    .map(|found| found.path.clone());
                self.slots.insert(num, slot);
            }
            offset += REC_SIZE as u64;
        }
        Ok(())
    }

    pub fn map_slot(&self, slot: &mut Slot) -> bool {
        slot.map(&self.inventory)
    }

    /// Makes `num` the boot default by writing the single default-slot
    /// byte. Only present slots qualify.
    pub fn set_default_slot(&self, num: u16) -> Result<()> {
        if !self.slots.contains_key(&num) {
            return Err(SelectorError::EmptySlotDefault(num).into());
        }
        let storage = FileStorage::open_rw(&self.adf)?;
        storage.write(STATS_OFFSET + 2, &[num as u8])
    }

    /// Rewrites all 999 records in order; numbers missing from `slots`
    /// are written as cleared. Not atomic: a crash mid-loop leaves the
    /// table partially updated.
    pub fn update_slots(&self, slots: &BTreeMap<u16, Slot>) -> Result<()> {
        let storage = FileStorage::open_rw(&self.adf)?;
        let mut offset = REC_OFFSET;
        for num in 1..=MAX_SLOTS {
            assert!(offset == Self::slot_offset(num), "slot table position drifted");
            let raw = match slots.get(&num) {
                Some(slot) => slot.encode(),
                None => [0; REC_SIZE],
            };
            storage.write(offset, &raw)?;
            offset += REC_SIZE as u64;
        }
        Ok(())
    }

    /// Verifies every present slot against the medium and returns the
    /// number of problems found. With `fix`, wrong sizes are corrected,
    /// moved files are re-pointed when exactly one candidate turns up, and
    /// lost files clear their slot; several candidates only get reported.
    /// Fixes stay in memory until [`Self::update_slots`].
    pub fn check(&mut self, fix: bool) -> Result<u32> {
        let Self {
            mountpoint,
            inventory,
            slots,
            ..
        } = self;
        let mut problems = 0;
        for slot in slots.values_mut() {
            if slot.cleared {
                continue;
            }
            let resolved = slot
                .disk_file_name
                .clone()
                .filter(|path| mountpoint.join(path).is_file());
            match resolved {
                None => {
                    problems += 1;
                    let name = slot.file_name_lossy().into_owned();
                    warn!(
                        "file for slot {} is missing: {name:?} (cluster {})",
                        slot.num, slot.start_cluster
                    );
                    let candidates: Vec<String> = probe::find_file_by_name(mountpoint, &name)?
                        .iter()
                        .filter_map(|path| path.strip_prefix(&*mountpoint).ok())
                        .map(|path| path.to_string_lossy().into_owned())
                        .collect();
                    match candidates.as_slice() {
                        [] => {
                            info!("no candidates found, clearing slot {}", slot.num);
                            if fix {
                                slot.cleared = true;
                            }
                        }
                        [found] => {
                            info!("found {found:?}, updating slot {}", slot.num);
                            if fix {
                                slot.disk_file_name = Some(found.clone());
                                if !slot.map(inventory) {
                                    warn!("{found:?} has no start cluster on the volume");
                                }
                            }
                        }
                        found => {
                            info!("found several candidates for slot {}:", slot.num);
                            for (at, candidate) in found.iter().enumerate() {
                                info!("{:2}. {candidate:?}", at + 1);
                            }
                        }
                    }
                }
                Some(path) => {
                    let size = fs::metadata(mountpoint.join(&path))?.len() as u32;
                    if size != slot.file_size {
                        warn!(
                            "slot {} has wrong file size: {} recorded, {size} on disk",
                            slot.num, slot.file_size
                        );
                        problems += 1;
                        if fix {
                            slot.file_size = size;
                        }
                    }
                }
            }
        }
        Ok(problems)
    }

    /// Rebuilds the whole table from the `.adf` images on the medium,
    /// depth first in lexicographic order, and writes it out. Returns the
    /// number of images mapped.
    pub fn remap(&mut self) -> Result<usize> {
        let images = probe::find_adf_images(&self.mountpoint)?;
        info!("found {} ADF files", images.len());
        if images.len() > MAX_SLOTS as usize {
            warn!(
                "{} images exceed the {MAX_SLOTS} slots, ignoring the rest",
                images.len()
            );
        }

        let mut slots = BTreeMap::new();
        for (index, image) in images.iter().take(MAX_SLOTS as usize).enumerate() {
            let num = (index + 1) as u16;
            let relative = image
                .strip_prefix(&self.mountpoint)
                .unwrap_or(image)
                .to_string_lossy()
                .into_owned();
            info!("{num:2}. {relative}");
            let name = image
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            let size = fs::metadata(image)?.len() as u32;
            let mut slot = Slot {
                num,
                cleared: false,
                short_name: name.clone().into_bytes(),
                start_cluster: 0,
                file_size: size,
                file_name: name.into_bytes(),
                disk_file_name: Some(relative.clone()),
            };
            if !slot.map(&self.inventory) {
                return Err(SelectorError::Unmapped(relative).into());
            }
            slots.insert(num, slot);
        }
        let mapped = slots.len();
        for num in mapped as u16 + 1..=MAX_SLOTS {
            slots.insert(num, Slot::cleared_record(num));
        }

        self.update_slots(&slots)?;
        slots.retain(|_, slot| !slot.cleared);
        self.slots = slots;
        Ok(mapped)
    }
}
