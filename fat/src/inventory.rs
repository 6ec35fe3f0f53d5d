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

use std::collections::HashMap;

use gotek_ds::DataStorage;
use gotek_err::Result;

use crate::{dir::DirEntry, FatVolume};

/// A directory entry together with its `/`-joined path relative to the
/// volume root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryEntry {
    pub path: String,
    pub entry: DirEntry,
}

/// Every file and directory of a volume, indexed by start cluster and by
/// path. Built once per scan and immutable afterwards.
#[derive(Debug, Default)]
pub struct Inventory {
    entries: Vec<InventoryEntry>,
    by_cluster: HashMap<u32, Option<usize>>,
    by_path: HashMap<String, Option<usize>>,
}

impl Inventory {
    pub fn from_entries(entries: Vec<InventoryEntry>) -> Self {
        let mut by_cluster = HashMap::new();
        let mut by_path = HashMap::new();
        for (index, entry) in entries.iter().enumerate() {
            // A key claimed twice resolves to nothing; empty files for
            // instance all share start cluster 0.
            by_cluster
                .entry(entry.entry.cluster)
                .and_modify(|slot| *slot = None)
                .or_insert(Some(index));
            by_path
                .entry(entry.path.clone())
                .and_modify(|slot| *slot = None)
                .or_insert(Some(index));
        }
        Self {
            entries,
            by_cluster,
            by_path,
        }
    }

    /// The entry whose chain starts at `cluster`, if exactly one does.
    pub fn file_at_cluster(&self, cluster: u32) -> Option<&InventoryEntry> {
        self.by_cluster
            .get(&cluster)
            .copied()
            .flatten()
            .map(|index| &self.entries[index])
    }

    /// Start cluster of the entry at `path`. The lookup is case-sensitive;
    /// callers normalize beforehand if they need anything looser.
    pub fn starting_cluster(&self, path: &str) -> Option<u32> {
        self.by_path
            .get(path)
            .copied()
            .flatten()
            .map(|index| self.entries[index].entry.cluster)
    }

    pub fn entries(&self) -> &[InventoryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<DS: DataStorage> FatVolume<DS> {
    /// Enumerates the whole volume depth first, a subdirectory's contents
    /// before the subdirectory's own entry. `.` and `..` are left out.
    pub fn inventory(&self) -> Result<Inventory> {
        let mut entries = Vec::new();
        self.collect(None, self.read_root()?, &mut entries)?;
        Ok(Inventory::from_entries(entries))
    }

    fn collect(
        &self,
        prefix: Option<&str>,
        dir: Vec<DirEntry>,
        out: &mut Vec<InventoryEntry>,
    ) -> Result<()> {
        for entry in dir {
            if entry.name == "." || entry.name == ".." {
                continue;
            }
            let path = match prefix {
                Some(prefix) => format!("{prefix}/{}", entry.name),
                None => entry.name.clone(),
            };
            if entry.attributes.is_directory() {
                let children = self.read_dir(entry.cluster)?;
                self.collect(Some(&path), children, out)?;
            }
            out.push(InventoryEntry { path, entry });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dir::Attributes;

    fn entry(path: &str, cluster: u32) -> InventoryEntry {
        InventoryEntry {
            path: path.to_string(),
            entry: DirEntry {
                name: path.rsplit('/').next().unwrap_or(path).to_string(),
                attributes: Attributes(Attributes::ARCHIVE),
                created: Default::default(),
                last_accessed: Default::default(),
                modified: Default::default(),
                cluster,
                size: 0,
                offset: 0,
            },
        }
    }

    #[test]
    fn cluster_lookup_rejects_duplicates() {
        let inventory =
            Inventory::from_entries(vec![entry("a.adf", 7), entry("b.adf", 7), entry("c.adf", 9)]);
        assert!(inventory.file_at_cluster(7).is_none());
        assert_eq!(inventory.file_at_cluster(9).unwrap().path, "c.adf");
        assert!(inventory.file_at_cluster(11).is_none());
    }

    #[test]
    fn path_lookup_is_case_sensitive() {
        let inventory = Inventory::from_entries(vec![entry("Games/Turrican.adf", 12)]);
        assert_eq!(inventory.starting_cluster("Games/Turrican.adf"), Some(12));
        assert_eq!(inventory.starting_cluster("games/turrican.adf"), None);
    }
}
