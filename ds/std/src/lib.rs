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

use std::{fs::File, io::ErrorKind, os::unix::fs::FileExt, path::Path};

use gotek_ds::DataStorage;
use gotek_err::{Error, Result};

/// [`DataStorage`] over a regular file or a raw block device.
pub struct FileStorage {
    file: File,
}

impl FileStorage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            file: File::open(path)?,
        })
    }

    pub fn open_rw(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            file: File::options().read(true).write(true).open(path)?,
        })
    }
}

impl DataStorage for FileStorage {
    fn read(&self, offset: u64, buffer: &mut [u8]) -> Result<()> {
        self.file
            .read_exact_at(buffer, offset)
            .map_err(|error| match error.kind() {
                ErrorKind::UnexpectedEof => Error::ShortRead {
                    offset,
                    wanted: buffer.len(),
                },
                _ => Error::Io(error),
            })
    }

    fn write(&self, offset: u64, buffer: &[u8]) -> Result<()> {
        self.file.write_all_at(buffer, offset)?;
        Ok(())
    }
}
