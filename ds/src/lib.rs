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

pub use gotek_err::*;

/// Random-access byte storage, backed by a block device or an image file.
///
/// Offsets are absolute. `read` fills the whole buffer or fails with
/// [`Error::ShortRead`]; there is no notion of a current position.
pub trait DataStorage {
    fn read(&self, offset: u64, buffer: &mut [u8]) -> Result<()>;

    fn write(&self, offset: u64, buffer: &[u8]) -> Result<()>;
}
