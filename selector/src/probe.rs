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
    fs, io,
    path::{Path, PathBuf},
};

use gotek_err::Result;

/// All `.adf` images under `root`, extension matched without case, depth
/// first with each directory's entries in lexicographic order.
/// `selector.adf` itself is never an image.
pub fn find_adf_images(root: &Path) -> Result<Vec<PathBuf>> {
    let mut images = Vec::new();
    visit(root, &mut |path, name| {
        if name.eq_ignore_ascii_case("selector.adf") {
            return;
        }
        if Path::new(name)
            .extension()
            .is_some_and(|extension| extension.eq_ignore_ascii_case("adf"))
        {
            images.push(path.to_path_buf());
        }
    })?;
    Ok(images)
}

/// Every file under `root` whose bare name equals `name`, sorted.
pub fn find_file_by_name(root: &Path, name: &str) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    visit(root, &mut |path, file_name| {
        if file_name == name {
            found.push(path.to_path_buf());
        }
    })?;
    found.sort();
    Ok(found)
}

fn visit(dir: &Path, emit: &mut impl FnMut(&Path, &str)) -> Result<()> {
    let mut entries: Vec<fs::DirEntry> = fs::read_dir(dir)?.collect::<io::Result<_>>()?;
    entries.sort_by_key(|entry| entry.file_name());
    for entry in entries {
        let path = entry.path();
        let kind = entry.file_type()?;
        if kind.is_dir() {
            visit(&path, emit)?;
        } else if kind.is_file() {
            emit(&path, &entry.file_name().to_string_lossy());
        }
    }
    Ok(())
}
