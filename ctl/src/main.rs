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
    path::{Path, PathBuf},
    process,
};

use clap::Parser;
use gotek_ds_std::FileStorage;
use gotek_err::Result;
use gotek_fat::FatVolume;
use gotek_selector::Selector;
use log::LevelFilter;

/// Manage disk images for Amiga Gotek drives.
#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// USB drive mount point
    path: PathBuf,

    /// List disk images
    #[arg(short, long)]
    list: bool,

    /// Check disk images against the stick, fixing what can be fixed
    #[arg(short, long)]
    check: bool,

    /// Remap all disk images to slots
    #[arg(short, long)]
    remap: bool,

    /// Number of the image to boot by default
    #[arg(short = 'd', long = "set-default", value_name = "IMAGE_NO")]
    set_default: Option<u16>,

    /// Be verbose
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let args = Args::parse();
    env_logger::Builder::new()
        .filter_level(if args.verbose {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        })
        .format_target(false)
        .init();

    let modes = [args.list, args.check, args.remap, args.set_default.is_some()]
        .into_iter()
        .filter(|&mode| mode)
        .count();
    if modes != 1 {
        eprintln!("exactly one of --list, --check, --remap or --set-default must be given");
        process::exit(10);
    }

    let Some(device) = device_for_mount_point(&args.path) else {
        eprintln!("ERROR: cannot find device mounted on {}", args.path.display());
        process::exit(20);
    };
    println!("Using {}, mounted on {}", device.display(), args.path.display());

    if let Err(error) = run(&args, &device) {
        eprintln!("ERROR: {error}");
        process::exit(1);
    }
}

fn run(args: &Args, device: &Path) -> Result<()> {
    let volume = FatVolume::new(FileStorage::open(device)?, 0)?;
    let inventory = volume.inventory()?;
    let mut selector = Selector::open(&args.path, inventory)?;
    selector.scan()?;

    println!("Slots in use: {}", selector.slots.len());
    println!("Default slot: {}", selector.stats.default_slot);
    println!();
    if args.verbose {
        let unknown = selector.stats.unknown;
        println!("Stat bytes:");
        println!(
            "DEC:\t{}\t{}\t{}\t{}",
            unknown[0], unknown[1], unknown[2], unknown[3]
        );
        println!(
            "HEX:\t{:02x}\t{:02x}\t{:02x}\t{:02x}",
            unknown[0], unknown[1], unknown[2], unknown[3]
        );
        println!();
    }

    if args.list {
        for (num, slot) in &selector.slots {
            let name = slot
                .disk_file_name
                .clone()
                .unwrap_or_else(|| format!("<not on volume> {}", slot.file_name_lossy()));
            if args.verbose {
                println!("{num:3}. {name} (cluster {})", slot.start_cluster);
            } else {
                println!("{num:3}. {name}");
            }
        }
    } else if args.check {
        let problems = selector.check(true)?;
        if problems == 0 {
            println!("Selector is safe and sound!");
        } else {
            selector.update_slots(&selector.slots)?;
            println!("Fixed {problems} problem(s)");
        }
    } else if args.remap {
        let mapped = selector.remap()?;
        println!("Remapped {mapped} image(s)");
    } else if let Some(num) = args.set_default {
        selector.set_default_slot(num)?;
        println!("Default image set to {num}");
    }
    Ok(())
}

fn device_for_mount_point(mountpoint: &Path) -> Option<PathBuf> {
    let mounts = std::fs::read_to_string("/proc/mounts").ok()?;
    device_from_mount_table(&mounts, mountpoint)
}

/// Backing device for `mountpoint`, straight out of the mount table.
/// Mount points containing whitespace are not resolved.
fn device_from_mount_table(table: &str, mountpoint: &Path) -> Option<PathBuf> {
    let mut target = mountpoint.to_string_lossy().into_owned();
    while target.len() > 1 && target.ends_with('/') {
        target.pop();
    }
    for line in table.lines() {
        let mut fields = line.split_whitespace();
        let (Some(device), Some(mounted_on)) = (fields.next(), fields.next()) else {
            continue;
        };
        if mounted_on == target {
            return Some(PathBuf::from(device));
        }
    }
    None
}
