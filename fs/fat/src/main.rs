// Copyright 2025 Kevin Ludwig
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

//! Inspection and manipulation of FAT images from the command line.

use std::{env, fs, io::Write as _, process};

use pika_blk::{BlockDevice, Partition};
use pika_blk_file::FileDisk;
use pika_fs_fat::{Error, FatType, FatVolume, FileSystem, MountOptions, Result};

fn print_usage() {
    eprintln!(
        "Usage:
  fatctl <image> [--part <n>] [--fat12] [--rw] [--bypass-coherency] <command> [args]

Commands:
  ls <path>             list a directory
  cat <path>            print a file's content
  stat <path>           print an entry's size
  df                    print allocation figures
  label                 print the volume label
  write <path> <file>   copy a local file into the image
  rm <path>             delete a file or empty directory
  mkdir <path>          create a directory
  mv <path> <new_path>  move or rename an entry"
    );
}

fn main() {
    env_logger::init();
    if let Err(error) = run() {
        eprintln!("fatctl: {error}");
        process::exit(1);
    }
}

fn run() -> Result<()> {
    let mut args = env::args().skip(1);

    let mut image: Option<String> = None;
    let mut partition: Option<usize> = None;
    let mut writable = false;
    let mut options = MountOptions::default();
    let mut command: Option<String> = None;
    let mut operands: Vec<String> = Vec::new();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--part" => match args.next().and_then(|value| value.parse().ok()) {
                Some(index) => partition = Some(index),
                None => {
                    print_usage();
                    process::exit(2);
                }
            },
            "--fat12" => options.fat_type = Some(FatType::Fat12),
            "--rw" => writable = true,
            "--bypass-coherency" => options.bypass_coherency_check = true,
            "--help" | "-h" => {
                print_usage();
                return Ok(());
            }
            _ if image.is_none() => image = Some(arg),
            _ if command.is_none() => command = Some(arg),
            _ => operands.push(arg),
        }
    }
    let (Some(image), Some(command)) = (image, command) else {
        print_usage();
        process::exit(2);
    };

    let disk = FileDisk::open(&image, writable)?;
    let device: Box<dyn BlockDevice> = match partition {
        Some(index) => Box::new(Partition::from_mbr(disk, index)?),
        None => Box::new(disk),
    };
    let mut volume = FatVolume::mount_with(device, options)?;

    match (command.as_str(), operands.as_slice()) {
        ("ls", [path]) => {
            let Some(names) = volume.list_dir(path)? else {
                return Err(Error::NotFound);
            };
            for name in names {
                println!("{name}");
            }
        }
        ("cat", [path]) => {
            let Some(mut file) = volume.open(path, false)? else {
                return Err(Error::NotFound);
            };
            let content = file.read_all()?;
            std::io::stdout().write_all(&content)?;
        }
        ("stat", [path]) => {
            let Some(size) = volume.size_of(path)? else {
                return Err(Error::NotFound);
            };
            println!("{path}: {size} bytes");
        }
        ("df", []) => {
            let stats = volume.stats()?;
            println!(
                "{} ({:?}, serial {:08X}), cluster size {}",
                volume.volume_label(),
                volume.fat_type(),
                volume.volume_serial(),
                volume.cluster_size()
            );
            println!(
                "{} of {} clusters free ({} of {} bytes)",
                stats.free_clusters, stats.total_clusters, stats.free_bytes, stats.total_bytes
            );
        }
        ("label", []) => println!("{}", volume.volume_label()),
        ("write", [path, local]) => {
            let content = fs::read(local)?;
            // existing files are recreated, not overwritten in place
            if volume.size_of(path)?.is_some() {
                volume.delete(path)?;
            }
            let mut file = volume.create(path)?.ok_or(Error::AlreadyExists)?;
            file.write(&content)?;
            file.flush()?;
            drop(file);
            volume.flush()?;
        }
        ("rm", [path]) => {
            volume.delete(path)?;
            volume.flush()?;
        }
        ("mkdir", [path]) => {
            volume.mkdir(path)?;
            volume.flush()?;
        }
        ("mv", [path, new_path]) => {
            volume.rename(path, new_path)?;
            volume.flush()?;
        }
        _ => {
            print_usage();
            process::exit(2);
        }
    }
    Ok(())
}
