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

mod common;

use common::{fat12, fat16, fat32, file_record, SECTOR};
use pika_blk::{Overlay, RamDisk};
use pika_fs_fat::{Error, FatType, FatVolume, FileSystem, MountOptions, SeekFrom};

fn remount(volume: FatVolume<RamDisk>) -> FatVolume<RamDisk> {
    let data = volume.into_device().into_vec();
    FatVolume::mount(RamDisk::from_vec(SECTOR as u32, data).unwrap()).unwrap()
}

#[test]
fn mount_fat16_and_list_root() {
    let mut image = fat16(1024);
    image.fat(2, 0xFFFF);
    image.root_entry(0, &file_record(b"HELLO   TXT", 2, 11));
    image.cluster_data(2, b"hello world");

    let mut volume = FatVolume::mount(image.ram_disk()).unwrap();
    assert_eq!(volume.fat_type(), FatType::Fat16);
    assert_eq!(volume.volume_label(), "PIKA VOL");
    assert_eq!(volume.list_dir("/").unwrap().unwrap(), vec!["HELLO.TXT"]);
    assert_eq!(volume.size_of("/HELLO.TXT").unwrap(), Some(11));
    assert_eq!(volume.size_of("/MISSING.TXT").unwrap(), None);
    assert_eq!(volume.list_dir("/HELLO.TXT").unwrap(), None);

    let mut file = volume.open("/hello.txt", false).unwrap().unwrap();
    assert_eq!(file.read_all().unwrap(), b"hello world");
}

#[test]
fn fat32_read_spans_clusters() {
    let mut image = fat32(1024);
    image.fat(5, 6);
    image.fat(6, 0x0FFF_FFFF);
    image.root_entry(0, &file_record(b"DATA    BIN", 5, 1200));
    image.cluster_data(5, &[0xA5; 1024]);
    image.cluster_data(6, &[0x5A; 176]);

    let mut volume = FatVolume::mount(image.ram_disk()).unwrap();
    assert_eq!(volume.fat_type(), FatType::Fat32);
    assert_eq!(volume.cluster_size(), 1024);
    assert_eq!(volume.cluster_chain(5).unwrap(), vec![5, 6]);

    let mut file = volume.open("/DATA.BIN", false).unwrap().unwrap();
    let content = file.read_all().unwrap();
    assert_eq!(content.len(), 1200);
    assert!(content[..1024].iter().all(|&byte| byte == 0xA5));
    assert!(content[1024..].iter().all(|&byte| byte == 0x5A));
}

#[test]
fn seek_and_partial_reads() {
    let mut image = fat32(1024);
    image.fat(5, 6);
    image.fat(6, 0x0FFF_FFFF);
    image.root_entry(0, &file_record(b"DATA    BIN", 5, 1200));
    image.cluster_data(5, &[0xA5; 1024]);
    image.cluster_data(6, &[0x5A; 176]);

    let mut volume = FatVolume::mount(image.ram_disk()).unwrap();
    let mut file = volume.open("/DATA.BIN", false).unwrap().unwrap();
    assert_eq!(file.size(), 1200);

    file.seek(SeekFrom::Start(1000)).unwrap();
    let tail = file.read(400).unwrap();
    assert_eq!(tail.len(), 200);
    assert!(tail[..24].iter().all(|&byte| byte == 0xA5));
    assert!(tail[24..].iter().all(|&byte| byte == 0x5A));

    file.seek(SeekFrom::End(-10)).unwrap();
    assert_eq!(file.read_all().unwrap().len(), 10);
}

#[test]
fn create_write_flush_remount() {
    let image = fat16(1024);
    let mut volume = FatVolume::mount(image.ram_disk()).unwrap();
    let payload: Vec<u8> = (0..3000).map(|index| (index % 251) as u8).collect();

    {
        let mut file = volume.create("/X.DAT").unwrap().unwrap();
        file.write(&payload).unwrap();
        file.flush().unwrap();
        assert_eq!(file.size(), 3000);
    }
    volume.flush().unwrap();

    let data = volume.into_device().into_vec();
    // every FAT copy is byte-identical after a flush
    let fat_bytes = 16 * SECTOR;
    assert_eq!(
        data[SECTOR..SECTOR + fat_bytes],
        data[SECTOR + fat_bytes..SECTOR + 2 * fat_bytes]
    );

    let mut volume = FatVolume::mount(RamDisk::from_vec(SECTOR as u32, data).unwrap()).unwrap();
    assert_eq!(volume.size_of("/X.DAT").unwrap(), Some(3000));
    let mut file = volume.open("/X.DAT", false).unwrap().unwrap();
    let first = file.first_cluster();
    assert_eq!(file.read_all().unwrap(), payload);
    drop(file);

    // allocation covers the size with less than one spare cluster
    let chain = volume.cluster_chain(first).unwrap();
    assert_eq!(chain.len(), 6);
}

#[test]
fn delete_frees_and_reallocation_reuses() {
    let mut image = fat16(1024);
    image.fat(2, 3);
    image.fat(3, 4);
    image.fat(4, 0xFFFF);
    image.root_entry(0, &file_record(b"BIG     DAT", 2, 1536));
    for cluster in 2..5 {
        image.cluster_data(cluster, &[cluster as u8; 512]);
    }

    let mut volume = FatVolume::mount(image.ram_disk()).unwrap();
    let free_before = volume.stats().unwrap().free_clusters;

    volume.delete("/BIG.DAT").unwrap();
    assert_eq!(volume.stats().unwrap().free_clusters, free_before + 3);
    assert!(matches!(
        volume.delete("/BIG.DAT").unwrap_err(),
        Error::NotFound
    ));

    {
        let mut file = volume.create("/NEW.DAT").unwrap().unwrap();
        file.write(&[1; 100]).unwrap();
        file.flush().unwrap();
        assert_eq!(file.first_cluster(), 2);
    }
    volume.flush().unwrap();
    assert_eq!(volume.stats().unwrap().free_clusters, free_before + 2);

    // the freed tail is zero in both FAT copies
    let data = volume.into_device().into_vec();
    for copy in 0..2 {
        let base = SECTOR + copy * 16 * SECTOR;
        assert_eq!(data[base + 2 * 3..base + 2 * 3 + 2], [0, 0]);
        assert_eq!(data[base + 2 * 4..base + 2 * 4 + 2], [0, 0]);
        assert_eq!(data[base + 2 * 2..base + 2 * 2 + 2], [0xFF, 0xFF]);
    }
}

#[test]
fn rename_across_directories() {
    let image = fat16(1024);
    let mut volume = FatVolume::mount(image.ram_disk()).unwrap();
    volume.mkdir("/A").unwrap();
    volume.mkdir("/B").unwrap();
    {
        let mut file = volume.create("/A/F.TXT").unwrap().unwrap();
        file.write(b"payload").unwrap();
        file.flush().unwrap();
    }
    volume.flush().unwrap();

    volume.rename("/A/F.TXT", "/B/G.TXT").unwrap();
    volume.flush().unwrap();

    let mut volume = remount(volume);
    let mut root = volume.list_dir("/").unwrap().unwrap();
    root.sort();
    assert_eq!(root, vec!["A/", "B/"]);
    assert_eq!(volume.list_dir("/A").unwrap().unwrap(), Vec::<String>::new());
    assert_eq!(volume.list_dir("/B").unwrap().unwrap(), vec!["G.TXT"]);
    let mut file = volume.open("/B/G.TXT", false).unwrap().unwrap();
    assert_eq!(file.read_all().unwrap(), b"payload");
}

#[test]
fn rename_collisions_and_misses() {
    let image = fat16(1024);
    let mut volume = FatVolume::mount(image.ram_disk()).unwrap();
    assert!(volume.create("/A.TXT").unwrap().is_some());
    assert!(volume.create("/B.TXT").unwrap().is_some());
    assert!(volume.create("/A.TXT").unwrap().is_none());
    assert!(!FileSystem::create(&mut volume, "/A.TXT").unwrap());

    assert!(matches!(
        volume.rename("/A.TXT", "/B.TXT").unwrap_err(),
        Error::AlreadyExists
    ));
    assert!(matches!(
        volume.rename("/MISSING.TXT", "/C.TXT").unwrap_err(),
        Error::NotFound
    ));
    assert!(matches!(
        FatVolume::create(&mut volume, "/NO/WHERE.TXT"),
        Err(Error::NotFound)
    ));
}

#[test]
fn fat_copy_mismatch_fails_unless_bypassed() {
    let mut image = fat16(256);
    image.data[SECTOR + 16 * SECTOR + 40] ^= 0x55;
    let data = image.data.clone();

    assert!(matches!(
        FatVolume::mount(RamDisk::from_vec(SECTOR as u32, data).unwrap()),
        Err(Error::CorruptFilesystem)
    ));

    let options = MountOptions {
        bypass_coherency_check: true,
        ..Default::default()
    };
    let mut volume = FatVolume::mount_with(image.ram_disk(), options).unwrap();
    assert_eq!(volume.list_dir("/").unwrap().unwrap(), Vec::<String>::new());
}

#[test]
fn fat12_end_to_end() {
    let options = MountOptions {
        fat_type: Some(FatType::Fat12),
        ..Default::default()
    };
    let image = fat12(128);
    let mut volume = FatVolume::mount_with(image.ram_disk(), options).unwrap();
    assert_eq!(volume.fat_type(), FatType::Fat12);

    let payload: Vec<u8> = (0..700).map(|index| (index * 7 % 256) as u8).collect();
    {
        let mut file = volume.create("/ODD.BIN").unwrap().unwrap();
        file.write(&payload).unwrap();
        file.flush().unwrap();
    }
    volume.flush().unwrap();

    let data = volume.into_device().into_vec();
    let mut volume =
        FatVolume::mount_with(RamDisk::from_vec(SECTOR as u32, data).unwrap(), options).unwrap();
    assert_eq!(volume.size_of("/ODD.BIN").unwrap(), Some(700));
    let mut file = volume.open("/ODD.BIN", false).unwrap().unwrap();
    assert_eq!(file.read_all().unwrap(), payload);
}

#[test]
fn delete_refuses_non_empty_directory() {
    let image = fat16(1024);
    let mut volume = FatVolume::mount(image.ram_disk()).unwrap();
    volume.mkdir("/A").unwrap();
    volume.create("/A/F.TXT").unwrap();
    volume.flush().unwrap();

    assert!(matches!(
        volume.delete("/A").unwrap_err(),
        Error::InvalidArgument
    ));
    volume.delete("/A/F.TXT").unwrap();
    volume.delete("/A").unwrap();
    volume.flush().unwrap();

    let mut volume = remount(volume);
    assert_eq!(volume.list_dir("/").unwrap().unwrap(), Vec::<String>::new());
}

#[test]
fn nested_directories_survive_remount() {
    let image = fat32(1024);
    let mut volume = FatVolume::mount(image.ram_disk()).unwrap();
    volume.mkdir("/A").unwrap();
    volume.mkdir("/A/B").unwrap();
    {
        let mut file = volume.create("/A/B/DEEP.TXT").unwrap().unwrap();
        file.write(b"deep").unwrap();
        file.flush().unwrap();
    }
    volume.flush().unwrap();

    let mut volume = remount(volume);
    assert_eq!(volume.list_dir("/A").unwrap().unwrap(), vec!["B/"]);
    assert_eq!(
        volume.list_dir("/A/B").unwrap().unwrap(),
        vec!["DEEP.TXT"]
    );
    let mut file = volume.open("/A/B/DEEP.TXT", false).unwrap().unwrap();
    assert_eq!(file.read_all().unwrap(), b"deep");
}

#[test]
fn read_only_volume_rejects_mutation() {
    let mut image = fat16(256);
    image.fat(2, 0xFFFF);
    image.root_entry(0, &file_record(b"HELLO   TXT", 2, 5));
    image.cluster_data(2, b"hello");

    let mut volume = FatVolume::mount(image.ram_disk().read_only()).unwrap();
    let mut file = volume.open("/HELLO.TXT", false).unwrap().unwrap();
    assert_eq!(file.read_all().unwrap(), b"hello");
    drop(file);

    assert!(matches!(
        volume.open("/HELLO.TXT", true),
        Err(Error::ReadOnly)
    ));
    assert!(matches!(
        FatVolume::create(&mut volume, "/X.TXT"),
        Err(Error::ReadOnly)
    ));
    assert!(matches!(
        volume.delete("/HELLO.TXT").unwrap_err(),
        Error::ReadOnly
    ));
    assert!(matches!(volume.flush().unwrap_err(), Error::ReadOnly));
}

#[test]
fn overlay_captures_writes_without_touching_the_base() {
    let image = fat16(256);
    let overlay = Overlay::new(image.ram_disk().read_only());
    let mut volume = FatVolume::mount(overlay).unwrap();
    {
        let mut file = volume.create("/DRY.RUN").unwrap().unwrap();
        file.write(b"not for keeps").unwrap();
        file.flush().unwrap();
    }
    volume.flush().unwrap();

    let device = volume.into_device();
    assert!(!device.deltas().is_empty());
}

#[test]
fn fixed_root_refuses_overflow() {
    let image = fat16(1024);
    let mut volume = FatVolume::mount(image.ram_disk()).unwrap();
    // the fixed root holds exactly 512 entries
    for index in 0..512 {
        assert!(volume.create(&format!("/F{index}.X")).unwrap().is_some());
    }
    assert!(matches!(
        FatVolume::create(&mut volume, "/F512.X"),
        Err(Error::NoSpace)
    ));
    assert!(matches!(volume.mkdir("/D").unwrap_err(), Error::NoSpace));
    volume.flush().unwrap();

    let mut volume = remount(volume);
    assert_eq!(volume.list_dir("/").unwrap().unwrap().len(), 512);
}

#[test]
fn fat32_root_grows_past_one_cluster() {
    let image = fat32(1024);
    let mut volume = FatVolume::mount(image.ram_disk()).unwrap();
    // 40 entries do not fit the root's single 1024-byte cluster
    for index in 0..40 {
        assert!(volume.create(&format!("/F{index}.X")).unwrap().is_some());
    }
    volume.flush().unwrap();
    assert!(volume.cluster_chain(2).unwrap().len() > 1);

    let data = volume.into_device().into_vec();
    let mut volume = FatVolume::mount(RamDisk::from_vec(SECTOR as u32, data).unwrap()).unwrap();
    assert_eq!(volume.list_dir("/").unwrap().unwrap().len(), 40);
}

#[test]
fn empty_files_round_trip() {
    let image = fat16(256);
    let mut volume = FatVolume::mount(image.ram_disk()).unwrap();
    {
        let file = volume.create("/EMPTY.TXT").unwrap().unwrap();
        assert_eq!(file.size(), 0);
        assert_eq!(file.first_cluster(), 0);
    }
    volume.flush().unwrap();

    let mut volume = remount(volume);
    assert_eq!(volume.size_of("/EMPTY.TXT").unwrap(), Some(0));
    let mut file = volume.open("/EMPTY.TXT", false).unwrap().unwrap();
    assert!(file.read_all().unwrap().is_empty());
}

#[test]
fn fat32_fs_info_hints_track_the_allocator() {
    let image = fat32(1024);
    let mut volume = FatVolume::mount(image.ram_disk()).unwrap();
    {
        let mut file = volume.create("/X.DAT").unwrap().unwrap();
        file.write(&[9; 5000]).unwrap();
        file.flush().unwrap();
    }
    volume.flush().unwrap();
    let free = volume.stats().unwrap().free_clusters;

    let data = volume.into_device().into_vec();
    let hinted = u32::from_le_bytes([
        data[SECTOR + 488],
        data[SECTOR + 489],
        data[SECTOR + 490],
        data[SECTOR + 491],
    ]);
    assert_eq!(hinted, free);
}
