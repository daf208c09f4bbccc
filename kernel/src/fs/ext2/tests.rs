//! EXT2 integration tests over a RAM disk.
//!
//! `mkfs` formats a minimal single-group revision-0 filesystem the same
//! way mke2fs lays one out at 1024-byte blocks: boot block, superblock,
//! BGDT, block bitmap, inode bitmap, inode table, then data, with the
//! root directory occupying the first data block.

use crate::drivers::blockdev::DevId;
use crate::error::Errno;
use crate::fs::ramdisk;

use super::disk::DiskInode;
use super::superblock::{get_superblock, probe, put_superblock};
use super::*;

fn put16(img: &mut [u8], off: usize, v: u16) {
    img[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

fn put32(img: &mut [u8], off: usize, v: u32) {
    img[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

/// Format a fresh filesystem on a RAM disk and return its device.
fn mkfs(minor: u8, blocks_count: u32, inodes_count: u32) -> DevId {
    assert!(inodes_count % 8 == 0);
    let dev = ramdisk::create(minor, blocks_count as usize);
    let bs = EXT2_BLOCK_SIZE;
    let mut img = std::vec![0u8; blocks_count as usize * bs];

    let itable_blocks = inodes_count / 8; // 8 inodes of 128 bytes per block
    let root_block = 5 + itable_blocks;
    let covered = blocks_count - 1; // bitmap covers from first_data_block=1
    let free_blocks = covered - (5 + itable_blocks);
    let free_inodes = inodes_count - 10;

    // Superblock (block 1).
    let sb = bs;
    put32(&mut img, sb, inodes_count);
    put32(&mut img, sb + 4, blocks_count);
    put32(&mut img, sb + 12, free_blocks);
    put32(&mut img, sb + 16, free_inodes);
    put32(&mut img, sb + 20, 1); // first_data_block
    put32(&mut img, sb + 24, 0); // log_block_size
    put32(&mut img, sb + 32, 8192); // blocks_per_group
    put32(&mut img, sb + 36, 8192); // frags_per_group
    put32(&mut img, sb + 40, inodes_count); // inodes_per_group
    put16(&mut img, sb + 56, EXT2_MAGIC);
    put16(&mut img, sb + 58, 1); // clean
    put32(&mut img, sb + 76, 0); // revision 0

    // BGDT (block 2).
    let gd = 2 * bs;
    put32(&mut img, gd, 3); // block bitmap
    put32(&mut img, gd + 4, 4); // inode bitmap
    put32(&mut img, gd + 8, 5); // inode table
    put16(&mut img, gd + 12, free_blocks as u16);
    put16(&mut img, gd + 14, free_inodes as u16);
    put16(&mut img, gd + 16, 1); // root

    // Block bitmap (block 3): metadata blocks 1..=4+itable plus the root
    // directory block.
    for bit in 0..=(4 + itable_blocks) {
        img[3 * bs + (bit / 8) as usize] |= 1 << (bit % 8);
    }

    // Inode bitmap (block 4): the 10 reserved inodes.
    for bit in 0..10 {
        img[4 * bs + bit / 8] |= 1 << (bit % 8);
    }

    // Root inode (#2) in the inode table (block 5).
    let mut root = DiskInode::new(S_IFDIR | 0o755, 0, 0, 0);
    root.links_count = 2;
    root.size = bs as u32;
    root.blocks = 2;
    root.block[0] = root_block;
    let raw = root.encode();
    img[5 * bs + 128..5 * bs + 256].copy_from_slice(&raw);

    // Root directory data: "." then ".." spanning the block.
    let rb = root_block as usize * bs;
    put32(&mut img, rb, EXT2_ROOT_INO);
    put16(&mut img, rb + 4, 12);
    img[rb + 6] = 1;
    img[rb + 7] = FT_DIR;
    img[rb + 8] = b'.';
    put32(&mut img, rb + 12, EXT2_ROOT_INO);
    put16(&mut img, rb + 16, (bs - 12) as u16);
    img[rb + 18] = 2;
    img[rb + 19] = FT_DIR;
    img[rb + 20] = b'.';
    img[rb + 21] = b'.';

    ramdisk::with_image(minor, |image| image.copy_from_slice(&img));
    dev
}

/// Property 4: cleared bitmap bits must equal the superblock free count.
fn assert_bitmap_consistent(fs: &Ext2Fs, minor: u8) {
    let (covered, claimed) = {
        let state = fs.sb.lock();
        (
            state.sb.blocks_count - state.sb.first_data_block,
            state.sb.free_blocks_count,
        )
    };
    let free_bits = ramdisk::with_image(minor, |img| {
        let bm = &img[3 * EXT2_BLOCK_SIZE..4 * EXT2_BLOCK_SIZE];
        (0..covered)
            .filter(|bit| bm[(bit / 8) as usize] & (1 << (bit % 8)) == 0)
            .count() as u32
    });
    assert_eq!(free_bits, claimed, "bitmap free bits vs superblock counter");
}

#[test]
fn probe_validates_the_layout() {
    let dev = mkfs(10, 256, 32);
    probe(dev).unwrap();

    // Corrupt the magic.
    ramdisk::with_image(10, |img| img[1024 + 56] = 0);
    assert_eq!(probe(dev), Err(Errno::Inval));

    // 2048-byte blocks are refused.
    let dev2 = mkfs(11, 256, 32);
    ramdisk::with_image(11, |img| img[1024 + 24] = 1);
    assert_eq!(probe(dev2), Err(Errno::Inval));

    // Feature bits are refused.
    let dev3 = mkfs(12, 256, 32);
    ramdisk::with_image(12, |img| img[1024 + 96] = 2);
    assert_eq!(probe(dev3), Err(Errno::Inval));
}

#[test]
fn unaligned_write_spanning_the_indirect_boundary() {
    // Scenario A: 12300 bytes at offset 11500 touch direct[11] and the
    // first blocks behind the single-indirect pointer.
    let dev = mkfs(13, 1024, 32);
    let fs = get_superblock(dev).unwrap();

    let ino = fs.create(EXT2_ROOT_INO, "span.bin", 0o644, 0, 0).unwrap();
    let data: std::vec::Vec<u8> = (0..12300u32).map(|i| (i * 7 % 251) as u8).collect();
    assert_eq!(fs.write_file(ino, 11500, &data).unwrap(), 12300);

    // Remount: drop the record and read everything back from disk.
    put_superblock(dev).unwrap();
    let fs = get_superblock(dev).unwrap();
    let ino = fs.lookup(EXT2_ROOT_INO, "span.bin").unwrap();

    let mut readback = std::vec![0u8; 12300];
    assert_eq!(fs.read_file(ino, 11500, &mut readback).unwrap(), 12300);
    assert_eq!(readback, data);

    // The hole before the write reads as zeros.
    let mut hole = std::vec![0xFFu8; 512];
    assert_eq!(fs.read_file(ino, 100, &mut hole).unwrap(), 512);
    assert!(hole.iter().all(|&b| b == 0));

    assert_bitmap_consistent(&fs, 13);
}

#[test]
fn truncate_shrinks_the_block_tree() {
    // Scenario B: a 2 MiB file reaches through the double-indirect path;
    // truncating to 1024 must free everything but one block and zero the
    // indirect pointers in the inode.
    let dev = mkfs(14, 4096, 64);
    let fs = get_superblock(dev).unwrap();
    let (free0, _) = fs.free_counts();

    let ino = fs.create(EXT2_ROOT_INO, "big", 0o644, 0, 0).unwrap();
    let chunk = std::vec![0xABu8; 64 * 1024];
    for i in 0..32 {
        assert_eq!(fs.write_file(ino, i * 64 * 1024, &chunk).unwrap(), chunk.len());
    }
    assert_eq!(fs.stat(ino).unwrap().size, 2 * 1024 * 1024);
    assert_bitmap_consistent(&fs, 14);

    fs.truncate(ino, 1024).unwrap();
    let st = fs.stat(ino).unwrap();
    assert_eq!(st.size, 1024);
    assert_eq!(st.blocks, 2, "i_blocks must shrink to one 1024-byte block");

    let on_disk = fs.read_inode(ino).unwrap();
    assert_ne!(on_disk.block[0], 0);
    assert_eq!(on_disk.block[12], 0, "indirect pointer must be zeroed");
    assert_eq!(on_disk.block[13], 0, "double-indirect pointer must be zeroed");
    assert_eq!(on_disk.block[14], 0, "triple-indirect pointer must be zeroed");

    let (free1, _) = fs.free_counts();
    assert_eq!(free1, free0 - 1, "only the remaining data block stays allocated");
    assert_bitmap_consistent(&fs, 14);

    // Truncate-to-zero returns the filesystem to its baseline.
    fs.truncate(ino, 0).unwrap();
    assert_eq!(fs.free_counts().0, free0);
    assert_bitmap_consistent(&fs, 14);
}

#[test]
fn sparse_write_through_the_triple_indirect_path() {
    let dev = mkfs(15, 512, 32);
    let fs = get_superblock(dev).unwrap();
    let (free0, _) = fs.free_counts();

    let ino = fs.create(EXT2_ROOT_INO, "sparse", 0o644, 0, 0).unwrap();
    // One block far beyond the double-indirect range.
    let triple_start = (DIRECT_BLOCKS + PTRS_PER_BLOCK + PTRS_PER_BLOCK * PTRS_PER_BLOCK) as u32;
    let offset = (triple_start + 5) * EXT2_BLOCK_SIZE as u32;
    let payload = [0x5Au8; 100];
    assert_eq!(fs.write_file(ino, offset, &payload).unwrap(), 100);

    // One data block plus three indirect containers.
    assert_eq!(fs.stat(ino).unwrap().blocks, 8);
    assert_eq!(fs.free_counts().0, free0 - 4);

    let mut readback = [0u8; 100];
    assert_eq!(fs.read_file(ino, offset, &mut readback).unwrap(), 100);
    assert_eq!(readback, payload);

    // A read inside the hole is all zeros.
    let mut hole = [0xEEu8; 64];
    assert_eq!(fs.read_file(ino, 4096, &mut hole).unwrap(), 64);
    assert!(hole.iter().all(|&b| b == 0));

    fs.truncate(ino, 0).unwrap();
    assert_eq!(fs.free_counts().0, free0);
    assert_bitmap_consistent(&fs, 15);
}

#[test]
fn write_then_read_round_trip_with_truncate() {
    // Property 3 in the small: write/read equality, holes read zero,
    // truncate clamps size and EOF reads return nothing.
    let dev = mkfs(16, 512, 32);
    let fs = get_superblock(dev).unwrap();

    let ino = fs.create(EXT2_ROOT_INO, "f", 0o644, 0, 0).unwrap();
    let data: std::vec::Vec<u8> = (0..5000u32).map(|i| (i % 253) as u8).collect();
    assert_eq!(fs.write_file(ino, 123, &data).unwrap(), 5000);

    let mut readback = std::vec![0u8; 5000];
    assert_eq!(fs.read_file(ino, 123, &mut readback).unwrap(), 5000);
    assert_eq!(readback, data);

    fs.truncate(ino, 1000).unwrap();
    assert_eq!(fs.stat(ino).unwrap().size, 1000);
    let mut beyond = [0u8; 16];
    assert_eq!(fs.read_file(ino, 1000, &mut beyond).unwrap(), 0);
}

#[test]
fn directory_records_fill_blocks_exactly() {
    // Property 5: within each directory block the rec_lens sum to the
    // block size and no record crosses the boundary (the parser rejects
    // any that would).
    let dev = mkfs(17, 1024, 128);
    let fs = get_superblock(dev).unwrap();

    for i in 0..60 {
        let name = std::format!("file-number-{:03}", i);
        fs.create(EXT2_ROOT_INO, &name, 0o644, 0, 0).unwrap();
    }
    // Remove a few from the middle so removal coalescing is exercised.
    fs.unlink(EXT2_ROOT_INO, "file-number-010").unwrap();
    fs.unlink(EXT2_ROOT_INO, "file-number-011").unwrap();
    fs.unlink(EXT2_ROOT_INO, "file-number-030").unwrap();

    let root = fs.read_inode(EXT2_ROOT_INO).unwrap();
    let dir_blocks = root.size as usize / EXT2_BLOCK_SIZE;
    assert!(dir_blocks >= 2, "sixty entries must spill into a second block");

    for b in 0..dir_blocks {
        // Resolve the physical block through the inode (all direct here).
        let disk_block = root.block[b] as usize;
        assert_ne!(disk_block, 0);
        ramdisk::with_image(17, |img| {
            let raw = &img[disk_block * EXT2_BLOCK_SIZE..(disk_block + 1) * EXT2_BLOCK_SIZE];
            let mut offset = 0usize;
            let mut sum = 0usize;
            while offset < EXT2_BLOCK_SIZE {
                let rec_len = u16::from_le_bytes([raw[offset + 4], raw[offset + 5]]) as usize;
                assert!(rec_len >= 8 && rec_len % 4 == 0);
                assert!(offset + rec_len <= EXT2_BLOCK_SIZE, "record crosses block boundary");
                sum += rec_len;
                offset += rec_len;
            }
            assert_eq!(sum, EXT2_BLOCK_SIZE, "rec_lens must cover the block");
        });
    }

    // Reuse of the holes left by the removals.
    fs.create(EXT2_ROOT_INO, "reborn", 0o644, 0, 0).unwrap();
    assert!(fs.lookup(EXT2_ROOT_INO, "reborn").is_ok());
    assert_eq!(fs.lookup(EXT2_ROOT_INO, "file-number-010"), Err(Errno::NoEnt));
    assert_eq!(
        fs.create(EXT2_ROOT_INO, "reborn", 0o644, 0, 0),
        Err(Errno::Exist)
    );
}

#[test]
fn unlink_defers_the_wipe_until_the_last_reference() {
    let dev = mkfs(18, 512, 32);
    let fs = get_superblock(dev).unwrap();
    let (free0, ifree0) = fs.free_counts();

    let ino = fs.create(EXT2_ROOT_INO, "doomed", 0o644, 0, 0).unwrap();
    fs.write_file(ino, 0, &[7u8; 3000]).unwrap();
    assert_eq!(fs.free_counts().0, free0 - 3);

    // Hold an extra reference across the unlink.
    fs.get_inode(ino).unwrap();
    fs.unlink(EXT2_ROOT_INO, "doomed").unwrap();

    // Entry is gone but the blocks survive while the reference lives.
    assert_eq!(fs.lookup(EXT2_ROOT_INO, "doomed"), Err(Errno::NoEnt));
    assert_eq!(fs.free_counts().0, free0 - 3);
    let on_disk = fs.read_inode(ino).unwrap();
    assert_eq!(on_disk.links_count, 0);
    assert_ne!(on_disk.dtime, 0, "deletion time is stamped at unlink");

    // Dropping the last reference wipes the inode.
    fs.release_inode(ino).unwrap();
    assert_eq!(fs.free_counts(), (free0, ifree0));
    assert_bitmap_consistent(&fs, 18);
}

#[test]
fn mkdir_rmdir_maintain_link_counts() {
    let dev = mkfs(19, 512, 32);
    let fs = get_superblock(dev).unwrap();

    assert_eq!(fs.read_inode(EXT2_ROOT_INO).unwrap().links_count, 2);
    let sub = fs.mkdir(EXT2_ROOT_INO, "sub", 0o755, 0, 0).unwrap();
    assert_eq!(fs.read_inode(EXT2_ROOT_INO).unwrap().links_count, 3);
    assert_eq!(fs.read_inode(sub).unwrap().links_count, 2);

    // ".." of the child resolves to the root.
    assert_eq!(fs.lookup(sub, ".."), Ok(EXT2_ROOT_INO));

    // Non-empty directories are refused without force.
    fs.create(sub, "inner", 0o644, 0, 0).unwrap();
    assert_eq!(fs.rmdir(EXT2_ROOT_INO, "sub", false), Err(Errno::NotEmpty));

    fs.unlink(sub, "inner").unwrap();
    fs.rmdir(EXT2_ROOT_INO, "sub", false).unwrap();
    assert_eq!(fs.read_inode(EXT2_ROOT_INO).unwrap().links_count, 2);
    assert_eq!(fs.lookup(EXT2_ROOT_INO, "sub"), Err(Errno::NoEnt));
    assert_bitmap_consistent(&fs, 19);

    // Mount points are refused.
    let m = fs.mkdir(EXT2_ROOT_INO, "mnt", 0o755, 0, 0).unwrap();
    fs.set_mountpoint(m, true);
    assert_eq!(fs.rmdir(EXT2_ROOT_INO, "mnt", false), Err(Errno::Busy));
    fs.set_mountpoint(m, false);
    fs.rmdir(EXT2_ROOT_INO, "mnt", false).unwrap();
}

#[test]
fn hard_links_share_the_inode() {
    let dev = mkfs(20, 512, 32);
    let fs = get_superblock(dev).unwrap();

    let ino = fs.create(EXT2_ROOT_INO, "a", 0o644, 0, 0).unwrap();
    fs.write_file(ino, 0, b"linked contents").unwrap();
    fs.link(EXT2_ROOT_INO, "b", ino).unwrap();
    assert_eq!(fs.stat(ino).unwrap().links, 2);
    assert_eq!(fs.lookup(EXT2_ROOT_INO, "b"), Ok(ino));
    assert_eq!(fs.link(EXT2_ROOT_INO, "b", ino), Err(Errno::Exist));

    // Directories cannot be hard-linked.
    let d = fs.mkdir(EXT2_ROOT_INO, "d", 0o755, 0, 0).unwrap();
    assert_eq!(fs.link(EXT2_ROOT_INO, "dlink", d), Err(Errno::Perm));

    // Dropping one name keeps the data reachable through the other.
    fs.unlink(EXT2_ROOT_INO, "a").unwrap();
    let mut buf = [0u8; 15];
    assert_eq!(fs.read_file(ino, 0, &mut buf).unwrap(), 15);
    assert_eq!(&buf, b"linked contents");
    assert_eq!(fs.stat(ino).unwrap().links, 1);
}

#[test]
fn device_nodes_store_their_minor() {
    let dev = mkfs(22, 256, 32);
    let fs = get_superblock(dev).unwrap();

    let ino = fs.mknod(EXT2_ROOT_INO, "hdb1", S_IFBLK | 0o660, 0x11).unwrap();
    let on_disk = fs.read_inode(ino).unwrap();
    assert_eq!(on_disk.mode & S_IFMT, S_IFBLK);
    assert_eq!(on_disk.block[0], 0x11, "device minor lives in direct[0]");

    assert_eq!(fs.mknod(EXT2_ROOT_INO, "notdev", 0o644, 1), Err(Errno::Inval));
}

#[test]
fn enospc_reports_partial_progress() {
    let dev = mkfs(21, 64, 32);
    let fs = get_superblock(dev).unwrap();
    let (free0, _) = fs.free_counts();
    assert!(free0 < 100);

    let ino = fs.create(EXT2_ROOT_INO, "hog", 0o644, 0, 0).unwrap();
    let big = std::vec![9u8; 100 * 1024];
    let written = fs.write_file(ino, 0, &big).unwrap();
    assert!(written > 0 && written < big.len(), "partial success, got {}", written);
    assert_eq!(fs.stat(ino).unwrap().size as usize, written);

    // The next write has nothing left to allocate.
    assert_eq!(fs.write_file(ino, (written + 4096) as u32, &[1u8; 10]), Err(Errno::NoSpc));
    assert_bitmap_consistent(&fs, 21);

    // Freeing the file makes space again.
    fs.truncate(ino, 0).unwrap();
    assert_eq!(fs.free_counts().0, free0);
}
