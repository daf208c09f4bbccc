//! Block and inode bitmap allocation.
//!
//! Allocations scan the preferred group's bitmap first and fall through to
//! the other groups. Every mutation rewrites the bitmap block and then
//! persists the superblock + BGDT, all under the per-filesystem metadata
//! semaphore, so the free counters never drift from the bitmaps.

use alloc::vec::Vec;

use crate::error::Errno;
use crate::fs::blockcache;

use super::superblock::Ext2Fs;
use super::EXT2_BLOCK_SIZE;

fn read_bitmap(fs: &Ext2Fs, block: u32) -> Result<Vec<u8>, Errno> {
    let mut raw = Vec::new();
    raw.try_reserve_exact(EXT2_BLOCK_SIZE).map_err(|_| Errno::NoMem)?;
    raw.resize(EXT2_BLOCK_SIZE, 0);
    blockcache::read_bytes(fs.dev, block as u64, 0, &mut raw)?;
    Ok(raw)
}

fn find_clear_bit(bitmap: &[u8], limit: u32) -> Option<u32> {
    for bit in 0..limit {
        if bitmap[(bit / 8) as usize] & (1 << (bit % 8)) == 0 {
            return Some(bit);
        }
    }
    None
}

fn set_bit(bitmap: &mut [u8], bit: u32) {
    bitmap[(bit / 8) as usize] |= 1 << (bit % 8);
}

fn clear_bit(bitmap: &mut [u8], bit: u32) -> bool {
    let was = bitmap[(bit / 8) as usize] & (1 << (bit % 8)) != 0;
    bitmap[(bit / 8) as usize] &= !(1 << (bit % 8));
    was
}

/// Allocate one data block, preferring `preferred_group`. Returns the
/// absolute block number. `ENOSPC` when every bitmap is full.
pub fn alloc_block(fs: &Ext2Fs, preferred_group: u32) -> Result<u32, Errno> {
    fs.metadata.wait();
    let result = alloc_block_locked(fs, preferred_group);
    fs.metadata.signal();
    result
}

fn alloc_block_locked(fs: &Ext2Fs, preferred_group: u32) -> Result<u32, Errno> {
    let (group_count, first_data_block, blocks_per_group) = {
        let state = fs.sb.lock();
        (state.sb.group_count(), state.sb.first_data_block, state.sb.blocks_per_group)
    };

    for i in 0..group_count {
        let group = (preferred_group + i) % group_count;
        let (bitmap_block, free) = {
            let bgdt = fs.bgdt.lock();
            (bgdt[group as usize].block_bitmap, bgdt[group as usize].free_blocks_count)
        };
        if free == 0 {
            continue;
        }

        let limit = fs.sb.lock().sb.blocks_in_group(group);
        let mut bitmap = read_bitmap(fs, bitmap_block)?;
        let bit = match find_clear_bit(&bitmap, limit) {
            Some(b) => b,
            None => continue,
        };
        set_bit(&mut bitmap, bit);
        blockcache::write_bytes(fs.dev, bitmap_block as u64, 0, &bitmap)?;

        fs.bgdt.lock()[group as usize].free_blocks_count -= 1;
        fs.sb.lock().sb.free_blocks_count -= 1;
        fs.flush_metadata()?;

        return Ok(first_data_block + group * blocks_per_group + bit);
    }
    Err(Errno::NoSpc)
}

/// Free one data block.
pub fn free_block(fs: &Ext2Fs, block: u32) -> Result<(), Errno> {
    fs.metadata.wait();
    let result = free_block_locked(fs, block);
    fs.metadata.signal();
    result
}

fn free_block_locked(fs: &Ext2Fs, block: u32) -> Result<(), Errno> {
    let (first_data_block, blocks_per_group, blocks_count) = {
        let state = fs.sb.lock();
        (state.sb.first_data_block, state.sb.blocks_per_group, state.sb.blocks_count)
    };
    if block < first_data_block || block >= blocks_count {
        log::error!(target: "ext2", "{}: freeing out-of-range block {}", fs.dev, block);
        return Err(Errno::Inval);
    }
    let group = (block - first_data_block) / blocks_per_group;
    let bit = (block - first_data_block) % blocks_per_group;

    let bitmap_block = fs.bgdt.lock()[group as usize].block_bitmap;
    let mut bitmap = read_bitmap(fs, bitmap_block)?;
    if !clear_bit(&mut bitmap, bit) {
        log::error!(target: "ext2", "{}: double free of block {}", fs.dev, block);
        return Err(Errno::Inval);
    }
    blockcache::write_bytes(fs.dev, bitmap_block as u64, 0, &bitmap)?;

    fs.bgdt.lock()[group as usize].free_blocks_count += 1;
    fs.sb.lock().sb.free_blocks_count += 1;
    fs.flush_metadata()
}

/// Allocate an inode, preferring `preferred_group`. Returns the inode
/// number. Directory allocations bump the group's directory count.
pub fn alloc_inode(fs: &Ext2Fs, preferred_group: u32, is_dir: bool) -> Result<u32, Errno> {
    fs.metadata.wait();
    let result = alloc_inode_locked(fs, preferred_group, is_dir);
    fs.metadata.signal();
    result
}

fn alloc_inode_locked(fs: &Ext2Fs, preferred_group: u32, is_dir: bool) -> Result<u32, Errno> {
    let (group_count, inodes_per_group) = {
        let state = fs.sb.lock();
        (state.sb.group_count(), state.sb.inodes_per_group)
    };

    for i in 0..group_count {
        let group = (preferred_group + i) % group_count;
        let (bitmap_block, free) = {
            let bgdt = fs.bgdt.lock();
            (bgdt[group as usize].inode_bitmap, bgdt[group as usize].free_inodes_count)
        };
        if free == 0 {
            continue;
        }

        let mut bitmap = read_bitmap(fs, bitmap_block)?;
        let bit = match find_clear_bit(&bitmap, inodes_per_group) {
            Some(b) => b,
            None => continue,
        };
        set_bit(&mut bitmap, bit);
        blockcache::write_bytes(fs.dev, bitmap_block as u64, 0, &bitmap)?;

        {
            let mut bgdt = fs.bgdt.lock();
            bgdt[group as usize].free_inodes_count -= 1;
            if is_dir {
                bgdt[group as usize].used_dirs_count += 1;
            }
        }
        fs.sb.lock().sb.free_inodes_count -= 1;
        fs.flush_metadata()?;

        return Ok(group * inodes_per_group + bit + 1);
    }
    Err(Errno::NoSpc)
}

/// Free an inode's bitmap bit.
pub fn free_inode(fs: &Ext2Fs, nr: u32, was_dir: bool) -> Result<(), Errno> {
    fs.metadata.wait();
    let result = free_inode_locked(fs, nr, was_dir);
    fs.metadata.signal();
    result
}

fn free_inode_locked(fs: &Ext2Fs, nr: u32, was_dir: bool) -> Result<(), Errno> {
    let (inodes_per_group, inodes_count) = {
        let state = fs.sb.lock();
        (state.sb.inodes_per_group, state.sb.inodes_count)
    };
    if nr == 0 || nr > inodes_count {
        return Err(Errno::Inval);
    }
    let group = (nr - 1) / inodes_per_group;
    let bit = (nr - 1) % inodes_per_group;

    let bitmap_block = fs.bgdt.lock()[group as usize].inode_bitmap;
    let mut bitmap = read_bitmap(fs, bitmap_block)?;
    if !clear_bit(&mut bitmap, bit) {
        log::error!(target: "ext2", "{}: double free of inode {}", fs.dev, nr);
        return Err(Errno::Inval);
    }
    blockcache::write_bytes(fs.dev, bitmap_block as u64, 0, &bitmap)?;

    {
        let mut bgdt = fs.bgdt.lock();
        bgdt[group as usize].free_inodes_count += 1;
        if was_dir {
            bgdt[group as usize].used_dirs_count -= 1;
        }
    }
    fs.sb.lock().sb.free_inodes_count += 1;
    fs.flush_metadata()
}
