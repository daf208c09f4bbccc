//! Directory entry management.
//!
//! Entries are variable-length records `{inode, rec_len, name_len,
//! file_type, name}` packed so that no record crosses a block boundary and
//! every `rec_len` is a multiple of 4. Insertion splits an existing record
//! with enough trailing slack, or claims a fresh block with one record
//! spanning it. Removal either clears the inode field (first record of a
//! block) or extends the predecessor's `rec_len` over the victim.

use alloc::string::String;
use alloc::vec::Vec;

use crate::error::Errno;
use crate::fs::blockcache;

use super::blocktree::{self, WalkFlags};
use super::disk::DiskInode;
use super::superblock::Ext2Fs;
use super::EXT2_BLOCK_SIZE;

/// Longest representable file name.
pub const NAME_MAX: usize = 255;

/// Bytes a record with an `n`-byte name occupies (header + name, padded
/// to 4).
pub fn record_size(name_len: usize) -> usize {
    (8 + name_len + 3) & !3
}

/// One parsed directory entry.
#[derive(Debug, Clone)]
pub struct DirEntryInfo {
    pub ino: u32,
    pub file_type: u8,
    pub name: String,
}

struct RawEntry {
    offset: usize,
    ino: u32,
    rec_len: usize,
    name_len: usize,
    file_type: u8,
}

fn parse_entry(block: &[u8], offset: usize) -> Result<RawEntry, Errno> {
    if offset + 8 > EXT2_BLOCK_SIZE {
        return Err(Errno::Io);
    }
    let ino = u32::from_le_bytes([
        block[offset],
        block[offset + 1],
        block[offset + 2],
        block[offset + 3],
    ]);
    let rec_len = u16::from_le_bytes([block[offset + 4], block[offset + 5]]) as usize;
    let name_len = block[offset + 6] as usize;
    let file_type = block[offset + 7];
    if rec_len < 8 || rec_len % 4 != 0 || offset + rec_len > EXT2_BLOCK_SIZE {
        log::error!(target: "ext2", "corrupt directory record at offset {}", offset);
        return Err(Errno::Io);
    }
    Ok(RawEntry { offset, ino, rec_len, name_len, file_type })
}

fn entry_name<'a>(block: &'a [u8], e: &RawEntry) -> &'a [u8] {
    &block[e.offset + 8..e.offset + 8 + e.name_len]
}

fn write_entry_header(block: &mut [u8], offset: usize, ino: u32, rec_len: usize, name_len: usize, file_type: u8) {
    block[offset..offset + 4].copy_from_slice(&ino.to_le_bytes());
    block[offset + 4..offset + 6].copy_from_slice(&(rec_len as u16).to_le_bytes());
    block[offset + 6] = name_len as u8;
    block[offset + 7] = file_type;
}

/// Disk block backing file block `idx` of `inode` (0 = hole).
fn map_block(fs: &Ext2Fs, inode: &mut DiskInode, idx: u64) -> Result<u32, Errno> {
    let mut found = 0u32;
    blocktree::walk(fs, inode, 0, idx, idx, WalkFlags::default(), &mut |_, b| {
        found = b;
        Ok(())
    })?;
    Ok(found)
}

fn read_dir_block(fs: &Ext2Fs, block: u32) -> Result<Vec<u8>, Errno> {
    let mut raw = Vec::new();
    raw.try_reserve_exact(EXT2_BLOCK_SIZE).map_err(|_| Errno::NoMem)?;
    raw.resize(EXT2_BLOCK_SIZE, 0);
    blockcache::read_bytes(fs.dev, block as u64, 0, &mut raw)?;
    Ok(raw)
}

/// Look up `name`. Returns `(inode, file_type)` if present.
pub fn lookup(fs: &Ext2Fs, dir: &mut DiskInode, name: &str) -> Result<Option<(u32, u8)>, Errno> {
    if name.is_empty() || name.len() > NAME_MAX {
        return Err(Errno::Inval);
    }
    let blocks = dir.size as u64 / EXT2_BLOCK_SIZE as u64;
    for idx in 0..blocks {
        let block = map_block(fs, dir, idx)?;
        if block == 0 {
            continue;
        }
        let raw = read_dir_block(fs, block)?;
        let mut offset = 0;
        while offset < EXT2_BLOCK_SIZE {
            let e = parse_entry(&raw, offset)?;
            if e.ino != 0 && entry_name(&raw, &e) == name.as_bytes() {
                return Ok(Some((e.ino, e.file_type)));
            }
            offset += e.rec_len;
        }
    }
    Ok(None)
}

/// List every live entry.
pub fn list(fs: &Ext2Fs, dir: &mut DiskInode) -> Result<Vec<DirEntryInfo>, Errno> {
    let mut out = Vec::new();
    let blocks = dir.size as u64 / EXT2_BLOCK_SIZE as u64;
    for idx in 0..blocks {
        let block = map_block(fs, dir, idx)?;
        if block == 0 {
            continue;
        }
        let raw = read_dir_block(fs, block)?;
        let mut offset = 0;
        while offset < EXT2_BLOCK_SIZE {
            let e = parse_entry(&raw, offset)?;
            if e.ino != 0 {
                out.push(DirEntryInfo {
                    ino: e.ino,
                    file_type: e.file_type,
                    name: String::from_utf8_lossy(entry_name(&raw, &e)).into_owned(),
                });
            }
            offset += e.rec_len;
        }
    }
    Ok(out)
}

/// True when the directory holds nothing besides "." and "..".
pub fn is_empty(fs: &Ext2Fs, dir: &mut DiskInode) -> Result<bool, Errno> {
    let blocks = dir.size as u64 / EXT2_BLOCK_SIZE as u64;
    for idx in 0..blocks {
        let block = map_block(fs, dir, idx)?;
        if block == 0 {
            continue;
        }
        let raw = read_dir_block(fs, block)?;
        let mut offset = 0;
        while offset < EXT2_BLOCK_SIZE {
            let e = parse_entry(&raw, offset)?;
            if e.ino != 0 {
                let n = entry_name(&raw, &e);
                if n != b"." && n != b".." {
                    return Ok(false);
                }
            }
            offset += e.rec_len;
        }
    }
    Ok(true)
}

/// Insert `name -> ino`. The caller has checked for duplicates.
///
/// Walks the existing blocks looking for a record with enough trailing
/// slack to split, or a dead record wide enough to reuse; otherwise a new
/// block is allocated holding a single block-spanning record.
pub fn insert(
    fs: &Ext2Fs,
    dir: &mut DiskInode,
    dir_nr: u32,
    name: &str,
    ino: u32,
    file_type: u8,
) -> Result<(), Errno> {
    if name.is_empty() || name.len() > NAME_MAX {
        return Err(Errno::Inval);
    }
    let needed = record_size(name.len());
    let blocks = dir.size as u64 / EXT2_BLOCK_SIZE as u64;

    for idx in 0..blocks {
        let block = map_block(fs, dir, idx)?;
        if block == 0 {
            continue;
        }
        let mut raw = read_dir_block(fs, block)?;
        let mut offset = 0;
        while offset < EXT2_BLOCK_SIZE {
            let e = parse_entry(&raw, offset)?;

            if e.ino == 0 && e.rec_len >= needed {
                // Reuse a dead record in place, keeping its rec_len.
                write_entry_header(&mut raw, e.offset, ino, e.rec_len, name.len(), file_type);
                raw[e.offset + 8..e.offset + 8 + name.len()].copy_from_slice(name.as_bytes());
                return blockcache::write_bytes(fs.dev, block as u64, 0, &raw);
            }

            let used = record_size(e.name_len);
            if e.ino != 0 && e.rec_len >= used + needed {
                // Split: shorten the live record, place ours in the tail.
                let tail_off = e.offset + used;
                let tail_len = e.rec_len - used;
                write_entry_header(&mut raw, e.offset, e.ino, used, e.name_len, e.file_type);
                write_entry_header(&mut raw, tail_off, ino, tail_len, name.len(), file_type);
                raw[tail_off + 8..tail_off + 8 + name.len()].copy_from_slice(name.as_bytes());
                return blockcache::write_bytes(fs.dev, block as u64, 0, &raw);
            }

            offset += e.rec_len;
        }
    }

    // No room: allocate the next directory block and write one record
    // spanning it.
    let new_idx = blocks;
    let mut disk_block = 0u32;
    let flags = WalkFlags { allocate: true, ..WalkFlags::default() };
    blocktree::walk(fs, dir, dir_nr, new_idx, new_idx, flags, &mut |_, b| {
        disk_block = b;
        Ok(())
    })?;

    let mut raw = Vec::new();
    raw.try_reserve_exact(EXT2_BLOCK_SIZE).map_err(|_| Errno::NoMem)?;
    raw.resize(EXT2_BLOCK_SIZE, 0);
    write_entry_header(&mut raw, 0, ino, EXT2_BLOCK_SIZE, name.len(), file_type);
    raw[8..8 + name.len()].copy_from_slice(name.as_bytes());
    blockcache::write_bytes(fs.dev, disk_block as u64, 0, &raw)?;

    dir.size += EXT2_BLOCK_SIZE as u32;
    Ok(())
}

/// Remove `name`. Returns the inode number the entry pointed to.
pub fn remove(fs: &Ext2Fs, dir: &mut DiskInode, name: &str) -> Result<u32, Errno> {
    if name.is_empty() || name.len() > NAME_MAX {
        return Err(Errno::Inval);
    }
    let blocks = dir.size as u64 / EXT2_BLOCK_SIZE as u64;

    for idx in 0..blocks {
        let block = map_block(fs, dir, idx)?;
        if block == 0 {
            continue;
        }
        let mut raw = read_dir_block(fs, block)?;
        let mut offset = 0;
        let mut prev: Option<RawEntry> = None;
        while offset < EXT2_BLOCK_SIZE {
            let e = parse_entry(&raw, offset)?;
            if e.ino != 0 && entry_name(&raw, &e) == name.as_bytes() {
                let removed = e.ino;
                match prev {
                    None => {
                        // First record of the block: mark it dead.
                        write_entry_header(&mut raw, e.offset, 0, e.rec_len, 0, 0);
                    }
                    Some(p) => {
                        // Extend the predecessor over the victim.
                        write_entry_header(
                            &mut raw,
                            p.offset,
                            p.ino,
                            p.rec_len + e.rec_len,
                            p.name_len,
                            p.file_type,
                        );
                    }
                }
                blockcache::write_bytes(fs.dev, block as u64, 0, &raw)?;
                return Ok(removed);
            }
            offset += e.rec_len;
            prev = Some(e);
        }
    }
    Err(Errno::NoEnt)
}
