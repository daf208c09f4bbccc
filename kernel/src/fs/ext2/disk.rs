//! On-disk structures: superblock, block group descriptor, inode.
//!
//! All fields are little-endian on disk. The codecs parse into plain
//! structs and patch values back into the raw block image so that fields
//! this driver does not interpret survive a rewrite untouched.

use crate::error::Errno;

use super::{EXT2_BLOCK_SIZE, EXT2_INODE_SIZE, EXT2_MAGIC};

fn le16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

fn le32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn put16(buf: &mut [u8], off: usize, val: u16) {
    buf[off..off + 2].copy_from_slice(&val.to_le_bytes());
}

fn put32(buf: &mut [u8], off: usize, val: u32) {
    buf[off..off + 4].copy_from_slice(&val.to_le_bytes());
}

/// Parsed superblock fields (base revision-0 set plus the revision-1
/// fields the probe validates).
#[derive(Debug, Clone)]
pub struct Superblock {
    pub inodes_count: u32,
    pub blocks_count: u32,
    pub free_blocks_count: u32,
    pub free_inodes_count: u32,
    pub first_data_block: u32,
    pub log_block_size: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub wtime: u32,
    pub magic: u16,
    pub state: u16,
    pub rev_level: u32,
    pub inode_size: u16,
    pub feature_compat: u32,
    pub feature_incompat: u32,
    pub feature_ro_compat: u32,
}

impl Superblock {
    /// Parse from the 1024-byte superblock image.
    pub fn parse(raw: &[u8]) -> Result<Superblock, Errno> {
        if raw.len() < EXT2_BLOCK_SIZE {
            return Err(Errno::Inval);
        }
        let sb = Superblock {
            inodes_count: le32(raw, 0),
            blocks_count: le32(raw, 4),
            free_blocks_count: le32(raw, 12),
            free_inodes_count: le32(raw, 16),
            first_data_block: le32(raw, 20),
            log_block_size: le32(raw, 24),
            blocks_per_group: le32(raw, 32),
            inodes_per_group: le32(raw, 40),
            wtime: le32(raw, 48),
            magic: le16(raw, 56),
            state: le16(raw, 58),
            rev_level: le32(raw, 76),
            inode_size: if le32(raw, 76) == 0 { EXT2_INODE_SIZE as u16 } else { le16(raw, 88) },
            feature_compat: le32(raw, 92),
            feature_incompat: le32(raw, 96),
            feature_ro_compat: le32(raw, 100),
        };
        if sb.magic != EXT2_MAGIC {
            return Err(Errno::Inval);
        }
        Ok(sb)
    }

    /// Patch the mutable counters back into the raw superblock image.
    pub fn update_image(&self, raw: &mut [u8]) {
        put32(raw, 12, self.free_blocks_count);
        put32(raw, 16, self.free_inodes_count);
        put32(raw, 48, self.wtime);
        put16(raw, 58, self.state);
    }

    /// Number of block groups.
    pub fn group_count(&self) -> u32 {
        (self.blocks_count - self.first_data_block + self.blocks_per_group - 1)
            / self.blocks_per_group
    }

    /// Data blocks actually present in group `g` (the last group may be
    /// shorter than `blocks_per_group`).
    pub fn blocks_in_group(&self, group: u32) -> u32 {
        let covered = self.blocks_count - self.first_data_block;
        let start = group * self.blocks_per_group;
        (covered - start).min(self.blocks_per_group)
    }
}

/// Block group descriptor (32 bytes on disk).
#[derive(Debug, Clone, Copy)]
pub struct GroupDesc {
    pub block_bitmap: u32,
    pub inode_bitmap: u32,
    pub inode_table: u32,
    pub free_blocks_count: u16,
    pub free_inodes_count: u16,
    pub used_dirs_count: u16,
}

/// On-disk size of a group descriptor.
pub const GROUP_DESC_SIZE: usize = 32;

impl GroupDesc {
    pub fn parse(raw: &[u8]) -> GroupDesc {
        GroupDesc {
            block_bitmap: le32(raw, 0),
            inode_bitmap: le32(raw, 4),
            inode_table: le32(raw, 8),
            free_blocks_count: le16(raw, 12),
            free_inodes_count: le16(raw, 14),
            used_dirs_count: le16(raw, 16),
        }
    }

    pub fn encode(&self, raw: &mut [u8]) {
        put32(raw, 0, self.block_bitmap);
        put32(raw, 4, self.inode_bitmap);
        put32(raw, 8, self.inode_table);
        put16(raw, 12, self.free_blocks_count);
        put16(raw, 14, self.free_inodes_count);
        put16(raw, 16, self.used_dirs_count);
    }
}

/// The 128-byte on-disk inode.
#[derive(Debug, Clone)]
pub struct DiskInode {
    pub mode: u16,
    pub uid: u16,
    pub size: u32,
    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
    pub dtime: u32,
    pub gid: u16,
    pub links_count: u16,
    /// Allocated blocks in 512-byte units.
    pub blocks: u32,
    pub flags: u32,
    /// direct[0..12], indirect, double-indirect, triple-indirect.
    pub block: [u32; 15],
    pub generation: u32,
}

impl DiskInode {
    /// A zeroed inode with the given mode.
    pub fn new(mode: u16, uid: u16, gid: u16, now: u32) -> DiskInode {
        DiskInode {
            mode,
            uid,
            size: 0,
            atime: now,
            ctime: now,
            mtime: now,
            dtime: 0,
            gid,
            links_count: 0,
            blocks: 0,
            flags: 0,
            block: [0; 15],
            generation: 0,
        }
    }

    pub fn parse(raw: &[u8]) -> DiskInode {
        let mut block = [0u32; 15];
        for (i, b) in block.iter_mut().enumerate() {
            *b = le32(raw, 40 + i * 4);
        }
        DiskInode {
            mode: le16(raw, 0),
            uid: le16(raw, 2),
            size: le32(raw, 4),
            atime: le32(raw, 8),
            ctime: le32(raw, 12),
            mtime: le32(raw, 16),
            dtime: le32(raw, 20),
            gid: le16(raw, 24),
            links_count: le16(raw, 26),
            blocks: le32(raw, 28),
            flags: le32(raw, 32),
            block,
            generation: le32(raw, 100),
        }
    }

    /// Encode into a 128-byte image. Unknown fields are written as zero,
    /// which matches a revision-0 filesystem with no feature bits.
    pub fn encode(&self) -> [u8; EXT2_INODE_SIZE] {
        let mut raw = [0u8; EXT2_INODE_SIZE];
        put16(&mut raw, 0, self.mode);
        put16(&mut raw, 2, self.uid);
        put32(&mut raw, 4, self.size);
        put32(&mut raw, 8, self.atime);
        put32(&mut raw, 12, self.ctime);
        put32(&mut raw, 16, self.mtime);
        put32(&mut raw, 20, self.dtime);
        put16(&mut raw, 24, self.gid);
        put16(&mut raw, 26, self.links_count);
        put32(&mut raw, 28, self.blocks);
        put32(&mut raw, 32, self.flags);
        for (i, b) in self.block.iter().enumerate() {
            put32(&mut raw, 40 + i * 4, *b);
        }
        put32(&mut raw, 100, self.generation);
        raw
    }

    pub fn is_dir(&self) -> bool {
        self.mode & super::S_IFMT == super::S_IFDIR
    }

    pub fn is_reg(&self) -> bool {
        self.mode & super::S_IFMT == super::S_IFREG
    }
}
