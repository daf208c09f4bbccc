//! The inode block-tree walker.
//!
//! One engine serves reads, writes, and truncation: it visits every data
//! block for a file-block range across direct[0..12] and the three
//! indirect subtrees, invoking a callback per block. In allocating mode
//! missing blocks are allocated (preferring the inode's group) and zeroed;
//! in deallocating mode visited blocks are freed and an indirect container
//! that becomes empty is freed as well. Zeroed entries are written back to
//! their parent blocklist. `i_blocks` (512-byte units) is kept in step
//! with every allocation and deallocation, including mid-walk failures.

use alloc::vec::Vec;

use crate::error::Errno;
use crate::fs::blockcache;

use super::bitmap;
use super::disk::DiskInode;
use super::superblock::Ext2Fs;
use super::{DIRECT_BLOCKS, EXT2_BLOCK_SIZE, PTRS_PER_BLOCK};

/// Walker mode flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct WalkFlags {
    /// Allocate missing blocks (and indirect containers) on the way.
    pub allocate: bool,
    /// Free every visited block; free emptied indirect containers.
    pub deallocate: bool,
    /// Zero visited entries in their parent blocklist and write it back.
    pub zero: bool,
}

/// Sectors (512-byte units) accounted per 1024-byte block.
const UNITS_PER_BLOCK: u32 = (EXT2_BLOCK_SIZE / 512) as u32;

fn read_ptr_block(fs: &Ext2Fs, block: u32) -> Result<Vec<u32>, Errno> {
    let mut raw = [0u8; EXT2_BLOCK_SIZE];
    blockcache::read_bytes(fs.dev, block as u64, 0, &mut raw)?;
    Ok((0..PTRS_PER_BLOCK)
        .map(|i| u32::from_le_bytes([raw[i * 4], raw[i * 4 + 1], raw[i * 4 + 2], raw[i * 4 + 3]]))
        .collect())
}

fn write_ptr_block(fs: &Ext2Fs, block: u32, ptrs: &[u32]) -> Result<(), Errno> {
    let mut raw = [0u8; EXT2_BLOCK_SIZE];
    for (i, p) in ptrs.iter().enumerate() {
        raw[i * 4..i * 4 + 4].copy_from_slice(&p.to_le_bytes());
    }
    blockcache::write_bytes(fs.dev, block as u64, 0, &raw)
}

fn zero_block_on_disk(fs: &Ext2Fs, block: u32) -> Result<(), Errno> {
    blockcache::write_bytes(fs.dev, block as u64, 0, &[0u8; EXT2_BLOCK_SIZE])
}

/// Per-block callback: `(file_block_index, disk_block)`. A hole is
/// reported as disk block 0 (never allocated in non-allocating mode).
pub type WalkCallback<'a> = &'a mut dyn FnMut(u64, u32) -> Result<(), Errno>;

struct WalkCtx<'a> {
    fs: &'a Ext2Fs,
    preferred_group: u32,
    flags: WalkFlags,
    cb: WalkCallback<'a>,
    i_blocks: &'a mut u32,
}

impl<'a> WalkCtx<'a> {
    fn alloc_block(&mut self) -> Result<u32, Errno> {
        let block = bitmap::alloc_block(self.fs, self.preferred_group)?;
        zero_block_on_disk(self.fs, block)?;
        *self.i_blocks += UNITS_PER_BLOCK;
        Ok(block)
    }

    fn free_block(&mut self, block: u32) -> Result<(), Errno> {
        bitmap::free_block(self.fs, block)?;
        *self.i_blocks -= UNITS_PER_BLOCK;
        Ok(())
    }

    /// Visit one data-block slot. Returns true if the slot changed.
    fn visit_leaf(&mut self, slot: &mut u32, file_idx: u64) -> Result<bool, Errno> {
        let mut changed = false;
        if *slot == 0 && self.flags.allocate {
            *slot = self.alloc_block()?;
            changed = true;
        }

        (self.cb)(file_idx, *slot)?;

        if self.flags.deallocate && *slot != 0 {
            self.free_block(*slot)?;
            if self.flags.zero {
                *slot = 0;
                changed = true;
            }
        }
        Ok(changed)
    }

    /// Visit an indirect subtree rooted at `slot`.
    ///
    /// `level` 1..=3; the subtree covers file blocks
    /// `[base, base + PTRS_PER_BLOCK^level)`, clipped to `[first, last]`.
    /// Returns true if the slot changed.
    fn visit_indirect(
        &mut self,
        slot: &mut u32,
        level: u32,
        base: u64,
        first: u64,
        last: u64,
    ) -> Result<bool, Errno> {
        let child_span = (PTRS_PER_BLOCK as u64).pow(level - 1);

        if *slot == 0 {
            if self.flags.allocate {
                *slot = self.alloc_block()?;
            } else {
                // Whole subtree is a hole: report it block by block when
                // reading, nothing to do when deallocating.
                if !self.flags.deallocate {
                    for idx in first..=last {
                        (self.cb)(idx, 0)?;
                    }
                }
                return Ok(false);
            }

            let mut ptrs = read_ptr_block(self.fs, *slot)?;
            let result = self.visit_children(&mut ptrs, *slot, level, base, first, last, child_span);
            return result.map(|_| true);
        }

        let container = *slot;
        let mut ptrs = read_ptr_block(self.fs, container)?;
        self.visit_children(&mut ptrs, container, level, base, first, last, child_span)?;

        if self.flags.deallocate && ptrs.iter().all(|&p| p == 0) {
            // The container emptied out: free it and clear the parent slot.
            self.free_block(container)?;
            if self.flags.zero {
                *slot = 0;
            }
            return Ok(true);
        }
        Ok(false)
    }

    /// Visit the children of one indirect block and write it back if any
    /// entry changed.
    #[allow(clippy::too_many_arguments)]
    fn visit_children(
        &mut self,
        ptrs: &mut [u32],
        container: u32,
        level: u32,
        base: u64,
        first: u64,
        last: u64,
        child_span: u64,
    ) -> Result<(), Errno> {
        let first_child = ((first - base) / child_span) as usize;
        let last_child = ((last - base) / child_span) as usize;

        let mut dirty = false;
        let mut walk_err = None;
        for k in first_child..=last_child {
            let child_base = base + k as u64 * child_span;
            let cfirst = first.max(child_base);
            let clast = last.min(child_base + child_span - 1);
            let changed = if level == 1 {
                self.visit_leaf(&mut ptrs[k], cfirst)
            } else {
                self.visit_indirect(&mut ptrs[k], level - 1, child_base, cfirst, clast)
            };
            match changed {
                Ok(c) => dirty |= c,
                Err(e) => {
                    // Stop the walk but still persist entries already
                    // mutated, so i_blocks and the tree stay consistent.
                    dirty |= self.flags.allocate || self.flags.zero;
                    walk_err = Some(e);
                    break;
                }
            }
        }

        if dirty {
            write_ptr_block(self.fs, container, ptrs)?;
        }
        match walk_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Walk file blocks `[first, last]` of `inode`, invoking `cb` per block.
pub fn walk(
    fs: &Ext2Fs,
    inode: &mut DiskInode,
    inode_nr: u32,
    first: u64,
    last: u64,
    flags: WalkFlags,
    cb: WalkCallback<'_>,
) -> Result<(), Errno> {
    if last < first {
        return Ok(());
    }

    let direct_end = DIRECT_BLOCKS as u64;
    let single_end = direct_end + PTRS_PER_BLOCK as u64;
    let double_end = single_end + (PTRS_PER_BLOCK as u64).pow(2);
    let triple_end = double_end + (PTRS_PER_BLOCK as u64).pow(3);
    if last >= triple_end {
        return Err(Errno::Inval);
    }

    let preferred_group = fs.inode_group(inode_nr);
    let DiskInode { ref mut block, ref mut blocks, .. } = *inode;
    let mut ctx = WalkCtx { fs, preferred_group, flags, cb, i_blocks: blocks };

    let mut result = Ok(());

    // Direct blocks: the parent blocklist is the inode itself.
    if first < direct_end {
        for idx in first..=last.min(direct_end - 1) {
            if let Err(e) = ctx.visit_leaf(&mut block[idx as usize], idx) {
                result = Err(e);
                break;
            }
        }
    }

    // Indirect subtrees, clipped to the requested range.
    let subtrees = [
        (DIRECT_BLOCKS, 1u32, direct_end, single_end),
        (DIRECT_BLOCKS + 1, 2, single_end, double_end),
        (DIRECT_BLOCKS + 2, 3, double_end, triple_end),
    ];
    for (slot_idx, level, start, end) in subtrees {
        if result.is_err() || last < start || first >= end {
            continue;
        }
        let sfirst = first.max(start);
        let slast = last.min(end - 1);
        if let Err(e) = ctx.visit_indirect(&mut block[slot_idx], level, start, sfirst, slast) {
            result = Err(e);
        }
    }

    result
}

/// Free every block beyond `new_size` and clear the vacated pointers.
/// Does not touch `inode.size`; the caller owns size and mtime updates.
pub fn truncate_blocks(fs: &Ext2Fs, inode: &mut DiskInode, new_size: u32) -> Result<(), Errno> {
    let bs = EXT2_BLOCK_SIZE as u64;
    let first = (new_size as u64 + bs - 1) / bs;
    // Walk to the end of the triple-indirect range: holes cost nothing and
    // a sparse tail past `size` is freed too.
    let last = DIRECT_BLOCKS as u64 + (PTRS_PER_BLOCK as u64)
        + (PTRS_PER_BLOCK as u64).pow(2)
        + (PTRS_PER_BLOCK as u64).pow(3)
        - 1;
    let flags = WalkFlags { allocate: false, deallocate: true, zero: true };
    walk(fs, inode, 0, first, last, flags, &mut |_, _| Ok(()))
}
