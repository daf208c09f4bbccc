//! Mounted-filesystem metadata records.
//!
//! One [`Ext2Fs`] per mounted device: the superblock image, the block
//! group descriptor table copy, and the inode cache. A global list caches
//! records by device; a per-record binary semaphore serializes every
//! on-disk metadata mutation (bitmaps, counters, inode writes) so the free
//! counts stay consistent with the bitmaps.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::drivers::blockdev::DevId;
use crate::error::Errno;
use crate::fs::blockcache;
use crate::sync::{Semaphore, Spinlock};
use crate::time;

use super::disk::{DiskInode, GroupDesc, Superblock, GROUP_DESC_SIZE};
use super::{blocktree, EXT2_BLOCK_SIZE, EXT2_INODE_SIZE, EXT2_MAGIC};

/// Seconds-since-boot stand-in for wall-clock timestamps.
pub(super) fn now() -> u32 {
    (time::current_ticks() / time::HZ) as u32
}

pub(super) struct SbState {
    pub sb: Superblock,
    /// Raw superblock image; uninterpreted fields survive rewrites.
    pub raw: Vec<u8>,
}

/// An inode held in the per-filesystem cache.
pub(super) struct CachedInode {
    pub nr: u32,
    pub inode: DiskInode,
    pub refs: u32,
    pub dirty: bool,
}

/// Arena-indexed cache: removal is O(1) via the slot index, lookups scan
/// the (small) arena.
pub(super) struct InodeCache {
    entries: Vec<Option<CachedInode>>,
}

impl InodeCache {
    fn find(&mut self, nr: u32) -> Option<&mut CachedInode> {
        self.entries
            .iter_mut()
            .flatten()
            .find(|c| c.nr == nr)
    }

    fn insert(&mut self, cached: CachedInode) {
        match self.entries.iter_mut().find(|e| e.is_none()) {
            Some(slot) => *slot = Some(cached),
            None => self.entries.push(Some(cached)),
        }
    }

    fn remove(&mut self, nr: u32) -> Option<CachedInode> {
        self.entries
            .iter_mut()
            .find(|e| e.as_ref().is_some_and(|c| c.nr == nr))
            .and_then(|e| e.take())
    }
}

/// In-memory record for one mounted EXT2 filesystem.
pub struct Ext2Fs {
    pub dev: DevId,
    pub(super) sb: Spinlock<SbState>,
    pub(super) bgdt: Spinlock<Vec<GroupDesc>>,
    icache: Spinlock<InodeCache>,
    /// Binary semaphore guarding all on-disk metadata mutation.
    pub(super) metadata: Semaphore,
    /// Inodes another filesystem is mounted on.
    mounts: Spinlock<Vec<u32>>,
}

static SUPERBLOCKS: Spinlock<Vec<(DevId, Arc<Ext2Fs>)>> = Spinlock::new(Vec::new());

/// Validate that `dev` carries a mountable filesystem: magic, revision-0
/// compatible layout, 1024-byte blocks, matching inode size, and zero
/// feature masks.
pub fn probe(dev: DevId) -> Result<(), Errno> {
    let mut raw = Vec::new();
    raw.try_reserve_exact(EXT2_BLOCK_SIZE).map_err(|_| Errno::NoMem)?;
    raw.resize(EXT2_BLOCK_SIZE, 0);
    blockcache::read_bytes(dev, 1, 0, &mut raw)?;

    let sb = Superblock::parse(&raw)?;
    if sb.magic != EXT2_MAGIC {
        return Err(Errno::Inval);
    }
    if sb.log_block_size != 0 {
        log::warn!(target: "ext2", "{}: unsupported block size {}", dev,
            1024u32 << sb.log_block_size);
        return Err(Errno::Inval);
    }
    if sb.inode_size as usize != EXT2_INODE_SIZE {
        log::warn!(target: "ext2", "{}: unsupported inode size {}", dev, sb.inode_size);
        return Err(Errno::Inval);
    }
    if sb.feature_compat != 0 || sb.feature_incompat != 0 || sb.feature_ro_compat != 0 {
        log::warn!(target: "ext2", "{}: feature bits set ({:#x}/{:#x}/{:#x}), refusing",
            dev, sb.feature_compat, sb.feature_incompat, sb.feature_ro_compat);
        return Err(Errno::Inval);
    }
    Ok(())
}

/// Return the cached metadata record for `dev`, reading superblock and
/// BGDT from disk on first use.
pub fn get_superblock(dev: DevId) -> Result<Arc<Ext2Fs>, Errno> {
    if let Some((_, fs)) = SUPERBLOCKS.lock().iter().find(|(d, _)| *d == dev) {
        return Ok(Arc::clone(fs));
    }

    // Read outside the list lock, then re-check for a racing mount.
    probe(dev)?;
    let fs = Arc::new(read_metadata(dev)?);

    let mut list = SUPERBLOCKS.lock();
    if let Some((_, existing)) = list.iter().find(|(d, _)| *d == dev) {
        // Lost the race; our copy is dropped.
        return Ok(Arc::clone(existing));
    }
    list.push((dev, Arc::clone(&fs)));
    drop(list);
    let (blocks, free) = {
        let state = fs.sb.lock();
        (state.sb.blocks_count, state.sb.free_blocks_count)
    };
    log::info!(target: "ext2", "{}: mounted, {} blocks, {} free", dev, blocks, free);
    Ok(fs)
}

/// Drop the cached record for `dev` after flushing its metadata. Fails
/// with `EBUSY` while inodes are still cached.
pub fn put_superblock(dev: DevId) -> Result<(), Errno> {
    let mut list = SUPERBLOCKS.lock();
    let idx = list.iter().position(|(d, _)| *d == dev).ok_or(Errno::NoDev)?;
    {
        let fs = &list[idx].1;
        if fs.icache.lock().entries.iter().flatten().count() > 0 {
            return Err(Errno::Busy);
        }
        fs.flush_metadata()?;
    }
    list.remove(idx);
    Ok(())
}

fn read_metadata(dev: DevId) -> Result<Ext2Fs, Errno> {
    let mut raw = Vec::new();
    raw.try_reserve_exact(EXT2_BLOCK_SIZE).map_err(|_| Errno::NoMem)?;
    raw.resize(EXT2_BLOCK_SIZE, 0);
    blockcache::read_bytes(dev, 1, 0, &mut raw)?;
    let sb = Superblock::parse(&raw)?;

    let groups = sb.group_count() as usize;
    let mut bgdt_raw = Vec::new();
    bgdt_raw
        .try_reserve_exact(groups * GROUP_DESC_SIZE)
        .map_err(|_| Errno::NoMem)?;
    bgdt_raw.resize(groups * GROUP_DESC_SIZE, 0);
    // The BGDT starts in the block after the superblock.
    blockcache::read_bytes(dev, 2, 0, &mut bgdt_raw)?;

    let bgdt = (0..groups)
        .map(|g| GroupDesc::parse(&bgdt_raw[g * GROUP_DESC_SIZE..]))
        .collect();

    Ok(Ext2Fs {
        dev,
        sb: Spinlock::new(SbState { sb, raw }),
        bgdt: Spinlock::new(bgdt),
        icache: Spinlock::new(InodeCache { entries: Vec::new() }),
        metadata: Semaphore::new(1),
        mounts: Spinlock::new(Vec::new()),
    })
}

impl Ext2Fs {
    /// Write the superblock image and the BGDT copy back to disk. Caller
    /// holds the metadata semaphore (or is tearing the record down).
    pub(super) fn flush_metadata(&self) -> Result<(), Errno> {
        {
            let mut state = self.sb.lock();
            let mut raw = core::mem::take(&mut state.raw);
            state.sb.wtime = now();
            state.sb.update_image(&mut raw);
            state.raw = raw;
            blockcache::write_bytes(self.dev, 1, 0, &state.raw)?;
        }

        let bgdt = self.bgdt.lock();
        let mut raw = Vec::new();
        raw.try_reserve_exact(bgdt.len() * GROUP_DESC_SIZE)
            .map_err(|_| Errno::NoMem)?;
        raw.resize(bgdt.len() * GROUP_DESC_SIZE, 0);
        for (g, desc) in bgdt.iter().enumerate() {
            desc.encode(&mut raw[g * GROUP_DESC_SIZE..(g + 1) * GROUP_DESC_SIZE]);
        }
        blockcache::write_bytes(self.dev, 2, 0, &raw)
    }

    /// Disk location of inode `nr`: `(group, table block, byte offset)`.
    fn inode_location(&self, nr: u32) -> Result<(u32, u64), Errno> {
        let state = self.sb.lock();
        if nr == 0 || nr > state.sb.inodes_count {
            return Err(Errno::Inval);
        }
        let group = (nr - 1) / state.sb.inodes_per_group;
        let index = ((nr - 1) % state.sb.inodes_per_group) as u64;
        drop(state);
        let table = self.bgdt.lock()[group as usize].inode_table as u64;
        Ok((group, table * EXT2_BLOCK_SIZE as u64 + index * EXT2_INODE_SIZE as u64))
    }

    /// Block group an inode lives in (allocation preference).
    pub(super) fn inode_group(&self, nr: u32) -> u32 {
        let state = self.sb.lock();
        nr.saturating_sub(1) / state.sb.inodes_per_group
    }

    /// Read inode `nr` from disk, bypassing the cache.
    pub fn read_inode(&self, nr: u32) -> Result<DiskInode, Errno> {
        let (_, byte_off) = self.inode_location(nr)?;
        let mut raw = [0u8; EXT2_INODE_SIZE];
        blockcache::read_bytes(self.dev, 0, byte_off, &mut raw)?;
        Ok(DiskInode::parse(&raw))
    }

    /// Write inode `nr` to its slot in the inode table.
    pub fn write_inode(&self, nr: u32, inode: &DiskInode) -> Result<(), Errno> {
        let (_, byte_off) = self.inode_location(nr)?;
        blockcache::write_bytes(self.dev, 0, byte_off, &inode.encode())
    }

    /// Take a reference on inode `nr`, reading it into the cache on first
    /// use. The disk read happens outside the cache lock; a racing loader
    /// is resolved by re-checking, and the loser's copy is dropped.
    pub fn get_inode(&self, nr: u32) -> Result<(), Errno> {
        if let Some(cached) = self.icache.lock().find(nr) {
            cached.refs += 1;
            return Ok(());
        }

        let inode = self.read_inode(nr)?;

        let mut cache = self.icache.lock();
        if let Some(cached) = cache.find(nr) {
            cached.refs += 1;
            return Ok(());
        }
        cache.insert(CachedInode { nr, inode, refs: 1, dirty: false });
        Ok(())
    }

    /// Run `f` on the cached inode `nr`. The inode must be referenced.
    pub(super) fn with_inode<R>(
        &self,
        nr: u32,
        f: impl FnOnce(&mut CachedInode) -> R,
    ) -> Result<R, Errno> {
        let mut cache = self.icache.lock();
        match cache.find(nr) {
            Some(cached) => Ok(f(cached)),
            None => Err(Errno::NoEnt),
        }
    }

    /// Drop a reference on inode `nr`.
    ///
    /// When the last reference goes away the inode is flushed; if its link
    /// count reached zero it is wiped instead: every data and indirect
    /// block is freed, then the inode's bitmap bit is cleared.
    pub fn release_inode(&self, nr: u32) -> Result<(), Errno> {
        let action = {
            let mut cache = self.icache.lock();
            let cached = cache.find(nr).ok_or(Errno::NoEnt)?;
            cached.refs -= 1;
            if cached.refs > 0 {
                return Ok(());
            }
            let wipe = cached.inode.links_count == 0;
            let dirty = cached.dirty;
            let entry = cache.remove(nr).unwrap();
            (wipe, dirty, entry.inode)
        };
        let (wipe, dirty, mut inode) = action;

        if wipe {
            log::debug!(target: "ext2", "{}: wiping inode {}", self.dev, nr);
            blocktree::truncate_blocks(self, &mut inode, 0)?;
            inode.dtime = now();
            self.write_inode(nr, &inode)?;
            super::bitmap::free_inode(self, nr, inode.is_dir())?;
        } else if dirty {
            self.write_inode(nr, &inode)?;
        }
        Ok(())
    }

    /// Number of cached inodes (diagnostics and tests).
    pub fn cached_inodes(&self) -> usize {
        self.icache.lock().entries.iter().flatten().count()
    }

    /// Mark or unmark an inode as a mount point.
    pub fn set_mountpoint(&self, nr: u32, mounted: bool) {
        let mut mounts = self.mounts.lock();
        if mounted {
            if !mounts.contains(&nr) {
                mounts.push(nr);
            }
        } else {
            mounts.retain(|&m| m != nr);
        }
    }

    pub fn is_mountpoint(&self, nr: u32) -> bool {
        self.mounts.lock().contains(&nr)
    }

    /// Current free-space counters `(blocks, inodes)`.
    pub fn free_counts(&self) -> (u32, u32) {
        let state = self.sb.lock();
        (state.sb.free_blocks_count, state.sb.free_inodes_count)
    }
}
