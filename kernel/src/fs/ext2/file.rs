//! Byte-granular file operations and the namespace operations.
//!
//! Everything here works on referenced inodes: take a cache reference,
//! operate on a private copy, store the mutated copy back, release. A
//! release that drops the last reference of an unlinked inode triggers the
//! deferred on-disk wipe (see `superblock.rs`).

use alloc::vec::Vec;

use crate::error::Errno;
use crate::fs::blockcache;

use super::blocktree::{self, WalkFlags};
use super::dir::{self, DirEntryInfo};
use super::disk::DiskInode;
use super::superblock::{now, Ext2Fs};
use super::{bitmap, file_type_for_mode, EXT2_BLOCK_SIZE, EXT2_ROOT_INO, LINK_MAX, S_IFDIR, S_IFMT, S_IFREG};

/// File metadata snapshot.
#[derive(Debug, Clone)]
pub struct Stat {
    pub ino: u32,
    pub mode: u16,
    pub uid: u16,
    pub gid: u16,
    pub size: u32,
    pub links: u16,
    /// Allocated blocks in 512-byte units.
    pub blocks: u32,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
}

impl Ext2Fs {
    /// Clone the cached inode out for an operation.
    fn load(&self, nr: u32) -> Result<DiskInode, Errno> {
        self.get_inode(nr)?;
        match self.with_inode(nr, |c| c.inode.clone()) {
            Ok(i) => Ok(i),
            Err(e) => {
                let _ = self.release_inode(nr);
                Err(e)
            }
        }
    }

    /// Store a mutated copy back into the cache and mark it dirty.
    fn store(&self, nr: u32, inode: &DiskInode) -> Result<(), Errno> {
        self.with_inode(nr, |c| {
            c.inode = inode.clone();
            c.dirty = true;
        })
    }

    /// Read up to `buf.len()` bytes at `offset`. Returns bytes read; holes
    /// read as zeros and reads past the end are clipped.
    pub fn read_file(&self, nr: u32, offset: u32, buf: &mut [u8]) -> Result<usize, Errno> {
        let mut inode = self.load(nr)?;
        let result = (|| {
            if inode.is_dir() {
                return Err(Errno::IsDir);
            }
            let size = inode.size;
            if offset >= size || buf.is_empty() {
                return Ok(0);
            }
            let len = buf.len().min((size - offset) as usize);
            let bs = EXT2_BLOCK_SIZE as u64;
            let start = offset as u64;
            let end = start + len as u64;

            let dev = self.dev;
            let out = &mut buf[..len];
            let mut cb = |file_idx: u64, block: u32| -> Result<(), Errno> {
                let blk_start = file_idx * bs;
                let lo = start.max(blk_start);
                let hi = end.min(blk_start + bs);
                let slice = &mut out[(lo - start) as usize..(hi - start) as usize];
                if block == 0 {
                    slice.fill(0);
                    Ok(())
                } else {
                    blockcache::read_bytes(dev, block as u64, lo - blk_start, slice)
                }
            };
            blocktree::walk(
                self,
                &mut inode,
                nr,
                start / bs,
                (end - 1) / bs,
                WalkFlags::default(),
                &mut cb,
            )?;
            Ok(len)
        })();

        if result.is_ok() {
            inode.atime = now();
            self.store(nr, &inode)?;
        }
        self.release_inode(nr)?;
        result
    }

    /// Write `buf` at `offset`, allocating blocks as needed. Returns the
    /// bytes actually written: when a bitmap runs dry mid-write the bytes
    /// placed so far are reported, and `ENOSPC` only if nothing was.
    pub fn write_file(&self, nr: u32, offset: u32, buf: &[u8]) -> Result<usize, Errno> {
        let mut inode = self.load(nr)?;
        let result = (|| {
            if inode.is_dir() {
                return Err(Errno::IsDir);
            }
            if buf.is_empty() {
                return Ok(0);
            }
            if offset.checked_add(buf.len() as u32).is_none() {
                return Err(Errno::Inval);
            }
            let bs = EXT2_BLOCK_SIZE as u64;
            let start = offset as u64;
            let end = start + buf.len() as u64;

            let dev = self.dev;
            let mut written = 0usize;
            let mut cb = |file_idx: u64, block: u32| -> Result<(), Errno> {
                let blk_start = file_idx * bs;
                let lo = start.max(blk_start);
                let hi = end.min(blk_start + bs);
                let slice = &buf[(lo - start) as usize..(hi - start) as usize];
                blockcache::write_bytes(dev, block as u64, lo - blk_start, slice)?;
                written += slice.len();
                Ok(())
            };
            let flags = WalkFlags { allocate: true, ..WalkFlags::default() };
            let walked = blocktree::walk(
                self,
                &mut inode,
                nr,
                start / bs,
                (end - 1) / bs,
                flags,
                &mut cb,
            );

            match walked {
                Ok(()) => Ok(written),
                Err(Errno::NoSpc) if written > 0 => Ok(written),
                Err(e) => Err(e),
            }
        })();

        match result {
            Ok(written) => {
                let end = offset + written as u32;
                if end > inode.size {
                    inode.size = end;
                }
                inode.mtime = now();
                self.store(nr, &inode)?;
                self.release_inode(nr)?;
                Ok(written)
            }
            Err(e) => {
                // A failed allocating walk may still have changed the tree.
                self.store(nr, &inode)?;
                self.release_inode(nr)?;
                Err(e)
            }
        }
    }

    /// Truncate (or sparsely extend) to `new_size` bytes.
    pub fn truncate(&self, nr: u32, new_size: u32) -> Result<(), Errno> {
        let mut inode = self.load(nr)?;
        let result = (|| {
            if inode.is_dir() {
                return Err(Errno::IsDir);
            }
            if new_size < inode.size {
                blocktree::truncate_blocks(self, &mut inode, new_size)?;
            }
            inode.size = new_size;
            inode.mtime = now();
            Ok(())
        })();
        self.store(nr, &inode)?;
        self.release_inode(nr)?;
        result
    }

    pub fn stat(&self, nr: u32) -> Result<Stat, Errno> {
        let inode = self.load(nr)?;
        let stat = Stat {
            ino: nr,
            mode: inode.mode,
            uid: inode.uid,
            gid: inode.gid,
            size: inode.size,
            links: inode.links_count,
            blocks: inode.blocks,
            atime: inode.atime,
            mtime: inode.mtime,
            ctime: inode.ctime,
        };
        self.release_inode(nr)?;
        Ok(stat)
    }

    /// Create a device node: a character or block special file whose
    /// device minor is stored in `block[0]`.
    pub fn mknod(&self, dir_nr: u32, name: &str, mode: u16, minor: u8) -> Result<u32, Errno> {
        match mode & S_IFMT {
            super::S_IFBLK | super::S_IFCHR => {}
            _ => return Err(Errno::Inval),
        }
        let ino = self.create(dir_nr, name, mode, 0, 0)?;
        self.get_inode(ino)?;
        self.with_inode(ino, |c| {
            c.inode.block[0] = minor as u32;
            c.dirty = true;
        })?;
        self.release_inode(ino)?;
        Ok(ino)
    }

    /// Look up `name` in directory `dir_nr`.
    pub fn lookup(&self, dir_nr: u32, name: &str) -> Result<u32, Errno> {
        let mut dirino = self.load(dir_nr)?;
        let result = (|| {
            if !dirino.is_dir() {
                return Err(Errno::NotDir);
            }
            match dir::lookup(self, &mut dirino, name)? {
                Some((ino, _)) => Ok(ino),
                None => Err(Errno::NoEnt),
            }
        })();
        self.release_inode(dir_nr)?;
        result
    }

    pub fn readdir(&self, dir_nr: u32) -> Result<Vec<DirEntryInfo>, Errno> {
        let mut dirino = self.load(dir_nr)?;
        let result = if dirino.is_dir() {
            dir::list(self, &mut dirino)
        } else {
            Err(Errno::NotDir)
        };
        self.release_inode(dir_nr)?;
        result
    }

    /// Create a regular (or special) file. Returns the new inode number.
    pub fn create(&self, dir_nr: u32, name: &str, mode: u16, uid: u16, gid: u16) -> Result<u32, Errno> {
        if mode & S_IFMT == S_IFDIR {
            return Err(Errno::IsDir);
        }
        let mode = if mode & S_IFMT == 0 { mode | S_IFREG } else { mode };

        let mut dirino = self.load(dir_nr)?;
        let result = (|| {
            if !dirino.is_dir() {
                return Err(Errno::NotDir);
            }
            if dir::lookup(self, &mut dirino, name)?.is_some() {
                return Err(Errno::Exist);
            }

            let ino = bitmap::alloc_inode(self, self.inode_group(dir_nr), false)?;
            let mut inode = DiskInode::new(mode, uid, gid, now());
            inode.links_count = 1;
            self.write_inode(ino, &inode)?;

            if let Err(e) = dir::insert(self, &mut dirino, dir_nr, name, ino, file_type_for_mode(mode)) {
                let _ = bitmap::free_inode(self, ino, false);
                return Err(e);
            }
            dirino.mtime = now();
            self.store(dir_nr, &dirino)?;
            Ok(ino)
        })();
        self.release_inode(dir_nr)?;
        result
    }

    /// Create a directory with its "." and ".." entries.
    pub fn mkdir(&self, dir_nr: u32, name: &str, mode: u16, uid: u16, gid: u16) -> Result<u32, Errno> {
        let mode = (mode & !S_IFMT) | S_IFDIR;

        let mut parent = self.load(dir_nr)?;
        let result = (|| {
            if !parent.is_dir() {
                return Err(Errno::NotDir);
            }
            if parent.links_count >= LINK_MAX {
                return Err(Errno::MLink);
            }
            if dir::lookup(self, &mut parent, name)?.is_some() {
                return Err(Errno::Exist);
            }

            let ino = bitmap::alloc_inode(self, self.inode_group(dir_nr), true)?;
            let mut child = DiskInode::new(mode, uid, gid, now());
            child.links_count = 2; // "." plus the parent's entry
            self.write_inode(ino, &child)?;

            // The child's own entries first, then publish it in the parent.
            dir::insert(self, &mut child, ino, ".", ino, super::FT_DIR)?;
            dir::insert(self, &mut child, ino, "..", dir_nr, super::FT_DIR)?;
            self.write_inode(ino, &child)?;

            if let Err(e) = dir::insert(self, &mut parent, dir_nr, name, ino, super::FT_DIR) {
                let mut dead = child.clone();
                let _ = blocktree::truncate_blocks(self, &mut dead, 0);
                let _ = self.write_inode(ino, &dead);
                let _ = bitmap::free_inode(self, ino, true);
                return Err(e);
            }
            parent.links_count += 1; // the child's ".."
            parent.mtime = now();
            self.store(dir_nr, &parent)?;
            Ok(ino)
        })();
        self.release_inode(dir_nr)?;
        result
    }

    /// Add a hard link `name -> target_nr`.
    pub fn link(&self, dir_nr: u32, name: &str, target_nr: u32) -> Result<(), Errno> {
        let mut target = self.load(target_nr)?;
        let result = (|| {
            if target.is_dir() {
                return Err(Errno::Perm);
            }
            if target.links_count >= LINK_MAX {
                return Err(Errno::MLink);
            }

            let mut dirino = self.load(dir_nr)?;
            let inner = (|| {
                if !dirino.is_dir() {
                    return Err(Errno::NotDir);
                }
                if dir::lookup(self, &mut dirino, name)?.is_some() {
                    return Err(Errno::Exist);
                }
                dir::insert(self, &mut dirino, dir_nr, name, target_nr,
                    file_type_for_mode(target.mode))?;
                dirino.mtime = now();
                self.store(dir_nr, &dirino)
            })();
            self.release_inode(dir_nr)?;
            inner?;

            target.links_count += 1;
            target.ctime = now();
            self.store(target_nr, &target)?;
            self.write_inode(target_nr, &target)
        })();
        self.release_inode(target_nr)?;
        result
    }

    /// Remove a directory entry; the inode's wipe is deferred until its
    /// last in-memory reference drops.
    pub fn unlink(&self, dir_nr: u32, name: &str) -> Result<(), Errno> {
        if name == "." || name == ".." {
            return Err(Errno::Inval);
        }
        let mut dirino = self.load(dir_nr)?;
        let result = (|| {
            if !dirino.is_dir() {
                return Err(Errno::NotDir);
            }
            let (ino, _) = dir::lookup(self, &mut dirino, name)?.ok_or(Errno::NoEnt)?;

            let mut target = self.load(ino)?;
            if target.is_dir() {
                self.release_inode(ino)?;
                return Err(Errno::IsDir);
            }

            dir::remove(self, &mut dirino, name)?;
            dirino.mtime = now();
            self.store(dir_nr, &dirino)?;

            target.links_count -= 1;
            target.ctime = now();
            if target.links_count == 0 {
                // Deletion time is stamped now; the block wipe waits for
                // the last in-memory reference to go away.
                target.dtime = now();
            }
            self.store(ino, &target)?;
            self.write_inode(ino, &target)?;
            self.release_inode(ino)
        })();
        self.release_inode(dir_nr)?;
        result
    }

    /// Remove a directory. Refuses the root, mount points, extra hard
    /// links, and non-empty directories. With `force` set, it
    /// skips the link-count and emptiness checks.
    pub fn rmdir(&self, dir_nr: u32, name: &str, force: bool) -> Result<(), Errno> {
        if name == "." || name == ".." {
            return Err(Errno::Inval);
        }
        let mut parent = self.load(dir_nr)?;
        let result = (|| {
            if !parent.is_dir() {
                return Err(Errno::NotDir);
            }
            let (ino, _) = dir::lookup(self, &mut parent, name)?.ok_or(Errno::NoEnt)?;
            if ino == EXT2_ROOT_INO {
                return Err(Errno::Busy);
            }
            if self.is_mountpoint(ino) {
                return Err(Errno::Busy);
            }

            let mut child = self.load(ino)?;
            let inner = (|| {
                if !child.is_dir() {
                    return Err(Errno::NotDir);
                }
                if !force {
                    if child.links_count > 2 {
                        return Err(Errno::NotEmpty);
                    }
                    if !dir::is_empty(self, &mut child)? {
                        return Err(Errno::NotEmpty);
                    }
                }

                blocktree::truncate_blocks(self, &mut child, 0)?;
                child.size = 0;
                child.links_count = 0;
                child.dtime = now();
                self.store(ino, &child)?;

                dir::remove(self, &mut parent, name)?;
                parent.links_count -= 1; // the child's ".." went away
                parent.mtime = now();
                self.store(dir_nr, &parent)
            })();
            self.release_inode(ino)?;
            inner
        })();
        self.release_inode(dir_nr)?;
        result
    }
}
