//! MBR partition table parsing and partition-relative block resolution.
//!
//! Each drive carries up to 15 partitions (minor bits 0..3, partition 0 is
//! the raw device). The table is read once at probe time from the MBR in
//! sector 0; partition bounds are enforced on every request.

use crate::drivers::blockdev::SECTORS_PER_BLOCK;
use crate::error::Errno;

/// Maximum partitions per drive (minor encoding limit).
pub const MAX_PARTITIONS: usize = 15;

/// A partition in 1024-byte block units, bounds inclusive.
#[derive(Debug, Clone, Copy)]
pub struct Partition {
    pub first_block: u64,
    pub last_block: u64,
}

/// Per-drive partition table.
#[derive(Debug, Clone)]
pub struct PartitionTable {
    parts: [Option<Partition>; MAX_PARTITIONS],
}

impl PartitionTable {
    pub const fn empty() -> Self {
        PartitionTable { parts: [None; MAX_PARTITIONS] }
    }

    /// Parse the four primary MBR entries from sector 0.
    ///
    /// Entries with type 0, size 0, or an odd start sector (not addressable
    /// in 1024-byte blocks) are skipped.
    pub fn from_mbr(sector: &[u8; 512]) -> Self {
        let mut table = PartitionTable::empty();

        if sector[510] != 0x55 || sector[511] != 0xAA {
            log::warn!(target: "part", "no MBR signature, treating disk as unpartitioned");
            return table;
        }

        for i in 0..4 {
            let off = 446 + i * 16;
            let ptype = sector[off + 4];
            let start = u32::from_le_bytes([
                sector[off + 8],
                sector[off + 9],
                sector[off + 10],
                sector[off + 11],
            ]) as u64;
            let size = u32::from_le_bytes([
                sector[off + 12],
                sector[off + 13],
                sector[off + 14],
                sector[off + 15],
            ]) as u64;

            if ptype == 0 || size == 0 {
                continue;
            }
            if start % SECTORS_PER_BLOCK != 0 {
                log::warn!(target: "part",
                    "partition {} starts at odd sector {}, skipping", i + 1, start);
                continue;
            }

            let first_block = start / SECTORS_PER_BLOCK;
            let blocks = size / SECTORS_PER_BLOCK;
            if blocks == 0 {
                continue;
            }
            table.parts[i] = Some(Partition {
                first_block,
                last_block: first_block + blocks - 1,
            });
            log::info!(target: "part",
                "MBR[{}]: type {:#04x} blocks {}..={}", i + 1, ptype,
                first_block, first_block + blocks - 1);
        }

        table
    }

    /// Look up partition `index` (1-based; 0 is the raw device).
    pub fn get(&self, index: u8) -> Option<Partition> {
        if index == 0 || index as usize > MAX_PARTITIONS {
            return None;
        }
        self.parts[index as usize - 1]
    }

    /// Translate a partition-relative block range to an absolute range.
    ///
    /// For partition 0 the range is checked against the whole drive
    /// (`total_blocks`); for partitions 1..=15 against the table entry.
    /// Returns the absolute first block, `ENODEV` for an absent partition,
    /// `EINVAL` for an empty or out-of-bounds range.
    pub fn resolve(
        &self,
        partition: u8,
        first_block: u64,
        blocks: u32,
        total_blocks: u64,
    ) -> Result<u64, Errno> {
        if blocks == 0 {
            return Err(Errno::Inval);
        }
        if partition == 0 {
            if first_block + blocks as u64 > total_blocks {
                return Err(Errno::Inval);
            }
            return Ok(first_block);
        }
        let part = self.get(partition).ok_or(Errno::NoDev)?;
        let abs_first = part.first_block + first_block;
        let abs_last = abs_first + blocks as u64 - 1;
        if abs_last > part.last_block {
            return Err(Errno::Inval);
        }
        Ok(abs_first)
    }
}
