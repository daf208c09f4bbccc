//! Byte-granular access on top of the block device layer.
//!
//! A thin pass-through today: no block is kept around between calls.
//! Reads and writes may start and end anywhere; partial blocks at either
//! edge of a write are handled read-modify-write. Temporary block buffers
//! are allocated per call and failure to get one reports `ENOMEM`.

use alloc::vec::Vec;

use crate::drivers::blockdev::{self, DevId, BLOCK_SIZE};
use crate::error::Errno;

fn temp_block() -> Result<Vec<u8>, Errno> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(BLOCK_SIZE).map_err(|_| Errno::NoMem)?;
    buf.resize(BLOCK_SIZE, 0);
    Ok(buf)
}

/// Read `buf.len()` bytes from `dev` starting `offset` bytes into block
/// `first_block`.
pub fn read_bytes(dev: DevId, first_block: u64, offset: u64, buf: &mut [u8]) -> Result<(), Errno> {
    if buf.is_empty() {
        return Ok(());
    }
    let mut block = first_block + offset / BLOCK_SIZE as u64;
    let mut off = (offset % BLOCK_SIZE as u64) as usize;
    let mut done = 0usize;

    while done < buf.len() {
        let n = (BLOCK_SIZE - off).min(buf.len() - done);
        if off == 0 && n == BLOCK_SIZE {
            // Aligned whole block: read straight into the caller's buffer.
            blockdev::read(dev, block, 1, &mut buf[done..done + BLOCK_SIZE])?;
        } else {
            let mut tmp = temp_block()?;
            blockdev::read(dev, block, 1, &mut tmp)?;
            buf[done..done + n].copy_from_slice(&tmp[off..off + n]);
        }
        done += n;
        off = 0;
        block += 1;
    }
    Ok(())
}

/// Write `buf.len()` bytes to `dev` starting `offset` bytes into block
/// `first_block`. Partial edge blocks are read, patched, and written back.
pub fn write_bytes(dev: DevId, first_block: u64, offset: u64, buf: &[u8]) -> Result<(), Errno> {
    if buf.is_empty() {
        return Ok(());
    }
    let mut block = first_block + offset / BLOCK_SIZE as u64;
    let mut off = (offset % BLOCK_SIZE as u64) as usize;
    let mut done = 0usize;

    while done < buf.len() {
        let n = (BLOCK_SIZE - off).min(buf.len() - done);
        if off == 0 && n == BLOCK_SIZE {
            blockdev::write(dev, block, 1, &buf[done..done + BLOCK_SIZE])?;
        } else {
            let mut tmp = temp_block()?;
            blockdev::read(dev, block, 1, &mut tmp)?;
            tmp[off..off + n].copy_from_slice(&buf[done..done + n]);
            blockdev::write(dev, block, 1, &tmp)?;
        }
        done += n;
        off = 0;
        block += 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::ramdisk;

    #[test]
    fn unaligned_write_preserves_neighbors() {
        let dev = ramdisk::create(0, 8);

        // Paint two blocks, then overwrite a range spanning the boundary.
        let paint = std::vec![0x55u8; 2 * BLOCK_SIZE];
        write_bytes(dev, 0, 0, &paint).unwrap();

        let patch = std::vec![0xA7u8; 300];
        write_bytes(dev, 0, 900, &patch).unwrap();

        let mut readback = std::vec![0u8; 2 * BLOCK_SIZE];
        read_bytes(dev, 0, 0, &mut readback).unwrap();
        for (i, &b) in readback.iter().enumerate() {
            let expected = if (900..1200).contains(&i) { 0xA7 } else { 0x55 };
            assert_eq!(b, expected, "byte {}", i);
        }
    }

    #[test]
    fn offset_normalization_crosses_blocks() {
        let dev = ramdisk::create(1, 8);
        let data: Vec<u8> = (0..2500u32).map(|i| (i % 251) as u8).collect();
        // Offset larger than a block: starts inside block 3.
        write_bytes(dev, 1, 2048 + 100, &data).unwrap();

        let mut readback = std::vec![0u8; 2500];
        read_bytes(dev, 3, 100, &mut readback).unwrap();
        assert_eq!(readback, data);
    }

    #[test]
    fn out_of_range_is_reported() {
        let dev = ramdisk::create(2, 2);
        let buf = [0u8; 10];
        assert_eq!(write_bytes(dev, 2, 0, &buf), Err(Errno::Inval));
    }
}
