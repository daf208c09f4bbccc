//! PATA driver for PCI IDE controllers.
//!
//! Each controller carries a primary and a secondary channel; each channel
//! carries up to two drives and one request queue (the channel bus
//! serializes transfers anyway). Transfers use bus-master DMA with a
//! per-channel PRD table; completion is IRQ-driven through the shared
//! request queue. A synchronous PIO path exists for early boot, before
//! interrupts are enabled, and for loading partition tables at probe time.

use alloc::boxed::Box;
use alloc::vec::Vec;

use bitflags::bitflags;

use crate::arch::x86::port::{inb, inw, outb};
use crate::config;
use crate::drivers::blockdev::{self, BlockDeviceOps, SECTORS_PER_BLOCK};
use crate::drivers::pci::PciDevice;
use crate::drivers::storage::hdq::{HdDriver, Request, RequestQueue, Rw};
use crate::drivers::storage::part::PartitionTable;
use crate::error::Errno;
use crate::mem::{self, PhysAddr, VirtAddr};
use crate::sync::Spinlock;

// ── Command block registers (offsets from the channel's command base) ──
const REG_DATA: u16 = 0;
const REG_SECTOR_COUNT: u16 = 2;
const REG_LBA_LO: u16 = 3;
const REG_LBA_MID: u16 = 4;
const REG_LBA_HI: u16 = 5;
const REG_DRIVE_HEAD: u16 = 6;
const REG_STATUS: u16 = 7;
const REG_COMMAND: u16 = 7;

bitflags! {
    /// ATA status register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AtaStatus: u8 {
        const ERR = 1 << 0;
        const DRQ = 1 << 3;
        const DRDY = 1 << 6;
        const BSY = 1 << 7;
    }
}

bitflags! {
    /// Bus-master command register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BmCommand: u8 {
        const START = 1 << 0;
        /// Direction: set = device-to-memory (a disk read).
        const WRITE = 1 << 3;
    }
}

bitflags! {
    /// Bus-master status register bits (INT and ERR are write-1-to-clear).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BmStatus: u8 {
        const ACTIVE = 1 << 0;
        const ERR = 1 << 1;
        const INT = 1 << 2;
        const SIMPLEX = 1 << 7;
    }
}

// ── ATA commands ────────────────────────────────────
const CMD_READ_DMA: u8 = 0xC8;
const CMD_WRITE_DMA: u8 = 0xCA;
const CMD_READ_DMA_EXT: u8 = 0x25;
const CMD_WRITE_DMA_EXT: u8 = 0x35;
const CMD_READ_SECTORS: u8 = 0x20;
const CMD_IDENTIFY: u8 = 0xEC;

// Device control bits.
const CTRL_NIEN: u8 = 1 << 1;
const CTRL_SRST: u8 = 1 << 2;

/// Spin iterations for BSY/DRQ waits before declaring a timeout.
const WAIT_TIMEOUT: u32 = 1_000_000;
/// Spin iterations granted to a soft reset.
const RESET_TIMEOUT: u32 = 5_000_000;

/// PRD table capacity per channel.
pub const PRDT_ENTRIES: usize = 64;
/// Required PRD table alignment: the table may not cross a 64 KiB boundary.
const PRDT_ALIGN: usize = 64 * 1024;

/// Default chunk size in 1024-byte blocks (254 sectors keeps LBA28 legal
/// and the worst-case PRD entry count well inside the table).
const CHUNK_BLOCKS: u32 = 127;
/// Reduced chunk size when the drive identifies as QEMU, whose emulated
/// bus master misbehaves on long PRD chains.
const CHUNK_BLOCKS_QEMU: u32 = 8;

/// One physical region descriptor: `{phys_base, byte_count, EOT}`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrdEntry {
    pub phys: u32,
    /// Byte count; 0 means 64 KiB.
    pub count: u16,
    /// Bit 15 = end of table.
    pub flags: u16,
}

pub const PRD_EOT: u16 = 0x8000;

const PAGE_SIZE: u64 = 4096;

/// Split `[buffer, buffer + len)` into PRD entries, one per overlap of the
/// buffer with a virtual page, translating each chunk start to physical.
///
/// No entry crosses a page boundary; the last entry carries EOT. Fails with
/// `EINVAL` if a translation is missing or the chunk list would overflow
/// `max_entries` (the chunk-size workaround should have prevented that).
pub fn build_prd_entries(
    buffer: VirtAddr,
    len: usize,
    max_entries: usize,
    translate: impl Fn(VirtAddr) -> Option<PhysAddr>,
) -> Result<Vec<PrdEntry>, Errno> {
    if len == 0 {
        return Err(Errno::Inval);
    }
    let mut entries = Vec::new();
    let mut virt = buffer.as_u64();
    let end = buffer.as_u64() + len as u64;
    while virt < end {
        let page_end = (virt & !(PAGE_SIZE - 1)) + PAGE_SIZE;
        let chunk = (end.min(page_end) - virt) as usize;
        let phys = translate(VirtAddr::new(virt)).ok_or(Errno::Inval)?;
        if entries.len() == max_entries {
            return Err(Errno::Inval);
        }
        entries.push(PrdEntry {
            phys: phys.as_u64() as u32,
            count: chunk as u16,
            flags: 0,
        });
        virt += chunk as u64;
    }
    entries.last_mut().unwrap().flags |= PRD_EOT;
    Ok(entries)
}

/// Drive metadata extracted from the 256 IDENTIFY words.
#[derive(Debug, Clone)]
pub struct IdentifyInfo {
    pub model: [u8; 40],
    pub lba: bool,
    pub lba48: bool,
    pub total_sectors: u64,
    pub qemu: bool,
}

impl IdentifyInfo {
    pub fn model_str(&self) -> &str {
        core::str::from_utf8(&self.model).unwrap_or("???").trim()
    }
}

/// Parse an IDENTIFY DEVICE block: model string (byte-swapped words
/// 27..=46), LBA support (word 49 bit 9), LBA48 (word 83 bit 10), sector
/// counts (words 60-61, or 100-103 when LBA48).
pub fn parse_identify(words: &[u16; 256]) -> IdentifyInfo {
    let mut model = [0u8; 40];
    for i in 0..20 {
        model[i * 2] = (words[27 + i] >> 8) as u8;
        model[i * 2 + 1] = words[27 + i] as u8;
    }

    let lba = words[49] & (1 << 9) != 0;
    let lba48 = words[83] & (1 << 10) != 0;

    let sectors28 = (words[60] as u64) | ((words[61] as u64) << 16);
    let sectors48 = (words[100] as u64)
        | ((words[101] as u64) << 16)
        | ((words[102] as u64) << 32)
        | ((words[103] as u64) << 48);
    let total_sectors = if lba48 && sectors48 != 0 { sectors48 } else { sectors28 };

    let qemu = model.starts_with(b"QEMU");

    IdentifyInfo { model, lba, lba48, total_sectors, qemu }
}

/// LBA register bytes for a transfer: `(lo[3], hi[3], count)` where `hi`
/// holds bytes 4..6 written first in the LBA48 two-phase sequence.
pub fn split_lba(lba: u64, sectors: u16) -> ([u8; 3], [u8; 3], u16) {
    (
        [lba as u8, (lba >> 8) as u8, (lba >> 16) as u8],
        [(lba >> 24) as u8, (lba >> 32) as u8, (lba >> 40) as u8],
        sectors,
    )
}

// ── Channel state ───────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelMode {
    Legacy,
    Native,
}

/// Per-drive probe results. Immutable after init.
struct DriveInfo {
    lba48: bool,
    total_blocks: u64,
    partitions: PartitionTable,
}

/// One IDE channel: command block, control block, bus-master block, and up
/// to two probed drives.
struct PataChannel {
    cmd_base: u16,
    ctrl_base: u16,
    bm_base: u16,
    irq: u8,
    #[allow(dead_code)]
    mode: ChannelMode,
    prdt_virt: VirtAddr,
    prdt_phys: PhysAddr,
    chunk_blocks: u32,
    drives: [Option<DriveInfo>; 2],
}

/// A channel with its request queue, as registered with the block layer.
struct PataDev {
    chan: &'static PataChannel,
    queue: RequestQueue,
}

static DEVICES: Spinlock<Vec<&'static PataDev>> = Spinlock::new(Vec::new());

impl PataChannel {
    unsafe fn read_reg(&self, reg: u16) -> u8 {
        inb(self.cmd_base + reg)
    }

    unsafe fn write_reg(&self, reg: u16, val: u8) {
        outb(self.cmd_base + reg, val)
    }

    unsafe fn alt_status(&self) -> u8 {
        inb(self.ctrl_base)
    }

    unsafe fn bm_status(&self) -> BmStatus {
        BmStatus::from_bits_truncate(inb(self.bm_base + 2))
    }

    /// 400 ns settle delay: four alternate-status reads.
    unsafe fn delay_400ns(&self) {
        for _ in 0..4 {
            self.alt_status();
        }
    }

    /// Wait for BSY to clear. Also fails on a floating bus (0xFF).
    unsafe fn wait_not_busy(&self, timeout: u32) -> Result<(), Errno> {
        for _ in 0..timeout {
            let s = self.alt_status();
            if s == 0xFF {
                return Err(Errno::Io);
            }
            if AtaStatus::from_bits_truncate(s) & AtaStatus::BSY == AtaStatus::empty() {
                return Ok(());
            }
            core::hint::spin_loop();
        }
        Err(Errno::Io)
    }

    /// Wait for `DRQ=1, BSY=0, ERR=0` (PIO data phase).
    unsafe fn wait_drq(&self) -> Result<(), Errno> {
        for _ in 0..WAIT_TIMEOUT {
            let s = AtaStatus::from_bits_truncate(self.alt_status());
            if s.contains(AtaStatus::ERR) {
                return Err(Errno::Io);
            }
            if !s.contains(AtaStatus::BSY) && s.contains(AtaStatus::DRQ) {
                return Ok(());
            }
            core::hint::spin_loop();
        }
        Err(Errno::Io)
    }

    /// Wait until both BSY and DRQ are clear (idle before drive select).
    unsafe fn wait_idle(&self) -> Result<(), Errno> {
        for _ in 0..WAIT_TIMEOUT {
            let s = AtaStatus::from_bits_truncate(self.alt_status());
            if !s.contains(AtaStatus::BSY) && !s.contains(AtaStatus::DRQ) {
                return Ok(());
            }
            core::hint::spin_loop();
        }
        Err(Errno::Io)
    }

    /// Soft reset: assert SRST with interrupts masked, settle, release,
    /// wait for BSY to clear.
    unsafe fn soft_reset(&self) -> Result<(), Errno> {
        outb(self.ctrl_base, CTRL_SRST | CTRL_NIEN);
        self.delay_400ns();
        outb(self.ctrl_base, CTRL_NIEN);
        self.delay_400ns();
        self.wait_not_busy(RESET_TIMEOUT)
    }

    /// Select a drive and settle.
    unsafe fn select(&self, slave: bool) {
        self.write_reg(REG_DRIVE_HEAD, 0xA0 | ((slave as u8) << 4));
        self.delay_400ns();
    }

    /// Issue IDENTIFY DEVICE and read the 256-word response.
    unsafe fn identify(&self, slave: bool) -> Result<[u16; 256], Errno> {
        self.select(slave);
        self.write_reg(REG_SECTOR_COUNT, 0);
        self.write_reg(REG_LBA_LO, 0);
        self.write_reg(REG_LBA_MID, 0);
        self.write_reg(REG_LBA_HI, 0);
        self.write_reg(REG_COMMAND, CMD_IDENTIFY);
        self.delay_400ns();

        let status = self.alt_status();
        if status == 0 || status == 0xFF {
            return Err(Errno::NoDev);
        }
        self.wait_not_busy(WAIT_TIMEOUT)?;

        // ATAPI and other non-ATA devices park a signature here.
        if self.read_reg(REG_LBA_MID) != 0 || self.read_reg(REG_LBA_HI) != 0 {
            return Err(Errno::NoDev);
        }
        self.wait_drq()?;

        let mut words = [0u16; 256];
        for w in words.iter_mut() {
            *w = inw(self.cmd_base + REG_DATA);
        }
        Ok(words)
    }

    /// Synchronous PIO read of one 512-byte sector. Usable before IRQs are
    /// enabled; used for partition-table loads at probe time.
    unsafe fn pio_read_sector(&self, slave: bool, lba: u64, buf: &mut [u8; 512]) -> Result<(), Errno> {
        self.wait_idle()?;
        outb(self.ctrl_base, CTRL_NIEN);
        self.write_reg(REG_DRIVE_HEAD, 0xE0 | ((slave as u8) << 4) | ((lba >> 24) & 0x0F) as u8);
        self.write_reg(REG_SECTOR_COUNT, 1);
        self.write_reg(REG_LBA_LO, lba as u8);
        self.write_reg(REG_LBA_MID, (lba >> 8) as u8);
        self.write_reg(REG_LBA_HI, (lba >> 16) as u8);
        self.write_reg(REG_COMMAND, CMD_READ_SECTORS);
        self.delay_400ns();

        self.wait_not_busy(WAIT_TIMEOUT)?;
        self.wait_drq()?;
        for i in (0..512).step_by(2) {
            let word = inw(self.cmd_base + REG_DATA);
            buf[i] = word as u8;
            buf[i + 1] = (word >> 8) as u8;
        }
        // Reading the status register acknowledges the transfer.
        let _ = self.read_reg(REG_STATUS);
        Ok(())
    }

    fn drive_for(&self, minor: u8) -> Result<(bool, &DriveInfo), Errno> {
        let slave = (minor >> 4) & 1 == 1;
        match &self.drives[slave as usize] {
            Some(info) => Ok((slave, info)),
            None => Err(Errno::NoDev),
        }
    }
}

impl HdDriver for PataChannel {
    fn chunk_size(&self) -> u32 {
        self.chunk_blocks
    }

    fn prepare(&self, req: &Request) -> Result<(), Errno> {
        let len = req.blocks as usize * blockdev::BLOCK_SIZE;
        let entries = build_prd_entries(req.buffer, len, PRDT_ENTRIES, mem::virt_to_phys)?;
        let table = self.prdt_virt.as_ptr::<PrdEntry>();
        for (i, e) in entries.iter().enumerate() {
            unsafe { core::ptr::write_volatile(table.add(i), *e) };
        }
        Ok(())
    }

    fn submit(&self, req: &Request) -> Result<(), Errno> {
        if req.rw == Rw::Write && config::pata_ro() {
            panic!("pata: write refused, pata_ro is set");
        }
        let (slave, info) = self.drive_for(req.minor)?;
        let lba = req.first_block * SECTORS_PER_BLOCK;
        let sectors = (req.blocks as u64 * SECTORS_PER_BLOCK) as u16;
        let use_lba48 = info.lba48 && (lba + sectors as u64 > 0x0FFF_FFFF || sectors > 255);

        unsafe {
            // Program the bus master: PRDT base, direction, clear INT+ERR.
            crate::arch::x86::port::outl(self.bm_base + 4, self.prdt_phys.as_u64() as u32);
            let dir = if req.rw == Rw::Read { BmCommand::WRITE } else { BmCommand::empty() };
            outb(self.bm_base, dir.bits());
            outb(self.bm_base + 2, (BmStatus::INT | BmStatus::ERR).bits());

            self.wait_idle()?;
            if use_lba48 {
                self.write_reg(REG_DRIVE_HEAD, 0x40 | ((slave as u8) << 4));
            } else {
                self.write_reg(REG_DRIVE_HEAD,
                    0xE0 | ((slave as u8) << 4) | ((lba >> 24) & 0x0F) as u8);
            }
            self.delay_400ns();
            // Enable the completion interrupt.
            outb(self.ctrl_base, 0);

            let (lo, hi, count) = split_lba(lba, sectors);
            if use_lba48 {
                self.write_reg(REG_SECTOR_COUNT, (count >> 8) as u8);
                self.write_reg(REG_LBA_LO, hi[0]);
                self.write_reg(REG_LBA_MID, hi[1]);
                self.write_reg(REG_LBA_HI, hi[2]);
            }
            self.write_reg(REG_SECTOR_COUNT, count as u8);
            self.write_reg(REG_LBA_LO, lo[0]);
            self.write_reg(REG_LBA_MID, lo[1]);
            self.write_reg(REG_LBA_HI, lo[2]);

            let cmd = match (req.rw, use_lba48) {
                (Rw::Read, false) => CMD_READ_DMA,
                (Rw::Write, false) => CMD_WRITE_DMA,
                (Rw::Read, true) => CMD_READ_DMA_EXT,
                (Rw::Write, true) => CMD_WRITE_DMA_EXT,
            };
            self.write_reg(REG_COMMAND, cmd);

            // Start the bus master.
            outb(self.bm_base, (dir | BmCommand::START).bits());
        }
        Ok(())
    }

    fn complete(&self, req: &Request, status: i32) {
        if status != 0 {
            log::error!(target: "pata",
                "request failed: minor {} {:?} block {} + {}",
                req.minor, req.rw, req.first_block, req.blocks);
        }
    }
}

// ── IRQ handling ────────────────────────────────────

/// Service every channel whose bus-master status shows a pending interrupt
/// on this vector. Clears INT (write-1), stops the engine, and reports the
/// transfer status to the channel's queue.
pub fn handle_irq(vector: u8) {
    let devices = DEVICES.lock();
    for dev in devices.iter() {
        let chan = dev.chan;
        if chan.irq != vector {
            continue;
        }
        unsafe {
            let status = chan.bm_status();
            if !status.contains(BmStatus::INT) {
                continue;
            }
            // Write-1-to-clear INT (and ERR while we are at it), stop engine.
            outb(chan.bm_base + 2, (BmStatus::INT | BmStatus::ERR).bits());
            let cmd = inb(chan.bm_base);
            outb(chan.bm_base, cmd & !BmCommand::START.bits());

            let ata = AtaStatus::from_bits_truncate(chan.read_reg(REG_STATUS));
            let failed = status.contains(BmStatus::ERR) || ata.contains(AtaStatus::ERR);
            dev.queue.irq_complete(if failed { Errno::Io.code() } else { 0 });
        }
    }
}

// ── Probing ─────────────────────────────────────────

/// Probe one PCI IDE controller (class 0x01/0x01) and register its
/// channels. Controllers with the simplex bit set are refused. Called once
/// per controller by the boot code with the devices it enumerated.
pub fn probe_controller(pci: &PciDevice) {
    if pci.class_code != 0x01 || pci.subclass != 0x01 {
        return;
    }
    if pci.prog_if & 0x80 == 0 {
        log::warn!(target: "pata", "controller without bus-master capability, skipping");
        return;
    }

    pci.enable_bus_master();
    let bm_base = (pci.bars[4] & !0x3) as u16;
    if bm_base == 0 {
        log::warn!(target: "pata", "controller has no bus-master BAR, skipping");
        return;
    }
    if unsafe { inb(bm_base + 2) } & BmStatus::SIMPLEX.bits() != 0 {
        log::warn!(target: "pata", "simplex controller refused");
        return;
    }

    for ch in 0..2u8 {
        let native = pci.prog_if & (1 << (ch * 2)) != 0;
        let (cmd_base, ctrl_base, irq) = if native {
            (
                (pci.bars[ch as usize * 2] & !0x3) as u16,
                (pci.bars[ch as usize * 2 + 1] & !0x3) as u16 + 2,
                pci.interrupt_line,
            )
        } else if ch == 0 {
            (0x1F0, 0x3F6, 14)
        } else {
            (0x170, 0x376, 15)
        };

        probe_channel(
            cmd_base,
            ctrl_base,
            bm_base + ch as u16 * 8,
            irq,
            if native { ChannelMode::Native } else { ChannelMode::Legacy },
        );
    }
}

fn probe_channel(cmd_base: u16, ctrl_base: u16, bm_base: u16, irq: u8, mode: ChannelMode) {
    let mut chan = PataChannel {
        cmd_base,
        ctrl_base,
        bm_base,
        irq,
        mode,
        prdt_virt: VirtAddr::new(0),
        prdt_phys: PhysAddr::new(0),
        chunk_blocks: CHUNK_BLOCKS,
        drives: [None, None],
    };

    unsafe {
        if chan.soft_reset().is_err() {
            log::debug!(target: "pata", "channel {:#x}: reset timeout, no channel", cmd_base);
            return;
        }

        for slave in [false, true] {
            let words = match chan.identify(slave) {
                Ok(w) => w,
                Err(_) => continue,
            };
            let id = parse_identify(&words);
            if !id.lba {
                log::warn!(target: "pata", "drive '{}' has no LBA support, rejected",
                    id.model_str());
                continue;
            }
            log::info!(target: "pata", "channel {:#x} {}: '{}', {} sectors{}{}",
                cmd_base,
                if slave { "slave" } else { "master" },
                id.model_str(),
                id.total_sectors,
                if id.lba48 { ", lba48" } else { "" },
                if id.qemu { ", qemu quirks" } else { "" });

            if id.qemu {
                chan.chunk_blocks = chan.chunk_blocks.min(CHUNK_BLOCKS_QEMU);
            }
            let total_blocks = id.total_sectors / SECTORS_PER_BLOCK;
            let mut mbr = [0u8; 512];
            let partitions = match chan.pio_read_sector(slave, 0, &mut mbr) {
                Ok(()) => PartitionTable::from_mbr(&mbr),
                Err(e) => {
                    log::error!(target: "pata", "partition scan failed: {}", e);
                    PartitionTable::empty()
                }
            };
            chan.drives[slave as usize] = Some(DriveInfo {
                lba48: id.lba48,
                total_blocks,
                partitions,
            });
        }
    }

    if chan.drives.iter().all(|d| d.is_none()) {
        return;
    }

    let prdt = match mem::alloc_aligned(PRDT_ENTRIES * core::mem::size_of::<PrdEntry>(), PRDT_ALIGN)
    {
        Some(v) => v,
        None => {
            log::error!(target: "pata", "PRDT allocation failed, channel dropped");
            return;
        }
    };
    chan.prdt_virt = prdt;
    chan.prdt_phys = match mem::virt_to_phys(prdt) {
        Some(p) => p,
        None => panic!("pata: PRDT has no physical mapping"),
    };

    let chan: &'static PataChannel = Box::leak(Box::new(chan));
    let mut devices = DEVICES.lock();
    let first = devices.is_empty();
    let dev: &'static PataDev = Box::leak(Box::new(PataDev {
        chan,
        queue: RequestQueue::new(chan),
    }));
    devices.push(dev);
    if first {
        drop(devices);
        if let Err(e) = blockdev::register_driver(blockdev::MAJOR_PATA, &PataOps) {
            log::error!(target: "pata", "major registration failed: {}", e);
        }
    }
}

/// Synchronous single-sector PIO read, usable before interrupts are wired
/// up (early boot, loading the root partition table).
pub fn read_sector_early(minor: u8, lba: u64, buf: &mut [u8; 512]) -> Result<(), Errno> {
    let dev = device_for(minor)?;
    let (slave, _) = dev.chan.drive_for(minor)?;
    unsafe { dev.chan.pio_read_sector(slave, lba, buf) }
}

// ── Block layer entry points ────────────────────────

/// Dispatch from the majors registry into the per-channel queues.
struct PataOps;

fn device_for(minor: u8) -> Result<&'static PataDev, Errno> {
    // Two drives per channel: drive index = (channel << 1) | slave.
    let channel = (minor >> 5) as usize;
    DEVICES.lock().get(channel).copied().ok_or(Errno::NoDev)
}

fn resolve(dev: &PataDev, minor: u8, first_block: u64, blocks: u32) -> Result<u64, Errno> {
    let (_, info) = dev.chan.drive_for(minor)?;
    info.partitions
        .resolve(minor & 0x0F, first_block, blocks, info.total_blocks)
}

impl BlockDeviceOps for PataOps {
    fn open(&self, minor: u8) -> Result<(), Errno> {
        let dev = device_for(minor)?;
        dev.chan.drive_for(minor).map(|_| ())
    }

    fn close(&self, _minor: u8) -> Result<(), Errno> {
        Ok(())
    }

    fn read(&self, minor: u8, first_block: u64, blocks: u32, buf: &mut [u8]) -> Result<(), Errno> {
        let dev = device_for(minor)?;
        let abs = resolve(dev, minor, first_block, blocks)?;
        dev.queue.read_blocks(minor, abs, blocks, buf)
    }

    fn write(&self, minor: u8, first_block: u64, blocks: u32, buf: &[u8]) -> Result<(), Errno> {
        let dev = device_for(minor)?;
        let abs = resolve(dev, minor, first_block, blocks)?;
        dev.queue.write_blocks(minor, abs, blocks, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prd_entries_never_cross_pages() {
        // 10 KiB buffer starting 512 bytes into a page.
        let base = 0x10000u64 + 512;
        let entries =
            build_prd_entries(VirtAddr::new(base), 10 * 1024, PRDT_ENTRIES, |v| {
                Some(PhysAddr::new(v.as_u64() | 0x8000_0000))
            })
            .unwrap();

        // 3584 + 4096 + 2560 = 10240.
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].count, 3584);
        assert_eq!(entries[1].count, 4096);
        assert_eq!(entries[2].count, 2560);
        assert_eq!(entries[0].flags & PRD_EOT, 0);
        assert_eq!(entries[2].flags & PRD_EOT, PRD_EOT);

        let total: usize = entries.iter().map(|e| e.count as usize).sum();
        assert_eq!(total, 10 * 1024);
        for e in &entries {
            let start = e.phys as u64;
            let end = start + e.count as u64 - 1;
            assert_eq!(start / 4096, end / 4096, "entry crosses a page boundary");
        }
    }

    #[test]
    fn prd_build_fails_on_missing_translation() {
        let err = build_prd_entries(VirtAddr::new(0x1000), 4096, PRDT_ENTRIES, |_| None);
        assert_eq!(err.unwrap_err(), Errno::Inval);
    }

    #[test]
    fn prd_build_respects_capacity() {
        let err = build_prd_entries(VirtAddr::new(0x1000), 64 * 1024, 4, |v| {
            Some(PhysAddr::new(v.as_u64()))
        });
        assert_eq!(err.unwrap_err(), Errno::Inval);
    }

    #[test]
    fn identify_parsing() {
        let mut words = [0u16; 256];
        // Model "QEMU HARDDISK" padded with spaces, byte-swapped per word.
        let model = b"QEMU HARDDISK                           ";
        for i in 0..20 {
            words[27 + i] = ((model[i * 2] as u16) << 8) | model[i * 2 + 1] as u16;
        }
        words[49] = 1 << 9;
        words[83] = 1 << 10;
        words[60] = 0x5678;
        words[61] = 0x1234;
        words[100] = 0x0000;
        words[101] = 0x0001; // 0x10000 << 16 sectors

        let id = parse_identify(&words);
        assert!(id.lba);
        assert!(id.lba48);
        assert!(id.qemu);
        assert_eq!(id.model_str(), "QEMU HARDDISK");
        assert_eq!(id.total_sectors, 0x0001_0000);
    }

    #[test]
    fn identify_falls_back_to_lba28_count() {
        let mut words = [0u16; 256];
        words[49] = 1 << 9;
        words[60] = 0x1000;
        let id = parse_identify(&words);
        assert!(!id.lba48);
        assert!(!id.qemu);
        assert_eq!(id.total_sectors, 0x1000);
    }

    #[test]
    fn lba_split() {
        let (lo, hi, count) = split_lba(0x0123_4567_89AB, 16);
        assert_eq!(lo, [0xAB, 0x89, 0x67]);
        assert_eq!(hi, [0x45, 0x23, 0x01]);
        assert_eq!(count, 16);
    }
}
