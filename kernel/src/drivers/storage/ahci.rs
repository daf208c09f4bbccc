//! AHCI (SATA) driver.
//!
//! Each active port carries a 32-entry command list, a received-FIS area,
//! per-slot command tables, and one request queue. The queue contract is
//! the same as PATA's: one request at the hardware at a time, IRQ-driven
//! completion in submission order. Only command slot 0 is occupied per
//! submission; the remaining slots exist so the controller structures
//! match the hardware layout.

use alloc::boxed::Box;
use alloc::vec::Vec;

use bitflags::bitflags;

use crate::config;
use crate::drivers::blockdev::{self, BlockDeviceOps, SECTORS_PER_BLOCK};
use crate::drivers::pci::PciDevice;
use crate::drivers::storage::hdq::{HdDriver, Request, RequestQueue, Rw};
use crate::drivers::storage::part::PartitionTable;
use crate::drivers::storage::pata::parse_identify;
use crate::error::Errno;
use crate::mem::{self, PhysAddr, VirtAddr};
use crate::sync::Spinlock;

// ── HBA generic registers ───────────────────────────
const REG_CAP: u64 = 0x00;
const REG_GHC: u64 = 0x04;
const REG_IS: u64 = 0x08;
const REG_PI: u64 = 0x0C;

const GHC_IE: u32 = 1 << 1;
const GHC_AE: u32 = 1 << 31;

/// CAP.SCLO: controller supports command-list override.
const CAP_SCLO: u32 = 1 << 24;

// ── Per-port registers (base = 0x100 + port * 0x80) ─
const PORT_CLB: u64 = 0x00;
const PORT_CLBU: u64 = 0x04;
const PORT_FB: u64 = 0x08;
const PORT_FBU: u64 = 0x0C;
const PORT_IS: u64 = 0x10;
const PORT_IE: u64 = 0x14;
const PORT_CMD: u64 = 0x18;
const PORT_TFD: u64 = 0x20;
const PORT_SIG: u64 = 0x24;
const PORT_SSTS: u64 = 0x28;
const PORT_SCTL: u64 = 0x2C;
const PORT_SERR: u64 = 0x30;
const PORT_CI: u64 = 0x38;

bitflags! {
    /// PxCMD bits used by the start/stop/reset sequences.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PortCmd: u32 {
        const ST = 1 << 0;
        const SUD = 1 << 1;
        const POD = 1 << 2;
        const CLO = 1 << 3;
        const FRE = 1 << 4;
        const FR = 1 << 14;
        const CR = 1 << 15;
    }
}

/// PxIS.DHRS: device-to-host register FIS received (command completion).
const PORT_IS_DHRS: u32 = 1 << 0;
/// PxIS.TFES: task file error.
const PORT_IS_TFES: u32 = 1 << 30;

/// PxTFD bits mirroring the ATA status register.
const TFD_ERR: u32 = 1 << 0;
const TFD_DRQ: u32 = 1 << 3;
const TFD_BSY: u32 = 1 << 7;

/// PxSSTS.DET value: device present and PHY established.
const SSTS_DET_PRESENT: u32 = 3;

const SATA_SIG_ATA: u32 = 0x0000_0101;

const FIS_TYPE_REG_H2D: u8 = 0x27;

const ATA_CMD_READ_DMA_EXT: u8 = 0x25;
const ATA_CMD_WRITE_DMA_EXT: u8 = 0x35;
const ATA_CMD_IDENTIFY: u8 = 0xEC;

/// Command slots per port.
pub const CMD_SLOTS: usize = 32;
/// PRDT entries per command table.
pub const AHCI_PRDT_MAX: usize = 56;
/// Chunk size in 1024-byte blocks handed to the request queue.
const CHUNK_BLOCKS: u32 = 128;

/// Spin budget for engine start/stop waits.
const ENGINE_TIMEOUT: u32 = 1_000_000;
/// Spin budget for the QEMU CI-clear race in the IRQ path (≈500 ms).
const CI_CLEAR_TIMEOUT: u32 = 5_000_000;

// ── Controller data structures (DMA-visible) ────────

/// Command list header (32 bytes, 32 per port).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CmdHeader {
    pub flags: u16,
    pub prdtl: u16,
    pub prdbc: u32,
    pub ctba: u32,
    pub ctbau: u32,
    _reserved: [u32; 4],
}

/// Command header flag bits.
pub const CMDH_WRITE: u16 = 1 << 6;
/// Command FIS length in dwords (Register H2D = 5).
pub const CMDH_CFL_H2D: u16 = 5;

/// PRDT entry (16 bytes). `dbc` bits 21:0 = byte count minus one,
/// bit 31 = interrupt on completion.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AhciPrd {
    pub dba: u32,
    pub dbau: u32,
    _reserved: u32,
    pub dbc: u32,
}

pub const PRD_IOC: u32 = 1 << 31;

/// Command table: command FIS + ATAPI area + PRDT.
#[repr(C)]
pub struct CmdTable {
    pub cfis: [u8; 64],
    pub acmd: [u8; 16],
    _reserved: [u8; 48],
    pub prdt: [AhciPrd; AHCI_PRDT_MAX],
}

/// Register host-to-device FIS, placed in `cfis`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FisRegH2D {
    pub fis_type: u8,
    pub flags: u8,
    pub command: u8,
    pub features_lo: u8,
    pub lba0: u8,
    pub lba1: u8,
    pub lba2: u8,
    pub device: u8,
    pub lba3: u8,
    pub lba4: u8,
    pub lba5: u8,
    pub features_hi: u8,
    pub count_lo: u8,
    pub count_hi: u8,
    _reserved: [u8; 6],
}

/// Build a Register H2D command FIS for a 48-bit LBA transfer.
pub fn build_h2d_fis(command: u8, lba: u64, count: u16) -> FisRegH2D {
    FisRegH2D {
        fis_type: FIS_TYPE_REG_H2D,
        flags: 0x80, // C bit: this is a command
        command,
        features_lo: 0,
        lba0: lba as u8,
        lba1: (lba >> 8) as u8,
        lba2: (lba >> 16) as u8,
        device: 0x40, // LBA mode
        lba3: (lba >> 24) as u8,
        lba4: (lba >> 32) as u8,
        lba5: (lba >> 40) as u8,
        features_hi: 0,
        count_lo: count as u8,
        count_hi: (count >> 8) as u8,
        _reserved: [0; 6],
    }
}

/// Split a buffer into AHCI PRDT entries, one per page overlap, with IOC
/// set on the last entry. No entry crosses a page boundary.
pub fn build_ahci_prdt(
    buffer: VirtAddr,
    len: usize,
    max_entries: usize,
    translate: impl Fn(VirtAddr) -> Option<PhysAddr>,
) -> Result<Vec<AhciPrd>, Errno> {
    const PAGE_SIZE: u64 = 4096;
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
        entries.push(AhciPrd {
            dba: phys.as_u64() as u32,
            dbau: (phys.as_u64() >> 32) as u32,
            _reserved: 0,
            dbc: (chunk - 1) as u32,
        });
        virt += chunk as u64;
    }
    entries.last_mut().unwrap().dbc |= PRD_IOC;
    Ok(entries)
}

// ── MMIO helpers ────────────────────────────────────

#[inline(always)]
unsafe fn mmio_read32(base: u64, offset: u64) -> u32 {
    core::ptr::read_volatile((base + offset) as *const u32)
}

#[inline(always)]
unsafe fn mmio_write32(base: u64, offset: u64, val: u32) {
    core::ptr::write_volatile((base + offset) as *mut u32, val);
}

#[inline(always)]
fn port_base(port: u32) -> u64 {
    0x100 + (port as u64) * 0x80
}

// ── Port state ──────────────────────────────────────

/// One initialized port with its DMA structures and drive metadata.
struct AhciPort {
    mmio_base: u64,
    port: u32,
    supports_clo: bool,
    clb_virt: VirtAddr,
    #[allow(dead_code)]
    fb_virt: VirtAddr,
    /// Command tables, one per slot, contiguous.
    ctba_virt: VirtAddr,
    total_blocks: u64,
    partitions: PartitionTable,
}

struct AhciPortDev {
    port: &'static AhciPort,
    queue: RequestQueue,
}

struct AhciController {
    mmio_base: u64,
    irq: u8,
    /// Port-number-indexed references into `PORTS` for IRQ dispatch.
    ports: Vec<(u32, &'static AhciPortDev)>,
}

/// Flat registry: drive index (minor >> 4) indexes this list.
static PORTS: Spinlock<Vec<&'static AhciPortDev>> = Spinlock::new(Vec::new());
static CONTROLLERS: Spinlock<Vec<&'static AhciController>> = Spinlock::new(Vec::new());

/// Driver-wide IRQ handler lock: CPUs sharing the interrupt line serialize
/// here, not on the per-device queue locks.
static HANDLER_LOCK: Spinlock<()> = Spinlock::new(());

impl AhciPort {
    unsafe fn read(&self, reg: u64) -> u32 {
        mmio_read32(self.mmio_base, port_base(self.port) + reg)
    }

    unsafe fn write(&self, reg: u64, val: u32) {
        mmio_write32(self.mmio_base, port_base(self.port) + reg, val);
    }

    unsafe fn cmd_header(&self, slot: usize) -> *mut CmdHeader {
        (self.clb_virt.as_ptr::<CmdHeader>()).add(slot)
    }

    unsafe fn cmd_table(&self, slot: usize) -> *mut CmdTable {
        (self.ctba_virt.as_ptr::<CmdTable>()).add(slot)
    }

    /// Wait for slot 0 to go idle.
    unsafe fn wait_slot_clear(&self, budget: u32) -> Result<(), Errno> {
        for _ in 0..budget {
            if self.read(PORT_CI) & 1 == 0 {
                return Ok(());
            }
            core::hint::spin_loop();
        }
        Err(Errno::Io)
    }

    /// Fill slot 0 and issue one command. Does not wait for completion.
    unsafe fn issue(
        &self,
        command: u8,
        lba: u64,
        count: u16,
        buffer: Option<(VirtAddr, usize)>,
        write: bool,
    ) -> Result<(), Errno> {
        self.wait_slot_clear(ENGINE_TIMEOUT)?;

        let prdt = match buffer {
            Some((virt, len)) => build_ahci_prdt(virt, len, AHCI_PRDT_MAX, mem::virt_to_phys)?,
            None => Vec::new(),
        };

        let header = self.cmd_header(0);
        (*header).flags = CMDH_CFL_H2D | if write { CMDH_WRITE } else { 0 };
        (*header).prdtl = prdt.len() as u16;
        (*header).prdbc = 0;

        let table = self.cmd_table(0);
        core::ptr::write_bytes((*table).cfis.as_mut_ptr(), 0, 64);
        core::ptr::write_bytes((*table).acmd.as_mut_ptr(), 0, 16);
        let fis = build_h2d_fis(command, lba, count);
        core::ptr::write_volatile((*table).cfis.as_mut_ptr() as *mut FisRegH2D, fis);
        for (i, e) in prdt.iter().enumerate() {
            core::ptr::write_volatile((*table).prdt.as_mut_ptr().add(i), *e);
        }

        self.write(PORT_CI, 1);
        Ok(())
    }

    /// Poll slot 0 to completion (probe-time use, before IRQs are wired).
    unsafe fn poll_completion(&self) -> Result<(), Errno> {
        self.wait_slot_clear(CI_CLEAR_TIMEOUT)?;
        if self.read(PORT_TFD) & TFD_ERR != 0 || self.read(PORT_IS) & PORT_IS_TFES != 0 {
            return Err(Errno::Io);
        }
        Ok(())
    }

    /// Stop the command engine: clear ST, wait for CR to fall, clear FRE,
    /// wait for FR to fall.
    unsafe fn stop_engine(&self) {
        let mut cmd = PortCmd::from_bits_truncate(self.read(PORT_CMD));
        cmd.remove(PortCmd::ST);
        self.write(PORT_CMD, cmd.bits());
        for _ in 0..ENGINE_TIMEOUT {
            if self.read(PORT_CMD) & PortCmd::CR.bits() == 0 {
                break;
            }
            core::hint::spin_loop();
        }

        let mut cmd = PortCmd::from_bits_truncate(self.read(PORT_CMD));
        cmd.remove(PortCmd::FRE);
        self.write(PORT_CMD, cmd.bits());
        for _ in 0..ENGINE_TIMEOUT {
            if self.read(PORT_CMD) & PortCmd::FR.bits() == 0 {
                break;
            }
            core::hint::spin_loop();
        }
    }

    /// Start the command engine: FRE first, then clear a stuck BSY/DRQ via
    /// CLO if the controller supports it, then ST, waiting for CR to rise.
    unsafe fn start_engine(&self) -> Result<(), Errno> {
        let mut cmd = PortCmd::from_bits_truncate(self.read(PORT_CMD));
        cmd.insert(PortCmd::FRE);
        self.write(PORT_CMD, cmd.bits());

        let mut busy_budget = ENGINE_TIMEOUT;
        while self.read(PORT_TFD) & (TFD_BSY | TFD_DRQ) != 0 {
            if busy_budget == 0 {
                if self.supports_clo {
                    let cmd = self.read(PORT_CMD);
                    self.write(PORT_CMD, cmd | PortCmd::CLO.bits());
                    for _ in 0..ENGINE_TIMEOUT {
                        if self.read(PORT_CMD) & PortCmd::CLO.bits() == 0 {
                            break;
                        }
                        core::hint::spin_loop();
                    }
                    break;
                }
                return Err(Errno::Io);
            }
            busy_budget -= 1;
            core::hint::spin_loop();
        }

        let mut cmd = PortCmd::from_bits_truncate(self.read(PORT_CMD));
        cmd.insert(PortCmd::ST);
        self.write(PORT_CMD, cmd.bits());
        for _ in 0..ENGINE_TIMEOUT {
            if self.read(PORT_CMD) & PortCmd::CR.bits() != 0 {
                return Ok(());
            }
            core::hint::spin_loop();
        }
        Err(Errno::Io)
    }

    /// COMRESET: stop the engine, pulse PxSCTL.DET (or raise SUD from 0),
    /// and wait for the PHY to report a device.
    #[allow(dead_code)]
    unsafe fn comreset(&self) -> Result<(), Errno> {
        self.stop_engine();
        let cmd = PortCmd::from_bits_truncate(self.read(PORT_CMD));
        if cmd.contains(PortCmd::SUD) {
            let sctl = self.read(PORT_SCTL);
            self.write(PORT_SCTL, (sctl & !0xF) | 1);
            // DET=1 must be held for at least 1 ms.
            let start = crate::time::current_ticks();
            while crate::time::ticks_since(start) < 1 {
                core::hint::spin_loop();
            }
            self.write(PORT_SCTL, sctl & !0xF);
        } else {
            self.write(PORT_CMD, (cmd | PortCmd::SUD).bits());
        }
        for _ in 0..ENGINE_TIMEOUT {
            if self.read(PORT_SSTS) & 1 != 0 {
                return Ok(());
            }
            core::hint::spin_loop();
        }
        Err(Errno::Io)
    }
}

impl HdDriver for AhciPort {
    fn chunk_size(&self) -> u32 {
        CHUNK_BLOCKS
    }

    fn prepare(&self, _req: &Request) -> Result<(), Errno> {
        // The PRDT is written together with the FIS in submit(): the
        // command table is a single structure filled per issue.
        Ok(())
    }

    fn submit(&self, req: &Request) -> Result<(), Errno> {
        if req.rw == Rw::Write && config::ahci_ro() {
            panic!("ahci: write refused, ahci_ro is set");
        }
        let lba = req.first_block * SECTORS_PER_BLOCK;
        let sectors = (req.blocks as u64 * SECTORS_PER_BLOCK) as u16;
        let len = req.blocks as usize * blockdev::BLOCK_SIZE;
        let command = match req.rw {
            Rw::Read => ATA_CMD_READ_DMA_EXT,
            Rw::Write => ATA_CMD_WRITE_DMA_EXT,
        };
        unsafe { self.issue(command, lba, sectors, Some((req.buffer, len)), req.rw == Rw::Write) }
    }

    fn complete(&self, req: &Request, status: i32) {
        if status != 0 {
            log::error!(target: "ahci",
                "request failed: port {} {:?} block {} + {}",
                self.port, req.rw, req.first_block, req.blocks);
        }
    }
}

// ── IRQ handling ────────────────────────────────────

/// Service every controller on this vector. Runs under the driver-wide
/// handler lock; CPUs sharing the line serialize here.
pub fn handle_irq(vector: u8) {
    let _guard = HANDLER_LOCK.lock();
    let controllers = CONTROLLERS.lock();
    for ctrl in controllers.iter() {
        if ctrl.irq != vector {
            continue;
        }
        unsafe {
            let is = mmio_read32(ctrl.mmio_base, REG_IS);
            if is == 0 {
                continue;
            }
            for &(port_no, dev) in &ctrl.ports {
                if is & (1 << port_no) == 0 {
                    continue;
                }
                // Acknowledge at the controller level first.
                mmio_write32(ctrl.mmio_base, REG_IS, 1 << port_no);

                let port = dev.port;
                let port_is = port.read(PORT_IS);
                let serr = port.read(PORT_SERR);
                let tfd = port.read(PORT_TFD);

                if port_is & PORT_IS_DHRS != 0 {
                    // QEMU raises DHRS before clearing CI; wait it out so
                    // the next submit does not race the previous command.
                    if port.wait_slot_clear(CI_CLEAR_TIMEOUT).is_err() {
                        log::error!(target: "ahci",
                            "port {}: CI stuck after DHRS (IS={:#x} SERR={:#x})",
                            port_no, port_is, serr);
                    }
                }

                port.write(PORT_IS, port_is);
                port.write(PORT_SERR, serr);

                let failed = tfd & TFD_ERR != 0 || port_is & PORT_IS_TFES != 0;
                dev.queue.irq_complete(if failed { Errno::Io.code() } else { 0 });
            }
        }
    }
}

// ── Initialization ──────────────────────────────────

/// Probe one AHCI controller (PCI class 0x01/0x06) and bring up every port
/// with an attached SATA disk. Called by the boot code per controller.
pub fn probe_controller(pci: &PciDevice) {
    if pci.class_code != 0x01 || pci.subclass != 0x06 {
        return;
    }
    let abar = (pci.bars[5] & !0xF) as u64;
    if abar == 0 {
        log::warn!(target: "ahci", "BAR5 is zero, controller skipped");
        return;
    }

    pci.enable_bus_master();
    let mmio_base = match mem::map_memio(PhysAddr::new(abar), 0x1100) {
        Some(v) => v.as_u64(),
        None => {
            log::error!(target: "ahci", "failed to map ABAR");
            return;
        }
    };

    unsafe {
        let ghc = mmio_read32(mmio_base, REG_GHC);
        mmio_write32(mmio_base, REG_GHC, ghc | GHC_AE);

        let cap = mmio_read32(mmio_base, REG_CAP);
        let pi = mmio_read32(mmio_base, REG_PI);
        let supports_clo = cap & CAP_SCLO != 0;

        let mut ctrl_ports = Vec::new();
        for port_no in 0..32u32 {
            if pi & (1 << port_no) == 0 {
                continue;
            }
            let pbase = port_base(port_no);
            let ssts = mmio_read32(mmio_base, pbase + PORT_SSTS);
            if ssts & 0xF != SSTS_DET_PRESENT {
                continue;
            }
            let sig = mmio_read32(mmio_base, pbase + PORT_SIG);
            if sig != SATA_SIG_ATA {
                log::debug!(target: "ahci", "port {}: non-disk signature {:#010x}",
                    port_no, sig);
                continue;
            }
            if let Some(dev) = init_port(mmio_base, port_no, supports_clo) {
                let mut ports = PORTS.lock();
                let index = ports.len();
                ports.push(dev);
                drop(ports);
                ctrl_ports.push((port_no, dev));
                if index == 0 {
                    if let Err(e) = blockdev::register_driver(blockdev::MAJOR_AHCI, &AhciOps) {
                        log::error!(target: "ahci", "major registration failed: {}", e);
                    }
                }
            }
        }

        if ctrl_ports.is_empty() {
            return;
        }

        // Enable controller interrupts.
        let ghc = mmio_read32(mmio_base, REG_GHC);
        mmio_write32(mmio_base, REG_GHC, ghc | GHC_IE);

        CONTROLLERS.lock().push(Box::leak(Box::new(AhciController {
            mmio_base,
            irq: pci.interrupt_line,
            ports: ctrl_ports,
        })));
        log::info!(target: "ahci", "controller at {:#x}: irq {}", abar, pci.interrupt_line);
    }
}

/// Bring one port up per the init sequence: stop engine, spin-up, wait for
/// the PHY, install DMA structures, clear errors, start engine, clear IS.
unsafe fn init_port(mmio_base: u64, port_no: u32, supports_clo: bool) -> Option<&'static AhciPortDev> {
    let clb_size = CMD_SLOTS * core::mem::size_of::<CmdHeader>();
    let clb = mem::alloc_aligned(clb_size, 1024)?;
    let fb = mem::alloc_aligned(256, 256)?;
    let ctba = mem::alloc_aligned(CMD_SLOTS * core::mem::size_of::<CmdTable>(), 128)?;

    let mut port = AhciPort {
        mmio_base,
        port: port_no,
        supports_clo,
        clb_virt: clb,
        fb_virt: fb,
        ctba_virt: ctba,
        total_blocks: 0,
        partitions: PartitionTable::empty(),
    };

    // 1-2. Stop the command engine and FIS receive.
    port.stop_engine();

    // 3. Spin up / power on.
    let cmd = port.read(PORT_CMD);
    port.write(PORT_CMD, cmd | (PortCmd::SUD | PortCmd::POD).bits());

    // 4. Wait for device present + PHY ready.
    let mut present = false;
    for _ in 0..ENGINE_TIMEOUT {
        if port.read(PORT_SSTS) & 0xF == SSTS_DET_PRESENT {
            present = true;
            break;
        }
        core::hint::spin_loop();
    }
    if !present {
        log::debug!(target: "ahci", "port {}: no device after spin-up", port_no);
        return None;
    }

    // 5. Install command list and received-FIS area.
    core::ptr::write_bytes(clb.as_ptr::<u8>(), 0, clb_size);
    core::ptr::write_bytes(fb.as_ptr::<u8>(), 0, 256);
    core::ptr::write_bytes(ctba.as_ptr::<u8>(), 0, CMD_SLOTS * core::mem::size_of::<CmdTable>());
    let clb_phys = mem::virt_to_phys(clb)?.as_u64();
    let fb_phys = mem::virt_to_phys(fb)?.as_u64();
    port.write(PORT_CLB, clb_phys as u32);
    port.write(PORT_CLBU, (clb_phys >> 32) as u32);
    port.write(PORT_FB, fb_phys as u32);
    port.write(PORT_FBU, (fb_phys >> 32) as u32);

    // Point every command header at its table.
    for slot in 0..CMD_SLOTS {
        let table_phys = mem::virt_to_phys(VirtAddr::new(
            ctba.as_u64() + (slot * core::mem::size_of::<CmdTable>()) as u64,
        ))?
        .as_u64();
        let header = port.cmd_header(slot);
        (*header).ctba = table_phys as u32;
        (*header).ctbau = (table_phys >> 32) as u32;
    }

    // 6. Clear PxSERR (write-1s) so PxTFD can clear.
    port.write(PORT_SERR, 0xFFFF_FFFF);

    // 7. FIS receive on, then start the engine.
    if port.start_engine().is_err() {
        log::warn!(target: "ahci", "port {}: engine failed to start", port_no);
        return None;
    }

    // 8. Clear any stale interrupt status, then unmask completions.
    port.write(PORT_IS, 0xFFFF_FFFF);
    port.write(PORT_IE, PORT_IS_DHRS | PORT_IS_TFES);

    // IDENTIFY (polled; the scheduler is not running yet).
    let id_buf = mem::alloc_aligned(512, 2)?;
    port.issue(ATA_CMD_IDENTIFY, 0, 1, Some((id_buf, 512)), false).ok()?;
    if port.poll_completion().is_err() {
        log::warn!(target: "ahci", "port {}: IDENTIFY failed", port_no);
        mem::free(id_buf);
        return None;
    }
    let mut words = [0u16; 256];
    core::ptr::copy_nonoverlapping(id_buf.as_ptr::<u16>() as *const u16, words.as_mut_ptr(), 256);
    let id = parse_identify(&words);
    port.total_blocks = id.total_sectors / SECTORS_PER_BLOCK;
    log::info!(target: "ahci", "port {}: '{}', {} sectors", port_no, id.model_str(),
        id.total_sectors);

    // Partition scan: polled single-sector read into the same bounce buffer.
    port.issue(ATA_CMD_READ_DMA_EXT, 0, 1, Some((id_buf, 512)), false).ok()?;
    if port.poll_completion().is_ok() {
        let mut mbr = [0u8; 512];
        core::ptr::copy_nonoverlapping(id_buf.as_ptr::<u8>() as *const u8, mbr.as_mut_ptr(), 512);
        port.partitions = PartitionTable::from_mbr(&mbr);
    } else {
        log::error!(target: "ahci", "port {}: partition scan failed", port_no);
    }
    mem::free(id_buf);

    let port: &'static AhciPort = Box::leak(Box::new(port));
    Some(Box::leak(Box::new(AhciPortDev {
        port,
        queue: RequestQueue::new(port),
    })))
}

// ── Block layer entry points ────────────────────────

struct AhciOps;

fn device_for(minor: u8) -> Result<&'static AhciPortDev, Errno> {
    PORTS
        .lock()
        .get((minor >> 4) as usize)
        .copied()
        .ok_or(Errno::NoDev)
}

impl BlockDeviceOps for AhciOps {
    fn open(&self, minor: u8) -> Result<(), Errno> {
        device_for(minor).map(|_| ())
    }

    fn close(&self, _minor: u8) -> Result<(), Errno> {
        Ok(())
    }

    fn read(&self, minor: u8, first_block: u64, blocks: u32, buf: &mut [u8]) -> Result<(), Errno> {
        let dev = device_for(minor)?;
        let abs = dev
            .port
            .partitions
            .resolve(minor & 0x0F, first_block, blocks, dev.port.total_blocks)?;
        dev.queue.read_blocks(minor, abs, blocks, buf)
    }

    fn write(&self, minor: u8, first_block: u64, blocks: u32, buf: &[u8]) -> Result<(), Errno> {
        let dev = device_for(minor)?;
        let abs = dev
            .port
            .partitions
            .resolve(minor & 0x0F, first_block, blocks, dev.port.total_blocks)?;
        dev.queue.write_blocks(minor, abs, blocks, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn h2d_fis_layout() {
        let fis = build_h2d_fis(ATA_CMD_READ_DMA_EXT, 0x0123_4567_89AB, 0x0204);
        assert_eq!(fis.fis_type, FIS_TYPE_REG_H2D);
        assert_eq!(fis.flags, 0x80);
        assert_eq!(fis.command, 0x25);
        assert_eq!(fis.device, 0x40);
        assert_eq!(
            [fis.lba0, fis.lba1, fis.lba2, fis.lba3, fis.lba4, fis.lba5],
            [0xAB, 0x89, 0x67, 0x45, 0x23, 0x01]
        );
        assert_eq!(fis.count_lo, 0x04);
        assert_eq!(fis.count_hi, 0x02);
        assert_eq!(core::mem::size_of::<FisRegH2D>(), 20);
    }

    #[test]
    fn structure_sizes_match_the_spec() {
        assert_eq!(core::mem::size_of::<CmdHeader>(), 32);
        assert_eq!(core::mem::size_of::<AhciPrd>(), 16);
        // 64 (CFIS) + 16 (ACMD) + 48 (reserved) + PRDT.
        assert_eq!(
            core::mem::size_of::<CmdTable>(),
            128 + AHCI_PRDT_MAX * core::mem::size_of::<AhciPrd>()
        );
    }

    #[test]
    fn prdt_entries_have_ioc_on_last_and_stay_in_pages() {
        let entries = build_ahci_prdt(VirtAddr::new(0x7000 + 100), 9000, AHCI_PRDT_MAX, |v| {
            Some(PhysAddr::new(v.as_u64() + 0x1_0000_0000))
        })
        .unwrap();
        let total: usize = entries
            .iter()
            .map(|e| ((e.dbc & 0x3F_FFFF) + 1) as usize)
            .sum();
        assert_eq!(total, 9000);
        for (i, e) in entries.iter().enumerate() {
            let is_last = i == entries.len() - 1;
            assert_eq!(e.dbc & PRD_IOC != 0, is_last);
            let start = ((e.dbau as u64) << 32) | e.dba as u64;
            let end = start + (e.dbc & 0x3F_FFFF) as u64;
            assert_eq!(start / 4096, end / 4096, "entry crosses a page");
        }
    }

    #[test]
    fn prdt_overflow_is_rejected() {
        let err = build_ahci_prdt(VirtAddr::new(0), 64 * 4096, 8, |v| {
            Some(PhysAddr::new(v.as_u64()))
        });
        assert_eq!(err.unwrap_err(), Errno::Inval);
    }
}
