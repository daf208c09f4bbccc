//! Per-device HD request queue.
//!
//! A fixed ring of [`HD_QUEUE_SIZE`] slots shared by all submitters of one
//! device. Submission claims the tail under the device lock; if the device
//! is idle the request is handed to the driver immediately, otherwise it
//! waits in the ring. Completion runs in IRQ context: it finishes the head,
//! wakes its submitter, and feeds the next queued request to the hardware.
//! Completions are therefore delivered strictly in submission order.

use alloc::sync::Arc;

use crate::drivers::blockdev::BLOCK_SIZE;
use crate::error::Errno;
use crate::mem::VirtAddr;
use crate::sync::{Semaphore, Spinlock};

/// Ring slots per device (power of two).
pub const HD_QUEUE_SIZE: usize = 16;

/// Transfer direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rw {
    Read,
    Write,
}

/// One queued transfer, in absolute 1024-byte blocks on the raw device.
#[derive(Debug, Clone)]
pub struct Request {
    pub minor: u8,
    pub rw: Rw,
    pub first_block: u64,
    pub blocks: u32,
    /// Kernel virtual address of the data buffer (`blocks * BLOCK_SIZE` bytes).
    pub buffer: VirtAddr,
    /// Task that submitted the request (0 for early-boot/kthread context).
    pub task: u32,
}

/// Driver half of the queue contract.
///
/// `prepare` builds per-request DMA structures (PRDT), `submit` programs
/// the hardware, `complete` runs in IRQ context before the submitter is
/// woken. None of these may block.
pub trait HdDriver: Send + Sync {
    /// Maximum blocks per hardware request; larger submissions are split.
    fn chunk_size(&self) -> u32;
    fn prepare(&self, req: &Request) -> Result<(), Errno>;
    fn submit(&self, req: &Request) -> Result<(), Errno>;
    fn complete(&self, req: &Request, status: i32);
}

/// Completion handshake shared between submitter and IRQ path.
struct Completion {
    done: Semaphore,
    status: core::sync::atomic::AtomicI32,
}

struct Slot {
    req: Request,
    completion: Arc<Completion>,
}

struct QueueInner {
    ring: [Option<Slot>; HD_QUEUE_SIZE],
    /// Next slot to complete. Free-running; masked on access.
    head: u64,
    /// Next free slot. Invariant: `tail - head <= HD_QUEUE_SIZE`.
    tail: u64,
    /// True iff a request is at the hardware and an IRQ is outstanding.
    device_busy: bool,
}

/// The request queue for one device.
pub struct RequestQueue {
    driver: &'static dyn HdDriver,
    inner: Spinlock<QueueInner>,
    /// Slot permits: one per free ring entry.
    slots: Semaphore,
}

const MASK: u64 = (HD_QUEUE_SIZE - 1) as u64;

impl RequestQueue {
    pub fn new(driver: &'static dyn HdDriver) -> Self {
        const EMPTY: Option<Slot> = None;
        RequestQueue {
            driver,
            inner: Spinlock::new(QueueInner {
                ring: [EMPTY; HD_QUEUE_SIZE],
                head: 0,
                tail: 0,
                device_busy: false,
            }),
            slots: Semaphore::new(HD_QUEUE_SIZE as i32),
        }
    }

    /// Number of requests currently in the ring (diagnostics).
    pub fn depth(&self) -> usize {
        let q = self.inner.lock();
        (q.tail - q.head) as usize
    }

    /// Submit one request and block until it completes.
    pub fn submit_and_wait(&self, req: Request) -> Result<(), Errno> {
        debug_assert!(req.blocks > 0 && req.blocks <= self.driver.chunk_size());

        self.slots.wait();

        let completion = Arc::new(Completion {
            done: Semaphore::new(0),
            status: core::sync::atomic::AtomicI32::new(0),
        });

        {
            let mut q = self.inner.lock();
            let idx = (q.tail & MASK) as usize;
            debug_assert!(q.ring[idx].is_none());
            q.ring[idx] = Some(Slot { req, completion: Arc::clone(&completion) });
            q.tail += 1;

            if !q.device_busy {
                // The ring was empty, so our request is the head: start it.
                let slot = q.ring[idx].as_ref().unwrap();
                let started = self
                    .driver
                    .prepare(&slot.req)
                    .and_then(|_| self.driver.submit(&slot.req));
                match started {
                    Ok(()) => q.device_busy = true,
                    Err(e) => {
                        q.ring[idx] = None;
                        q.head += 1;
                        drop(q);
                        self.slots.signal();
                        return Err(e);
                    }
                }
            }
        }

        completion.done.wait();
        let status = completion.status.load(core::sync::atomic::Ordering::Acquire);
        if status == 0 {
            Ok(())
        } else {
            Err(Errno::Io)
        }
    }

    /// Complete the request at the head with the given status and start the
    /// next queued request, if any. Called from the driver's IRQ handler.
    ///
    /// `status` is 0 for success, nonzero for a controller/device error.
    pub fn irq_complete(&self, status: i32) {
        let mut released = 0usize;
        {
            let mut q = self.inner.lock();
            if q.head == q.tail {
                // Spurious interrupt with an empty ring.
                q.device_busy = false;
                return;
            }

            let idx = (q.head & MASK) as usize;
            let slot = q.ring[idx].take().expect("hdq: head slot empty");
            q.head += 1;
            released += 1;

            self.driver.complete(&slot.req, status);
            slot.completion
                .status
                .store(status, core::sync::atomic::Ordering::Release);
            slot.completion.done.signal();

            // Feed the new head to the hardware. A submit failure completes
            // that request with EIO and moves on.
            q.device_busy = false;
            while q.head != q.tail {
                let nidx = (q.head & MASK) as usize;
                let started = {
                    let next = q.ring[nidx].as_ref().expect("hdq: queued slot empty");
                    self.driver
                        .prepare(&next.req)
                        .and_then(|_| self.driver.submit(&next.req))
                };
                match started {
                    Ok(()) => {
                        q.device_busy = true;
                        break;
                    }
                    Err(e) => {
                        log::error!(target: "hdq", "deferred submit failed: {}", e);
                        let failed = q.ring[nidx].take().unwrap();
                        q.head += 1;
                        released += 1;
                        failed.completion.status.store(
                            Errno::Io.code(),
                            core::sync::atomic::Ordering::Release,
                        );
                        failed.completion.done.signal();
                    }
                }
            }
        }
        for _ in 0..released {
            self.slots.signal();
        }
    }

    /// Read `blocks` 1024-byte blocks, splitting into driver-sized chunks.
    pub fn read_blocks(
        &self,
        minor: u8,
        first_block: u64,
        blocks: u32,
        buf: &mut [u8],
    ) -> Result<(), Errno> {
        self.rw_chunked(minor, Rw::Read, first_block, blocks, VirtAddr::new(buf.as_mut_ptr() as u64), buf.len())
    }

    /// Write `blocks` 1024-byte blocks, splitting into driver-sized chunks.
    pub fn write_blocks(
        &self,
        minor: u8,
        first_block: u64,
        blocks: u32,
        buf: &[u8],
    ) -> Result<(), Errno> {
        self.rw_chunked(minor, Rw::Write, first_block, blocks, VirtAddr::new(buf.as_ptr() as u64), buf.len())
    }

    fn rw_chunked(
        &self,
        minor: u8,
        rw: Rw,
        first_block: u64,
        blocks: u32,
        buffer: VirtAddr,
        buf_len: usize,
    ) -> Result<(), Errno> {
        if blocks == 0 {
            return Err(Errno::Inval);
        }
        if buf_len < blocks as usize * BLOCK_SIZE {
            return Err(Errno::Inval);
        }

        let chunk = self.driver.chunk_size().max(1);
        let task = crate::task::current_task_id();

        let mut block = first_block;
        let mut offset = 0u64;
        let mut remaining = blocks;
        while remaining > 0 {
            let n = remaining.min(chunk);
            self.submit_and_wait(Request {
                minor,
                rw,
                first_block: block,
                blocks: n,
                buffer: VirtAddr::new(buffer.as_u64() + offset),
                task,
            })?;
            block += n as u64;
            offset += n as u64 * BLOCK_SIZE as u64;
            remaining -= n;
        }
        Ok(())
    }
}
