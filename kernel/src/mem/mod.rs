//! Consumed memory-manager interface.
//!
//! The page-table machinery itself is out of scope; this module defines
//! the operations the core kernel consumes from it: virtual-to-physical
//! translation for DMA, aligned allocation for controller structures,
//! MMIO mapping, and the address-space handles used by fork/exec. The
//! boot code installs the real implementation via [`install`]; the test
//! harness installs a host-heap provider.

pub mod addr;

pub use addr::{PhysAddr, VirtAddr};

use crate::sync::Spinlock;

/// Opaque handle to a user address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressSpace(pub u32);

/// Function table supplied by the memory manager.
#[derive(Clone, Copy)]
pub struct MemoryOps {
    /// Translate a kernel-visible virtual address to its physical address.
    pub virt_to_phys: fn(VirtAddr) -> Option<PhysAddr>,
    /// Allocate `size` bytes with the given alignment. Physically contiguous.
    pub alloc_aligned: fn(usize, usize) -> Option<VirtAddr>,
    /// Free a region returned by `alloc_aligned`.
    pub free: fn(VirtAddr),
    /// Map a physical MMIO window and return its virtual base.
    pub map_memio: fn(PhysAddr, usize) -> Option<VirtAddr>,
    /// Create an empty user address space.
    pub new_address_space: fn() -> Option<AddressSpace>,
    /// Clone an address space copy-on-write (fork).
    pub clone_address_space: fn(AddressSpace) -> Option<AddressSpace>,
    /// Tear down an address space.
    pub free_address_space: fn(AddressSpace),
}

static MEM_OPS: Spinlock<Option<MemoryOps>> = Spinlock::new(None);

/// Install the memory manager operations. Called once at boot.
pub fn install(ops: MemoryOps) {
    *MEM_OPS.lock() = Some(ops);
}

fn ops() -> MemoryOps {
    MEM_OPS
        .lock()
        .expect("memory manager interface not installed")
}

pub fn virt_to_phys(virt: VirtAddr) -> Option<PhysAddr> {
    (ops().virt_to_phys)(virt)
}

pub fn alloc_aligned(size: usize, align: usize) -> Option<VirtAddr> {
    (ops().alloc_aligned)(size, align)
}

pub fn free(addr: VirtAddr) {
    (ops().free)(addr)
}

pub fn map_memio(phys: PhysAddr, size: usize) -> Option<VirtAddr> {
    (ops().map_memio)(phys, size)
}

pub fn new_address_space() -> Option<AddressSpace> {
    (ops().new_address_space)()
}

pub fn clone_address_space(src: AddressSpace) -> Option<AddressSpace> {
    (ops().clone_address_space)(src)
}

pub fn free_address_space(handle: AddressSpace) {
    (ops().free_address_space)(handle)
}

#[cfg(test)]
pub(crate) mod testprov {
    //! Host-heap provider for the test harness: identity phys mapping,
    //! allocations tracked so `free` can reconstruct the layout.

    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    static ALLOCS: Spinlock<BTreeMap<u64, (usize, usize)>> = Spinlock::new(BTreeMap::new());
    static NEXT_AS: AtomicU32 = AtomicU32::new(1);

    fn host_virt_to_phys(virt: VirtAddr) -> Option<PhysAddr> {
        Some(PhysAddr::new(virt.as_u64()))
    }

    fn host_alloc_aligned(size: usize, align: usize) -> Option<VirtAddr> {
        let layout = std::alloc::Layout::from_size_align(size, align).ok()?;
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return None;
        }
        ALLOCS.lock().insert(ptr as u64, (size, align));
        Some(VirtAddr::new(ptr as u64))
    }

    fn host_free(addr: VirtAddr) {
        if let Some((size, align)) = ALLOCS.lock().remove(&addr.as_u64()) {
            let layout = std::alloc::Layout::from_size_align(size, align).unwrap();
            unsafe { std::alloc::dealloc(addr.as_u64() as *mut u8, layout) };
        }
    }

    fn host_map_memio(phys: PhysAddr, _size: usize) -> Option<VirtAddr> {
        Some(VirtAddr::new(phys.as_u64()))
    }

    fn host_new_as() -> Option<AddressSpace> {
        Some(AddressSpace(NEXT_AS.fetch_add(1, Ordering::Relaxed)))
    }

    fn host_clone_as(_src: AddressSpace) -> Option<AddressSpace> {
        Some(AddressSpace(NEXT_AS.fetch_add(1, Ordering::Relaxed)))
    }

    fn host_free_as(_handle: AddressSpace) {}

    /// Install the host provider (idempotent; tests may race, all install
    /// the same table).
    pub(crate) fn install_host_provider() {
        super::install(MemoryOps {
            virt_to_phys: host_virt_to_phys,
            alloc_aligned: host_alloc_aligned,
            free: host_free,
            map_memio: host_map_memio,
            new_address_space: host_new_as,
            clone_address_space: host_clone_as,
            free_address_space: host_free_as,
        });
    }
}
