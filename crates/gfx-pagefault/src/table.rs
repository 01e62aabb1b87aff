//! Fixed-capacity tracked-range table.
//!
//! Readers (including the fault handler) walk the slots with atomics only and pin a slot
//! through its in-flight counter. Writers are serialized by the owning manager and never
//! reallocate the slot array.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::{PageFaultError, Result};

/// Who currently owns a tracked range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AllocationDomain {
    /// Never touched; pages are protected.
    None = 0,
    /// CPU owns the data; pages are accessible.
    Cpu = 1,
    /// GPU owns the data; pages are protected.
    Gpu = 2,
    /// One thread is moving the range between domains. Everyone else waits it out.
    Migrating = 3,
}

impl AllocationDomain {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => AllocationDomain::Cpu,
            2 => AllocationDomain::Gpu,
            3 => AllocationDomain::Migrating,
            _ => AllocationDomain::None,
        }
    }
}

/// Moves a range's contents between host pages and GPU storage.
///
/// Both directions run while the range is claimed and its pages are still protected, so
/// implementations reach the host pages through an unprotected alias
/// ([`HostAllocation::write_unprotected`](crate::HostAllocation::write_unprotected)).
/// `transfer_to_cpu` runs from the fault handler on the faulting thread. Neither direction
/// can report failure to its caller.
pub trait DomainTransfer: Send + Sync {
    fn transfer_to_cpu(&self, ptr: usize, size: usize);

    fn transfer_to_gpu(&self, ptr: usize, size: usize);
}

struct Slot {
    /// Zero while the slot is free.
    base: AtomicUsize,
    size: AtomicUsize,
    domain: AtomicU8,
    in_flight: AtomicU32,
    transfer: AtomicPtr<Arc<dyn DomainTransfer>>,
}

impl Slot {
    fn new() -> Self {
        Self {
            base: AtomicUsize::new(0),
            size: AtomicUsize::new(0),
            domain: AtomicU8::new(AllocationDomain::None as u8),
            in_flight: AtomicU32::new(0),
            transfer: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Pin the slot if it still tracks `base`.
    fn pin(&self, base: usize) -> Option<SlotGuard<'_>> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        if self.base.load(Ordering::SeqCst) != base {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            return None;
        }
        Some(SlotGuard { slot: self, base })
    }
}

/// Pinned view of a live slot. The slot is not recycled while a guard exists.
pub(crate) struct SlotGuard<'a> {
    slot: &'a Slot,
    base: usize,
}

impl SlotGuard<'_> {
    pub(crate) fn base(&self) -> usize {
        self.base
    }

    pub(crate) fn size(&self) -> usize {
        self.slot.size.load(Ordering::Acquire)
    }

    pub(crate) fn domain(&self) -> AllocationDomain {
        AllocationDomain::from_u8(self.slot.domain.load(Ordering::Acquire))
    }

    /// Take the range for a domain change and return the domain it held.
    ///
    /// Spins while another thread holds it; never returns [`AllocationDomain::Migrating`].
    /// Lock- and allocation-free, so the fault handler may call it.
    pub(crate) fn claim(&self) -> AllocationDomain {
        let migrating = AllocationDomain::Migrating as u8;
        let mut spins = 0u32;
        loop {
            let current = self.slot.domain.load(Ordering::Acquire);
            if current != migrating
                && self
                    .slot
                    .domain
                    .compare_exchange_weak(current, migrating, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                return AllocationDomain::from_u8(current);
            }
            if spins < 64 {
                spins += 1;
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
    }

    /// Publish the outcome of a [`claim`](Self::claim).
    pub(crate) fn release(&self, domain: AllocationDomain) {
        debug_assert_ne!(domain, AllocationDomain::Migrating);
        self.slot.domain.store(domain as u8, Ordering::Release);
    }

    pub(crate) fn transfer(&self) -> &dyn DomainTransfer {
        // SAFETY: the pointer is published before `base` and only freed by `remove` after
        // `base` was cleared and every pin was released.
        let transfer = unsafe { &*self.slot.transfer.load(Ordering::Acquire) };
        transfer.as_ref()
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.slot.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

pub(crate) struct RangeTable {
    slots: Box<[Slot]>,
}

impl RangeTable {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| Slot::new()).collect(),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.base.load(Ordering::Acquire) != 0)
            .count()
    }

    /// Range containing `address`. Lock- and allocation-free.
    pub(crate) fn find(&self, address: usize) -> Option<SlotGuard<'_>> {
        self.slots.iter().find_map(|slot| {
            let base = slot.base.load(Ordering::SeqCst);
            if base == 0 || address < base {
                return None;
            }
            let size = slot.size.load(Ordering::Acquire);
            if address - base >= size {
                return None;
            }
            slot.pin(base)
        })
    }

    /// Range starting exactly at `base`.
    pub(crate) fn get(&self, base: usize) -> Option<SlotGuard<'_>> {
        if base == 0 {
            return None;
        }
        self.slots
            .iter()
            .find(|slot| slot.base.load(Ordering::SeqCst) == base)
            .and_then(|slot| slot.pin(base))
    }

    pub(crate) fn bases(&self) -> Vec<usize> {
        self.slots
            .iter()
            .map(|slot| slot.base.load(Ordering::Acquire))
            .filter(|&base| base != 0)
            .collect()
    }

    /// Writers only.
    pub(crate) fn insert(
        &self,
        base: usize,
        size: usize,
        domain: AllocationDomain,
        transfer: Arc<dyn DomainTransfer>,
    ) -> Result<()> {
        let end = base.checked_add(size).ok_or(PageFaultError::Overlapping { ptr: base, size })?;
        let overlaps = self.slots.iter().any(|slot| {
            let other = slot.base.load(Ordering::Acquire);
            other != 0 && base < other + slot.size.load(Ordering::Acquire) && other < end
        });
        if overlaps {
            return Err(PageFaultError::Overlapping { ptr: base, size });
        }
        let slot = self
            .slots
            .iter()
            .find(|slot| {
                slot.base.load(Ordering::Acquire) == 0
                    && slot.transfer.load(Ordering::Acquire).is_null()
            })
            .ok_or(PageFaultError::TableFull {
                capacity: self.capacity(),
            })?;

        slot.size.store(size, Ordering::Release);
        slot.domain.store(domain as u8, Ordering::Release);
        slot.transfer
            .store(Box::into_raw(Box::new(transfer)), Ordering::Release);
        slot.base.store(base, Ordering::SeqCst);
        Ok(())
    }

    /// Writers only. Blocks until no reader holds the slot.
    pub(crate) fn remove(&self, base: usize) -> Result<()> {
        let slot = self
            .slots
            .iter()
            .find(|slot| base != 0 && slot.base.load(Ordering::SeqCst) == base)
            .ok_or(PageFaultError::NotTracked(base))?;
        slot.base.store(0, Ordering::SeqCst);
        while slot.in_flight.load(Ordering::SeqCst) != 0 {
            std::thread::yield_now();
        }
        let transfer = slot.transfer.swap(ptr::null_mut(), Ordering::AcqRel);
        if !transfer.is_null() {
            // SAFETY: produced by `Box::into_raw` in `insert`; no reader can reach it anymore.
            drop(unsafe { Box::from_raw(transfer) });
        }
        Ok(())
    }
}

impl Drop for RangeTable {
    fn drop(&mut self) {
        for slot in self.slots.iter() {
            let transfer = slot.transfer.swap(ptr::null_mut(), Ordering::AcqRel);
            if !transfer.is_null() {
                // SAFETY: produced by `Box::into_raw` in `insert`; `&mut self` excludes readers.
                drop(unsafe { Box::from_raw(transfer) });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nothing;

    impl DomainTransfer for Nothing {
        fn transfer_to_cpu(&self, _ptr: usize, _size: usize) {}
        fn transfer_to_gpu(&self, _ptr: usize, _size: usize) {}
    }

    #[test]
    fn lookup_covers_the_whole_range_only() {
        let table = RangeTable::new(4);
        table
            .insert(0x10000, 0x2000, AllocationDomain::None, Arc::new(Nothing))
            .unwrap();
        assert!(table.find(0xFFFF).is_none());
        assert_eq!(table.find(0x10000).map(|g| g.base()), Some(0x10000));
        assert_eq!(table.find(0x11FFF).map(|g| g.size()), Some(0x2000));
        assert!(table.find(0x12000).is_none());
    }

    #[test]
    fn rejects_overlap_and_overflow_of_capacity() {
        let table = RangeTable::new(2);
        table
            .insert(0x10000, 0x2000, AllocationDomain::None, Arc::new(Nothing))
            .unwrap();
        assert!(matches!(
            table.insert(0x11000, 0x1000, AllocationDomain::None, Arc::new(Nothing)),
            Err(PageFaultError::Overlapping { .. })
        ));
        table
            .insert(0x20000, 0x1000, AllocationDomain::Cpu, Arc::new(Nothing))
            .unwrap();
        assert!(matches!(
            table.insert(0x30000, 0x1000, AllocationDomain::Cpu, Arc::new(Nothing)),
            Err(PageFaultError::TableFull { capacity: 2 })
        ));

        table.remove(0x10000).unwrap();
        assert_eq!(table.len(), 1);
        table
            .insert(0x30000, 0x1000, AllocationDomain::Cpu, Arc::new(Nothing))
            .unwrap();
        assert!(matches!(
            table.remove(0x40000),
            Err(PageFaultError::NotTracked(0x40000))
        ));
    }

    #[test]
    fn claim_excludes_other_claimants_until_released() {
        let table = RangeTable::new(1);
        table
            .insert(0x10000, 0x1000, AllocationDomain::Gpu, Arc::new(Nothing))
            .unwrap();
        let guard = table.get(0x10000).unwrap();
        assert_eq!(guard.claim(), AllocationDomain::Gpu);
        assert_eq!(guard.domain(), AllocationDomain::Migrating);

        std::thread::scope(|scope| {
            let waiter = scope.spawn(|| table.get(0x10000).unwrap().claim());
            std::thread::sleep(std::time::Duration::from_millis(20));
            assert!(!waiter.is_finished());
            guard.release(AllocationDomain::Cpu);
            assert_eq!(waiter.join().unwrap(), AllocationDomain::Cpu);
        });
        assert_eq!(guard.domain(), AllocationDomain::Migrating);
        guard.release(AllocationDomain::Cpu);
    }

    #[test]
    fn removal_waits_for_pinned_readers() {
        let table = Arc::new(RangeTable::new(1));
        table
            .insert(0x10000, 0x1000, AllocationDomain::Gpu, Arc::new(Nothing))
            .unwrap();

        let guard = table.find(0x10000).unwrap();
        let remover = {
            let table = Arc::clone(&table);
            std::thread::spawn(move || table.remove(0x10000).unwrap())
        };
        while table.get(0x10000).is_some() {
            std::thread::yield_now();
        }
        // Unpublished but still pinned: the transfer handle is alive.
        guard.transfer().transfer_to_cpu(0x10000, 0x1000);
        assert_eq!(guard.domain(), AllocationDomain::Gpu);
        drop(guard);
        remover.join().unwrap();
        assert!(table.find(0x10000).is_none());
    }
}
