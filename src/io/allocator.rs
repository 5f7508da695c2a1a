//! Slot pool: the fixed set of page-aligned buffers a copy moves data
//! through.
//!
//! Slot `i` owns one buffer of `block_size` bytes and is bound to offset
//! `i * block_size` inside a round. Buffers are allocated once and reused
//! in place for every round of the copy.

use aligned_box::AlignedBox;
use std::{
    alloc::{alloc_zeroed, Layout},
    rc::Rc,
};

use crate::{
    engine::stat::CopyStat,
    error::{CopyError, Result},
};

/// One buffer of the pool.
pub struct Slot {
    buffer: AlignedBox<[u8]>,
    index: usize,
}

impl Slot {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buffer
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buffer
    }
}

/// Owner of every slot of a copy.
pub struct SlotPool {
    slots: Vec<Slot>,
    block_size: usize,
    stat: Rc<CopyStat>,
}

impl SlotPool {
    /// Allocate `capacity` zeroed buffers of `block_size` bytes each.
    ///
    /// Either every slot is allocated or the call fails with
    /// [`CopyError::Resource`] and the slots obtained so far are released.
    #[tracing::instrument(level = "trace", skip(stat))]
    pub fn allocate(capacity: usize, block_size: usize, stat: Rc<CopyStat>) -> Result<Self> {
        let alignment = page_size().map_err(|reason| CopyError::Resource {
            capacity,
            block_size,
            reason,
        })?;
        Self::allocate_with(capacity, block_size, stat, |_| {
            new_aligned_buffer(alignment, block_size)
        })
    }

    fn allocate_with<A>(
        capacity: usize,
        block_size: usize,
        stat: Rc<CopyStat>,
        mut alloc: A,
    ) -> Result<Self>
    where
        A: FnMut(usize) -> std::result::Result<AlignedBox<[u8]>, String>,
    {
        if capacity == 0 || block_size == 0 {
            return Err(CopyError::Resource {
                capacity,
                block_size,
                reason: "pool dimensions must be non-zero".into(),
            });
        }
        // Slots pushed here are released by `Drop` if a later one fails.
        let mut pool = SlotPool {
            slots: Vec::with_capacity(capacity),
            block_size,
            stat,
        };
        for index in 0..capacity {
            let buffer = alloc(index).map_err(|reason| CopyError::Resource {
                capacity,
                block_size,
                reason,
            })?;
            pool.slots.push(Slot { buffer, index });
            pool.stat.add_slot_allocated();
        }
        tracing::trace!(
            slots = capacity,
            block_size = block_size,
            "Slot pool allocated"
        );
        Ok(pool)
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Offset of slot `index` relative to the start of a round.
    pub fn offset(&self, index: usize) -> u64 {
        index as u64 * self.block_size as u64
    }

    pub fn buffer(&self, index: usize) -> &[u8] {
        self.slots[index].as_slice()
    }

    /// Stage the contents of slot `index` for a write batch.
    pub fn buffer_mut(&mut self, index: usize) -> &mut [u8] {
        self.slots[index].as_mut_slice()
    }

    pub fn slots_mut(&mut self) -> impl Iterator<Item = &mut Slot> {
        self.slots.iter_mut()
    }

    pub(crate) fn stat(&self) -> &Rc<CopyStat> {
        &self.stat
    }
}

impl Drop for SlotPool {
    fn drop(&mut self) {
        for slot in self.slots.drain(..) {
            drop(slot);
            self.stat.add_slot_released();
        }
    }
}

fn page_size() -> std::result::Result<usize, String> {
    let n = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if n > 0 {
        Ok(n as usize)
    } else {
        Err(format!(
            "sysconf(_SC_PAGESIZE) failed: {}",
            std::io::Error::last_os_error()
        ))
    }
}

fn new_aligned_buffer(
    alignment: usize,
    len: usize,
) -> std::result::Result<AlignedBox<[u8]>, String> {
    let layout = Layout::from_size_align(len, alignment)
        .map_err(|err| format!("invalid layout for {len} bytes aligned to {alignment}: {err}"))?;

    unsafe {
        let ptr = alloc_zeroed(layout);
        if ptr.is_null() {
            return Err(format!("out of memory allocating {len} bytes"));
        }

        let slice_ptr = std::ptr::slice_from_raw_parts_mut(ptr, len);
        Ok(AlignedBox::<[u8]>::from_raw_parts(slice_ptr, layout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_midway_releases_what_was_allocated() {
        let stat = Rc::new(CopyStat::new());
        let result = SlotPool::allocate_with(8, 64, stat.clone(), |index| {
            if index == 5 {
                Err("injected".to_string())
            } else {
                new_aligned_buffer(4096, 64)
            }
        });

        match result {
            Err(CopyError::Resource { capacity, reason, .. }) => {
                assert_eq!(capacity, 8);
                assert_eq!(reason, "injected");
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("allocation should have failed"),
        }
        assert_eq!(stat.slots_allocated(), 5);
        assert_eq!(stat.slots_released(), 5);
        assert!(stat.is_balanced());
    }

    #[test]
    fn impossible_layout_is_a_resource_error() {
        let stat = Rc::new(CopyStat::new());
        let result = SlotPool::allocate(2, isize::MAX as usize, stat.clone());
        assert!(matches!(result, Err(CopyError::Resource { .. })));
        assert_eq!(stat.slots_allocated(), 0);
    }

    #[test]
    fn buffers_are_page_aligned_and_zeroed() {
        let stat = Rc::new(CopyStat::new());
        let pool = SlotPool::allocate(3, 100, stat).unwrap();
        let page = page_size().unwrap();
        for index in 0..pool.capacity() {
            let buf = pool.buffer(index);
            assert_eq!(buf.len(), 100);
            assert_eq!(buf.as_ptr() as usize % page, 0);
            assert!(buf.iter().all(|&b| b == 0));
        }
    }
}
