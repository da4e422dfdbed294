use std::sync::Mutex;

use crate::device::{MappedBuffer, UvcDevice};
use crate::error::{Result, UvcError};

/// Who currently holds a buffer slot: us (writable) or the kernel
/// (queued for transmission).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    Producer,
    Kernel,
}

/// Pure ownership bookkeeping for a fixed set of slots. Separated from
/// the mmap/ioctl plumbing so the invariants are testable on their own.
#[derive(Debug)]
pub struct PoolState {
    owners: Vec<Owner>,
}

impl PoolState {
    pub fn new(count: usize) -> PoolState {
        PoolState { owners: vec![Owner::Producer; count] }
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    pub fn owner(&self, index: usize) -> Option<Owner> {
        self.owners.get(index).copied()
    }

    pub fn producer_count(&self) -> usize {
        self.owners.iter().filter(|o| **o == Owner::Producer).count()
    }

    pub fn kernel_count(&self) -> usize {
        self.owners.len() - self.producer_count()
    }

    pub fn submit(&mut self, index: usize) -> Result<()> {
        match self.owners.get(index) {
            Some(Owner::Producer) => {
                self.owners[index] = Owner::Kernel;
                Ok(())
            }
            Some(Owner::Kernel) => Err(UvcError::ProtocolViolation(format!(
                "buffer {} submitted while already queued", index
            ))),
            None => Err(UvcError::ProtocolViolation(format!(
                "buffer index {} out of range ({} slots)", index, self.owners.len()
            ))),
        }
    }

    pub fn reclaim(&mut self, index: usize) -> Result<()> {
        match self.owners.get(index) {
            Some(Owner::Kernel) => {
                self.owners[index] = Owner::Producer;
                Ok(())
            }
            Some(Owner::Producer) => Err(UvcError::ProtocolViolation(format!(
                "buffer {} reclaimed while not queued", index
            ))),
            None => Err(UvcError::ProtocolViolation(format!(
                "buffer index {} out of range ({} slots)", index, self.owners.len()
            ))),
        }
    }

    /// STREAMOFF implicitly dequeues everything; every slot comes home.
    pub fn release_all(&mut self) {
        for owner in &mut self.owners {
            *owner = Owner::Producer;
        }
    }
}

struct Slot {
    mapping: MappedBuffer,
}

/// The negotiated frame buffers: kernel-allocated, memory-mapped, with
/// ownership tracked per slot.
pub struct FramePool {
    inner: Mutex<PoolInner>,
}

struct PoolInner {
    state: PoolState,
    slots: Vec<Slot>,
}

impl FramePool {
    /// Allocates `count` buffers from the driver and maps each one.
    /// The driver may grant fewer than asked; the pool size is whatever
    /// it granted.
    pub fn create(device: &UvcDevice, count: u32) -> Result<FramePool> {
        let granted = device.request_buffers(count)?;
        if granted == 0 {
            return Err(UvcError::ProtocolViolation("driver granted zero buffers".to_string()));
        }
        if granted != count {
            warn!("asked for {} buffers, granted {}", count, granted);
        }
        let mut slots = Vec::with_capacity(granted as usize);
        for index in 0..granted {
            let (length, offset) = device.query_buffer(index)?;
            let mapping = MappedBuffer::map(device, length, offset)?;
            debug!("buffer {}: {} bytes at offset {:#x}", index, length, offset);
            slots.push(Slot { mapping });
        }
        Ok(FramePool {
            inner: Mutex::new(PoolInner { state: PoolState::new(granted as usize), slots }),
        })
    }

    pub fn len(&self) -> usize {
        self.lock().state.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().state.is_empty()
    }

    pub fn producer_count(&self) -> usize {
        self.lock().state.producer_count()
    }

    /// Runs `fill` over the slot's mapped memory. The slot must be
    /// producer-owned.
    pub fn fill(&self, index: usize, fill: impl FnOnce(&mut [u8])) -> Result<()> {
        let mut inner = self.lock();
        match inner.state.owner(index) {
            Some(Owner::Producer) => {}
            Some(Owner::Kernel) => {
                return Err(UvcError::ProtocolViolation(format!(
                    "buffer {} written while queued", index
                )))
            }
            None => {
                return Err(UvcError::ProtocolViolation(format!(
                    "buffer index {} out of range", index
                )))
            }
        }
        fill(inner.slots[index].mapping.as_mut_slice());
        Ok(())
    }

    /// Hands a filled buffer to the kernel for transmission.
    pub fn submit_frame(&self, device: &UvcDevice, index: usize, bytes_used: u32) -> Result<()> {
        let mut inner = self.lock();
        inner.state.submit(index)?;
        if let Err(e) = device.queue_buffer(index as u32, bytes_used) {
            // the kernel never saw it; the slot stays ours
            inner.state.reclaim(index)?;
            return Err(e);
        }
        Ok(())
    }

    /// Takes back a buffer the kernel finished with. `None` when the
    /// driver has nothing ready.
    pub fn reclaim_frame(&self, device: &UvcDevice) -> Result<Option<usize>> {
        match device.dequeue_buffer()? {
            Some(index) => {
                let mut inner = self.lock();
                inner.state.reclaim(index as usize)?;
                Ok(Some(index as usize))
            }
            None => Ok(None),
        }
    }

    /// STREAMOFF path: every slot back to producer ownership.
    pub fn release_all(&self) {
        self.lock().state.release_all();
    }

    /// A pool with bookkeeping only, no mapped slots.
    #[cfg(test)]
    pub(crate) fn with_state(state: PoolState) -> FramePool {
        FramePool { inner: Mutex::new(PoolInner { state, slots: Vec::new() }) }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ownership_counts_are_conserved() {
        let mut state = PoolState::new(4);
        assert_eq!(state.producer_count(), 4);
        assert_eq!(state.kernel_count(), 0);

        state.submit(0).unwrap();
        state.submit(2).unwrap();
        assert_eq!(state.producer_count(), 2);
        assert_eq!(state.kernel_count(), 2);
        assert_eq!(state.producer_count() + state.kernel_count(), state.len());

        state.reclaim(0).unwrap();
        assert_eq!(state.producer_count(), 3);
        assert_eq!(state.owner(0), Some(Owner::Producer));
        assert_eq!(state.owner(2), Some(Owner::Kernel));
    }

    #[test]
    fn double_submit_is_rejected() {
        let mut state = PoolState::new(2);
        state.submit(1).unwrap();
        let err = state.submit(1).unwrap_err();
        assert!(matches!(err, UvcError::ProtocolViolation(_)));
        // the failed call must not corrupt the slot
        assert_eq!(state.owner(1), Some(Owner::Kernel));
        state.reclaim(1).unwrap();
    }

    #[test]
    fn reclaim_of_unqueued_buffer_is_rejected() {
        let mut state = PoolState::new(2);
        let err = state.reclaim(0).unwrap_err();
        assert!(matches!(err, UvcError::ProtocolViolation(_)));
        assert_eq!(state.owner(0), Some(Owner::Producer));
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        let mut state = PoolState::new(2);
        assert!(state.submit(2).is_err());
        assert!(state.reclaim(7).is_err());
    }

    #[test]
    fn release_all_returns_every_slot() {
        let mut state = PoolState::new(3);
        state.submit(0).unwrap();
        state.submit(1).unwrap();
        state.submit(2).unwrap();
        assert_eq!(state.kernel_count(), 3);

        state.release_all();
        assert_eq!(state.producer_count(), 3);
        // and they are submittable again
        state.submit(1).unwrap();
    }
}
