//! Buffers used to send and receive frames, plus the pools that back them.
//!
//! A [`ReceiveBuffer`] is temporarily given to higher layers when a frame is
//! indicated; when dropped, its underlying memory is automatically returned
//! to the [`ReceiveBufferPool`] it came from, which is how the engine gets
//! its buffers back for re-arming. A [`TransmitFrame`] describes an outbound
//! frame as a list of physically contiguous fragments. [`CoalesceBuffer`]s
//! are preallocated contiguous buffers used to linearize a frame with more
//! fragments than the device's scatter list can hold.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::{boxed::Box, collections::VecDeque, sync::Arc, vec::Vec};
use core::{
    fmt, mem,
    ops::{Deref, DerefMut},
};
use spin::Mutex;

/// A physical (bus) address as seen by the device's DMA engine.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysicalAddress(u64);

impl PhysicalAddress {
    pub const fn new(value: u64) -> PhysicalAddress {
        PhysicalAddress(value)
    }

    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "p{:#X}", self.0)
    }
}

struct PoolSlot {
    data: Box<[u8]>,
    phys_addr: PhysicalAddress,
}

/// The pool of preallocated receive buffers for one adapter.
///
/// Shared via `Arc` between the engine and every in-flight [`ReceiveBuffer`];
/// buffers push themselves back here when dropped. There is one pool per
/// adapter rather than a process-wide static.
pub struct ReceiveBufferPool {
    slots: Mutex<VecDeque<PoolSlot>>,
}

impl ReceiveBufferPool {
    pub fn new() -> Arc<ReceiveBufferPool> {
        Arc::new(ReceiveBufferPool {
            slots: Mutex::new(VecDeque::new()),
        })
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pops one buffer out of the pool. Its length starts at zero until the
    /// device reports a received frame into it.
    pub fn pop(self: &Arc<Self>) -> Option<ReceiveBuffer> {
        let slot = self.slots.lock().pop_front()?;
        Some(ReceiveBuffer {
            data: slot.data,
            phys_addr: slot.phys_addr,
            length: 0,
            pool: Arc::clone(self),
        })
    }
}

/// A buffer that holds one received frame and is contiguous in physical
/// memory. Auto-dereferences into the valid portion of its bytes.
///
/// When dropped, the underlying memory is returned to the pool it was created
/// from; dropping a frame indicated with a low-resources status is therefore
/// exactly how the upper layer hands the buffer back to the engine.
pub struct ReceiveBuffer {
    data: Box<[u8]>,
    phys_addr: PhysicalAddress,
    length: u16,
    pool: Arc<ReceiveBufferPool>,
}

impl ReceiveBuffer {
    /// Wraps freshly allocated backing memory into a buffer owned by `pool`.
    pub fn new(
        data: Box<[u8]>,
        phys_addr: PhysicalAddress,
        pool: &Arc<ReceiveBufferPool>,
    ) -> Result<ReceiveBuffer, &'static str> {
        if data.is_empty() || data.len() > u16::MAX as usize {
            return Err("ReceiveBuffer::new(): invalid backing buffer size");
        }
        Ok(ReceiveBuffer {
            data,
            phys_addr,
            length: 0,
            pool: Arc::clone(pool),
        })
    }

    pub fn phys_addr(&self) -> PhysicalAddress {
        self.phys_addr
    }

    /// Size of the backing memory in bytes.
    pub fn capacity(&self) -> u16 {
        self.data.len() as u16
    }

    /// Number of valid bytes, i.e. the received frame length.
    pub fn length(&self) -> u16 {
        self.length
    }

    /// Sets the valid data length, typically to the byte count the device
    /// reported. Fails if it exceeds the buffer capacity.
    pub fn set_length(&mut self, length: u16) -> Result<(), &'static str> {
        if length > self.capacity() {
            Err("ReceiveBuffer::set_length(): length exceeds buffer capacity")
        } else {
            self.length = length;
            Ok(())
        }
    }
}

impl Deref for ReceiveBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data[..self.length as usize]
    }
}

impl DerefMut for ReceiveBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data[..self.length as usize]
    }
}

impl Drop for ReceiveBuffer {
    fn drop(&mut self) {
        // Take ownership of the backing memory by swapping in an empty slice,
        // then push it back to the pool as an inert slot; storing plain slots
        // (not ReceiveBuffers) keeps the pool free of Arc cycles.
        let data = mem::replace(&mut self.data, Vec::new().into_boxed_slice());
        if data.is_empty() {
            return;
        }
        self.pool.slots.lock().push_back(PoolSlot {
            data,
            phys_addr: self.phys_addr,
        });
    }
}

/// A network frame received by the NIC, backed by one receive buffer.
pub struct ReceivedFrame(pub ReceiveBuffer);

/// One physically contiguous piece of an outbound frame.
pub struct Fragment {
    data: Box<[u8]>,
    phys_addr: PhysicalAddress,
}

impl Fragment {
    pub fn new(data: Box<[u8]>, phys_addr: PhysicalAddress) -> Fragment {
        Fragment { data, phys_addr }
    }

    pub fn phys_addr(&self) -> PhysicalAddress {
        self.phys_addr
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Deref for Fragment {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

/// An outbound frame, described as an ordered list of physically contiguous
/// fragments. A frame is immutable once submitted; it is handed back to its
/// owner through the send-complete callback.
pub struct TransmitFrame {
    fragments: Vec<Fragment>,
    length: usize,
}

impl TransmitFrame {
    pub fn new(fragments: Vec<Fragment>) -> TransmitFrame {
        let length = fragments.iter().map(Fragment::len).sum();
        TransmitFrame { fragments, length }
    }

    /// Convenience constructor for a single-fragment frame.
    pub fn from_slice(bytes: &[u8], phys_addr: PhysicalAddress) -> TransmitFrame {
        TransmitFrame::new(alloc::vec![Fragment::new(
            bytes.to_vec().into_boxed_slice(),
            phys_addr,
        )])
    }

    /// Total frame length in bytes, across all fragments.
    pub fn length(&self) -> usize {
        self.length
    }

    pub fn fragment_count(&self) -> usize {
        self.fragments.len()
    }

    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    /// Linearizes the whole frame into `dest`, which must be at least
    /// [`length`](Self::length) bytes. Returns the number of bytes written.
    pub fn copy_into(&self, dest: &mut [u8]) -> usize {
        assert!(
            dest.len() >= self.length,
            "destination buffer too small for frame: {} < {}",
            dest.len(),
            self.length
        );
        let mut offset = 0;
        for fragment in &self.fragments {
            dest[offset..offset + fragment.len()].copy_from_slice(fragment);
            offset += fragment.len();
        }
        offset
    }
}

/// A preallocated physically contiguous buffer used to linearize an outbound
/// frame with more fragments than the device's scatter list can hold.
pub struct CoalesceBuffer {
    data: Box<[u8]>,
    phys_addr: PhysicalAddress,
}

impl CoalesceBuffer {
    pub fn new(data: Box<[u8]>, phys_addr: PhysicalAddress) -> CoalesceBuffer {
        CoalesceBuffer { data, phys_addr }
    }

    pub fn phys_addr(&self) -> PhysicalAddress {
        self.phys_addr
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }
}

impl Deref for CoalesceBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for CoalesceBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// A fixed set of coalesce buffers. Mutated only while the adapter lock is
/// held, so it needs no interior locking of its own.
pub struct CoalescePool {
    buffers: Vec<CoalesceBuffer>,
    capacity: usize,
}

impl CoalescePool {
    pub fn new(buffers: Vec<CoalesceBuffer>) -> CoalescePool {
        let capacity = buffers.len();
        CoalescePool { buffers, capacity }
    }

    /// Total number of buffers owned by the pool.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of buffers currently available for acquisition.
    pub fn available(&self) -> usize {
        self.buffers.len()
    }

    pub fn acquire(&mut self) -> Option<CoalesceBuffer> {
        self.buffers.pop()
    }

    /// Returns a buffer to the pool. A buffer is owned by at most one
    /// descriptor at a time, so exceeding the pool capacity means a buffer
    /// was released twice; that is a fatal bookkeeping bug.
    pub fn release(&mut self, buffer: CoalesceBuffer) {
        assert!(
            self.buffers.len() < self.capacity,
            "coalesce buffer released twice"
        );
        self.buffers.push(buffer);
    }
}
