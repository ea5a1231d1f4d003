//! The receive engine: draining completed descriptors, indicating frames
//! upward, and re-arming the ring.
//!
//! The ring is a FIFO of armed descriptors; the device completes them from
//! the head. Draining stops at the first descriptor the device still owns.
//! A good frame's buffer travels upward inside the indicated
//! [`ReceivedFrame`] and its descriptor slot goes back to the free list; the
//! slot is re-armed later with whatever buffer next comes out of the pool.
//! Error and oversize frames never leave the engine: their descriptor is
//! re-armed on the spot with the same buffer.

use alloc::vec::Vec;
use core::hint;
use log::{debug, error, warn};

use nic_buffers::{ReceiveBuffer, ReceivedFrame};
use nic_device::{
    DmaAllocator, InterruptControl, NicDevice, ReceiveUnitState, RxFrameStatus, ScatterMapper,
};
use nic_ring::{DescriptorArena, OwnerTag, SlotId, SlotList};

use crate::{Adapter, AdapterInner, FrameSink, Guard, IndicationStatus};

pub(crate) struct RxState {
    pub(crate) arena: DescriptorArena<RxDesc>,
    /// Armed descriptors, head first in device completion order.
    pub(crate) ring: SlotList,
    /// Buffers currently held by the upper layer. Always equals the arena
    /// capacity minus the ring length.
    pub(crate) used: u16,
    /// Whether an asynchronous buffer refill is outstanding.
    pub(crate) refill_pending: bool,
}

pub(crate) struct RxDesc {
    /// The armed buffer. `None` only while the slot sits on the free list.
    pub(crate) buffer: Option<ReceiveBuffer>,
}

/// Drains completed receive descriptors until the device holds the ring
/// head again, indicating frames upward in bounded batches.
///
/// The adapter lock is released for the duration of each `frames_received`
/// call and re-taken afterwards, so completions that arrive during the
/// indication are picked up by the next pass of the outer loop.
pub(crate) fn drain_receive<'a, D, I, P, S>(
    adapter: &'a Adapter<D, I, P, S>,
    mut guard: Guard<'a, D, P>,
) -> Guard<'a, D, P>
where
    D: NicDevice,
    I: InterruptControl,
    P: ScatterMapper + DmaAllocator,
    S: FrameSink,
{
    loop {
        let batch = collect_batch(&mut guard);
        if batch.is_empty() {
            replenish(&mut guard);
            return guard;
        }
        drop(guard);
        adapter.sink.frames_received(batch);
        guard = adapter.inner.lock();
        replenish(&mut guard);
    }
}

/// Harvests up to one batch of completed descriptors.
fn collect_batch<D, P>(inner: &mut AdapterInner<D, P>) -> Vec<(ReceivedFrame, IndicationStatus)>
where
    D: NicDevice,
    P: DmaAllocator,
{
    let capacity = inner.rx.arena.capacity();
    let mut batch = Vec::new();
    while (batch.len() as u16) < inner.config.rx_batch_limit {
        if inner.rx.used as usize == capacity {
            // Every buffer is upstream; nothing is armed, so there is
            // nothing to poll. Refill is already in flight.
            break;
        }
        let head = inner
            .rx
            .ring
            .peek_head()
            .expect("receive ring empty with descriptors unaccounted for");
        let completion = match inner.device.rx_poll(head) {
            Some(completion) => completion,
            None => break,
        };
        let rx = &mut inner.rx;
        let slot = rx.ring.pop_head(&mut rx.arena);
        rx.arena.set_owner(slot, OwnerTag::CompletedByDevice);

        if completion.length > inner.config.max_frame_size {
            error!(
                "dropping oversize received frame: {} bytes in {:?}",
                completion.length, slot
            );
            inner.stats.rx_oversize += 1;
            recycle(inner, slot);
            continue;
        }
        if !completion.status.is_ok() {
            debug!("receive error {:?} in {:?}", completion.status, slot);
            match completion.status {
                RxFrameStatus::CrcError => inner.stats.rx_errors_crc += 1,
                RxFrameStatus::AlignmentError => inner.stats.rx_errors_alignment += 1,
                RxFrameStatus::Overrun => inner.stats.rx_errors_overrun += 1,
                RxFrameStatus::Ok => {}
            }
            recycle(inner, slot);
            continue;
        }

        let mut buffer = inner
            .rx
            .arena
            .get_mut(slot)
            .buffer
            .take()
            .expect("armed receive descriptor had no buffer");
        buffer
            .set_length(completion.length)
            .expect("received frame longer than its buffer");
        inner.rx.arena.release(slot);
        inner.rx.used += 1;

        let status = if inner.rx.used as usize + inner.config.rx_reserve_watermark as usize
            <= capacity
        {
            IndicationStatus::Success
        } else {
            inner.stats.rx_frames_low_resources += 1;
            if !inner.rx.refill_pending {
                inner.rx.refill_pending = true;
                inner.stats.rx_refills_requested += 1;
                let count = inner.config.rx_refill_count as usize;
                let size = inner.config.rx_buffer_size as usize;
                inner.platform.request_receive_buffers(count, size);
            }
            IndicationStatus::LowResources
        };
        inner.stats.rx_frames_indicated += 1;
        batch.push((ReceivedFrame(buffer), status));
    }
    batch
}

/// Re-arms an error/oversize descriptor with the buffer it already holds.
fn recycle<D: NicDevice, P>(inner: &mut AdapterInner<D, P>, slot: SlotId) {
    let (phys, capacity) = {
        let buffer = inner
            .rx
            .arena
            .get(slot)
            .buffer
            .as_ref()
            .expect("armed receive descriptor had no buffer");
        (buffer.phys_addr(), buffer.capacity())
    };
    inner.device.arm_receive(slot, phys, capacity);
    inner.rx.arena.set_owner(slot, OwnerTag::ArmedForDevice);
    let rx = &mut inner.rx;
    rx.ring.push_tail(&mut rx.arena, slot);
}

/// Arms free descriptors with buffers from the pool until one of the two
/// runs out.
pub(crate) fn replenish<D: NicDevice, P>(inner: &mut AdapterInner<D, P>) {
    while inner.rx.used > 0 {
        let buffer = match inner.pool.pop() {
            Some(buffer) => buffer,
            None => break,
        };
        let slot = inner
            .rx
            .arena
            .try_acquire_free()
            .expect("receive buffers outstanding but no free descriptors");
        inner.device.arm_receive(slot, buffer.phys_addr(), buffer.capacity());
        inner.rx.arena.get_mut(slot).buffer = Some(buffer);
        inner.rx.arena.set_owner(slot, OwnerTag::ArmedForDevice);
        let rx = &mut inner.rx;
        rx.ring.push_tail(&mut rx.arena, slot);
        rx.used -= 1;
    }
}

/// Restarts the receive unit if it stopped and armed descriptors exist.
///
/// The start command is acknowledged asynchronously, so this polls the unit
/// state a bounded number of times. A device that never acknowledges is
/// logged and counted, not fatal; the next interrupt or refill retries.
pub(crate) fn restart_receive_if_stalled<D: NicDevice, P>(inner: &mut AdapterInner<D, P>) {
    let head = match inner.rx.ring.peek_head() {
        Some(head) => head,
        None => return,
    };
    if inner.device.receive_unit_state() == ReceiveUnitState::Ready {
        return;
    }
    if let Err(e) = inner.device.start_receive(head) {
        warn!("receive unit restart rejected: {}", e);
        inner.stats.hw_not_responding += 1;
        return;
    }
    inner.stats.rx_restarts += 1;
    for _ in 0..inner.config.restart_poll_bound {
        if inner.device.receive_unit_state() == ReceiveUnitState::Ready {
            return;
        }
        hint::spin_loop();
    }
    warn!("receive unit did not become ready after restart");
    inner.stats.hw_not_responding += 1;
}
