//! The completion engine: harvesting finished transmit descriptors,
//! releasing their resources, and draining the deferred send queue.
//!
//! The device completes the Active Chain strictly head-first, so harvesting
//! stops at the first descriptor it still owns; a completion bit observed on
//! a later descriptor is not acted on until everything ahead of it is done.
//! Resource release also runs in chain order, which keeps mapping-register
//! slots freed in the order they were allocated.

use core::mem;

use nic_device::{DmaAllocator, InterruptControl, NicDevice, ScatterMapper};
use nic_ring::OwnerTag;

use crate::tx::{self, SubmitFailure, TxPayload};
use crate::{Adapter, AdapterInner, FrameSink, Guard, SendStatus};

pub(crate) fn drain_completions<'a, D, I, P, S>(
    adapter: &'a Adapter<D, I, P, S>,
    mut guard: Guard<'a, D, P>,
) -> Guard<'a, D, P>
where
    D: NicDevice,
    I: InterruptControl,
    P: ScatterMapper + DmaAllocator,
    S: FrameSink,
{
    harvest(&mut guard);
    guard = clean_completed(adapter, guard);
    drain_deferred(adapter, guard)
}

/// Moves completed descriptors from the Active Chain onto the completed
/// list, recording each wire outcome.
fn harvest<D: NicDevice, P>(inner: &mut AdapterInner<D, P>) {
    if inner.tx.start_pending {
        // The chain head was never started; re-issue the start from the
        // current head so everything linked behind it runs too.
        match inner.tx.active.peek_head() {
            Some(head) => {
                if inner.device.start_transmit(head).is_ok() {
                    inner.tx.start_pending = false;
                }
            }
            None => inner.tx.start_pending = false,
        }
    }
    if inner.tx.resume_pending && !inner.tx.active.is_empty() {
        if inner.device.resume_transmit().is_ok() {
            inner.tx.resume_pending = false;
        }
    }
    loop {
        let head = match inner.tx.active.peek_head() {
            Some(head) => head,
            None => return,
        };
        let completion = match inner.device.tx_poll(head) {
            Some(completion) => completion,
            None => return,
        };
        let tx = &mut inner.tx;
        let slot = tx.active.pop_head(&mut tx.arena);
        tx.arena.set_owner(slot, OwnerTag::CompletedByDevice);
        tx.arena.get_mut(slot).result_ok = completion.ok;
        tx.completed.push_tail(&mut tx.arena, slot);
    }
}

/// Releases each completed descriptor's resources and fires its callback.
///
/// The lock is dropped around every `send_complete` call, one frame at a
/// time, so the callback may submit new frames.
fn clean_completed<'a, D, I, P, S>(
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
        let (payload, ok) = {
            let inner = &mut *guard;
            let tx = &mut inner.tx;
            if tx.completed.is_empty() {
                return guard;
            }
            let slot = tx.completed.pop_head(&mut tx.arena);
            let ok = tx.arena.get(slot).result_ok;
            let payload = mem::replace(&mut tx.arena.get_mut(slot).payload, TxPayload::None);
            tx.arena.release(slot);
            (payload, ok)
        };
        let status = if ok {
            SendStatus::Success
        } else {
            SendStatus::Failure
        };
        match payload {
            TxPayload::None => panic!("completed transmit descriptor had no payload"),
            TxPayload::Inline(frame) => {
                note_frame_result(&mut guard, ok);
                drop(guard);
                adapter.sink.send_complete(frame, status);
                guard = adapter.inner.lock();
            }
            TxPayload::Scatter { frame, entries } => {
                for entry in &entries {
                    guard.platform.unmap(entry.mapping);
                }
                note_frame_result(&mut guard, ok);
                drop(guard);
                adapter.sink.send_complete(frame, status);
                guard = adapter.inner.lock();
            }
            TxPayload::Coalesced { frame, buffer } => {
                guard.tx.coalesce.release(buffer);
                note_frame_result(&mut guard, ok);
                drop(guard);
                adapter.sink.send_complete(frame, status);
                guard = adapter.inner.lock();
            }
            // Control descriptors release their slot but are not reported
            // through the send-complete callback.
            TxPayload::Control(_) => {
                guard.stats.controls_completed += 1;
            }
        }
    }
}

fn note_frame_result<D, P>(inner: &mut AdapterInner<D, P>, ok: bool) {
    if ok {
        inner.stats.tx_frames_sent += 1;
    } else {
        inner.stats.tx_frames_failed += 1;
    }
}

/// Re-submits deferred requests in order, stopping (and putting the request
/// back at the front) as soon as resources run out again.
fn drain_deferred<'a, D, I, P, S>(
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
        let request = match guard.tx.deferred.pop_front() {
            Some(request) => request,
            None => return guard,
        };
        match tx::submit_request(&mut guard, request) {
            Ok(()) => {}
            Err(SubmitFailure::Resources(request)) => {
                guard.tx.deferred.push_front(request);
                return guard;
            }
            // Length was validated when the frame was first accepted; if it
            // surfaces here anyway, report the frame as failed rather than
            // dropping it silently.
            Err(SubmitFailure::InvalidLength(frame)) => {
                drop(guard);
                adapter.sink.send_complete(frame, SendStatus::Failure);
                guard = adapter.inner.lock();
            }
        }
    }
}
