//! The transmit engine: classifying outbound frames and posting them onto
//! the hardware transmit chain.
//!
//! Each accepted request takes exactly one descriptor from the transmit free
//! list and lands on the tail of the Active Chain. A descriptor carries its
//! frame in one of three mutually exclusive modes: copied inline (short
//! frames), as a scatter list of mapped fragments, or linearized into a
//! coalesce buffer when the fragment count exceeds the device's scatter
//! limit. Failure paths are transactional: on `Resources` or
//! `InvalidLength` nothing has been consumed and the request (or frame) is
//! handed back intact.

use alloc::{collections::VecDeque, vec::Vec};
use log::{debug, warn};

use nic_buffers::{CoalesceBuffer, CoalescePool, TransmitFrame};
use nic_device::{ControlCommand, NicDevice, ScatterEntry, ScatterMapper, TxDescriptorData};
use nic_ring::{DescriptorArena, OwnerTag, SlotId, SlotList};

use crate::AdapterInner;

/// Size of a transmit descriptor's inline data area.
pub(crate) const INLINE_DATA_SIZE: usize = 64;

pub(crate) struct TxState {
    pub(crate) arena: DescriptorArena<TxDesc>,
    /// Descriptors posted to the device, head first in completion order.
    pub(crate) active: SlotList,
    /// Harvested completions awaiting resource release and callbacks.
    pub(crate) completed: SlotList,
    /// Requests that failed on resources, waiting for completions to free
    /// descriptors. Drained front-first to preserve submission order.
    pub(crate) deferred: VecDeque<TxRequest>,
    pub(crate) coalesce: CoalescePool,
    /// A start command was rejected; retry on the next completion pass.
    pub(crate) start_pending: bool,
    /// A resume command was rejected; retry on the next completion pass.
    pub(crate) resume_pending: bool,
}

pub(crate) struct TxDesc {
    pub(crate) payload: TxPayload,
    /// Wire outcome recorded at harvest time, consumed at cleanup time.
    pub(crate) result_ok: bool,
}

/// What a posted descriptor is carrying, so cleanup knows which resources
/// to release.
pub(crate) enum TxPayload {
    None,
    Inline(TransmitFrame),
    Scatter {
        frame: TransmitFrame,
        entries: Vec<ScatterEntry>,
    },
    Coalesced {
        frame: TransmitFrame,
        buffer: CoalesceBuffer,
    },
    Control(ControlCommand),
}

pub(crate) enum TxRequest {
    Frame(TransmitFrame),
    Control(ControlCommand),
}

pub(crate) enum SubmitFailure {
    /// Out of descriptors, mappings, or coalesce buffers; the untouched
    /// request is handed back for deferral.
    Resources(TxRequest),
    /// Zero-length or oversize frame, handed back to the caller.
    InvalidLength(TransmitFrame),
}

pub(crate) fn submit_request<D, P>(
    inner: &mut AdapterInner<D, P>,
    request: TxRequest,
) -> Result<(), SubmitFailure>
where
    D: NicDevice,
    P: ScatterMapper,
{
    match request {
        TxRequest::Frame(frame) => submit_frame(inner, frame),
        TxRequest::Control(command) => submit_control(inner, command),
    }
}

/// Pops a free descriptor, keeping the last one in reserve so the engine
/// can always terminate or extend the hardware chain.
fn acquire_with_spare(arena: &mut DescriptorArena<TxDesc>) -> Option<SlotId> {
    if arena.free_count() < 2 {
        return None;
    }
    arena.try_acquire_free()
}

fn submit_frame<D, P>(
    inner: &mut AdapterInner<D, P>,
    frame: TransmitFrame,
) -> Result<(), SubmitFailure>
where
    D: NicDevice,
    P: ScatterMapper,
{
    let length = frame.length();
    if length == 0 || length > inner.config.max_frame_size as usize {
        return Err(SubmitFailure::InvalidLength(frame));
    }
    let slot = match acquire_with_spare(&mut inner.tx.arena) {
        Some(slot) => slot,
        None => return Err(SubmitFailure::Resources(TxRequest::Frame(frame))),
    };

    if length <= inner.config.min_frame_size as usize {
        // Short frames are copied into the descriptor's own data area,
        // zero-padded up to the minimum wire length.
        let padded = inner.config.min_frame_size as usize;
        let mut data = [0u8; INLINE_DATA_SIZE];
        frame.copy_into(&mut data);
        inner
            .device
            .post_transmit(slot, TxDescriptorData::Inline(&data[..padded]));
        inner.tx.arena.get_mut(slot).payload = TxPayload::Inline(frame);
        inner.stats.tx_inline += 1;
    } else if frame.fragment_count() <= inner.config.scatter_limit as usize {
        let entries = match inner.platform.map_frame(&frame) {
            Ok(entries) => entries,
            Err(e) => {
                // Mapping registers are a transient resource like
                // descriptors, so this is a deferral, not an error.
                debug!("fragment mapping unavailable: {}", e);
                inner.stats.tx_map_failures += 1;
                inner.tx.arena.release(slot);
                return Err(SubmitFailure::Resources(TxRequest::Frame(frame)));
            }
        };
        inner
            .device
            .post_transmit(slot, TxDescriptorData::Scatter(&entries));
        inner.tx.arena.get_mut(slot).payload = TxPayload::Scatter { frame, entries };
        inner.stats.tx_scatter += 1;
    } else {
        let mut buffer = match inner.tx.coalesce.acquire() {
            Some(buffer) => buffer,
            None => {
                inner.tx.arena.release(slot);
                return Err(SubmitFailure::Resources(TxRequest::Frame(frame)));
            }
        };
        frame.copy_into(&mut buffer[..]);
        inner.device.post_transmit(
            slot,
            TxDescriptorData::Coalesced {
                buffer: buffer.phys_addr(),
                length: length as u16,
            },
        );
        inner.tx.arena.get_mut(slot).payload = TxPayload::Coalesced { frame, buffer };
        inner.stats.tx_coalesced += 1;
    }

    chain_descriptor(inner, slot);
    Ok(())
}

fn submit_control<D, P>(
    inner: &mut AdapterInner<D, P>,
    command: ControlCommand,
) -> Result<(), SubmitFailure>
where
    D: NicDevice,
{
    let slot = match acquire_with_spare(&mut inner.tx.arena) {
        Some(slot) => slot,
        None => return Err(SubmitFailure::Resources(TxRequest::Control(command))),
    };
    inner
        .device
        .post_transmit(slot, TxDescriptorData::Control(&command));
    inner.tx.arena.get_mut(slot).payload = TxPayload::Control(command);
    chain_descriptor(inner, slot);
    Ok(())
}

/// Appends a populated descriptor to the Active Chain and kicks the device:
/// a start command when the chain was empty, otherwise a link plus resume.
fn chain_descriptor<D: NicDevice, P>(inner: &mut AdapterInner<D, P>, slot: SlotId) {
    let prev = inner.tx.active.tail();
    inner.tx.arena.set_owner(slot, OwnerTag::ArmedForDevice);
    let tx = &mut inner.tx;
    tx.active.push_tail(&mut tx.arena, slot);
    match prev {
        None => {
            if let Err(e) = inner.device.start_transmit(slot) {
                warn!("transmit start rejected: {}", e);
                inner.stats.hw_not_responding += 1;
                inner.tx.start_pending = true;
            }
        }
        Some(prev) => {
            inner.device.append_transmit(prev, slot);
            if let Err(e) = inner.device.resume_transmit() {
                warn!("transmit resume rejected: {}", e);
                inner.stats.tx_resume_failures += 1;
                inner.tx.resume_pending = true;
            }
        }
    }
}
