//! The receive/transmit descriptor ring engine for an Ethernet NIC.
//!
//! An [`Adapter`] owns two descriptor arenas (receive and transmit), the
//! buffer pools that feed them, and the hardware handles it drives through
//! the [`nic_device`] traits. All descriptor and ring state lives behind one
//! `spin::Mutex` (the adapter lock); the only lock-free entry point is
//! [`Adapter::isr`], which claims an interrupt, masks the device, and leaves
//! the actual descriptor work to [`Adapter::deferred_process`].
//!
//! Received frames and transmit completions are delivered to the embedding
//! system through a [`FrameSink`], always with the adapter lock released, so
//! the sink may re-enter the adapter (e.g. submit a reply frame from inside
//! `frames_received`).
//!
//! Buffer ownership on the receive side follows the pool-on-drop scheme in
//! [`nic_buffers`]: every indicated frame carries its `ReceiveBuffer` with
//! it, and dropping the frame is what returns the buffer for re-arming. A
//! frame indicated as [`IndicationStatus::LowResources`] must be dropped
//! before `frames_received` returns; the engine re-arms descriptors from the
//! pool immediately after the callback.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod cleanup;
mod interrupt;
mod rx;
mod stats;
mod tx;

#[cfg(test)]
mod mock;

pub use stats::AdapterStats;

use alloc::{collections::VecDeque, sync::Arc, vec::Vec};
use core::sync::atomic::AtomicU8;
use log::info;
use spin::{Mutex, MutexGuard};

use nic_buffers::{
    CoalescePool, ReceiveBuffer, ReceiveBufferPool, ReceivedFrame, TransmitFrame,
};
use nic_device::{
    ControlCommand, DmaAllocator, InterruptControl, NicDevice, PacketFilter, ReceiveUnitState,
    ScatterMapper,
};
use nic_ring::{DescriptorArena, OwnerTag, SlotList};

use rx::{RxDesc, RxState};
use tx::{SubmitFailure, TxDesc, TxPayload, TxRequest, TxState, INLINE_DATA_SIZE};

/// How a received frame is being handed to the upper layer.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum IndicationStatus {
    /// The upper layer may hold the frame for as long as it likes.
    Success,
    /// Buffers are scarce; the frame must be dropped (returning its buffer)
    /// before the `frames_received` callback returns.
    LowResources,
}

/// Outcome of submitting a frame or control command.
pub enum TransmitResult {
    /// Posted to the device; the send-complete callback reports the outcome.
    Pending,
    /// Descriptors, mappings, or coalesce buffers were exhausted. The
    /// request was queued internally and will be posted as completions free
    /// resources; the send-complete callback still fires eventually.
    Resources,
    /// The frame was zero-length or longer than the configured maximum. It
    /// is handed back unmodified and nothing was consumed.
    InvalidLength(TransmitFrame),
}

impl core::fmt::Debug for TransmitResult {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            TransmitResult::Pending => f.write_str("Pending"),
            TransmitResult::Resources => f.write_str("Resources"),
            TransmitResult::InvalidLength(frame) => {
                write!(f, "InvalidLength({} bytes)", frame.length())
            }
        }
    }
}

/// Final status of one transmitted frame, as reported by the device.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SendStatus {
    Success,
    Failure,
}

/// The upper layer's receive and send-complete callbacks.
///
/// Both are invoked with the adapter lock released, so implementations may
/// call back into the adapter.
pub trait FrameSink: Send + Sync {
    /// Delivers a batch of received frames, in arrival order.
    fn frames_received(&self, frames: Vec<(ReceivedFrame, IndicationStatus)>);

    /// Returns a completed outbound frame to its owner.
    fn send_complete(&self, frame: TransmitFrame, status: SendStatus);
}

/// Policy constants for one adapter. All sizes are validated at bring-up.
#[derive(Clone, Debug)]
pub struct AdapterConfig {
    /// Number of receive descriptors (fixed for the adapter's lifetime).
    pub rx_ring_size: u16,
    /// Size of each receive buffer in bytes.
    pub rx_buffer_size: u16,
    /// Receive buffers held in reserve: indications switch to
    /// [`IndicationStatus::LowResources`] once fewer than this many
    /// descriptors could remain armed.
    pub rx_reserve_watermark: u16,
    /// Maximum frames indicated per `frames_received` call.
    pub rx_batch_limit: u16,
    /// Buffers requested per asynchronous refill.
    pub rx_refill_count: u16,
    /// Number of transmit descriptors; one is always held in reserve.
    pub tx_ring_size: u16,
    /// Maximum scatter entries per transmit descriptor.
    pub scatter_limit: u16,
    /// Frames at or below this length are copied inline into the descriptor
    /// and padded up to it.
    pub min_frame_size: u16,
    /// Maximum frame length accepted for transmit and receive.
    pub max_frame_size: u16,
    /// Number of preallocated coalesce buffers.
    pub coalesce_buffers: u16,
    /// Maximum ack-and-process iterations per deferred-processing pass.
    pub dpc_loop_bound: u32,
    /// Maximum receive-unit state polls after issuing a (re)start command.
    pub restart_poll_bound: u32,
}

impl Default for AdapterConfig {
    fn default() -> AdapterConfig {
        AdapterConfig {
            rx_ring_size: 32,
            rx_buffer_size: 2048,
            rx_reserve_watermark: 4,
            rx_batch_limit: 32,
            rx_refill_count: 8,
            tx_ring_size: 32,
            scatter_limit: 16,
            min_frame_size: 60,
            max_frame_size: 1514,
            coalesce_buffers: 4,
            dpc_loop_bound: 2,
            restart_poll_bound: 1000,
        }
    }
}

impl AdapterConfig {
    fn validate(&self) -> Result<(), &'static str> {
        if self.rx_ring_size == 0 {
            return Err("rx_ring_size must be nonzero");
        }
        if self.rx_reserve_watermark >= self.rx_ring_size {
            return Err("rx_reserve_watermark must be smaller than the receive ring");
        }
        if self.rx_batch_limit == 0 {
            return Err("rx_batch_limit must be nonzero");
        }
        if self.tx_ring_size < 2 {
            return Err("tx_ring_size must be at least 2 (one descriptor stays in reserve)");
        }
        if self.scatter_limit == 0 {
            return Err("scatter_limit must be nonzero");
        }
        if self.min_frame_size == 0 || self.min_frame_size as usize > INLINE_DATA_SIZE {
            return Err("min_frame_size out of range for inline descriptors");
        }
        if self.max_frame_size <= self.min_frame_size {
            return Err("max_frame_size must exceed min_frame_size");
        }
        if self.rx_buffer_size < self.max_frame_size {
            return Err("rx_buffer_size must hold a maximum-size frame");
        }
        if self.dpc_loop_bound == 0 {
            return Err("dpc_loop_bound must be nonzero");
        }
        Ok(())
    }
}

/// Everything the adapter lock protects.
pub(crate) struct AdapterInner<D, P> {
    pub(crate) device: D,
    pub(crate) platform: P,
    pub(crate) rx: RxState,
    pub(crate) tx: TxState,
    pub(crate) stats: AdapterStats,
    pub(crate) config: AdapterConfig,
    pub(crate) pool: Arc<ReceiveBufferPool>,
}

pub(crate) type Guard<'a, D, P> = MutexGuard<'a, AdapterInner<D, P>>;

/// One NIC, fully initialized and running.
///
/// `D` is the device register/descriptor interface, `I` the lock-free
/// interrupt-line interface (often the same object), `P` the platform's
/// mapping and DMA-allocation services, and `S` the upper layer's callbacks.
pub struct Adapter<D, I, P, S> {
    pub(crate) inner: Mutex<AdapterInner<D, P>>,
    pub(crate) irq: I,
    pub(crate) sink: Arc<S>,
    pub(crate) int_state: AtomicU8,
}

impl<D, I, P, S> Adapter<D, I, P, S>
where
    D: NicDevice,
    I: InterruptControl,
    P: ScatterMapper + DmaAllocator,
    S: FrameSink,
{
    /// Brings up one adapter: allocates its buffer pools, arms the full
    /// receive ring, starts the receive unit, and unmasks interrupts.
    pub fn new(
        config: AdapterConfig,
        mut device: D,
        irq: I,
        mut platform: P,
        sink: Arc<S>,
    ) -> Result<Adapter<D, I, P, S>, &'static str> {
        config.validate()?;

        let pool = ReceiveBufferPool::new();
        let buffers = platform.allocate_receive_buffers(
            &pool,
            config.rx_ring_size as usize,
            config.rx_buffer_size as usize,
        )?;
        if buffers.len() != config.rx_ring_size as usize {
            return Err("platform returned the wrong number of receive buffers");
        }
        let coalesce = platform.allocate_coalesce_buffers(
            config.coalesce_buffers as usize,
            config.max_frame_size as usize,
        )?;

        let mut rx_arena = DescriptorArena::new(config.rx_ring_size as usize, |_| RxDesc {
            buffer: None,
        });
        let mut ring = SlotList::new();
        for buffer in buffers {
            let slot = rx_arena
                .try_acquire_free()
                .ok_or("more receive buffers than descriptors")?;
            device.arm_receive(slot, buffer.phys_addr(), buffer.capacity());
            rx_arena.get_mut(slot).buffer = Some(buffer);
            rx_arena.set_owner(slot, OwnerTag::ArmedForDevice);
            ring.push_tail(&mut rx_arena, slot);
        }

        let head = ring.peek_head().ok_or("receive ring is empty")?;
        device.start_receive(head)?;
        let mut ready = false;
        for _ in 0..config.restart_poll_bound {
            if device.receive_unit_state() == ReceiveUnitState::Ready {
                ready = true;
                break;
            }
            core::hint::spin_loop();
        }
        if !ready {
            return Err("receive unit did not become ready");
        }

        let tx_arena = DescriptorArena::new(config.tx_ring_size as usize, |_| TxDesc {
            payload: TxPayload::None,
            result_ok: false,
        });

        info!(
            "adapter up: {} rx descriptors of {} bytes, {} tx descriptors, {} coalesce buffers",
            config.rx_ring_size, config.rx_buffer_size, config.tx_ring_size, config.coalesce_buffers
        );

        let adapter = Adapter {
            inner: Mutex::new(AdapterInner {
                device,
                platform,
                rx: RxState {
                    arena: rx_arena,
                    ring,
                    used: 0,
                    refill_pending: false,
                },
                tx: TxState {
                    arena: tx_arena,
                    active: SlotList::new(),
                    completed: SlotList::new(),
                    deferred: VecDeque::new(),
                    coalesce: CoalescePool::new(coalesce),
                    start_pending: false,
                    resume_pending: false,
                },
                stats: AdapterStats::default(),
                config,
                pool,
            }),
            irq,
            sink,
            int_state: AtomicU8::new(interrupt::INT_IDLE),
        };
        adapter.irq.unmask_interrupts();
        Ok(adapter)
    }

    /// Submits one outbound frame.
    ///
    /// Ownership of the frame transfers to the adapter unless
    /// [`TransmitResult::InvalidLength`] hands it back. Every accepted frame
    /// is eventually returned through [`FrameSink::send_complete`].
    pub fn submit(&self, frame: TransmitFrame) -> TransmitResult {
        let mut inner = self.inner.lock();
        match tx::submit_request(&mut inner, TxRequest::Frame(frame)) {
            Ok(()) => TransmitResult::Pending,
            Err(SubmitFailure::Resources(request)) => {
                inner.stats.tx_deferred += 1;
                inner.tx.deferred.push_back(request);
                TransmitResult::Resources
            }
            Err(SubmitFailure::InvalidLength(frame)) => TransmitResult::InvalidLength(frame),
        }
    }

    /// Reprograms the device's receive packet filter.
    ///
    /// Issued as an internal control descriptor through the transmit chain;
    /// it completes without a send-complete callback.
    pub fn set_packet_filter(&self, filter: PacketFilter) -> TransmitResult {
        self.submit_control(ControlCommand::SetPacketFilter(filter))
    }

    /// Replaces the device's multicast address list.
    pub fn set_multicast_list(&self, addresses: Vec<[u8; 6]>) -> TransmitResult {
        self.submit_control(ControlCommand::SetMulticastList(addresses))
    }

    fn submit_control(&self, command: ControlCommand) -> TransmitResult {
        let mut inner = self.inner.lock();
        match tx::submit_request(&mut inner, TxRequest::Control(command)) {
            Ok(()) => TransmitResult::Pending,
            Err(SubmitFailure::Resources(request)) => {
                inner.stats.tx_deferred += 1;
                inner.tx.deferred.push_back(request);
                TransmitResult::Resources
            }
            // Control commands carry no frame, so no length to reject.
            Err(SubmitFailure::InvalidLength(frame)) => TransmitResult::InvalidLength(frame),
        }
    }

    /// Completes an asynchronous buffer refill requested from the platform.
    ///
    /// The buffers must belong to this adapter's pool (see
    /// [`Adapter::receive_buffer_pool`]). Re-arms as many unarmed receive
    /// descriptors as possible and restarts the receive unit if it had
    /// stopped for lack of buffers.
    pub fn provide_receive_buffers(&self, buffers: Vec<ReceiveBuffer>) {
        let mut guard = self.inner.lock();
        guard.rx.refill_pending = false;
        // Dropping routes every buffer through the pool; the drain's
        // replenish then arms as many as there are reclaimed descriptors.
        drop(buffers);
        // Completions may be sitting unprocessed at the ring head if the
        // unit stopped before the interrupt was serviced. Harvest them before
        // re-programming the head pointer; restarting first would hand the
        // device descriptors it has already written.
        guard = rx::drain_receive(self, guard);
        rx::restart_receive_if_stalled(&mut guard);
    }

    /// The pool that backs this adapter's receive buffers.
    pub fn receive_buffer_pool(&self) -> Arc<ReceiveBufferPool> {
        Arc::clone(&self.inner.lock().pool)
    }

    /// A snapshot of the adapter's counters.
    pub fn stats(&self) -> AdapterStats {
        self.inner.lock().stats.clone()
    }

    /// Receive buffers currently held by the upper layer.
    pub fn receive_descriptors_outstanding(&self) -> usize {
        self.inner.lock().rx.used as usize
    }

    /// Transmit descriptors currently on the free list.
    pub fn transmit_descriptors_free(&self) -> usize {
        self.inner.lock().tx.arena.free_count()
    }
}
