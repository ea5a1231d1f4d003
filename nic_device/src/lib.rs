//! The narrow contract between the ring engine and the hardware/platform.
//!
//! The engine never touches device registers or device-written descriptor
//! memory directly. Every access that has hardware memory-ordering concerns
//! (volatile reads of completion bits, register command issue, interrupt
//! mask manipulation) is funneled through the small traits defined here, so
//! the ring logic itself stays free of `unsafe` and can be exercised against
//! a software device in tests.
//!
//! The traits are split along execution contexts:
//! - [`InterruptControl`] is the only part the interrupt service routine may
//!   touch: lock-free reads and mask writes, callable without the adapter
//!   lock.
//! - [`NicDevice`] is everything else, called only while the adapter lock is
//!   held.
//! - [`ScatterMapper`] and [`DmaAllocator`] are platform services rather
//!   than device registers, but sit behind the same kind of seam.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::{sync::Arc, vec::Vec};
use bitflags::bitflags;
use nic_buffers::{CoalesceBuffer, PhysicalAddress, ReceiveBuffer, ReceiveBufferPool, TransmitFrame};
use nic_ring::SlotId;

bitflags! {
    /// Interrupt causes reported, and acknowledged, by [`NicDevice::ack_status`].
    pub struct InterruptStatus: u16 {
        /// One or more receive descriptors have completed.
        const FRAME_RECEIVED  = 1 << 0;
        /// The receive unit stopped for lack of armed descriptors.
        const RX_NO_RESOURCES = 1 << 1;
        /// One or more transmit descriptors have completed.
        const TRANSMIT_DONE   = 1 << 2;
        /// The command unit went idle after finishing its chain.
        const COMMAND_IDLE    = 1 << 3;
        /// The PHY reported a link status change.
        const LINK_CHANGE     = 1 << 4;
    }
}

bitflags! {
    /// Receive filter modes set through the configure hook.
    pub struct PacketFilter: u8 {
        const DIRECTED    = 1 << 0;
        const MULTICAST   = 1 << 1;
        const BROADCAST   = 1 << 2;
        const PROMISCUOUS = 1 << 3;
    }
}

/// State of the device's receive unit.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ReceiveUnitState {
    /// Never started, or explicitly stopped.
    Idle,
    /// Running and able to receive into armed descriptors.
    Ready,
    /// Suspended at a chain boundary.
    Suspended,
    /// Stopped because it ran out of armed descriptors.
    NoResources,
}

/// Per-frame receive status reported by the device.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RxFrameStatus {
    Ok,
    CrcError,
    AlignmentError,
    Overrun,
}

impl RxFrameStatus {
    pub fn is_ok(self) -> bool {
        self == RxFrameStatus::Ok
    }
}

/// The device's completion record for one receive descriptor.
#[derive(Clone, Copy, Debug)]
pub struct RxCompletion {
    /// Received frame length in bytes.
    pub length: u16,
    pub status: RxFrameStatus,
}

/// The device's completion record for one transmit descriptor.
#[derive(Clone, Copy, Debug)]
pub struct TxCompletion {
    /// Whether the frame went out on the wire successfully.
    pub ok: bool,
}

/// Opaque handle for one mapping-register slot reserved by
/// [`ScatterMapper::map_frame`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct MappingHandle(pub u32);

/// One physical fragment of a mapped outbound frame.
#[derive(Clone, Copy, Debug)]
pub struct ScatterEntry {
    pub phys_addr: PhysicalAddress,
    pub length: u16,
    pub mapping: MappingHandle,
}

/// An internal adapter command submitted through the transmit chain.
#[derive(Clone, Debug)]
pub enum ControlCommand {
    SetPacketFilter(PacketFilter),
    SetMulticastList(Vec<[u8; 6]>),
}

/// Hardware-visible contents of one transmit descriptor. Exactly one data
/// mode applies per descriptor.
pub enum TxDescriptorData<'a> {
    /// Short frame copied directly into the descriptor's own data area.
    Inline(&'a [u8]),
    /// Scatter list of physical fragments, one entry per fragment.
    Scatter(&'a [ScatterEntry]),
    /// Whole frame linearized into one coalesce buffer.
    Coalesced { buffer: PhysicalAddress, length: u16 },
    /// Internal control command; carries no frame data.
    Control(&'a ControlCommand),
}

/// The part of the device an interrupt service routine may touch.
///
/// Every method must be non-blocking and callable without the adapter lock;
/// implementations typically map these to single volatile register accesses.
pub trait InterruptControl: Send + Sync {
    /// Whether this device is currently signaling an interrupt.
    fn interrupt_pending(&self) -> bool;

    /// Whether the device's interrupt line is masked.
    fn interrupts_masked(&self) -> bool;

    fn mask_interrupts(&self);

    fn unmask_interrupts(&self);
}

/// Register and descriptor-memory access for one NIC.
///
/// All methods are called with the adapter lock held. The completion-bit
/// polls (`rx_poll`, `tx_poll`) are the single points where device-written
/// memory is read, so implementations concentrate their volatile accesses
/// and memory barriers there.
pub trait NicDevice {
    /// Reads and acknowledges the pending interrupt causes in one access.
    /// A second call without intervening device activity returns the empty
    /// set.
    fn ack_status(&mut self) -> InterruptStatus;

    /// Hands one receive descriptor to the device: clears its completion
    /// status and points it at `buffer` with the given capacity. The
    /// descriptor becomes the new tail of the device's receive chain.
    fn arm_receive(&mut self, slot: SlotId, buffer: PhysicalAddress, capacity: u16);

    /// Polls the completion bit of one receive descriptor. Returns `None`
    /// while the device still owns it.
    fn rx_poll(&mut self, slot: SlotId) -> Option<RxCompletion>;

    fn receive_unit_state(&mut self) -> ReceiveUnitState;

    /// Programs the receive head pointer to `head` and issues a
    /// receive-start command. The unit reports [`ReceiveUnitState::Ready`]
    /// once the command is accepted; callers poll for that.
    fn start_receive(&mut self, head: SlotId) -> Result<(), &'static str>;

    /// Populates the hardware-visible fields of one transmit descriptor and
    /// marks it as the chain terminator.
    fn post_transmit(&mut self, slot: SlotId, data: TxDescriptorData);

    /// Polls the completion bit of one transmit descriptor. Returns `None`
    /// while the device still owns it.
    fn tx_poll(&mut self, slot: SlotId) -> Option<TxCompletion>;

    /// Programs the command-unit head pointer to `head` and issues a start
    /// command. Only valid when the command unit is idle.
    fn start_transmit(&mut self, head: SlotId) -> Result<(), &'static str>;

    /// Links `slot` after `prev` in the hardware chain and clears `prev`'s
    /// chain-terminator flag so the device continues past it.
    fn append_transmit(&mut self, prev: SlotId, slot: SlotId);

    /// Issues a command-unit resume, waiting (bounded) for the previous
    /// command to be accepted first if necessary. An error means the device
    /// did not accept the command in time; the caller retries on the next
    /// completion cycle.
    fn resume_transmit(&mut self) -> Result<(), &'static str>;
}

/// Decomposes an outbound frame into physical fragments, reserving one
/// mapping-register slot per fragment.
///
/// Mapping registers are a bounded resource allocated as a ring, so entries
/// must be unmapped exactly once each, in the order they were produced.
pub trait ScatterMapper {
    /// Maps every fragment of `frame`. On failure no slots remain reserved.
    fn map_frame(&mut self, frame: &TransmitFrame) -> Result<Vec<ScatterEntry>, &'static str>;

    /// Releases one mapping-register slot.
    fn unmap(&mut self, mapping: MappingHandle);
}

/// Platform DMA-memory services.
pub trait DmaAllocator {
    /// Synchronously allocates `count` receive buffers of `buffer_size`
    /// bytes, all owned by `pool`. Used on the adapter bring-up path.
    fn allocate_receive_buffers(
        &mut self,
        pool: &Arc<ReceiveBufferPool>,
        count: usize,
        buffer_size: usize,
    ) -> Result<Vec<ReceiveBuffer>, &'static str>;

    /// Synchronously allocates `count` coalesce buffers of `buffer_size`
    /// bytes.
    fn allocate_coalesce_buffers(
        &mut self,
        count: usize,
        buffer_size: usize,
    ) -> Result<Vec<CoalesceBuffer>, &'static str>;

    /// Begins an asynchronous bulk allocation of receive buffers. Completion
    /// re-enters the engine through its buffer-provision entry point. The
    /// engine guarantees a single outstanding request per adapter.
    fn request_receive_buffers(&mut self, count: usize, buffer_size: usize);
}
