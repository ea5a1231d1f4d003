//! A scriptable software NIC for exercising the engine without hardware.
//!
//! One [`MockHandle`] stands in for all four hardware/platform traits, so a
//! single clone-able object is passed to [`crate::Adapter::new`] as device,
//! interrupt line, and platform. Tests script it by completing descriptors
//! and raising status bits, then assert on the command log it records.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use spin::Mutex;

use nic_buffers::{
    CoalesceBuffer, PhysicalAddress, ReceiveBuffer, ReceiveBufferPool, ReceivedFrame,
    TransmitFrame,
};
use nic_device::{
    DmaAllocator, InterruptControl, InterruptStatus, MappingHandle, NicDevice, ReceiveUnitState,
    RxCompletion, RxFrameStatus, ScatterEntry, ScatterMapper, TxCompletion, TxDescriptorData,
};
use nic_ring::SlotId;

use crate::{FrameSink, IndicationStatus, SendStatus};

/// Device commands in the order the engine issued them.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Command {
    StartReceive(usize),
    StartTransmit(usize),
    AppendTransmit(usize, usize),
    ResumeTransmit,
}

/// What the engine wrote into one transmit descriptor.
#[derive(Clone, PartialEq, Eq, Debug)]
pub(crate) enum Posted {
    Inline(Vec<u8>),
    /// `(phys_addr, length, mapping)` per scatter entry.
    Scatter(Vec<(u64, u16, u32)>),
    Coalesced { phys: u64, length: u16 },
    Control,
}

struct MockState {
    status: InterruptStatus,
    /// Armed receive descriptors in device completion order.
    rx_armed: VecDeque<SlotId>,
    rx_done: BTreeMap<usize, RxCompletion>,
    tx_done: BTreeMap<usize, TxCompletion>,
    ru_state: ReceiveUnitState,
    /// State polls remaining before the receive unit reports ready.
    ready_countdown: u32,
    commands: Vec<Command>,
    posted: Vec<(usize, Posted)>,
    arm_log: Vec<(usize, u64, u16)>,
    fail_start_once: bool,
    fail_resume_once: bool,
    map_slots_available: usize,
    next_mapping: u32,
    unmapped: Vec<u32>,
    refill_requests: Vec<(usize, usize)>,
    next_phys: u64,
}

struct MockShared {
    pending: AtomicBool,
    masked: AtomicBool,
    state: Mutex<MockState>,
}

#[derive(Clone)]
pub(crate) struct MockHandle(Arc<MockShared>);

impl MockHandle {
    pub(crate) fn new() -> MockHandle {
        MockHandle(Arc::new(MockShared {
            pending: AtomicBool::new(false),
            masked: AtomicBool::new(true),
            state: Mutex::new(MockState {
                status: InterruptStatus::empty(),
                rx_armed: VecDeque::new(),
                rx_done: BTreeMap::new(),
                tx_done: BTreeMap::new(),
                ru_state: ReceiveUnitState::Idle,
                ready_countdown: 0,
                commands: Vec::new(),
                posted: Vec::new(),
                arm_log: Vec::new(),
                fail_start_once: false,
                fail_resume_once: false,
                map_slots_available: 64,
                next_mapping: 0,
                unmapped: Vec::new(),
                refill_requests: Vec::new(),
                next_phys: 0x10_0000,
            }),
        }))
    }

    /// Completes the oldest armed receive descriptor and raises the
    /// interrupt line.
    pub(crate) fn complete_next_rx(&self, length: u16, status: RxFrameStatus) {
        let mut s = self.0.state.lock();
        let slot = s
            .rx_armed
            .pop_front()
            .expect("no armed receive descriptors to complete");
        s.rx_done.insert(slot.index(), RxCompletion { length, status });
        s.status |= InterruptStatus::FRAME_RECEIVED;
        if s.rx_armed.is_empty() {
            s.ru_state = ReceiveUnitState::NoResources;
            s.status |= InterruptStatus::RX_NO_RESOURCES;
        }
        self.0.pending.store(true, Ordering::SeqCst);
    }

    /// Completes one transmit descriptor and raises the interrupt line.
    pub(crate) fn complete_tx(&self, slot: usize, ok: bool) {
        let mut s = self.0.state.lock();
        s.tx_done.insert(slot, TxCompletion { ok });
        s.status |= InterruptStatus::TRANSMIT_DONE;
        self.0.pending.store(true, Ordering::SeqCst);
    }

    pub(crate) fn raise_link_change(&self) {
        self.0.state.lock().status |= InterruptStatus::LINK_CHANGE;
        self.0.pending.store(true, Ordering::SeqCst);
    }

    pub(crate) fn raise_command_idle(&self) {
        self.0.state.lock().status |= InterruptStatus::COMMAND_IDLE;
        self.0.pending.store(true, Ordering::SeqCst);
    }

    pub(crate) fn set_ready_countdown(&self, polls: u32) {
        self.0.state.lock().ready_countdown = polls;
    }

    pub(crate) fn set_fail_start_once(&self) {
        self.0.state.lock().fail_start_once = true;
    }

    pub(crate) fn set_fail_resume_once(&self) {
        self.0.state.lock().fail_resume_once = true;
    }

    pub(crate) fn commands(&self) -> Vec<Command> {
        self.0.state.lock().commands.clone()
    }

    pub(crate) fn posted(&self) -> Vec<(usize, Posted)> {
        self.0.state.lock().posted.clone()
    }

    pub(crate) fn armed_count(&self) -> usize {
        self.0.state.lock().rx_armed.len()
    }

    pub(crate) fn arm_log(&self) -> Vec<(usize, u64, u16)> {
        self.0.state.lock().arm_log.clone()
    }

    pub(crate) fn ru_state(&self) -> ReceiveUnitState {
        self.0.state.lock().ru_state
    }

    pub(crate) fn refill_requests(&self) -> Vec<(usize, usize)> {
        self.0.state.lock().refill_requests.clone()
    }

    pub(crate) fn unmapped(&self) -> Vec<u32> {
        self.0.state.lock().unmapped.clone()
    }

    pub(crate) fn masked(&self) -> bool {
        self.0.masked.load(Ordering::SeqCst)
    }
}

impl InterruptControl for MockHandle {
    fn interrupt_pending(&self) -> bool {
        self.0.pending.load(Ordering::SeqCst)
    }

    fn interrupts_masked(&self) -> bool {
        self.0.masked.load(Ordering::SeqCst)
    }

    fn mask_interrupts(&self) {
        self.0.masked.store(true, Ordering::SeqCst);
    }

    fn unmask_interrupts(&self) {
        self.0.masked.store(false, Ordering::SeqCst);
    }
}

impl NicDevice for MockHandle {
    fn ack_status(&mut self) -> InterruptStatus {
        self.0.pending.store(false, Ordering::SeqCst);
        let mut s = self.0.state.lock();
        core::mem::replace(&mut s.status, InterruptStatus::empty())
    }

    fn arm_receive(&mut self, slot: SlotId, buffer: PhysicalAddress, capacity: u16) {
        let mut s = self.0.state.lock();
        s.rx_armed.push_back(slot);
        s.arm_log.push((slot.index(), buffer.value(), capacity));
    }

    fn rx_poll(&mut self, slot: SlotId) -> Option<RxCompletion> {
        self.0.state.lock().rx_done.remove(&slot.index())
    }

    fn receive_unit_state(&mut self) -> ReceiveUnitState {
        let mut s = self.0.state.lock();
        if s.ready_countdown > 0 {
            s.ready_countdown -= 1;
            if s.ready_countdown == 0 {
                s.ru_state = ReceiveUnitState::Ready;
            }
        }
        s.ru_state
    }

    fn start_receive(&mut self, head: SlotId) -> Result<(), &'static str> {
        let mut s = self.0.state.lock();
        s.commands.push(Command::StartReceive(head.index()));
        if s.ready_countdown == 0 {
            s.ru_state = ReceiveUnitState::Ready;
        }
        Ok(())
    }

    fn post_transmit(&mut self, slot: SlotId, data: TxDescriptorData) {
        let posted = match data {
            TxDescriptorData::Inline(bytes) => Posted::Inline(bytes.to_vec()),
            TxDescriptorData::Scatter(entries) => Posted::Scatter(
                entries
                    .iter()
                    .map(|e| (e.phys_addr.value(), e.length, e.mapping.0))
                    .collect(),
            ),
            TxDescriptorData::Coalesced { buffer, length } => Posted::Coalesced {
                phys: buffer.value(),
                length,
            },
            TxDescriptorData::Control(_) => Posted::Control,
        };
        self.0.state.lock().posted.push((slot.index(), posted));
    }

    fn tx_poll(&mut self, slot: SlotId) -> Option<TxCompletion> {
        self.0.state.lock().tx_done.remove(&slot.index())
    }

    fn start_transmit(&mut self, head: SlotId) -> Result<(), &'static str> {
        let mut s = self.0.state.lock();
        s.commands.push(Command::StartTransmit(head.index()));
        if s.fail_start_once {
            s.fail_start_once = false;
            return Err("start command not accepted");
        }
        Ok(())
    }

    fn append_transmit(&mut self, prev: SlotId, slot: SlotId) {
        self.0
            .state
            .lock()
            .commands
            .push(Command::AppendTransmit(prev.index(), slot.index()));
    }

    fn resume_transmit(&mut self) -> Result<(), &'static str> {
        let mut s = self.0.state.lock();
        s.commands.push(Command::ResumeTransmit);
        if s.fail_resume_once {
            s.fail_resume_once = false;
            return Err("resume command not accepted");
        }
        Ok(())
    }
}

impl ScatterMapper for MockHandle {
    fn map_frame(&mut self, frame: &TransmitFrame) -> Result<Vec<ScatterEntry>, &'static str> {
        let mut s = self.0.state.lock();
        let count = frame.fragment_count();
        if count > s.map_slots_available {
            return Err("no mapping registers available");
        }
        s.map_slots_available -= count;
        let entries = frame
            .fragments()
            .iter()
            .map(|fragment| {
                let mapping = MappingHandle(s.next_mapping);
                s.next_mapping += 1;
                ScatterEntry {
                    phys_addr: fragment.phys_addr(),
                    length: fragment.len() as u16,
                    mapping,
                }
            })
            .collect();
        Ok(entries)
    }

    fn unmap(&mut self, mapping: MappingHandle) {
        let mut s = self.0.state.lock();
        s.unmapped.push(mapping.0);
        s.map_slots_available += 1;
    }
}

impl DmaAllocator for MockHandle {
    fn allocate_receive_buffers(
        &mut self,
        pool: &Arc<ReceiveBufferPool>,
        count: usize,
        buffer_size: usize,
    ) -> Result<Vec<ReceiveBuffer>, &'static str> {
        let mut buffers = Vec::with_capacity(count);
        for _ in 0..count {
            let phys = self.alloc_phys(buffer_size);
            buffers.push(ReceiveBuffer::new(
                vec![0u8; buffer_size].into_boxed_slice(),
                phys,
                pool,
            )?);
        }
        Ok(buffers)
    }

    fn allocate_coalesce_buffers(
        &mut self,
        count: usize,
        buffer_size: usize,
    ) -> Result<Vec<CoalesceBuffer>, &'static str> {
        let mut buffers = Vec::with_capacity(count);
        for _ in 0..count {
            let phys = self.alloc_phys(buffer_size);
            buffers.push(CoalesceBuffer::new(
                vec![0u8; buffer_size].into_boxed_slice(),
                phys,
            ));
        }
        Ok(buffers)
    }

    fn request_receive_buffers(&mut self, count: usize, buffer_size: usize) {
        self.0
            .state
            .lock()
            .refill_requests
            .push((count, buffer_size));
    }
}

impl MockHandle {
    fn alloc_phys(&self, size: usize) -> PhysicalAddress {
        let mut s = self.0.state.lock();
        let phys = s.next_phys;
        s.next_phys += size as u64;
        PhysicalAddress::new(phys)
    }
}

/// Records every indication and completion; optionally keeps successful
/// frames alive so their buffers stay out of the pool, the way an upper
/// layer holding frames would.
pub(crate) struct TestSink {
    pub(crate) received: Mutex<Vec<(Vec<u8>, IndicationStatus)>>,
    pub(crate) completions: Mutex<Vec<(usize, SendStatus)>>,
    held: Mutex<Vec<ReceivedFrame>>,
    hold_success: bool,
}

impl TestSink {
    pub(crate) fn new(hold_success: bool) -> Arc<TestSink> {
        Arc::new(TestSink {
            received: Mutex::new(Vec::new()),
            completions: Mutex::new(Vec::new()),
            held: Mutex::new(Vec::new()),
            hold_success,
        })
    }
}

impl FrameSink for TestSink {
    fn frames_received(&self, frames: Vec<(ReceivedFrame, IndicationStatus)>) {
        for (frame, status) in frames {
            self.received.lock().push((frame.0.to_vec(), status));
            if status == IndicationStatus::Success && self.hold_success {
                self.held.lock().push(frame);
            }
            // Anything not held is dropped here, which returns its buffer;
            // low-resources frames are always returned synchronously.
        }
    }

    fn send_complete(&self, frame: TransmitFrame, status: SendStatus) {
        self.completions.lock().push((frame.length(), status));
    }
}
