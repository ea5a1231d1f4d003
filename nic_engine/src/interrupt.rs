//! The interrupt front-end and the deferred processor.
//!
//! The ISR runs lock-free: it decides whether the interrupt belongs to this
//! adapter, claims it through a small atomic state machine, masks the
//! device, and tells the caller to schedule deferred processing. All
//! descriptor work happens later in [`Adapter::deferred_process`] under the
//! adapter lock. The state machine guarantees exactly one deferred pass per
//! claimed interrupt:
//!
//! `Idle --(isr claims)--> Claimed --(masked)--> Deferred --(processed)--> Idle`

use core::sync::atomic::Ordering;

use log::info;

use nic_device::{
    DmaAllocator, InterruptControl, InterruptStatus, NicDevice, ScatterMapper,
};

use crate::{cleanup, rx, Adapter, FrameSink};

pub(crate) const INT_IDLE: u8 = 0;
pub(crate) const INT_CLAIMED: u8 = 1;
pub(crate) const INT_DEFERRED: u8 = 2;

impl<D, I, P, S> Adapter<D, I, P, S>
where
    D: NicDevice,
    I: InterruptControl,
    P: ScatterMapper + DmaAllocator,
    S: FrameSink,
{
    /// The interrupt service routine. Never takes the adapter lock.
    ///
    /// Returns `true` when the interrupt was claimed for this adapter and
    /// [`deferred_process`](Adapter::deferred_process) must be scheduled.
    /// Returns `false` when the interrupt is not ours, or when a previous
    /// claim is still being processed (the device is masked, so it cannot
    /// have raised a new one).
    pub fn isr(&self) -> bool {
        if !self.irq.interrupt_pending() {
            return false;
        }
        if self.irq.interrupts_masked() {
            return false;
        }
        if self
            .int_state
            .compare_exchange(INT_IDLE, INT_CLAIMED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.irq.mask_interrupts();
        self.int_state.store(INT_DEFERRED, Ordering::Release);
        true
    }

    /// One deferred-processing pass for a claimed interrupt.
    ///
    /// Acknowledges the device's status word and runs the receive drain,
    /// receive-unit restart, and transmit completion engines for whichever
    /// causes are set, repeating up to `dpc_loop_bound` times to pick up
    /// causes that arrived mid-pass. Unmasks interrupts on exit.
    pub fn deferred_process(&self) {
        if self.int_state.load(Ordering::Acquire) != INT_DEFERRED {
            return;
        }
        let mut guard = self.inner.lock();
        let bound = guard.config.dpc_loop_bound;
        for _ in 0..bound {
            let status = guard.device.ack_status();
            if status.is_empty() {
                break;
            }
            if status.contains(InterruptStatus::LINK_CHANGE) {
                guard.stats.link_changes += 1;
                info!("link status change");
            }
            if status
                .intersects(InterruptStatus::FRAME_RECEIVED | InterruptStatus::RX_NO_RESOURCES)
            {
                guard = rx::drain_receive(self, guard);
            }
            if status.contains(InterruptStatus::RX_NO_RESOURCES) {
                rx::restart_receive_if_stalled(&mut guard);
            }
            if status
                .intersects(InterruptStatus::TRANSMIT_DONE | InterruptStatus::COMMAND_IDLE)
            {
                guard = cleanup::drain_completions(self, guard);
            }
        }
        drop(guard);
        self.int_state.store(INT_IDLE, Ordering::Release);
        self.irq.unmask_interrupts();
    }
}
