//! Running counters for one adapter.
//!
//! Updated under the adapter lock; read out as a snapshot via
//! [`crate::Adapter::stats`].

/// Event counters accumulated over the adapter's lifetime.
#[derive(Clone, Debug, Default)]
pub struct AdapterStats {
    /// Frames handed to the upper layer, regardless of indication status.
    pub rx_frames_indicated: u64,
    /// Frames indicated with the low-resources status.
    pub rx_frames_low_resources: u64,
    pub rx_errors_crc: u64,
    pub rx_errors_alignment: u64,
    pub rx_errors_overrun: u64,
    /// Completions whose reported length exceeded the configured maximum.
    pub rx_oversize: u64,
    /// Asynchronous buffer refills requested from the platform.
    pub rx_refills_requested: u64,
    /// Times the receive unit was restarted after stopping for resources.
    pub rx_restarts: u64,
    /// Frames that completed transmission successfully.
    pub tx_frames_sent: u64,
    /// Frames the device reported as failed on the wire.
    pub tx_frames_failed: u64,
    pub tx_inline: u64,
    pub tx_scatter: u64,
    pub tx_coalesced: u64,
    /// Submissions queued internally for lack of descriptors or mappings.
    pub tx_deferred: u64,
    pub tx_map_failures: u64,
    /// Resume commands the device failed to accept in time.
    pub tx_resume_failures: u64,
    /// Internal control descriptors that completed.
    pub controls_completed: u64,
    pub link_changes: u64,
    /// Start/restart commands the device never acknowledged.
    pub hw_not_responding: u64,
}
