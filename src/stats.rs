//! Engine counters.

/// Observable counters, in the shape the host exports them.
#[derive(Debug, Default, Clone)]
pub struct UksmStats {
    /// Stable nodes with at least one mapping (one copy kept per node).
    pub pages_shared: u64,
    /// Additional mappings pointing at stable nodes beyond the first.
    pub pages_sharing: u64,
    /// Candidates currently parked in the unstable tree.
    pub pages_unshared: u64,
    /// Pages run through the merge engine since startup.
    pub pages_scanned: u64,
    /// Pages scanned when the last round closed.
    pub pages_scanned_last: u64,
    /// Completed scan rounds.
    pub full_scans: u64,
    /// Times the driving loop reported a sleep between batches.
    pub sleep_times: u64,

    // Skip accounting: no error leaves the scanner, each failed page step
    // lands in exactly one of these.
    pub skip_page_invalid: u64,
    pub skip_lock_busy: u64,
    pub skip_page_changed: u64,
    pub skip_oom: u64,
}

impl UksmStats {
    /// Pages scanned during the round currently in progress.
    pub fn scanned_this_round(&self) -> u64 {
        self.pages_scanned - self.pages_scanned_last
    }
}
