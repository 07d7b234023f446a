use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of [`OrderingStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrderingStatsSnapshot {
    /// Messages routed into the engine (real-time input only).
    pub messages_received: u64,
    /// Messages emitted in order on the merged output.
    pub messages_emitted: u64,
    /// Stale or already-buffered messages dropped by chains.
    pub duplicates_dropped: u64,
    pub gaps_found: u64,
    pub gaps_resolved: u64,
    /// Ranges skipped during forced resolution.
    pub unfillable_gaps: u64,
    pub resend_attempts: u64,
    pub resend_failures: u64,
}

/// Shared engine counters, updated lock-free from chains and gap tasks.
#[derive(Debug, Default)]
pub struct OrderingStats {
    messages_received: AtomicU64,
    messages_emitted: AtomicU64,
    duplicates_dropped: AtomicU64,
    gaps_found: AtomicU64,
    gaps_resolved: AtomicU64,
    unfillable_gaps: AtomicU64,
    resend_attempts: AtomicU64,
    resend_failures: AtomicU64,
}

impl OrderingStats {
    pub fn snapshot(&self) -> OrderingStatsSnapshot {
        OrderingStatsSnapshot {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_emitted: self.messages_emitted.load(Ordering::Relaxed),
            duplicates_dropped: self.duplicates_dropped.load(Ordering::Relaxed),
            gaps_found: self.gaps_found.load(Ordering::Relaxed),
            gaps_resolved: self.gaps_resolved.load(Ordering::Relaxed),
            unfillable_gaps: self.unfillable_gaps.load(Ordering::Relaxed),
            resend_attempts: self.resend_attempts.load(Ordering::Relaxed),
            resend_failures: self.resend_failures.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn note_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_emitted(&self) {
        self.messages_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_duplicate(&self) {
        self.duplicates_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_gap_found(&self) {
        self.gaps_found.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_gap_resolved(&self) {
        self.gaps_resolved.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_unfillable_gap(&self) {
        self.unfillable_gaps.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_resend_attempt(&self) {
        self.resend_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_resend_failure(&self) {
        self.resend_failures.fetch_add(1, Ordering::Relaxed);
    }
}
