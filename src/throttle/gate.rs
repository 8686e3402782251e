//! Admission control.

use crate::core::error::GateResult;
use crate::throttle::space::SpaceProbe;
use crate::throttle::tracker::{DailyUsageRecord, DailyUsageTracker};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Throttle thresholds. Zero disables a check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleLimits {
    /// Bytes that must remain free after admitting a file.
    pub min_free_space: u64,
    /// Files admitted per calendar day.
    pub max_files_per_day: u64,
    /// Bytes admitted per calendar day.
    pub max_volume_per_day: u64,
}

impl ThrottleLimits {
    /// No limits at all.
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// Sets the free-space floor.
    pub fn with_min_free_space(mut self, bytes: u64) -> Self {
        self.min_free_space = bytes;
        self
    }

    /// Sets the daily file limit.
    pub fn with_max_files_per_day(mut self, files: u64) -> Self {
        self.max_files_per_day = files;
        self
    }

    /// Sets the daily volume limit.
    pub fn with_max_volume_per_day(mut self, bytes: u64) -> Self {
        self.max_volume_per_day = bytes;
        self
    }

    /// Applies the daily checks to `usage` for a file of `candidate` bytes.
    ///
    /// When both daily checks fail, the one with less remaining capacity
    /// wins; ties go to the file limit.
    pub fn daily_reason(&self, usage: &DailyUsageRecord, candidate: u64) -> ThrottleReason {
        let files_ok = self.max_files_per_day == 0
            || usage.files_processed.saturating_add(1) <= self.max_files_per_day;
        let volume_ok = self.max_volume_per_day == 0
            || usage.bytes_processed.saturating_add(candidate) <= self.max_volume_per_day;

        match (files_ok, volume_ok) {
            (true, true) => ThrottleReason::Ok,
            (false, true) => ThrottleReason::DailyFileLimit,
            (true, false) => ThrottleReason::DailyVolumeLimit,
            (false, false) => {
                let remaining_files = self.max_files_per_day.saturating_sub(usage.files_processed);
                let remaining_bytes = self.max_volume_per_day.saturating_sub(usage.bytes_processed);
                let files_by_volume = remaining_bytes.checked_div(candidate).unwrap_or(0);
                if remaining_files <= files_by_volume {
                    ThrottleReason::DailyFileLimit
                } else {
                    ThrottleReason::DailyVolumeLimit
                }
            }
        }
    }
}

/// Why a file was or was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThrottleReason {
    /// Admitted.
    Ok,
    /// Admitting would leave less than the free-space floor.
    SpaceExhausted,
    /// Today's file count is used up.
    DailyFileLimit,
    /// Today's byte volume is used up.
    DailyVolumeLimit,
}

impl fmt::Display for ThrottleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ok => "OK",
            Self::SpaceExhausted => "SPACE_EXHAUSTED",
            Self::DailyFileLimit => "DAILY_FILE_LIMIT",
            Self::DailyVolumeLimit => "DAILY_VOLUME_LIMIT",
        };
        f.write_str(s)
    }
}

/// Result of one admission attempt. Never reused for another file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleDecision {
    /// Whether the file may proceed.
    pub admitted: bool,
    /// Why.
    pub reason: ThrottleReason,
    /// Free space the decision was based on, net of in-flight reservations.
    pub free_space: Option<u64>,
    /// Today's usage after the decision.
    pub usage: DailyUsageRecord,
}

/// Combines the free-space check and the daily quota into one atomic
/// admit-and-record step.
///
/// Space admitted to in-flight tasks stays reserved until the worker calls
/// [`release`](Self::release), so files admitted back to back cannot all
/// claim the same free bytes before any of them is written.
///
/// The reservation is held for the task's whole life, including after its
/// quarantine copy already shows up in a filesystem probe. Near the floor
/// an in-flight file is therefore counted twice and admission stops early;
/// it never stops late.
#[derive(Debug)]
pub struct ThrottleGate {
    limits: ThrottleLimits,
    tracker: Arc<DailyUsageTracker>,
    probe: Arc<dyn SpaceProbe>,
    reserved: Mutex<u64>,
}

impl ThrottleGate {
    /// Creates a gate.
    pub fn new(
        limits: ThrottleLimits,
        tracker: Arc<DailyUsageTracker>,
        probe: Arc<dyn SpaceProbe>,
    ) -> Self {
        Self {
            limits,
            tracker,
            probe,
            reserved: Mutex::new(0),
        }
    }

    /// Configured limits.
    pub fn limits(&self) -> &ThrottleLimits {
        &self.limits
    }

    /// The tracker behind the daily checks.
    pub fn tracker(&self) -> &Arc<DailyUsageTracker> {
        &self.tracker
    }

    /// Bytes currently reserved by admitted, unfinished tasks.
    pub fn reserved(&self) -> u64 {
        *self.reserved.lock()
    }

    /// Decides whether a file of `candidate_bytes` may be admitted and, if
    /// so, records it against today's quota before returning.
    ///
    /// The space check runs first; its failure is reported regardless of
    /// the daily state. Blocks on the tracker's critical section, so call
    /// it from a blocking context.
    pub fn evaluate(&self, candidate_bytes: u64) -> GateResult<ThrottleDecision> {
        let mut reserved = self.reserved.lock();

        let free_space = if self.limits.min_free_space > 0 {
            let free = self.probe.available_bytes()?.saturating_sub(*reserved);
            let needed = candidate_bytes.saturating_add(self.limits.min_free_space);
            if needed > free {
                let usage = self.tracker.get(self.tracker.today())?;
                return Ok(self.decide(false, ThrottleReason::SpaceExhausted, Some(free), usage));
            }
            Some(free)
        } else {
            None
        };

        let mut reason = ThrottleReason::Ok;
        let (usage, admitted) = self.tracker.record_if(candidate_bytes, |usage| {
            reason = self.limits.daily_reason(usage, candidate_bytes);
            reason == ThrottleReason::Ok
        })?;

        if admitted {
            *reserved = reserved.saturating_add(candidate_bytes);
        }
        Ok(self.decide(admitted, reason, free_space, usage))
    }

    fn decide(
        &self,
        admitted: bool,
        reason: ThrottleReason,
        free_space: Option<u64>,
        usage: DailyUsageRecord,
    ) -> ThrottleDecision {
        tracing::debug!(
            admitted,
            reason = %reason,
            free_space = ?free_space,
            files_today = usage.files_processed,
            bytes_today = usage.bytes_processed,
            "Throttle decision"
        );
        ThrottleDecision {
            admitted,
            reason,
            free_space,
            usage,
        }
    }

    /// Returns `bytes` of reserved space once their task is terminal.
    pub fn release(&self, bytes: u64) {
        let mut reserved = self.reserved.lock();
        *reserved = reserved.saturating_sub(bytes);
    }
}
