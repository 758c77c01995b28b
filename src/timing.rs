//! Read-timeout levels and scan-polling backoff.
//!
//! The channel read timeout doubles as the periodic tick: every expiry
//! triggers a `p2p_find` refresh, and consecutive unanswered refreshes
//! push the level from `normal` to `long` so idle systems stop hammering
//! the radio.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Timeout selector for the channel read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimingLevel {
    /// Aggressive scan refresh.
    Normal,
    /// Extended while a WPS dialogue is in flight.
    Connect,
    /// Peers are not answering; slow down.
    Long,
    /// The Enroller runs nearly quiescent.
    Enroller,
}

/// Per-level read timeout in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SelectTimeouts {
    pub normal: u64,
    pub connect: u64,
    pub long: u64,
    pub enroller: u64,
}

impl Default for SelectTimeouts {
    fn default() -> Self {
        Self {
            normal: 10,
            connect: 90,
            long: 600,
            enroller: 600,
        }
    }
}

impl SelectTimeouts {
    pub fn for_level(&self, level: TimingLevel) -> Duration {
        let secs = match level {
            TimingLevel::Normal => self.normal,
            TimingLevel::Connect => self.connect,
            TimingLevel::Long => self.long,
            TimingLevel::Enroller => self.enroller,
        };
        Duration::from_secs(secs)
    }
}

/// Mutable timing state owned by the engine.
#[derive(Debug)]
pub struct TimingState {
    level: TimingLevel,
    scan_polling: u32,
    /// Last `p2p_connect`/enrol emission; `None` keeps the gate open.
    connect_mark: Option<Instant>,
}

impl TimingState {
    pub fn new(level: TimingLevel) -> Self {
        Self {
            level,
            scan_polling: 0,
            connect_mark: None,
        }
    }

    pub fn level(&self) -> TimingLevel {
        self.level
    }

    pub fn set_level(&mut self, level: TimingLevel) {
        self.level = level;
    }

    pub fn scan_polling(&self) -> u32 {
        self.scan_polling
    }

    /// Called before each read: once the polling budget is exhausted the
    /// normal level degrades to long. Returns true when it did.
    pub fn apply_backoff(&mut self, max_scan_polling: u32) -> bool {
        if self.level == TimingLevel::Normal
            && max_scan_polling > 0
            && self.scan_polling >= max_scan_polling
        {
            self.level = TimingLevel::Long;
            return true;
        }
        false
    }

    /// Whether this tick may still emit a `p2p_find` probe.
    pub fn may_poll(&self, max_scan_polling: u32) -> bool {
        max_scan_polling == 0 || self.scan_polling <= max_scan_polling
    }

    pub fn note_poll(&mut self) {
        self.scan_polling += 1;
    }

    /// Any event other than `OK` resets the polling streak.
    pub fn note_activity(&mut self) {
        self.scan_polling = 0;
    }

    /// Force the long level with an extra polling strike (the supplicant
    /// rejected a scan trigger because one is already pending).
    pub fn note_scan_rejected(&mut self) {
        self.scan_polling += 1;
        self.level = TimingLevel::Long;
    }

    /// Record that a connect/enrol command was just issued.
    pub fn mark_connect(&mut self) {
        self.connect_mark = Some(Instant::now());
    }

    /// Reopen the connect gate immediately.
    pub fn reset_connect_gate(&mut self) {
        self.connect_mark = None;
    }

    /// True when at least `min_conn_delay` passed since the last connect.
    pub fn connect_gate_open(&self, min_conn_delay: Duration) -> bool {
        match self.connect_mark {
            None => true,
            Some(mark) => mark.elapsed() >= min_conn_delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_timeout_table() {
        let table = SelectTimeouts::default();
        assert_eq!(table.for_level(TimingLevel::Normal), Duration::from_secs(10));
        assert_eq!(table.for_level(TimingLevel::Connect), Duration::from_secs(90));
        assert_eq!(table.for_level(TimingLevel::Long), Duration::from_secs(600));
        assert_eq!(
            table.for_level(TimingLevel::Enroller),
            Duration::from_secs(600)
        );
    }

    #[test]
    fn backoff_after_polling_budget() {
        let mut timing = TimingState::new(TimingLevel::Normal);
        assert!(!timing.apply_backoff(2));
        timing.note_poll();
        timing.note_poll();
        assert!(timing.apply_backoff(2));
        assert_eq!(timing.level(), TimingLevel::Long);
    }

    #[test]
    fn backoff_disabled_when_unlimited() {
        let mut timing = TimingState::new(TimingLevel::Normal);
        for _ in 0..10 {
            timing.note_poll();
        }
        assert!(!timing.apply_backoff(0));
        assert_eq!(timing.level(), TimingLevel::Normal);
    }

    #[test]
    fn activity_resets_polling_streak() {
        let mut timing = TimingState::new(TimingLevel::Normal);
        timing.note_poll();
        timing.note_poll();
        timing.note_activity();
        assert!(!timing.apply_backoff(2));
        assert_eq!(timing.scan_polling(), 0);
    }

    #[test]
    fn poll_budget_allows_one_overrun_log() {
        let mut timing = TimingState::new(TimingLevel::Normal);
        timing.note_poll();
        timing.note_poll();
        assert!(timing.may_poll(2));
        timing.note_poll();
        assert!(!timing.may_poll(2));
    }

    #[tokio::test(start_paused = true)]
    async fn connect_gate_follows_min_conn_delay() {
        let mut timing = TimingState::new(TimingLevel::Normal);
        let delay = Duration::from_secs(40);
        assert!(timing.connect_gate_open(delay));
        timing.mark_connect();
        assert!(!timing.connect_gate_open(delay));
        tokio::time::advance(Duration::from_secs(41)).await;
        assert!(timing.connect_gate_open(delay));
        timing.mark_connect();
        timing.reset_connect_gate();
        assert!(timing.connect_gate_open(delay));
    }
}
