use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceDirection {
    Tx,
    Rx,
}

#[derive(Debug, Clone)]
pub struct TraceRecord {
    pub direction: TraceDirection,
    pub unix_ms: u64,
    pub bytes: Vec<u8>,
}

/// Bounded ring of raw bytes sent and received on one connection, for
/// post-mortem inspection. The disabled path is a single atomic load.
pub struct TraceBuffer {
    enabled: AtomicBool,
    capacity: usize,
    records: Mutex<VecDeque<TraceRecord>>,
}

impl TraceBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            enabled: AtomicBool::new(false),
            capacity: capacity.max(1),
            records: Mutex::new(VecDeque::new()),
        }
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn record(&self, direction: TraceDirection, bytes: &[u8]) {
        if !self.is_enabled() {
            return;
        }
        let unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let mut guard = self.records.lock();
        if guard.len() == self.capacity {
            guard.pop_front();
        }
        guard.push_back(TraceRecord {
            direction,
            unix_ms,
            bytes: bytes.to_vec(),
        });
    }

    pub fn snapshot(&self) -> Vec<TraceRecord> {
        self.records.lock().iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_buffer_records_nothing() {
        let trace = TraceBuffer::new(4);
        trace.record(TraceDirection::Tx, &[1, 2, 3]);
        assert!(trace.snapshot().is_empty());
    }

    #[test]
    fn ring_drops_oldest() {
        let trace = TraceBuffer::new(2);
        trace.enable();
        trace.record(TraceDirection::Tx, &[1]);
        trace.record(TraceDirection::Rx, &[2]);
        trace.record(TraceDirection::Tx, &[3]);
        let records = trace.snapshot();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].bytes, vec![2]);
        assert_eq!(records[1].bytes, vec![3]);
    }
}
