use super::types::{OutcomeKind, OutcomeRecord};
use std::collections::VecDeque;

/// Count-based ring of the most recent call outcomes
#[derive(Debug)]
pub struct SlidingWindow {
    capacity: usize,
    records: VecDeque<OutcomeRecord>,
    failures: usize,
    slow: usize,
}

/// Failure and slow call rates over a window, in percent
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowRates {
    pub failure_rate: f64,
    pub slow_call_rate: f64,
}

impl SlidingWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            records: VecDeque::with_capacity(capacity),
            failures: 0,
            slow: 0,
        }
    }

    /// Append an outcome, evicting the oldest one when full
    pub fn push(&mut self, record: OutcomeRecord) {
        if self.records.len() == self.capacity {
            if let Some(evicted) = self.records.pop_front() {
                self.forget(&evicted);
            }
        }

        if record.kind == OutcomeKind::Failure {
            self.failures += 1;
        }
        if record.slow {
            self.slow += 1;
        }
        self.records.push_back(record);
    }

    fn forget(&mut self, record: &OutcomeRecord) {
        if record.kind == OutcomeKind::Failure {
            self.failures -= 1;
        }
        if record.slow {
            self.slow -= 1;
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.failures = 0;
        self.slow = 0;
    }

    /// Rates over the current contents, once at least `minimum_calls` are held
    pub fn rates(&self, minimum_calls: usize) -> Option<WindowRates> {
        let len = self.records.len();
        if len == 0 || len < minimum_calls {
            return None;
        }

        Some(WindowRates {
            failure_rate: self.failures as f64 * 100.0 / len as f64,
            slow_call_rate: self.slow as f64 * 100.0 / len as f64,
        })
    }
}
