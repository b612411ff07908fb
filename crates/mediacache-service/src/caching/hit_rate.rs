use std::collections::VecDeque;

/// A rolling hit rate over the most recent lookups.
#[derive(Debug, Clone)]
pub struct HitRateWindow {
    outcomes: VecDeque<bool>,
    capacity: usize,
    hits: usize,
}

impl HitRateWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            outcomes: VecDeque::with_capacity(capacity),
            capacity,
            hits: 0,
        }
    }

    pub fn record(&mut self, hit: bool) {
        if self.outcomes.len() == self.capacity && self.outcomes.pop_front() == Some(true) {
            self.hits -= 1;
        }
        self.outcomes.push_back(hit);
        if hit {
            self.hits += 1;
        }
    }

    /// The fraction of hits in the window, `0.0` when nothing was recorded yet.
    pub fn rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        self.hits as f64 / self.outcomes.len() as f64
    }
}
