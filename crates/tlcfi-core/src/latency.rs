//! # Latency Window
//!
//! Rolling average of request-to-confirmation times, in ticks.

use std::collections::VecDeque;

use crate::LATENCY_WINDOW;

/// Fixed-capacity window of response time samples.
#[derive(Debug, Clone)]
pub struct LatencyWindow {
    samples: VecDeque<u32>,
    capacity: usize,
    average: f64,
}

impl LatencyWindow {
    pub fn new(capacity: usize) -> Self {
        LatencyWindow {
            samples: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            average: 0.0,
        }
    }

    /// Adds a sample, dropping the oldest one when full, and returns the new average.
    pub fn push(&mut self, sample: u32) -> f64 {
        self.samples.push_back(sample);
        while self.samples.len() > self.capacity {
            self.samples.pop_front();
        }
        let sum: u64 = self.samples.iter().map(|&s| u64::from(s)).sum();
        self.average = sum as f64 / self.samples.len() as f64;
        self.average
    }

    /// Average over the retained samples, 0 when empty.
    pub fn average(&self) -> f64 {
        self.average
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl Default for LatencyWindow {
    fn default() -> Self {
        LatencyWindow::new(LATENCY_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_window() {
        let window = LatencyWindow::default();
        assert!(window.is_empty());
        assert_eq!(window.average(), 0.0);
    }

    #[test]
    fn test_average_over_last_fifty() {
        let mut window = LatencyWindow::default();
        // First sample is an outlier that must fall out of the window.
        window.push(10_000);
        for _ in 0..50 {
            window.push(100);
        }
        assert_eq!(window.len(), 50);
        assert_eq!(window.average(), 100.0);
    }

    #[test]
    fn test_running_average() {
        let mut window = LatencyWindow::new(3);
        assert_eq!(window.push(10), 10.0);
        assert_eq!(window.push(20), 15.0);
        assert_eq!(window.push(30), 20.0);
        assert_eq!(window.push(40), 30.0);
    }
}
