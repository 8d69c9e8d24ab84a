//! Monotonic counters and derived rates. Correctness elsewhere must
//! never depend on their precise values -- they exist for the adaptive
//! depth control loop and operator visibility.

use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::Serialize;

struct Inner {
    total_tests: u64,
    passes: u64,
    failures: u64,
    timeouts: u64,
    kills: u64,
    merges: u64,
    /// Sum of `depth` over every branch ever created, and the count, used
    /// to compute `avg_depth`.
    depth_sum: u64,
    depth_count: u64,
    /// Rolling window of the last `window_size` pass/fail outcomes, true =
    /// pass. Drives the adaptive-depth control loop.
    rolling: VecDeque<bool>,
    window_size: usize,
}

pub struct Stats {
    inner: Mutex<Inner>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct QueueStats {
    pub total_tests: u64,
    pub passes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub kills: u64,
    pub merges: u64,
    pub success_rate: f64,
    pub killed_percent: f64,
    pub avg_depth: f64,
}

impl Stats {
    pub fn new(window_size: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                total_tests: 0,
                passes: 0,
                failures: 0,
                timeouts: 0,
                kills: 0,
                merges: 0,
                depth_sum: 0,
                depth_count: 0,
                rolling: VecDeque::with_capacity(window_size.max(1)),
                window_size: window_size.max(1),
            }),
        }
    }

    pub fn record_branch_created(&self, depth: usize) {
        let mut inner = self.inner.lock();
        inner.depth_sum += depth as u64;
        inner.depth_count += 1;
    }

    pub fn record_pass(&self) {
        let mut inner = self.inner.lock();
        inner.total_tests += 1;
        inner.passes += 1;
        Self::push_rolling(&mut inner, true);
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.total_tests += 1;
        inner.failures += 1;
        Self::push_rolling(&mut inner, false);
    }

    pub fn record_timeout(&self) {
        let mut inner = self.inner.lock();
        inner.total_tests += 1;
        inner.timeouts += 1;
        Self::push_rolling(&mut inner, false);
    }

    pub fn record_kill(&self) {
        self.inner.lock().kills += 1;
    }

    pub fn record_merge(&self) {
        self.inner.lock().merges += 1;
    }

    fn push_rolling(inner: &mut Inner, outcome: bool) {
        if inner.rolling.len() == inner.window_size {
            inner.rolling.pop_front();
        }
        inner.rolling.push_back(outcome);
    }

    /// Rolling success rate over the last `window_size` outcomes. `1.0`
    /// (vacuously) when no outcomes have been recorded yet, so the
    /// adaptive-depth law starts at `DefaultDepth` rather than the
    /// low-pass-rate branch.
    pub fn rolling_success_rate(&self) -> f64 {
        let inner = self.inner.lock();
        if inner.rolling.is_empty() {
            return 1.0;
        }
        let passes = inner.rolling.iter().filter(|&&o| o).count();
        passes as f64 / inner.rolling.len() as f64
    }

    pub fn snapshot(&self) -> QueueStats {
        let inner = self.inner.lock();
        let killed_percent = if inner.total_tests == 0 {
            0.0
        } else {
            inner.kills as f64 / inner.total_tests as f64 * 100.0
        };
        let avg_depth = if inner.depth_count == 0 {
            0.0
        } else {
            inner.depth_sum as f64 / inner.depth_count as f64
        };
        let success_rate = if inner.rolling.is_empty() {
            1.0
        } else {
            inner.rolling.iter().filter(|&&o| o).count() as f64 / inner.rolling.len() as f64
        };
        QueueStats {
            total_tests: inner.total_tests,
            passes: inner.passes,
            failures: inner.failures,
            timeouts: inner.timeouts,
            kills: inner.kills,
            merges: inner.merges,
            success_rate,
            killed_percent,
            avg_depth,
        }
    }
}
