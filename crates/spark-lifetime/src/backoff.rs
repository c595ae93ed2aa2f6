//! 有界自旋等待：先忙等、再让出时间片、最后短暂休眠。
//!
//! 终止流程中的两处阻塞（排空守卫执行、等待互斥位释放）都基于此工具。
//! 在 loom 模型下统一改为 `loom::thread::yield_now()`，让模型调度器有机会切换线程。

use std::time::{Duration, Instant};

#[cfg(not(any(loom, spark_loom)))]
const SPIN_LIMIT: u32 = 64;
#[cfg(not(any(loom, spark_loom)))]
const YIELD_LIMIT: u32 = 64;
#[cfg(not(any(loom, spark_loom)))]
const PARK_INTERVAL: Duration = Duration::from_millis(1);

pub(crate) struct SpinWait {
    count: u32,
}

impl SpinWait {
    pub(crate) const fn new() -> Self {
        Self { count: 0 }
    }

    #[cfg(not(any(loom, spark_loom)))]
    pub(crate) fn spin_once(&mut self) {
        if self.count < SPIN_LIMIT {
            core::hint::spin_loop();
        } else if self.count < SPIN_LIMIT + YIELD_LIMIT {
            std::thread::yield_now();
        } else {
            std::thread::sleep(PARK_INTERVAL);
        }
        self.count = self.count.saturating_add(1);
    }

    #[cfg(any(loom, spark_loom))]
    pub(crate) fn spin_once(&mut self) {
        self.count = self.count.saturating_add(1);
        loom::thread::yield_now();
    }
}

/// 自旋直到 `condition` 成立；`timeout` 为 `None` 时不设上限。
///
/// 返回 `false` 表示超时时条件仍未满足。
pub(crate) fn spin_until(timeout: Option<Duration>, mut condition: impl FnMut() -> bool) -> bool {
    if condition() {
        return true;
    }
    let deadline = timeout.map(|limit| Instant::now() + limit);
    let mut spin = SpinWait::new();
    loop {
        spin.spin_once();
        if condition() {
            return true;
        }
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return false;
        }
    }
}

#[cfg(all(test, not(any(loom, spark_loom))))]
mod tests {
    use super::*;

    #[test]
    fn satisfied_condition_returns_immediately() {
        assert!(spin_until(Some(Duration::ZERO), || true));
    }

    #[test]
    fn unsatisfied_condition_times_out() {
        let started = Instant::now();
        assert!(!spin_until(Some(Duration::from_millis(20)), || false));
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn condition_is_polled_until_true() {
        let mut polls = 0;
        assert!(spin_until(None, || {
            polls += 1;
            polls == 200
        }));
        assert_eq!(polls, 200);
    }
}
