//! 打包原子状态字：执行计数、生命周期状态、自旋互斥位与迟到告警位共享同一个 `AtomicU64`。
//!
//! # 设计总览（Why）
//! - 组合读取（“状态仍为 Alive 且互斥位空闲”）必须是一次原子观测，拆成多个原子量会引入检查后使用的竞态；
//! - 所有转换都以整字 CAS 完成，调用方永远不会看到字段之间不一致的中间态。
//!
//! # 位布局（What）
//! | 位区间 | 字段 |
//! | --- | --- |
//! | `0..32` | 正在进行的守卫执行计数 |
//! | `32..34` | [`LifetimeStatus`] |
//! | `34` | 登记表自旋互斥位 |
//! | `35` | 排空超时后的迟到告警位 |

use core::fmt;

#[cfg(not(any(loom, spark_loom)))]
use core::sync::atomic::{AtomicU64, Ordering};
#[cfg(any(loom, spark_loom))]
use loom::sync::atomic::{AtomicU64, Ordering};

use crate::backoff::SpinWait;

const EXECUTING_MASK: u64 = (1 << 32) - 1;
const STATUS_SHIFT: u32 = 32;
const STATUS_MASK: u64 = 0b11 << STATUS_SHIFT;
const MUTEX_BIT: u64 = 1 << 34;
const LATE_WARNING_BIT: u64 = 1 << 35;

/// 生命周期状态，只能按 `Alive → Canceling → Terminating → Terminated` 单调前进。
///
/// - `Alive`：接受守卫执行与资源登记；
/// - `Canceling`：拒绝新的守卫执行，但仍接受登记（级联中的子作用域可能仍在挂载），终止方正在排空；
/// - `Terminating`：登记表已冻结，资源按 LIFO 释放中；
/// - `Terminated`：终态，登记表已丢弃。
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum LifetimeStatus {
    Alive = 0,
    Canceling = 1,
    Terminating = 2,
    Terminated = 3,
}

impl LifetimeStatus {
    /// 返回序列中的下一个状态；`Terminated` 没有后继。
    pub const fn next(self) -> Option<Self> {
        match self {
            LifetimeStatus::Alive => Some(LifetimeStatus::Canceling),
            LifetimeStatus::Canceling => Some(LifetimeStatus::Terminating),
            LifetimeStatus::Terminating => Some(LifetimeStatus::Terminated),
            LifetimeStatus::Terminated => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            LifetimeStatus::Alive => "Alive",
            LifetimeStatus::Canceling => "Canceling",
            LifetimeStatus::Terminating => "Terminating",
            LifetimeStatus::Terminated => "Terminated",
        }
    }

    const fn from_bits(bits: u64) -> Self {
        match bits & 0b11 {
            0 => LifetimeStatus::Alive,
            1 => LifetimeStatus::Canceling,
            2 => LifetimeStatus::Terminating,
            _ => LifetimeStatus::Terminated,
        }
    }
}

impl fmt::Display for LifetimeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 状态字的一次快照，只做位运算，不触碰原子量。
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct StateWord(u64);

impl StateWord {
    pub(crate) const fn executing(self) -> u32 {
        (self.0 & EXECUTING_MASK) as u32
    }

    pub(crate) const fn status(self) -> LifetimeStatus {
        LifetimeStatus::from_bits((self.0 & STATUS_MASK) >> STATUS_SHIFT)
    }

    pub(crate) const fn is_locked(self) -> bool {
        self.0 & MUTEX_BIT != 0
    }

    pub(crate) const fn late_warning(self) -> bool {
        self.0 & LATE_WARNING_BIT != 0
    }

    const fn with_status(self, status: LifetimeStatus) -> Self {
        Self((self.0 & !STATUS_MASK) | ((status as u64) << STATUS_SHIFT))
    }

    const fn with_lock(self, locked: bool) -> Self {
        if locked {
            Self(self.0 | MUTEX_BIT)
        } else {
            Self(self.0 & !MUTEX_BIT)
        }
    }

    const fn with_late_warning(self) -> Self {
        Self(self.0 | LATE_WARNING_BIT)
    }
}

impl fmt::Debug for StateWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateWord")
            .field("executing", &self.executing())
            .field("status", &self.status())
            .field("locked", &self.is_locked())
            .field("late_warning", &self.late_warning())
            .finish()
    }
}

/// 控制器持有的打包原子状态。
pub(crate) struct PackedState {
    word: AtomicU64,
}

impl PackedState {
    pub(crate) fn new(status: LifetimeStatus) -> Self {
        Self {
            word: AtomicU64::new(StateWord(0).with_status(status).0),
        }
    }

    pub(crate) fn load(&self) -> StateWord {
        StateWord(self.word.load(Ordering::Acquire))
    }

    fn compare_exchange(&self, current: StateWord, new: StateWord) -> Result<(), StateWord> {
        self.word
            .compare_exchange_weak(current.0, new.0, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(StateWord)
    }

    /// 守卫执行入口：仅在 `Alive` 时把执行计数加一。
    ///
    /// CAS 失败只意味着其他字段被并发修改，重新读取后继续；一旦读到非 `Alive` 立即放弃。
    pub(crate) fn try_enter_execution(&self) -> bool {
        let mut current = self.load();
        loop {
            if current.status() != LifetimeStatus::Alive {
                return false;
            }
            assert!(
                current.executing() < u32::MAX,
                "execution counter overflow: {current:?}"
            );
            match self.compare_exchange(current, StateWord(current.0 + 1)) {
                Ok(()) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// 守卫执行出口，返回递减之后的状态字。
    pub(crate) fn exit_execution(&self) -> StateWord {
        let previous = StateWord(self.word.fetch_sub(1, Ordering::AcqRel));
        debug_assert!(previous.executing() > 0, "unbalanced execution exit");
        StateWord(previous.0 - 1)
    }

    /// 在状态不超过 `max_status` 时抢占互斥位。
    ///
    /// 互斥位被占用时自旋等待；若等待期间状态越过阈值则返回 `false`。
    pub(crate) fn lock_if(&self, max_status: LifetimeStatus) -> bool {
        let mut spin = SpinWait::new();
        let mut current = self.load();
        loop {
            if current.status() > max_status {
                return false;
            }
            if current.is_locked() {
                spin.spin_once();
                current = self.load();
                continue;
            }
            match self.compare_exchange(current, current.with_lock(true)) {
                Ok(()) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// 释放互斥位。执行计数与状态可能已被并发修改，因此同样走整字 CAS。
    pub(crate) fn unlock(&self) {
        let mut current = self.load();
        loop {
            assert!(current.is_locked(), "mutex bit must be held: {current:?}");
            match self.compare_exchange(current, current.with_lock(false)) {
                Ok(()) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// 当前状态恰为 `expected` 时推进到下一个状态。
    pub(crate) fn advance_status_if(&self, expected: LifetimeStatus) -> bool {
        let Some(next) = expected.next() else {
            return false;
        };
        let mut current = self.load();
        loop {
            if current.status() != expected {
                return false;
            }
            match self.compare_exchange(current, current.with_status(next)) {
                Ok(()) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub(crate) fn mark_late_warning(&self) {
        let mut current = self.load();
        loop {
            if current.late_warning() {
                return;
            }
            match self.compare_exchange(current, current.with_late_warning()) {
                Ok(()) => return,
                Err(actual) => current = actual,
            }
        }
    }
}
