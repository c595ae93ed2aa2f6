//! 轮换作用域链：在固定父作用域下始终只保留一个“当前”子作用域。
//!
//! # 设计背景（Why）
//! - 视图切换、重连、订阅替换等场景需要“开启新一轮之前先结束上一轮”，且两步之间不能出现两个同时存活的轮次；
//! - 每一轮子作用域都会登记在父作用域中，长期轮换会让父登记表堆积已终止的条目，因此需要周期性压缩。
//!
//! # 执行逻辑（How）
//! 1. 创建一次性的、已终止的占位控制器，并用原子交换把它换入“当前”槽位，取回旧值；
//! 2. 以允许重入的方式终止旧值（可能正运行在父作用域自身的级联中），失败只记录日志；
//! 3. 构造替代者：共享的 Terminated 单例，或父作用域下新建的子作用域；
//! 4. 在替代者自身的守卫执行中运行可选的初始化逻辑，失败则终止替代者；
//! 5. 以占位控制器为期望值 CAS 安装替代者；竞争失败说明已有其他轮换接手，终止替代者；
//! 6. 每经过配置的成功轮换次数（父作用域为 Eternal 时跳过）压缩一次父登记表。

use std::{
    convert::Infallible,
    sync::{
        Arc, Weak,
        atomic::{AtomicU32, Ordering},
    },
};

use arc_swap::ArcSwap;
use tracing::debug;

use crate::{
    config,
    lifetime::{Lifetime, LifetimeCore, LifetimeDefinition},
    nested::{TerminateGuard, terminate_logged},
};

/// 轮换作用域链。
///
/// # 契约说明（What）
/// - [`Self::next`] 连续调用 M 次得到 M 个互不相同的子作用域，每一个都会被下一次轮换终止；
/// - 父作用域终止时当前轮次随之终止，“当前”槽位回到 Terminated；
/// - 克隆共享同一条链。
#[derive(Clone)]
pub struct SequentialLifetimes {
    inner: Arc<ChainState>,
}

struct ChainState {
    parent: Lifetime,
    current: ArcSwap<LifetimeCore>,
    rotations: Option<AtomicU32>,
    compaction_period: u32,
}

impl SequentialLifetimes {
    pub fn new(parent: &Lifetime) -> Self {
        let rotations = (!parent.is_eternal()).then(|| AtomicU32::new(0));
        let inner = Arc::new(ChainState {
            parent: parent.clone(),
            current: ArcSwap::new(LifetimeDefinition::terminated().core_arc()),
            rotations,
            compaction_period: config::rotation_compaction_period(),
        });

        // 父作用域持有的是弱引用，链被丢弃后钩子自然失效。
        let hook: Weak<ChainState> = Arc::downgrade(&inner);
        parent.on_termination_if_alive(move || {
            if let Some(chain) = hook.upgrade() {
                chain.retire_current();
            }
        });

        Self { inner }
    }

    /// 结束当前轮次并开启新一轮。
    pub fn next(&self) -> LifetimeDefinition {
        match self.inner.rotate(false, |_| Ok::<(), Infallible>(())) {
            Ok(next) => next,
            Err(never) => match never {},
        }
    }

    /// 结束当前轮次，槽位回到 Terminated。
    pub fn terminate_current(&self) {
        self.inner.retire_current();
    }

    /// 开启新一轮，并在新轮次的守卫执行中运行 `init`。
    ///
    /// `init` 失败时新轮次被终止，错误原样返回；槽位中保留的是已终止的轮次。
    pub fn define_next<E>(
        &self,
        init: impl FnOnce(&LifetimeDefinition) -> Result<(), E>,
    ) -> Result<LifetimeDefinition, E> {
        self.inner.rotate(false, init)
    }

    /// 当前轮次是否已不再存活。
    pub fn is_terminated(&self) -> bool {
        self.current().is_not_alive()
    }

    /// 当前轮次的只读句柄。
    pub fn current(&self) -> Lifetime {
        LifetimeDefinition::from_core(self.inner.current.load_full())
            .lifetime()
            .clone()
    }

    pub fn parent(&self) -> &Lifetime {
        &self.inner.parent
    }
}

impl ChainState {
    fn retire_current(&self) {
        match self.rotate(true, |_| Ok::<(), Infallible>(())) {
            Ok(_) => {}
            Err(never) => match never {},
        }
    }

    fn rotate<E>(
        &self,
        use_terminated: bool,
        init: impl FnOnce(&LifetimeDefinition) -> Result<(), E>,
    ) -> Result<LifetimeDefinition, E> {
        let placeholder = LifetimeDefinition::new();
        let _ = terminate_logged(&placeholder, false);
        let placeholder = placeholder.core_arc();

        let previous = LifetimeDefinition::from_core(self.current.swap(Arc::clone(&placeholder)));
        let _ = terminate_logged(&previous, true);

        let next = if use_terminated {
            LifetimeDefinition::terminated()
        } else {
            self.parent.create_nested()
        };

        let outcome = {
            // 析构顺序：先按需终止新轮次，再安装到槽位；初始化失败或展开时同样如此。
            let _install = InstallGuard {
                chain: self,
                placeholder: &placeholder,
                next: &next,
            };
            let terminate_on_failure = TerminateGuard::new(&next);
            let outcome = match next.execute_if_alive(|| init(&next)) {
                Some(Err(err)) => Err(err),
                _ => Ok(()),
            };
            if outcome.is_ok() {
                terminate_on_failure.disarm();
            }
            outcome
        };

        // 初始化失败的轮换不计入压缩周期。
        if outcome.is_ok() {
            self.compact_parent_periodically();
        }
        outcome.map(|()| next)
    }

    fn install(&self, placeholder: &Arc<LifetimeCore>, next: &LifetimeDefinition) {
        let previous = self.current.compare_and_swap(placeholder, next.core_arc());
        if !Arc::ptr_eq(&*previous, placeholder) {
            // 其他轮换已经替换了占位者，本轮的替代者作废。
            let _ = terminate_logged(next, true);
        }
    }

    fn compact_parent_periodically(&self) {
        let Some(rotations) = self.rotations.as_ref() else {
            return;
        };
        if rotations.fetch_add(1, Ordering::AcqRel) + 1 < self.compaction_period {
            return;
        }
        let mut observed = rotations.load(Ordering::Acquire);
        loop {
            if observed < self.compaction_period {
                return;
            }
            match rotations.compare_exchange_weak(
                observed,
                0,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => observed = actual,
            }
        }
        let dropped = self.parent.compact();
        debug!(
            parent = %self.parent,
            dropped,
            "compacted parent lifetime after rotations"
        );
    }
}

/// 无论初始化成功、失败还是展开，都把替代者安装到槽位中。
struct InstallGuard<'a> {
    chain: &'a ChainState,
    placeholder: &'a Arc<LifetimeCore>,
    next: &'a LifetimeDefinition,
}

impl Drop for InstallGuard<'_> {
    fn drop(&mut self) {
        self.chain.install(self.placeholder, self.next);
    }
}

impl std::fmt::Debug for SequentialLifetimes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequentialLifetimes")
            .field("parent", &self.inner.parent)
            .field("current", &self.current())
            .finish()
    }
}
