//! 生命周期控制器与两级能力句柄。
//!
//! # 设计背景（Why）
//! - [`Lifetime`] 是只读能力：查询状态、守卫执行、登记资源、派生子作用域；
//! - [`LifetimeDefinition`] 在此基础上额外持有终止权限，两者指向同一个控制器 [`LifetimeCore`]；
//! - 父作用域通过登记表持有子控制器的强引用，子控制器不回指父作用域，拆除后引用随登记表一起释放。
//!
//! # 终止协议（How）
//! 1. Eternal 或已越过 `Canceling` 时直接返回 `false`；
//! 2. 未显式允许重入、而当前线程正处于本作用域的守卫执行中时，返回 [`LifetimeError::ReentrantTermination`]；
//! 3. 以工作表迭代的方式把自身及所有已挂载子作用域从 `Alive` 标记为 `Canceling`；
//! 4. 等待其他线程的守卫执行排空（扣除本线程自身的重入帧），超时只记录告警并置位迟到标记；
//! 5. `Canceling → Terminating`，失败说明其他线程已接手，返回 `false`；
//! 6. 自旋等待互斥位释放，此后不会再有人获取互斥位；
//! 7. 按 LIFO 释放全部资源；
//! 8. `Terminating → Terminated`，失败即不变量破坏。

use std::{
    fmt,
    ops::Deref,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, OnceLock,
        atomic::{AtomicU64 as IdSequence, Ordering as IdOrdering},
    },
};

use spin::{Mutex, MutexGuard, RwLock};
use tracing::{debug, error, trace, warn};

use crate::{
    backoff::{self, SpinWait},
    config,
    error::{LifetimeError, Result},
    reentrancy::{self, ReentrancyGuard},
    registry::Registry,
    resource::{Disposable, ReleaseFault, Resource, panic_message},
    state::{LifetimeStatus, PackedState},
};

/// 未设置标识时日志中使用的名称。
pub const ANONYMOUS_LIFETIME_ID: &str = "Anonymous";

static NEXT_LIFETIME_ID: IdSequence = IdSequence::new(1);

static ETERNAL: OnceLock<Lifetime> = OnceLock::new();
static TERMINATED: OnceLock<LifetimeDefinition> = OnceLock::new();

/// 生命周期控制器本体。
pub(crate) struct LifetimeCore {
    id: u64,
    eternal: bool,
    state: PackedState,
    registry: Mutex<Registry>,
    label: RwLock<Option<Arc<str>>>,
}

impl LifetimeCore {
    fn new(label: Option<Arc<str>>) -> Self {
        Self {
            id: NEXT_LIFETIME_ID.fetch_add(1, IdOrdering::Relaxed),
            eternal: false,
            state: PackedState::new(LifetimeStatus::Alive),
            registry: Mutex::new(Registry::new()),
            label: RwLock::new(label),
        }
    }

    fn eternal() -> Self {
        Self {
            id: NEXT_LIFETIME_ID.fetch_add(1, IdOrdering::Relaxed),
            eternal: true,
            state: PackedState::new(LifetimeStatus::Alive),
            registry: Mutex::new(Registry::discarding()),
            label: RwLock::new(Some(Arc::from("Eternal"))),
        }
    }

    pub(crate) fn status(&self) -> LifetimeStatus {
        self.state.load().status()
    }

    /// 登记表的数据锁。持有互斥位的一方进入时必然无竞争，其余读者（级联、析构）只会短暂重叠。
    fn lock_registry(&self) -> MutexGuard<'_, Registry> {
        let mut spin = SpinWait::new();
        loop {
            if let Some(guard) = self.registry.try_lock() {
                return guard;
            }
            spin.spin_once();
        }
    }

    /// 在状态不超过 `max_status` 时持有互斥位执行 `action`。
    fn with_mutex_if<T>(
        &self,
        max_status: LifetimeStatus,
        action: impl FnOnce(&mut Registry) -> T,
    ) -> Option<T> {
        if !self.state.lock_if(max_status) {
            return None;
        }
        let _bit = MutexBit(&self.state);
        let mut registry = self.lock_registry();
        Some(action(&mut registry))
    }

    /// 登记资源；被拒绝时原样交还，由调用方决定如何处置。
    pub(crate) fn try_add(&self, resource: Resource) -> core::result::Result<(), Resource> {
        // Eternal 接受一切登记，但永远不会执行。
        if self.eternal {
            return Ok(());
        }
        let mut pending = Some(resource);
        self.with_mutex_if(LifetimeStatus::Canceling, |registry| {
            if let Some(resource) = pending.take() {
                registry.push(resource);
            }
        });
        match pending {
            None => Ok(()),
            Some(rejected) => Err(rejected),
        }
    }

    fn execute_if_alive<T>(&self, action: impl FnOnce() -> T) -> Option<T> {
        if !self.state.try_enter_execution() {
            return None;
        }
        let _frame = ExecutionFrame::enter(self);
        Some(action())
    }

    pub(crate) fn terminate(&self, allow_reentrant: bool) -> Result<bool> {
        if !self.begin_termination(allow_reentrant)? {
            return Ok(false);
        }
        self.destruct(allow_reentrant);
        self.finish_termination();
        Ok(true)
    }

    /// 终止协议的前半段：检查、级联标记、排空、推进到 `Terminating` 并等待互斥位释放。
    ///
    /// 返回 `Ok(true)` 表示调用方赢得了拆除权，必须继续析构并调用 [`Self::finish_termination`]。
    fn begin_termination(&self, allow_reentrant: bool) -> Result<bool> {
        if self.eternal || self.status() > LifetimeStatus::Canceling {
            return Ok(false);
        }

        let own_frames = reentrancy::depth(self.id);
        if !allow_reentrant && own_frames > 0 {
            return Err(LifetimeError::ReentrantTermination {
                lifetime: self.to_string(),
            });
        }

        self.mark_canceling_recursively();

        let timeout = config::drain_timeout();
        let drained = backoff::spin_until(Some(timeout), || {
            self.state.load().executing() <= own_frames
        });
        if !drained {
            warn!(
                lifetime = %self,
                timeout_ms = timeout.as_millis() as u64,
                "can't wait for `execute_if_alive` completed on other thread; keep termination"
            );
            self.state.mark_late_warning();
        }

        // 已被其他线程推进。
        if !self.state.advance_status_if(LifetimeStatus::Canceling) {
            return Ok(false);
        }
        trace!(lifetime = %self, "lifetime entered Terminating");

        backoff::spin_until(None, || !self.state.load().is_locked());
        Ok(true)
    }

    fn finish_termination(&self) {
        assert!(
            self.state.advance_status_if(LifetimeStatus::Terminating),
            "{self}: bad status for destructuring finish"
        );
        trace!(lifetime = %self, "lifetime terminated");
    }

    /// 自上而下把整棵子树从 `Alive` 标记为 `Canceling`。
    ///
    /// 只是让后代尽早拒绝新的守卫执行；登记表正被他人持有时直接跳过，
    /// 被跳过的子作用域会在父作用域析构时被终止。
    fn mark_canceling_recursively(&self) {
        let mut worklist = Vec::new();
        if !self.cancel_and_collect(&mut worklist) {
            return;
        }
        while let Some(child) = worklist.pop() {
            child.cancel_and_collect(&mut worklist);
        }
    }

    fn cancel_and_collect(&self, worklist: &mut Vec<Arc<LifetimeCore>>) -> bool {
        if self.eternal || !self.state.advance_status_if(LifetimeStatus::Alive) {
            return false;
        }
        trace!(lifetime = %self, "lifetime entered Canceling");
        if let Some(registry) = self.registry.try_lock() {
            registry.collect_children(worklist);
        }
        true
    }

    /// 取走登记表，此后登记表处于终态。
    fn take_for_teardown(&self) -> Vec<Resource> {
        let word = self.state.load();
        assert_eq!(
            word.status(),
            LifetimeStatus::Terminating,
            "{self}: bad status for destructuring start"
        );
        assert!(!word.is_locked(), "{self}: mutex must be released at this point");
        self.lock_registry().take()
    }

    /// 自下而上的析构，以显式帧栈代替递归。
    ///
    /// 每一帧对应一个已进入 `Terminating` 的控制器及其尚未释放的资源；弹出的资源若是子控制器，
    /// 且本线程赢得了它的拆除权，就压入新帧，子树释放完毕后再回到父帧继续 LIFO。
    fn destruct(&self, allow_reentrant: bool) {
        let mut stack = vec![TeardownFrame {
            owner: None,
            pending: self.take_for_teardown(),
        }];

        while let Some(frame) = stack.last_mut() {
            let Some(resource) = frame.pending.pop() else {
                if let Some(finished) = stack.pop().and_then(|frame| frame.owner) {
                    finished.finish_termination();
                }
                continue;
            };

            let owner: &LifetimeCore = frame.owner.as_deref().unwrap_or(self);
            let fault = match resource {
                Resource::Child(child) => {
                    match panic::catch_unwind(AssertUnwindSafe(|| {
                        child.begin_termination(allow_reentrant)
                    })) {
                        Ok(Ok(true)) => {
                            let pending = child.take_for_teardown();
                            stack.push(TeardownFrame {
                                owner: Some(child),
                                pending,
                            });
                            continue;
                        }
                        Ok(Ok(false)) => continue,
                        Ok(Err(source)) => ReleaseFault::ChildRefused {
                            child: child.to_string(),
                            source,
                        },
                        Err(payload) => ReleaseFault::ChildPanicked {
                            child: child.to_string(),
                            message: panic_message(payload),
                        },
                    }
                }
                other => match other.release(allow_reentrant) {
                    Ok(()) => continue,
                    Err(fault) => fault,
                },
            };
            error!(lifetime = %owner, %fault, "exception on termination of resource");
        }
    }

    /// 交出登记表，供丢弃未终止的作用域树时逐层展开。
    pub(crate) fn into_registry(self) -> Registry {
        self.registry.into_inner()
    }

    fn compact(&self) -> usize {
        let dropped = self
            .with_mutex_if(LifetimeStatus::Canceling, Registry::compact)
            .unwrap_or(0);
        if dropped > 0 {
            debug!(lifetime = %self, dropped, "dropped obsolete nested lifetimes");
        }
        dropped
    }
}

impl fmt::Display for LifetimeCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let word = self.state.load();
        let label = self.label.read();
        write!(
            f,
            "Lifetime `{}` [{}, executing={}, resources=",
            label.as_deref().unwrap_or(ANONYMOUS_LIFETIME_ID),
            word.status(),
            word.executing()
        )?;
        match self.registry.try_lock() {
            Some(registry) => write!(f, "{}]", registry.len()),
            None => f.write_str("?]"),
        }
    }
}

struct TeardownFrame {
    owner: Option<Arc<LifetimeCore>>,
    pending: Vec<Resource>,
}

/// 持有状态字互斥位的守卫，析构时以整字 CAS 释放。
struct MutexBit<'a>(&'a PackedState);

impl Drop for MutexBit<'_> {
    fn drop(&mut self) {
        self.0.unlock();
    }
}

/// 一层守卫执行：进入时已经完成计数加一，析构时回收两个计数（包括 panic 展开路径）。
struct ExecutionFrame<'a> {
    core: &'a LifetimeCore,
    _reentrancy: ReentrancyGuard,
}

impl<'a> ExecutionFrame<'a> {
    fn enter(core: &'a LifetimeCore) -> Self {
        Self {
            core,
            _reentrancy: ReentrancyGuard::enter(core.id),
        }
    }
}

impl Drop for ExecutionFrame<'_> {
    fn drop(&mut self) {
        let after = self.core.state.exit_execution();
        if after.late_warning() {
            error!(
                lifetime = %self.core,
                timeout_ms = config::drain_timeout().as_millis() as u64,
                "`execute_if_alive` after termination took too much time"
            );
        }
    }
}

/// 生命周期的只读能力句柄。
///
/// # 契约说明（What）
/// - 克隆只增加引用计数，所有克隆观察同一个控制器；
/// - 句柄本身不能终止作用域，终止权限属于 [`LifetimeDefinition`]；
/// - 丢弃全部句柄而不终止，会让登记的资源永远不被释放（与 Eternal 的语义一致）。
#[derive(Clone)]
pub struct Lifetime {
    core: Arc<LifetimeCore>,
}

impl Lifetime {
    /// 永不终止的全局生命周期：接受并丢弃一切登记。
    pub fn eternal() -> Lifetime {
        ETERNAL
            .get_or_init(|| Lifetime {
                core: Arc::new(LifetimeCore::eternal()),
            })
            .clone()
    }

    /// 已终止的全局生命周期：所有守卫操作都是空操作。
    pub fn terminated() -> Lifetime {
        LifetimeDefinition::terminated().lifetime
    }

    pub fn status(&self) -> LifetimeStatus {
        self.core.status()
    }

    pub fn is_alive(&self) -> bool {
        self.status() == LifetimeStatus::Alive
    }

    pub fn is_not_alive(&self) -> bool {
        !self.is_alive()
    }

    pub fn is_eternal(&self) -> bool {
        self.core.eternal
    }

    /// 日志标识，未设置时为 [`ANONYMOUS_LIFETIME_ID`]。
    pub fn id(&self) -> Arc<str> {
        self.core
            .label
            .read()
            .clone()
            .unwrap_or_else(|| Arc::from(ANONYMOUS_LIFETIME_ID))
    }

    /// 仅在作用域存活时执行 `action`。
    ///
    /// # 契约说明（What）
    /// - 返回 `None` 表示作用域已不处于 `Alive`，`action` 没有被调用；
    /// - 执行期间作用域的终止流程会等待本次调用结束（受排空超时约束）；
    /// - 在 `action` 内部终止同一作用域必须使用 `terminate(true)`。
    pub fn execute_if_alive<T>(&self, action: impl FnOnce() -> T) -> Option<T> {
        self.core.execute_if_alive(action)
    }

    /// 登记终止回调；作用域已越过 `Canceling` 时返回 `false` 且不保存回调。
    pub fn on_termination_if_alive(&self, action: impl FnOnce() + Send + 'static) -> bool {
        self.core.try_add(Resource::action(action)).is_ok()
    }

    /// 登记终止回调；被拒绝时立即执行回调，然后返回 [`LifetimeError::NotAccepting`]。
    pub fn on_termination(&self, action: impl FnOnce() + Send + 'static) -> Result<()> {
        self.add_or_release(Resource::action(action))
    }

    /// 登记外部句柄；作用域已越过 `Canceling` 时返回 `false`，句柄原样丢弃而不关闭。
    pub fn on_dispose_if_alive(&self, disposable: impl Disposable) -> bool {
        self.core.try_add(Resource::disposable(disposable)).is_ok()
    }

    /// 登记外部句柄；被拒绝时立即关闭句柄，然后返回 [`LifetimeError::NotAccepting`]。
    pub fn on_dispose(&self, disposable: impl Disposable) -> Result<()> {
        self.add_or_release(Resource::disposable(disposable))
    }

    fn add_or_release(&self, resource: Resource) -> Result<()> {
        let Err(rejected) = self.core.try_add(resource) else {
            return Ok(());
        };
        if let Err(fault) = rejected.release(true) {
            error!(lifetime = %self, %fault, "exception on termination of rejected resource");
        }
        Err(LifetimeError::NotAccepting {
            lifetime: self.to_string(),
            status: self.status(),
        })
    }

    /// 非 `Alive` 时返回 [`LifetimeError::NotAlive`]，便于在协作式取消点使用 `?`。
    pub fn ensure_alive(&self) -> Result<()> {
        let status = self.status();
        if status == LifetimeStatus::Alive {
            Ok(())
        } else {
            Err(LifetimeError::NotAlive {
                lifetime: self.to_string(),
                status,
            })
        }
    }

    /// 阻塞当前线程直到作用域进入 `Terminated`。对 Eternal 调用将永远不返回。
    pub fn wait_termination(&self) {
        backoff::spin_until(None, || self.status() == LifetimeStatus::Terminated);
    }

    /// 登记表中的条目数（包括尚未被压缩的已终止子作用域）。
    pub fn resource_count(&self) -> usize {
        self.core.lock_registry().len()
    }

    /// 正在进行的守卫执行数量。
    pub fn executing_count(&self) -> u32 {
        self.core.state.load().executing()
    }

    /// 从登记表中摘除已终止的子作用域，返回摘除的条目数。作用域越过 `Canceling` 后为空操作。
    pub fn compact(&self) -> usize {
        self.core.compact()
    }

    /// 判断两个句柄是否指向同一个控制器。
    pub fn ptr_eq(&self, other: &Lifetime) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }

    pub(crate) fn core(&self) -> &Arc<LifetimeCore> {
        &self.core
    }

    /// 把 `child` 挂载为本作用域的资源；本作用域已越过 `Canceling` 时立即终止 `child`。
    pub(crate) fn attach(&self, child: &LifetimeDefinition) {
        assert!(!child.is_eternal(), "can't attach eternal lifetime");
        if child.is_not_alive() {
            return;
        }
        if self.core.try_add(Resource::Child(child.core_arc())).is_err() {
            if let Err(err) = child.terminate(false) {
                error!(lifetime = %self, child = %child, %err, "can't terminate rejected nested lifetime");
            }
        }
    }
}

impl fmt::Display for Lifetime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.core, f)
    }
}

impl fmt::Debug for Lifetime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.core, f)
    }
}

/// 生命周期控制器：在 [`Lifetime`] 的全部能力之上持有终止权限。
///
/// # 教案式说明
/// - **意图 (Why)**：把“谁能结束作用域”与“谁能使用作用域”分开，上层只向协作者传递 [`Lifetime`]；
/// - **契约 (What)**：通过 `Deref` 暴露只读能力；[`Self::terminate`] 可并发、可重复调用，
///   恰好一个调用者完成拆除并得到 `Ok(true)`；
/// - **风险 (Trade-offs)**：克隆出的多个定义共享终止权限，应只在确实需要转移所有权时克隆。
#[derive(Clone)]
pub struct LifetimeDefinition {
    lifetime: Lifetime,
}

impl LifetimeDefinition {
    /// 创建独立的根作用域。
    pub fn new() -> Self {
        Self::from_core(Arc::new(LifetimeCore::new(None)))
    }

    /// 创建带日志标识的根作用域。
    pub fn with_id(id: impl Into<Arc<str>>) -> Self {
        Self::from_core(Arc::new(LifetimeCore::new(Some(id.into()))))
    }

    /// 全局共享、创建即终止的控制器。
    pub fn terminated() -> LifetimeDefinition {
        TERMINATED
            .get_or_init(|| {
                let definition = LifetimeDefinition::with_id("Terminated");
                if let Err(err) = definition.terminate(false) {
                    error!(lifetime = %definition, %err, "can't terminate the shared terminated lifetime");
                }
                definition
            })
            .clone()
    }

    pub(crate) fn from_core(core: Arc<LifetimeCore>) -> Self {
        Self {
            lifetime: Lifetime { core },
        }
    }

    pub(crate) fn core_arc(&self) -> Arc<LifetimeCore> {
        Arc::clone(&self.lifetime.core)
    }

    /// 更新日志标识。
    pub fn set_id(&self, id: impl Into<Arc<str>>) {
        *self.lifetime.core.label.write() = Some(id.into());
    }

    /// 只读能力句柄。
    pub fn lifetime(&self) -> &Lifetime {
        &self.lifetime
    }

    /// 请求终止。
    ///
    /// # 契约说明（What）
    /// - `Ok(true)`：本次调用完成了拆除；`Ok(false)`：Eternal、已被他人终止或正在被他人终止；
    /// - `allow_reentrant = false` 且当前线程处于本作用域的守卫执行中时返回
    ///   [`LifetimeError::ReentrantTermination`]，状态不变；
    /// - `allow_reentrant` 会原样传递给所有子作用域的终止调用。
    pub fn terminate(&self, allow_reentrant: bool) -> Result<bool> {
        self.lifetime.core.terminate(allow_reentrant)
    }
}

impl Default for LifetimeDefinition {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for LifetimeDefinition {
    type Target = Lifetime;

    fn deref(&self) -> &Lifetime {
        &self.lifetime
    }
}

impl fmt::Display for LifetimeDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.lifetime, f)
    }
}

impl fmt::Debug for LifetimeDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.lifetime, f)
    }
}
