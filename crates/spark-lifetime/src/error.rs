//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 收敛生命周期内核向调用方暴露的错误语义：只有“用法错误”与“显式拒绝”会以 `Err` 形式返回；
//! - “不再存活”在守卫执行上以 `Option::None` 表达，在条件登记上以 `false` 表达，属于正常竞态结果。
//!
//! ## 设计要求（What）
//! - 所有错误实现 `thiserror::Error`，可直接交给 `anyhow` 等上层框架；
//! - 变体携带生命周期的可读描述（`Display` 输出），便于定位是哪个作用域出了问题；
//! - 内核自身的不变量破坏以 `assert!` 中止当前操作，不进入本枚举。

use thiserror::Error;

use crate::state::LifetimeStatus;

/// 生命周期内核的统一结果别名。
pub type Result<T, E = LifetimeError> = core::result::Result<T, E>;

/// 生命周期内核的错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：区分“调用方用错了 API”与“竞态下作用域已经结束”两类情况，
///   前者需要修正代码，后者只需按业务语义降级；
/// - **契约 (What)**：所有变体均为 `Send + Sync + 'static`，可以跨线程传播；
/// - **设计权衡 (Trade-offs)**：`lifetime` 字段保存格式化后的字符串而非句柄，避免错误值延长作用域的存活期。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LifetimeError {
    /// 在自身 `execute_if_alive` 内部调用了 `terminate(false)`。
    ///
    /// - **意图 (Why)**：守卫执行内部终止自身会让排空等待永远等不到计数归零，属于编程错误；
    /// - **契约 (What)**：操作被拒绝，生命周期状态保持不变；如确需如此，改用 `terminate(true)`。
    #[error(
        "{lifetime}: can't terminate lifetime under `execute_if_alive` because termination doesn't support this; use `terminate(true)`"
    )]
    ReentrantTermination { lifetime: String },

    /// 抛错式登记（`on_termination` / `on_dispose`）发生在作用域越过 `Canceling` 之后。
    ///
    /// - **契约 (What)**：返回该错误之前，被拒绝的资源已经就地释放过一次；
    ///   若只想静默竞争，请使用 `*_if_alive` 变体。
    #[error(
        "{lifetime}: can't add termination resource while lifetime is {status}; consider `on_termination_if_alive`"
    )]
    NotAccepting {
        lifetime: String,
        status: LifetimeStatus,
    },

    /// [`Lifetime::ensure_alive`](crate::Lifetime::ensure_alive) 发现作用域已不处于 `Alive`。
    #[error("{lifetime}: lifetime is not alive ({status})")]
    NotAlive {
        lifetime: String,
        status: LifetimeStatus,
    },

    /// 配置校验或解析失败。
    #[error("invalid lifetime configuration: {detail}")]
    InvalidConfig { detail: String },
}

impl LifetimeError {
    /// 判断错误是否源自作用域已结束的竞态，而非调用方的用法错误。
    pub fn is_not_alive(&self) -> bool {
        matches!(
            self,
            LifetimeError::NotAccepting { .. } | LifetimeError::NotAlive { .. }
        )
    }
}
