//! 终止资源：生命周期拆除时恰好释放一次的对象。
//!
//! # 设计背景（Why）
//! - 登记表里只会出现三类东西：一次性回调、带关闭操作的外部句柄、嵌套的子控制器；
//! - 以显式的和类型承载这三类资源，释放逻辑穷举匹配，不做运行时类型探测。
//!
//! # 契约说明（What）
//! - 单个资源释放时的 panic、错误返回或子作用域拒绝终止都会被转换为 [`ReleaseFault`]，
//!   由调用方记录日志后继续释放其余资源；
//! - [`Disposable`] 由外部实现，`dispose` 只会被调用一次。

use std::{
    any::Any,
    borrow::Cow,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use thiserror::Error;

use crate::{error::LifetimeError, lifetime::LifetimeCore};

/// 资源释放时可返回的装箱错误。
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// 带显式关闭操作的外部资源，例如套接字、订阅句柄或文件。
///
/// # 契约说明（What）
/// - `dispose` 在所属生命周期进入 `Terminating` 后被调用恰好一次；
/// - 返回的错误只会被记录日志，不会阻止同一作用域中其他资源的释放；
/// - `label` 仅用于日志，默认返回类型名。
pub trait Disposable: Send + 'static {
    fn dispose(&mut self) -> Result<(), BoxError>;

    fn label(&self) -> Cow<'static, str> {
        Cow::Borrowed(core::any::type_name::<Self>())
    }
}

/// 登记表中的资源条目。
pub(crate) enum Resource {
    Action(Box<dyn FnOnce() + Send + 'static>),
    Disposable(Box<dyn Disposable>),
    Child(Arc<LifetimeCore>),
}

/// 单个资源释放失败的原因。
#[derive(Debug, Error)]
pub(crate) enum ReleaseFault {
    #[error("termination action panicked: {0}")]
    ActionPanicked(String),
    #[error("disposable `{label}` failed: {source}")]
    DisposeFailed {
        label: Cow<'static, str>,
        #[source]
        source: BoxError,
    },
    #[error("disposable `{label}` panicked: {message}")]
    DisposePanicked {
        label: Cow<'static, str>,
        message: String,
    },
    #[error("nested {child} refused termination: {source}")]
    ChildRefused {
        child: String,
        #[source]
        source: LifetimeError,
    },
    #[error("nested {child} panicked during termination: {message}")]
    ChildPanicked { child: String, message: String },
}

impl Resource {
    pub(crate) fn action(action: impl FnOnce() + Send + 'static) -> Self {
        Resource::Action(Box::new(action))
    }

    pub(crate) fn disposable(disposable: impl Disposable) -> Self {
        Resource::Disposable(Box::new(disposable))
    }

    pub(crate) fn child(&self) -> Option<&Arc<LifetimeCore>> {
        match self {
            Resource::Child(child) => Some(child),
            _ => None,
        }
    }

    /// 已经越过 `Canceling` 的子控制器可以从登记表中摘除。
    ///
    /// `Canceling` 的子作用域不能摘除：它仍可能在接受登记，父作用域的析构还要负责终止它。
    pub(crate) fn is_obsolete_child(&self) -> bool {
        self.child()
            .is_some_and(|child| child.status() >= crate::LifetimeStatus::Terminating)
    }

    /// 释放资源，任何失败都以 [`ReleaseFault`] 返回而不向上展开。
    pub(crate) fn release(self, allow_reentrant: bool) -> Result<(), ReleaseFault> {
        match self {
            Resource::Action(action) => panic::catch_unwind(AssertUnwindSafe(action))
                .map_err(|payload| ReleaseFault::ActionPanicked(panic_message(payload))),
            Resource::Disposable(mut disposable) => {
                match panic::catch_unwind(AssertUnwindSafe(|| disposable.dispose())) {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(source)) => Err(ReleaseFault::DisposeFailed {
                        label: disposable.label(),
                        source,
                    }),
                    Err(payload) => Err(ReleaseFault::DisposePanicked {
                        label: disposable.label(),
                        message: panic_message(payload),
                    }),
                }
            }
            Resource::Child(child) => {
                match panic::catch_unwind(AssertUnwindSafe(|| child.terminate(allow_reentrant))) {
                    Ok(Ok(_)) => Ok(()),
                    Ok(Err(source)) => Err(ReleaseFault::ChildRefused {
                        child: child.to_string(),
                        source,
                    }),
                    Err(payload) => Err(ReleaseFault::ChildPanicked {
                        child: child.to_string(),
                        message: panic_message(payload),
                    }),
                }
            }
        }
    }
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

#[cfg(all(test, not(any(loom, spark_loom))))]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct Failing;

    impl Disposable for Failing {
        fn dispose(&mut self) -> Result<(), BoxError> {
            Err("socket already closed".into())
        }

        fn label(&self) -> Cow<'static, str> {
            Cow::Borrowed("failing-socket")
        }
    }

    #[test]
    fn action_panic_is_captured() {
        let fault = Resource::action(|| panic!("boom"))
            .release(false)
            .expect_err("panic 必须被转换为 ReleaseFault");
        assert!(matches!(fault, ReleaseFault::ActionPanicked(ref message) if message == "boom"));
    }

    #[test]
    fn disposable_error_carries_label() {
        let fault = Resource::disposable(Failing)
            .release(false)
            .expect_err("dispose 错误必须被上报");
        assert!(fault.to_string().contains("failing-socket"));
    }

    #[test]
    fn action_runs_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        Resource::action(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .release(false)
        .expect("正常回调不应失败");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
