//! 嵌套作用域树：子作用域、交集作用域与成对的打开/关闭操作。
//!
//! # 设计总览（Why）
//! - 子作用域本身就是父作用域登记表中的一个资源：取消自上而下级联，拆除自下而上进行；
//! - 挂载失败（父作用域已越过 `Canceling`）时立即终止子作用域，不会出现“父已死、子仍活”的孤儿；
//! - 交集作用域同时挂在两个父作用域下，先到的级联生效，后到的终止请求因幂等而成为空操作。

use tracing::error;

use crate::{
    error::Result,
    lifetime::{Lifetime, LifetimeDefinition},
    resource::Resource,
};

/// 在析构时终止作用域的守卫，覆盖 `?` 提前返回与 panic 展开两条路径。
pub(crate) struct TerminateGuard<'a> {
    definition: Option<&'a LifetimeDefinition>,
}

impl<'a> TerminateGuard<'a> {
    pub(crate) fn new(definition: &'a LifetimeDefinition) -> Self {
        Self {
            definition: Some(definition),
        }
    }

    pub(crate) fn disarm(mut self) {
        self.definition = None;
    }
}

impl Drop for TerminateGuard<'_> {
    fn drop(&mut self) {
        if let Some(definition) = self.definition.take() {
            if let Err(err) = definition.terminate(false) {
                error!(lifetime = %definition, %err, "can't terminate scoped lifetime");
            }
        }
    }
}

impl LifetimeDefinition {
    /// 在临时根作用域中执行 `block`，返回时（包括 panic 展开）终止该作用域。
    pub fn using<T>(block: impl FnOnce(&Lifetime) -> T) -> T {
        let definition = LifetimeDefinition::new();
        let _guard = TerminateGuard::new(&definition);
        block(definition.lifetime())
    }
}

impl Lifetime {
    /// 创建挂载在本作用域下的子作用域。
    ///
    /// 本作用域已越过 `Canceling` 时，返回的子作用域已经处于终态。
    pub fn create_nested(&self) -> LifetimeDefinition {
        let nested = LifetimeDefinition::new();
        self.attach(&nested);
        nested
    }

    /// 创建子作用域，并在其自身的守卫执行中运行初始化逻辑。
    ///
    /// # 契约说明（What）
    /// - `init` 返回错误或 panic 时，子作用域被终止，错误原样返回（panic 继续展开）；
    /// - 子作用域创建即终止（父作用域已死）时，`init` 不会被调用，返回已终止的子作用域。
    pub fn create_nested_with<E>(
        &self,
        init: impl FnOnce(&LifetimeDefinition) -> core::result::Result<(), E>,
    ) -> core::result::Result<LifetimeDefinition, E> {
        let nested = self.create_nested();
        let guard = TerminateGuard::new(&nested);
        if let Some(Err(err)) = nested.execute_if_alive(|| init(&nested)) {
            return Err(err);
        }
        guard.disarm();
        Ok(nested)
    }

    /// 在临时子作用域中执行 `block`，返回时终止该子作用域。
    pub fn using_nested<T>(&self, block: impl FnOnce(&Lifetime) -> T) -> T {
        let nested = self.create_nested();
        let _guard = TerminateGuard::new(&nested);
        block(nested.lifetime())
    }

    /// 创建同时挂载在 `self` 与 `other` 下的作用域，任一方终止都会终止它。
    pub fn intersect(&self, other: &Lifetime) -> LifetimeDefinition {
        let intersection = LifetimeDefinition::new();
        self.attach(&intersection);
        other.attach(&intersection);
        intersection
    }

    /// 成对的打开/关闭操作，保证关闭恰好执行一次。
    ///
    /// # 执行逻辑（How）
    /// 1. 在守卫执行中调用 `opening`；作用域不再存活时两者都不会执行，返回 `None`；
    /// 2. 尝试把 `closing` 登记为终止回调；
    /// 3. 登记被拒绝（守卫执行内部发生了 `terminate(true)`，或排空超时后拆除已开始）时立即调用 `closing`。
    pub fn bracket<T>(
        &self,
        opening: impl FnOnce() -> T,
        closing: impl FnOnce() + Send + 'static,
    ) -> Option<T> {
        self.execute_if_alive(|| {
            let value = opening();
            self.add_or_run_inline(Resource::action(closing));
            value
        })
    }

    /// 与 [`Self::bracket`] 相同，但关闭操作接收打开操作产出的值。
    pub fn bracket_with<T>(
        &self,
        opening: impl FnOnce() -> T,
        closing: impl FnOnce(T) + Send + 'static,
    ) -> Option<T>
    where
        T: Clone + Send + 'static,
    {
        self.execute_if_alive(|| {
            let value = opening();
            let captured = value.clone();
            self.add_or_run_inline(Resource::action(move || closing(captured)));
            value
        })
    }

    fn add_or_run_inline(&self, resource: Resource) {
        match self.core().try_add(resource) {
            Ok(()) => {}
            Err(Resource::Action(action)) => action(),
            Err(other) => {
                if let Err(fault) = other.release(true) {
                    error!(lifetime = %self, %fault, "exception on termination of rejected resource");
                }
            }
        }
    }
}

/// 便捷函数：终止作用域并记录失败，用于不关心返回值的拆除路径。
pub(crate) fn terminate_logged(definition: &LifetimeDefinition, allow_reentrant: bool) -> Result<bool> {
    let outcome = definition.terminate(allow_reentrant);
    if let Err(err) = &outcome {
        error!(lifetime = %definition, %err, "can't terminate lifetime");
    }
    outcome
}
