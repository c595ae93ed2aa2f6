//! 终止资源登记表。
//!
//! # 契约说明（What）
//! - 只在持有状态字互斥位、且状态不超过 `Canceling` 时追加或压缩；
//! - 存储写满时先压缩（摘除已越过 `Canceling` 的子控制器），只有存活条目仍超过容量一半才翻倍扩容，
//!   这样高频创建子作用域的代码在稳态下不会无限增长；
//! - 进入 `Terminating` 后由析构流程一次性取走全部条目，之后存储被丢弃，任何追加都属于不变量破坏；
//! - 未经终止就被丢弃的作用域树按工作表逐层释放，析构深度与树高无关。
//!
//! # 风险提示（Trade-offs）
//! - 只有子控制器会被主动回收；回调与外部句柄即使逻辑上已过期也会保留到析构，
//!   假设它们数量少且廉价。

use std::sync::Arc;

use tracing::debug;

use crate::{lifetime::LifetimeCore, resource::Resource};

pub(crate) struct Registry {
    slots: Option<Vec<Resource>>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            slots: Some(Vec::with_capacity(1)),
        }
    }

    /// Eternal 生命周期使用的空登记表：从不存储任何资源。
    pub(crate) fn discarding() -> Self {
        Self { slots: None }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.as_ref().map_or(0, Vec::len)
    }

    #[cfg(test)]
    fn capacity(&self) -> usize {
        self.slots.as_ref().map_or(0, Vec::capacity)
    }

    /// 追加资源，必要时先压缩、再按需扩容。
    pub(crate) fn push(&mut self, resource: Resource) {
        let slots = self
            .slots
            .as_mut()
            .expect("`resources` can't be discarded under mutex while status < Terminating");

        if slots.len() == slots.capacity() {
            let before = slots.len();
            slots.retain(|resource| !resource.is_obsolete_child());
            let survivors = slots.len();
            if survivors * 2 > slots.capacity() {
                slots.reserve_exact(survivors.max(1));
            }
            if survivors != before {
                debug!(
                    dropped = before - survivors,
                    survivors,
                    capacity = slots.capacity(),
                    "compacted lifetime registry on growth"
                );
            }
        }

        slots.push(resource);
    }

    /// 摘除已终止的子控制器，并在存活条目远小于容量时收缩存储。返回摘除的条目数。
    pub(crate) fn compact(&mut self) -> usize {
        let Some(slots) = self.slots.as_mut() else {
            return 0;
        };
        let before = slots.len();
        slots.retain(|resource| !resource.is_obsolete_child());
        let survivors = slots.len();
        if survivors * 4 < slots.capacity() {
            slots.shrink_to((survivors * 2).max(1));
        }
        before - survivors
    }

    /// 非阻塞地收集子控制器，供级联取消使用。
    pub(crate) fn collect_children(&self, worklist: &mut Vec<Arc<LifetimeCore>>) {
        if let Some(slots) = self.slots.as_ref() {
            worklist.extend(slots.iter().filter_map(Resource::child).cloned());
        }
    }

    /// 取走全部资源并丢弃存储，之后登记表处于终态。
    pub(crate) fn take(&mut self) -> Vec<Resource> {
        self.slots.take().unwrap_or_default()
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        let Some(mut pending) = self.slots.take() else {
            return;
        };
        // 最后一个引用持有者负责把子控制器的条目并入工作表，子控制器自身析构时登记表已为空。
        while let Some(resource) = pending.pop() {
            if let Resource::Child(child) = resource {
                if let Some(core) = Arc::into_inner(child) {
                    pending.extend(core.into_registry().take());
                }
            }
        }
    }
}
