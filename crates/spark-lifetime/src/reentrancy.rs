//! 线程局部的守卫执行重入计数。
//!
//! 以控制器的唯一编号为键，记录当前线程调用栈上尚未退出的 `execute_if_alive` 帧数。
//! 终止流程据此区分“别的线程仍在执行”与“我自己就在执行中”：后者不应计入排空等待。
//! 线程局部状态只在同一条调用链上生效；跨越协作式挂起点时，调用方需保证守卫帧不跨线程迁移。

use std::cell::RefCell;

#[cfg(not(any(loom, spark_loom)))]
std::thread_local! {
    static EXECUTING: RefCell<Vec<(u64, u32)>> = const { RefCell::new(Vec::new()) };
}

#[cfg(any(loom, spark_loom))]
loom::thread_local! {
    static EXECUTING: RefCell<Vec<(u64, u32)>> = RefCell::new(Vec::new());
}

/// 当前线程在控制器 `id` 上的守卫执行深度。
pub(crate) fn depth(id: u64) -> u32 {
    EXECUTING.with(|frames| {
        frames
            .borrow()
            .iter()
            .find(|(key, _)| *key == id)
            .map_or(0, |(_, count)| *count)
    })
}

/// 进入一层守卫执行；返回的守卫在析构时退出该层，包括 panic 展开路径。
pub(crate) struct ReentrancyGuard {
    id: u64,
}

impl ReentrancyGuard {
    pub(crate) fn enter(id: u64) -> Self {
        EXECUTING.with(|frames| {
            let mut frames = frames.borrow_mut();
            match frames.iter_mut().find(|(key, _)| *key == id) {
                Some((_, count)) => *count += 1,
                None => frames.push((id, 1)),
            }
        });
        Self { id }
    }
}

impl Drop for ReentrancyGuard {
    fn drop(&mut self) {
        let id = self.id;
        EXECUTING.with(|frames| {
            let mut frames = frames.borrow_mut();
            if let Some(index) = frames.iter().position(|(key, _)| *key == id) {
                let count = &mut frames[index].1;
                *count -= 1;
                if *count == 0 {
                    frames.swap_remove(index);
                }
            }
        });
    }
}
