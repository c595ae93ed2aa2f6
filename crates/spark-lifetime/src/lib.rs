#![deny(unsafe_code)]
#![doc = r#"
# spark-lifetime

## 设计动机（Why）
- **定位**：为传输层、响应式集合、RPC 分发与 Actor 等子系统提供统一的“生命周期”原语，
  用于圈定订阅、套接字与后台任务的作用域，并保证拆除过程确定、无竞态。
- **架构角色**：处于依赖图的最底层，不依赖任何异步运行时；上层只通过
  [`Lifetime`]（只读能力）与 [`LifetimeDefinition`]（可终止的控制器）两种句柄交互。

## 核心契约（What）
- 状态严格单调：`Alive → Canceling → Terminating → Terminated`，不会回退、不会跳跃；
- 登记的终止资源在 `Terminating` 阶段按 LIFO 顺序恰好释放一次，单个资源的失败只记录日志；
- 取消自上而下级联，资源释放自下而上执行；
- [`Lifetime::execute_if_alive`] 是唯一的“守卫执行”入口，终止流程会等待其排空（带超时）。

## 实现策略（How）
- 执行计数、状态、自旋互斥位与“迟到告警”位打包进同一个 `AtomicU64`，所有转换都是整字 CAS；
- 资源登记表由互斥位授予独占，底层以 `spin::Mutex` 作为安全的数据容器，保持 `deny(unsafe_code)`；
- 线程局部的重入计数允许 `terminate(true)` 在自身守卫执行内部安全完成；
- [`SequentialLifetimes`] 在固定父生命周期下轮换“当前子作用域”，并周期性压缩父登记表。

## 风险与考量（Trade-offs）
- 取消是协作式的：守卫执行内部的代码需要自行轮询状态或依赖登记的终止资源被唤醒；
- 排空超时只是活性保护，超时后依然继续拆除，并在迟到的守卫执行结束时输出错误日志。
"#]

#[cfg(not(feature = "std"))]
compile_error!(
    "spark-lifetime 依赖线程局部存储、`catch_unwind` 与单调时钟：请启用默认特性或通过 `--features std` 显式打开该功能。",
);

mod backoff;
pub mod config;
pub mod error;
mod lifetime;
mod nested;
mod reentrancy;
mod registry;
pub mod resource;
pub mod sequential;
mod state;

pub use config::LifetimeConfig;
pub use error::{LifetimeError, Result};
pub use lifetime::{ANONYMOUS_LIFETIME_ID, Lifetime, LifetimeDefinition};
pub use resource::{BoxError, Disposable};
pub use sequential::SequentialLifetimes;
pub use state::LifetimeStatus;
