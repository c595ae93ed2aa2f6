//! 依赖进程级配置的行为：排空超时与轮换链的压缩周期。
//!
//! 配置是进程级的，本文件单独编译为一个测试二进制；其中每个用例都安装同一份配置，互不干扰。

use std::{
    sync::{
        Arc, Barrier,
        atomic::{AtomicBool, Ordering},
        mpsc,
    },
    thread,
};

use spark_lifetime::{LifetimeConfig, LifetimeDefinition, LifetimeStatus, SequentialLifetimes};
use tracing_test::traced_test;

const COMPACTION_LOG: &str = "compacted parent lifetime after rotations";

fn install_test_config() {
    LifetimeConfig {
        drain_timeout_ms: 20,
        rotation_compaction_period: 2,
    }
    .install()
    .expect("配置合法");
}

/// ## 超时后继续拆除，并在迟到的守卫执行结束时记录错误
///
/// - **逻辑 (How)**：工作线程进入守卫执行后阻塞在通道上；主线程在很短的排空超时后仍完成终止，
///   再放行工作线程，观察其离开守卫执行时输出的错误日志。
/// - **断言 (What)**：终止返回 `Ok(true)`、资源已释放、告警与错误日志各出现一次。
#[test]
#[traced_test]
fn termination_proceeds_after_drain_timeout() {
    install_test_config();

    let root = LifetimeDefinition::with_id("slow-consumer");
    let released = Arc::new(AtomicBool::new(false));
    {
        let released = Arc::clone(&released);
        root.on_termination_if_alive(move || released.store(true, Ordering::SeqCst));
    }

    let entered = Arc::new(Barrier::new(2));
    let (finish, finished) = mpsc::channel::<()>();
    let worker = {
        let root = root.clone();
        let entered = Arc::clone(&entered);
        // 把测试 span 带进工作线程，日志断言才能看到那里的事件。
        let span = tracing::Span::current();
        thread::spawn(move || {
            span.in_scope(|| {
                root.execute_if_alive(|| {
                    entered.wait();
                    finished.recv().expect("主线程负责放行");
                })
            })
        })
    };

    entered.wait();
    assert_eq!(root.terminate(false), Ok(true));
    assert_eq!(root.status(), LifetimeStatus::Terminated);
    assert!(released.load(Ordering::SeqCst));
    assert_eq!(root.executing_count(), 1);
    assert!(logs_contain("can't wait for `execute_if_alive` completed on other thread"));

    finish.send(()).expect("工作线程仍在等待");
    assert!(worker.join().expect("工作线程不应 panic").is_some());
    assert_eq!(root.executing_count(), 0);
    assert!(logs_contain("`execute_if_alive` after termination took too much time"));
}

/// ## 只有成功的轮换计入压缩周期
///
/// - **逻辑 (How)**：压缩周期为 2；一次成功轮换之后紧跟一次初始化失败的轮换，
///   此时不应触发压缩；再成功轮换一次才触发。
#[test]
#[traced_test]
fn failed_rotations_do_not_count_towards_compaction() {
    install_test_config();
    let parent = LifetimeDefinition::with_id("rotating-parent");
    let chain = SequentialLifetimes::new(&parent);

    let _first = chain.next();
    let failed = chain.define_next(|_| Err("init failed"));
    assert!(failed.is_err());
    assert!(chain.is_terminated());
    assert!(!logs_contain(COMPACTION_LOG));

    let second = chain.next();
    assert!(second.is_alive());
    assert!(logs_contain(COMPACTION_LOG));
}
