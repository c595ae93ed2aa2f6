//! 生命周期内核的并发竞态测试。
//!
//! # 教案级导览
//!
//! - **Why**：生命周期是无锁原语，正确性取决于终止、登记、守卫执行与挂载之间任意交错下的收敛；
//! - **How**：用 `Barrier` 让多个线程同时起跑，放大竞争窗口，结束后校验计数与状态不变量；
//! - **What**：幂等终止、登记与终止竞态、排空等待、挂载与终止竞态、状态单调性、阻塞等待终止。

use std::{
    sync::{
        Arc, Barrier, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use spark_lifetime::{LifetimeDefinition, LifetimeStatus};

const THREADS: usize = 8;

/// ## 测试一：N 个线程同时终止，恰好一个完成拆除
///
/// - **契约 (What)**：只有一个线程得到 `Ok(true)`，登记的资源只释放一次，其余线程得到 `Ok(false)`。
#[test]
fn concurrent_terminate_releases_exactly_once() {
    for _ in 0..50 {
        let root = LifetimeDefinition::new();
        let released = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let released = Arc::clone(&released);
            root.on_termination_if_alive(move || {
                released.fetch_add(1, Ordering::SeqCst);
            });
        }

        let barrier = Arc::new(Barrier::new(THREADS));
        let winners: usize = (0..THREADS)
            .map(|_| {
                let root = root.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    root.terminate(false).expect("并发终止不应报错")
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|handle| usize::from(handle.join().expect("终止线程不应 panic")))
            .sum();

        assert_eq!(winners, 1, "恰好一个线程完成拆除");
        assert_eq!(released.load(Ordering::SeqCst), 4);
        assert_eq!(root.status(), LifetimeStatus::Terminated);
    }
}

/// ## 测试二：登记与终止竞态，被接受的资源恰好执行一次，被拒绝的资源从不执行
#[test]
fn registration_racing_termination_is_exactly_once() {
    for _ in 0..50 {
        let root = LifetimeDefinition::new();
        let accepted = Arc::new(AtomicUsize::new(0));
        let executed = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(THREADS + 1));

        let registrars: Vec<_> = (0..THREADS)
            .map(|_| {
                let root = root.clone();
                let accepted = Arc::clone(&accepted);
                let executed = Arc::clone(&executed);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..64 {
                        let executed = Arc::clone(&executed);
                        if root.on_termination_if_alive(move || {
                            executed.fetch_add(1, Ordering::SeqCst);
                        }) {
                            accepted.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();

        barrier.wait();
        root.terminate(false).expect("终止不应报错");
        for registrar in registrars {
            registrar.join().expect("登记线程不应 panic");
        }

        assert_eq!(
            executed.load(Ordering::SeqCst),
            accepted.load(Ordering::SeqCst),
            "被接受的资源必须恰好执行一次"
        );
    }
}

/// ## 测试三：终止等待其他线程的守卫执行排空
///
/// - **逻辑 (How)**：工作线程进入守卫执行后停留一段时间；主线程随即终止，
///   登记的回调必须在工作线程离开守卫执行之后才运行。
#[test]
fn termination_drains_in_flight_execution() {
    let root = LifetimeDefinition::new();
    let inside = Arc::new(Barrier::new(2));
    let worker_done = Arc::new(AtomicBool::new(false));
    let observed_after_worker = Arc::new(AtomicBool::new(false));

    {
        let worker_done = Arc::clone(&worker_done);
        let observed = Arc::clone(&observed_after_worker);
        root.on_termination_if_alive(move || {
            observed.store(worker_done.load(Ordering::SeqCst), Ordering::SeqCst);
        });
    }

    let worker = {
        let root = root.clone();
        let inside = Arc::clone(&inside);
        let worker_done = Arc::clone(&worker_done);
        thread::spawn(move || {
            root.execute_if_alive(|| {
                inside.wait();
                thread::sleep(Duration::from_millis(50));
                worker_done.store(true, Ordering::SeqCst);
            })
        })
    };

    inside.wait();
    assert_eq!(root.terminate(false), Ok(true));
    assert!(worker.join().expect("工作线程不应 panic").is_some());
    assert!(
        observed_after_worker.load(Ordering::SeqCst),
        "资源释放必须发生在守卫执行结束之后"
    );
}

/// ## 测试四：子作用域挂载与父作用域终止竞态，不留下存活的孤儿
#[test]
fn attaching_children_racing_parent_termination_leaves_no_orphans() {
    for _ in 0..50 {
        let parent = LifetimeDefinition::new();
        let children = Arc::new(Mutex::new(Vec::new()));
        let barrier = Arc::new(Barrier::new(THREADS + 1));

        let creators: Vec<_> = (0..THREADS)
            .map(|_| {
                let parent = parent.clone();
                let children = Arc::clone(&children);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..32 {
                        let child = parent.create_nested();
                        let grandchild = child.create_nested();
                        let mut children = children.lock().expect("锁未中毒");
                        children.push(child);
                        children.push(grandchild);
                    }
                })
            })
            .collect();

        barrier.wait();
        parent.terminate(false).expect("终止不应报错");
        for creator in creators {
            creator.join().expect("创建线程不应 panic");
        }

        let children = children.lock().expect("锁未中毒");
        assert!(
            children
                .iter()
                .all(|child| child.status() == LifetimeStatus::Terminated),
            "父作用域终止后不允许存在存活的子作用域"
        );
    }
}

/// ## 测试五：观察到的状态序列单调不减且不跳跃
#[test]
fn observed_statuses_are_monotonic() {
    for _ in 0..20 {
        let root = LifetimeDefinition::new();
        // 拆除期间停留一会儿，让观察线程有机会看到 Terminating。
        root.on_termination_if_alive(|| thread::sleep(Duration::from_millis(2)));
        let stop = Arc::new(AtomicBool::new(false));

        let observer = {
            let root = root.clone();
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut seen = vec![root.status()];
                loop {
                    // 先读停止标志再读状态：停止后的最后一次读取必然看到终态。
                    let stopping = stop.load(Ordering::SeqCst);
                    let status = root.status();
                    if seen.last() != Some(&status) {
                        seen.push(status);
                    }
                    if stopping {
                        break;
                    }
                }
                seen
            })
        };

        thread::sleep(Duration::from_millis(1));
        root.terminate(false).expect("终止不应报错");
        stop.store(true, Ordering::SeqCst);
        let seen = observer.join().expect("观察线程不应 panic");

        for pair in seen.windows(2) {
            assert!(pair[0] < pair[1], "状态不得回退: {seen:?}");
        }
        assert_eq!(seen.last(), Some(&LifetimeStatus::Terminated));
    }
}

/// ## 测试六：守卫执行与终止并发时，执行要么完整发生在拆除之前，要么完全不发生
#[test]
fn guarded_execution_never_overlaps_teardown() {
    for _ in 0..50 {
        let root = LifetimeDefinition::new();
        let torn_down = Arc::new(AtomicBool::new(false));
        let violations = Arc::new(AtomicUsize::new(0));
        {
            let torn_down = Arc::clone(&torn_down);
            root.on_termination_if_alive(move || torn_down.store(true, Ordering::SeqCst));
        }

        let barrier = Arc::new(Barrier::new(THREADS + 1));
        let workers: Vec<_> = (0..THREADS)
            .map(|_| {
                let root = root.clone();
                let torn_down = Arc::clone(&torn_down);
                let violations = Arc::clone(&violations);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    while root
                        .execute_if_alive(|| {
                            if torn_down.load(Ordering::SeqCst) {
                                violations.fetch_add(1, Ordering::SeqCst);
                            }
                        })
                        .is_some()
                    {}
                })
            })
            .collect();

        barrier.wait();
        root.terminate(false).expect("终止不应报错");
        for worker in workers {
            worker.join().expect("工作线程不应 panic");
        }
        assert_eq!(violations.load(Ordering::SeqCst), 0);
        assert_eq!(root.executing_count(), 0);
    }
}

/// ## 测试七：`wait_termination` 阻塞到终止完成才返回
///
/// - **逻辑 (How)**：等待线程进入 `wait_termination`，主线程停顿一段时间后确认它仍未返回，
///   再执行终止；
/// - **断言 (What)**：等待线程返回时观察到的状态是 `Terminated`，且返回发生在终止之后。
#[test]
fn wait_termination_blocks_until_terminated() {
    let root = LifetimeDefinition::new();
    let returned = Arc::new(AtomicBool::new(false));

    let waiter = {
        let root = root.clone();
        let returned = Arc::clone(&returned);
        thread::spawn(move || {
            root.wait_termination();
            returned.store(true, Ordering::SeqCst);
            root.status()
        })
    };

    thread::sleep(Duration::from_millis(20));
    assert!(!returned.load(Ordering::SeqCst), "终止之前不得返回");
    assert!(root.is_alive());

    assert_eq!(root.terminate(false), Ok(true));
    let observed = waiter.join().expect("等待线程不应 panic");
    assert_eq!(observed, LifetimeStatus::Terminated);
    assert!(returned.load(Ordering::SeqCst));
}
