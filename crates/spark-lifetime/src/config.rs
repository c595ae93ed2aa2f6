//! 生命周期内核的进程级配置。
//!
//! # 设计背景（Why）
//! - 排空超时与轮换压缩周期在整个进程内共享，终止流程在热路径上只做一次原子读取；
//! - 配置以 `serde` 结构描述，宿主可以从自己的配置文件中截取 `[lifetime]` 段落直接反序列化。
//!
//! # 契约说明（What）
//! - [`LifetimeConfig::install`] 先校验再发布，新值对之后开始的终止流程与新建的轮换链生效；
//! - 已经在排空等待中的终止流程继续使用它读取到的旧值。

use std::{
    sync::atomic::{AtomicU32, AtomicU64, Ordering},
    time::Duration,
};

use serde::Deserialize;

use crate::error::{LifetimeError, Result};

/// 默认排空超时（毫秒）。
pub const DEFAULT_DRAIN_TIMEOUT_MS: u64 = 500;
/// 默认每多少次轮换压缩一次父作用域登记表。
pub const DEFAULT_ROTATION_COMPACTION_PERIOD: u32 = 1000;

static DRAIN_TIMEOUT_MS: AtomicU64 = AtomicU64::new(DEFAULT_DRAIN_TIMEOUT_MS);
static ROTATION_COMPACTION_PERIOD: AtomicU32 = AtomicU32::new(DEFAULT_ROTATION_COMPACTION_PERIOD);

/// 生命周期内核配置。
///
/// # 教案式说明
/// - **意图 (Why)**：排空超时是活性保护而非正确性条件，部署方可以根据 GC/调度抖动调整；
/// - **契约 (What)**：
///   - `drain_timeout_ms`：终止时等待其他线程守卫执行结束的上限，`0` 表示不等待；
///   - `rotation_compaction_period`：轮换链每经过多少次轮换触发一次父登记表压缩，必须大于 0；
/// - **风险 (Trade-offs)**：配置是进程级的，测试中修改它会影响同一进程内的其他用例。
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LifetimeConfig {
    pub drain_timeout_ms: u64,
    pub rotation_compaction_period: u32,
}

impl Default for LifetimeConfig {
    fn default() -> Self {
        Self {
            drain_timeout_ms: DEFAULT_DRAIN_TIMEOUT_MS,
            rotation_compaction_period: DEFAULT_ROTATION_COMPACTION_PERIOD,
        }
    }
}

impl LifetimeConfig {
    /// 读取当前生效的配置。
    pub fn current() -> Self {
        Self {
            drain_timeout_ms: DRAIN_TIMEOUT_MS.load(Ordering::Relaxed),
            rotation_compaction_period: ROTATION_COMPACTION_PERIOD.load(Ordering::Relaxed),
        }
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.rotation_compaction_period == 0 {
            return Err(LifetimeError::InvalidConfig {
                detail: "`rotation_compaction_period` must be greater than zero".to_owned(),
            });
        }
        Ok(())
    }

    /// 校验并发布为进程级配置。
    pub fn install(&self) -> Result<()> {
        self.validate()?;
        DRAIN_TIMEOUT_MS.store(self.drain_timeout_ms, Ordering::Relaxed);
        ROTATION_COMPACTION_PERIOD.store(self.rotation_compaction_period, Ordering::Relaxed);
        Ok(())
    }

    /// 从 TOML 文本解析配置，既接受 `[lifetime]` 段落，也接受顶层键。
    #[cfg(feature = "toml-config")]
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let invalid = |detail: String| LifetimeError::InvalidConfig { detail };
        let mut table: toml::Table = source.parse().map_err(|err| invalid(format!("{err}")))?;
        let section = match table.remove("lifetime") {
            Some(toml::Value::Table(section)) => section,
            Some(other) => {
                return Err(invalid(format!(
                    "`lifetime` must be a table, found {}",
                    other.type_str()
                )));
            }
            None => table,
        };
        let config: LifetimeConfig = toml::Value::Table(section)
            .try_into()
            .map_err(|err| invalid(format!("{err}")))?;
        config.validate()?;
        Ok(config)
    }
}

pub(crate) fn drain_timeout() -> Duration {
    Duration::from_millis(DRAIN_TIMEOUT_MS.load(Ordering::Relaxed))
}

pub(crate) fn rotation_compaction_period() -> u32 {
    ROTATION_COMPACTION_PERIOD.load(Ordering::Relaxed)
}
