use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use spark_transport::TransportCounters;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::{ConfigError, NetworkConfig};

static CONFIG: ArcSwapOption<NetworkConfig> = ArcSwapOption::const_empty();
static INIT_GUARD: Mutex<()> = parking_lot::const_mutex(());
static COUNTERS: TransportCounters = TransportCounters::new();

/// `initialize` 的结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InitOutcome {
    Initialized,
    /// 已初始化，本次调用未做任何修改。
    AlreadyInitialized,
}

/// 初始化进程级 Socket 库状态（网卡表与传输参数）。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 组播接口选择需要查询网卡表，而网卡表只应在进程内存在一份。
///
/// ## 逻辑 (How)
/// - 互斥锁串行化初始化与关闭，配置本身放在 `ArcSwapOption` 中，
///   打开流时无锁读取；
/// - 已初始化时直接返回 [`InitOutcome::AlreadyInitialized`]，不覆盖现有配置。
///
/// ## 契约 (What)
/// - 配置先经 [`NetworkConfig::validate`] 校验，失败时保持未初始化；
/// - 未显式初始化而直接打开流时，以默认配置惰性初始化。
pub fn initialize(config: NetworkConfig) -> Result<InitOutcome, ConfigError> {
    let _guard = INIT_GUARD.lock();
    if CONFIG.load().is_some() {
        debug!("socket library already initialized, keeping current configuration");
        return Ok(InitOutcome::AlreadyInitialized);
    }
    config.validate()?;
    info!(
        nics = config.nics.len(),
        default_port = config.default_port,
        "socket library initialized"
    );
    CONFIG.store(Some(Arc::new(config)));
    Ok(InitOutcome::Initialized)
}

/// 替换已初始化的配置；已打开的流继续使用打开时的快照。
pub fn reconfigure(config: NetworkConfig) -> Result<(), ConfigError> {
    let _guard = INIT_GUARD.lock();
    config.validate()?;
    info!(nics = config.nics.len(), "socket library reconfigured");
    CONFIG.store(Some(Arc::new(config)));
    Ok(())
}

/// 释放进程级状态，此后可再次初始化。
pub fn shutdown() {
    let _guard = INIT_GUARD.lock();
    if CONFIG.swap(None).is_some() {
        info!("socket library shut down");
    }
}

pub fn is_initialized() -> bool {
    CONFIG.load().is_some()
}

/// 当前配置；尚未初始化时以默认配置完成惰性初始化。
pub fn current_config() -> Arc<NetworkConfig> {
    if let Some(config) = CONFIG.load_full() {
        return config;
    }
    let _guard = INIT_GUARD.lock();
    if let Some(config) = CONFIG.load_full() {
        return config;
    }
    debug!("socket library lazily initialized with defaults");
    let config = Arc::new(NetworkConfig::default());
    CONFIG.store(Some(Arc::clone(&config)));
    config
}

/// 进程级传输计数。
pub fn counters() -> &'static TransportCounters {
    &COUNTERS
}
