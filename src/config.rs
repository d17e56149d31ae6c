use crate::error::{BridgeError, BridgeResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;

// ============================================================================
// 配置结构
// ============================================================================

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct BridgeConfig {
    /// 输出 debug 日志
    #[serde(default)]
    pub debug: bool,

    #[serde(default)]
    pub mirai: MiraiConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub transcode: TranscodeConfig,

    #[serde(default)]
    pub send: SendConfig,

    #[serde(default)]
    pub media: MediaConfig,
}

/// mirai-api-http 连接配置
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MiraiConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub verify_key: String,

    /// Bot 账号
    #[serde(default)]
    pub qq: u64,

    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_ms: u64,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl MiraiConfig {
    pub fn http_base(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn ws_base(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for MiraiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            verify_key: String::new(),
            qq: 0,
            reconnect_interval_ms: default_reconnect_interval(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// 目录缓存 (好友 / 群 / 群成员 / 陌生人)
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_info_ttl")]
    pub info_ttl_secs: u64,
    #[serde(default = "default_info_capacity")]
    pub info_capacity: usize,
    #[serde(default = "default_member_ttl")]
    pub member_ttl_secs: u64,
    #[serde(default = "default_member_capacity")]
    pub member_capacity: usize,
    #[serde(default = "default_member_ttl")]
    pub stranger_ttl_secs: u64,
    #[serde(default = "default_stranger_capacity")]
    pub stranger_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            info_ttl_secs: default_info_ttl(),
            info_capacity: default_info_capacity(),
            member_ttl_secs: default_member_ttl(),
            member_capacity: default_member_capacity(),
            stranger_ttl_secs: default_member_ttl(),
            stranger_capacity: default_stranger_capacity(),
        }
    }
}

/// 消息段转换失败时的处理策略
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ConversionPolicy {
    /// 记录日志并跳过失败的消息段
    #[default]
    BestEffort,
    /// 整个事件作废
    FailFast,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TranscodeConfig {
    /// 引用回复预览的最大字符数
    #[serde(default = "default_quote_max_length")]
    pub quote_max_length: usize,

    #[serde(default)]
    pub conversion_policy: ConversionPolicy,
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            quote_max_length: default_quote_max_length(),
            conversion_policy: ConversionPolicy::default(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SendConfig {
    /// 同一会话的并发发送按 FIFO 顺序执行
    #[serde(default = "default_true")]
    pub ordered_per_chat: bool,
}

impl Default for SendConfig {
    fn default() -> Self {
        Self {
            ordered_per_chat: true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct MediaConfig {
    /// 入站媒体下载目录，缺省为系统临时目录
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_dir: Option<PathBuf>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_reconnect_interval() -> u64 {
    3000
}

fn default_request_timeout() -> u64 {
    60
}

fn default_info_ttl() -> u64 {
    600
}

fn default_info_capacity() -> usize {
    2
}

fn default_member_ttl() -> u64 {
    3600
}

fn default_member_capacity() -> usize {
    20
}

fn default_stranger_capacity() -> usize {
    100
}

fn default_quote_max_length() -> usize {
    50
}

fn default_true() -> bool {
    true
}

// ============================================================================
// 配置管理器
// ============================================================================

pub struct ConfigManager {
    path: PathBuf,
    config: RwLock<BridgeConfig>,
}

impl ConfigManager {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            config: RwLock::new(BridgeConfig::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 加载配置，如果文件不存在则写入默认配置
    pub fn load(&self) -> BridgeResult<BridgeConfig> {
        if !self.path.exists() {
            let default_cfg = BridgeConfig::default();
            self.save_atomic(&default_cfg)?;
            return Ok(default_cfg);
        }

        let content = fs::read_to_string(&self.path)?;
        let cfg: BridgeConfig = toml::from_str(&content)?;
        cfg.validate()?;

        self.store(cfg.clone());
        Ok(cfg)
    }

    /// 原子写入配置（写临时文件 -> Rename 覆盖）
    pub fn save_atomic(&self, cfg: &BridgeConfig) -> BridgeResult<()> {
        let content = toml::to_string_pretty(cfg)?;
        let tmp_path = self.path.with_extension("tmp");

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp_path, &self.path)?;

        self.store(cfg.clone());
        Ok(())
    }

    /// 获取当前配置（只读快照）
    pub fn get(&self) -> BridgeConfig {
        match self.config.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn store(&self, cfg: BridgeConfig) {
        match self.config.write() {
            Ok(mut guard) => *guard = cfg,
            Err(poisoned) => *poisoned.into_inner() = cfg,
        }
    }
}

impl BridgeConfig {
    pub fn validate(&self) -> BridgeResult<()> {
        if self.cache.info_capacity == 0
            || self.cache.member_capacity == 0
            || self.cache.stranger_capacity == 0
        {
            return Err(BridgeError::Config("cache capacities must be non-zero".into()));
        }
        if self.transcode.quote_max_length == 0 {
            return Err(BridgeError::Config("quote_max_length must be non-zero".into()));
        }
        Ok(())
    }
}
