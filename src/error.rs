use crate::model::MsgType;
use thiserror::Error;

/// 桥接层统一错误类型
#[derive(Debug, Error)]
pub enum BridgeError {
    /// 连续两次刷新目录 (好友/群列表) 均失败
    #[error("directory unavailable: failed to refresh {directory} list ({source})")]
    DirectoryUnavailable {
        directory: &'static str,
        #[source]
        source: Box<BridgeError>,
    },

    /// 单个入站消息段转换失败
    #[error("failed to convert {kind} segment: {reason}")]
    SegmentConversion { kind: &'static str, reason: String },

    /// 事件循环内部故障，或在循环上下文中发起了阻塞调用
    #[error("scheduler fault: {0}")]
    Scheduler(String),

    /// 平台接口调用失败
    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid chat id: {0}")]
    InvalidChatId(String),

    /// 格式合法但无法解析的会话 (private / phone 等)
    #[error("chat {0} cannot be resolved")]
    UnresolvedChat(String),

    #[error("message type {0:?} cannot be sent to the platform")]
    UnsupportedMessage(MsgType),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    TomlDe(#[from] toml::de::Error),

    #[error(transparent)]
    TomlSer(#[from] toml::ser::Error),
}

pub type BridgeResult<T> = Result<T, BridgeError>;

impl From<reqwest::Error> for BridgeError {
    fn from(e: reqwest::Error) -> Self {
        BridgeError::Transport(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for BridgeError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        BridgeError::Transport(e.to_string())
    }
}

impl BridgeError {
    /// 目录刷新失败包装
    pub fn directory(directory: &'static str, source: BridgeError) -> Self {
        BridgeError::DirectoryUnavailable {
            directory,
            source: Box::new(source),
        }
    }

    pub fn segment(kind: &'static str, reason: impl Into<String>) -> Self {
        BridgeError::SegmentConversion {
            kind,
            reason: reason.into(),
        }
    }
}
