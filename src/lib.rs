// lib.rs
//
// ================================================================================
// qq-bridge - QQ (mirai-api-http) <-> 聊天中间件 协议桥
//
// 架构：目录缓存 | 会话 ID 映射 | 入站 / 出站消息转换 | 单线程事件循环 + 同步调用桥
// ================================================================================

pub mod log;

pub mod bridge;
pub mod bus;
pub mod cache;
pub mod chat_id;
pub mod config;
pub mod directory;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod media;
pub mod model;
pub mod platform;
pub mod transcode;

pub use bridge::Bridge;
pub use error::{BridgeError, BridgeResult};

// ============================================================================
// Re-exports (重新导出)
// ============================================================================

pub mod prelude {
    //! 常用类型的预导入模块
    //!
    //! ```rust
    //! use qq_bridge::prelude::*;
    //! ```

    // 1. 入口与错误处理
    pub use super::{Bridge, BridgeError, BridgeResult};

    // 2. 配置
    pub use super::config::{BridgeConfig, ConfigManager, ConversionPolicy};

    // 3. 数据模型
    pub use super::chat_id::{ChatId, ChatKind, from_composite_id, to_composite_id};
    pub use super::model::{
        Chat, MediaFile, Member, Mention, MsgType, NormalizedMessage, Substitutions,
    };

    // 4. 协作方接口
    pub use super::bus::{ChannelBus, LoggingBus, MiddlewareBus};
    pub use super::media::{HttpMediaStore, MediaStore};
    pub use super::platform::mirai::MiraiClient;
    pub use super::platform::{PlatformApi, PlatformEvent, Segment, SendTarget};

    // 5. 事件循环
    pub use super::dispatch::LoopState;

    // 6. 外部依赖
    pub use async_trait::async_trait;
}
