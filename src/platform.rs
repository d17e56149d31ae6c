//! QQ 平台接口抽象
//!
//! 目录查询、消息发送、事件订阅。桥接层其余部分只依赖 `PlatformApi`，
//! 具体协议实现见 [`mirai`]。

use crate::error::BridgeResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub mod mirai;
pub mod segment;

pub use segment::Segment;

// ============================================================================
// 平台数据记录
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FriendRecord {
    pub id: u64,
    #[serde(default)]
    pub nickname: String,
    #[serde(default)]
    pub remark: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRecord {
    pub id: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub permission: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberRecord {
    pub id: u64,
    #[serde(default)]
    pub member_name: String,
    #[serde(default)]
    pub permission: String,
    #[serde(default)]
    pub special_title: String,
    pub group: GroupRecord,
}

/// 陌生人资料 (userProfile)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProfileRecord {
    #[serde(default)]
    pub nickname: String,
    #[serde(default)]
    pub sign: String,
}

/// 发送成功后平台返回的消息 ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SentMessage {
    pub message_id: i64,
}

/// 发送目标
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SendTarget {
    Friend(u64),
    Group(u64),
    /// 群临时会话
    Temp { user: u64, group: u64 },
}

// ============================================================================
// 推送事件
// ============================================================================

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum PlatformEvent {
    GroupMessage {
        #[serde(deserialize_with = "segment::deserialize_chain")]
        message_chain: Vec<Segment>,
        sender: MemberRecord,
    },
    FriendMessage {
        #[serde(deserialize_with = "segment::deserialize_chain")]
        message_chain: Vec<Segment>,
        sender: FriendRecord,
    },
    TempMessage {
        #[serde(deserialize_with = "segment::deserialize_chain")]
        message_chain: Vec<Segment>,
        sender: MemberRecord,
    },
    /// 其它事件 (戳一戳、撤回、成员变动等) 不处理
    #[serde(other)]
    Other,
}

impl PlatformEvent {
    pub fn is_message(&self) -> bool {
        !matches!(self, PlatformEvent::Other)
    }
}

// ============================================================================
// 平台接口
// ============================================================================

#[async_trait]
pub trait PlatformApi: Send + Sync + 'static {
    async fn fetch_friends(&self) -> BridgeResult<Vec<FriendRecord>>;

    async fn fetch_groups(&self) -> BridgeResult<Vec<GroupRecord>>;

    async fn fetch_group_members(&self, group_id: u64) -> BridgeResult<Vec<MemberRecord>>;

    async fn fetch_profile(&self, uin: u64) -> BridgeResult<ProfileRecord>;

    async fn send_message(&self, target: SendTarget, chain: Vec<Segment>)
    -> BridgeResult<SentMessage>;

    /// 建立一次事件订阅。连接断开时返回的通道随之关闭
    async fn subscribe(&self) -> BridgeResult<mpsc::Receiver<PlatformEvent>>;

    /// 释放当前会话 (无会话时为空操作)
    async fn release(&self) -> BridgeResult<()>;
}
