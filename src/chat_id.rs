//! 复合会话 ID
//!
//! 线上格式：`friend_<uin>`、`group_<gid>`、`private_<uin>_<gid>` (群临时会话，后者为来源群)。
//! 其它前缀 (如 `phone_...`) 在语法上合法，但不对应任何可解析的会话。

use crate::error::{BridgeError, BridgeResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 会话类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    Friend,
    Group,
    /// 群临时会话
    Private,
}

impl ChatKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            ChatKind::Friend => "friend",
            ChatKind::Group => "group",
            ChatKind::Private => "private",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ChatId {
    Friend(u64),
    Group(u64),
    Private { user: u64, group: u64 },
    /// 预留的未知前缀，原样保存
    Other { kind: String, rest: String },
}

impl ChatId {
    /// 由平台 ID 构造复合 ID，临时会话必须提供来源群
    pub fn new(kind: ChatKind, platform_id: u64, origin_group: Option<u64>) -> BridgeResult<Self> {
        match kind {
            ChatKind::Friend => Ok(ChatId::Friend(platform_id)),
            ChatKind::Group => Ok(ChatId::Group(platform_id)),
            ChatKind::Private => origin_group
                .map(|group| ChatId::Private {
                    user: platform_id,
                    group,
                })
                .ok_or_else(|| {
                    BridgeError::InvalidChatId(format!(
                        "private_{} is missing its origin group",
                        platform_id
                    ))
                }),
        }
    }

    pub fn kind(&self) -> Option<ChatKind> {
        match self {
            ChatId::Friend(_) => Some(ChatKind::Friend),
            ChatId::Group(_) => Some(ChatKind::Group),
            ChatId::Private { .. } => Some(ChatKind::Private),
            ChatId::Other { .. } => None,
        }
    }

    /// 主平台 ID (好友 / 群号 / 临时会话对方)
    pub fn platform_id(&self) -> Option<u64> {
        match self {
            ChatId::Friend(id) | ChatId::Group(id) => Some(*id),
            ChatId::Private { user, .. } => Some(*user),
            ChatId::Other { .. } => None,
        }
    }

    pub fn origin_group(&self) -> Option<u64> {
        match self {
            ChatId::Private { group, .. } => Some(*group),
            _ => None,
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self, ChatId::Group(_))
    }
}

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatId::Friend(id) => write!(f, "friend_{}", id),
            ChatId::Group(id) => write!(f, "group_{}", id),
            ChatId::Private { user, group } => write!(f, "private_{}_{}", user, group),
            ChatId::Other { kind, rest } => write!(f, "{}_{}", kind, rest),
        }
    }
}

impl FromStr for ChatId {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || BridgeError::InvalidChatId(s.to_string());

        let (kind, rest) = s.split_once('_').ok_or_else(invalid)?;
        if kind.is_empty() || rest.is_empty() {
            return Err(invalid());
        }

        let parse = |v: &str| v.parse::<u64>().map_err(|_| invalid());

        match kind {
            "friend" => Ok(ChatId::Friend(parse(rest)?)),
            "group" => Ok(ChatId::Group(parse(rest)?)),
            "private" => {
                let (user, group) = rest.split_once('_').ok_or_else(invalid)?;
                Ok(ChatId::Private {
                    user: parse(user)?,
                    group: parse(group)?,
                })
            }
            _ => Ok(ChatId::Other {
                kind: kind.to_string(),
                rest: rest.to_string(),
            }),
        }
    }
}

impl TryFrom<String> for ChatId {
    type Error = BridgeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ChatId> for String {
    fn from(id: ChatId) -> Self {
        id.to_string()
    }
}

/// `(kind, id[, origin]) -> "<kind>_<id>[_<origin>]"`
pub fn to_composite_id(
    kind: ChatKind,
    platform_id: u64,
    origin_group: Option<u64>,
) -> BridgeResult<String> {
    ChatId::new(kind, platform_id, origin_group).map(|id| id.to_string())
}

pub fn from_composite_id(composite: &str) -> BridgeResult<ChatId> {
    composite.parse()
}
