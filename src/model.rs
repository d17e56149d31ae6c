//! 中间件侧的统一数据模型
//!
//! 会话 (Chat)、成员 (Member) 以及归一化消息 (NormalizedMessage)。
//! 这些都是廉价的值对象，可以随时从目录缓存或事件数据重新构造。

use crate::chat_id::ChatId;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::path::PathBuf;

// ----------------------------------------------------------------------------
// 会话与成员
// ----------------------------------------------------------------------------

/// 群成员，或私聊中的"对方"
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub uid: u64,
    pub name: String,
    /// 好友备注 (当该成员同时是好友时)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    /// 所属会话
    pub chat: ChatId,
}

impl Member {
    pub fn new(uid: u64, name: impl Into<String>, alias: Option<String>, chat: ChatId) -> Self {
        Self {
            uid,
            name: name.into(),
            alias,
            chat,
        }
    }

    /// 优先备注，其次名称，最后 QQ 号
    pub fn display_name(&self) -> String {
        self.alias
            .as_deref()
            .filter(|s| !s.is_empty())
            .or(Some(self.name.as_str()).filter(|s| !s.is_empty()))
            .map(String::from)
            .unwrap_or_else(|| self.uid.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chat {
    pub id: ChatId,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    /// 群成员名单 (仅在显式解析群会话时附带)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub members: Vec<Member>,
}

impl Chat {
    pub fn friend(uin: u64, name: impl Into<String>, alias: Option<String>) -> Self {
        Self {
            id: ChatId::Friend(uin),
            name: name.into(),
            alias,
            members: Vec::new(),
        }
    }

    pub fn group(gid: u64, name: impl Into<String>) -> Self {
        Self {
            id: ChatId::Group(gid),
            name: name.into(),
            alias: None,
            members: Vec::new(),
        }
    }

    /// 群临时会话
    pub fn private(uin: u64, origin_group: u64, name: impl Into<String>) -> Self {
        Self {
            id: ChatId::Private {
                user: uin,
                group: origin_group,
            },
            name: name.into(),
            alias: None,
            members: Vec::new(),
        }
    }

    pub fn with_members(mut self, members: Vec<Member>) -> Self {
        self.members = members;
        self
    }

    /// 私聊会话中的对方
    pub fn other(&self) -> Option<Member> {
        match self.id {
            ChatId::Friend(uid) | ChatId::Private { user: uid, .. } => Some(Member::new(
                uid,
                self.name.clone(),
                self.alias.clone(),
                self.id.clone(),
            )),
            _ => None,
        }
    }

    pub fn find_member(&self, uid: u64) -> Option<&Member> {
        self.members.iter().find(|m| m.uid == uid)
    }

    pub fn display_name(&self) -> &str {
        self.alias
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.name)
    }
}

// ----------------------------------------------------------------------------
// 消息
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MsgType {
    Text,
    Link,
    Image,
    Sticker,
    Animation,
    Voice,
    Video,
    File,
}

impl MsgType {
    /// 需要携带二进制载荷的类型
    pub fn is_media(&self) -> bool {
        !matches!(self, MsgType::Text | MsgType::Link)
    }
}

/// @ 的目标
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mention {
    User { uid: u64, name: String },
    All,
}

/// 文本区间 `[start, end)` 到 @ 目标的映射，偏移以字符 (char) 计
///
/// 序列化为按起点排序的 `[{"start", "end", "mention"}]` 数组。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Substitutions(BTreeMap<(usize, usize), Mention>);

#[derive(Serialize, Deserialize)]
struct Span<M> {
    start: usize,
    end: usize,
    mention: M,
}

impl Serialize for Substitutions {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.0.iter().map(|(&(start, end), mention)| Span {
            start,
            end,
            mention,
        }))
    }
}

impl<'de> Deserialize<'de> for Substitutions {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let spans = Vec::<Span<Mention>>::deserialize(deserializer)?;
        let mut subs = Substitutions::new();
        for span in spans {
            if !subs.insert(span.start, span.end, span.mention) {
                return Err(serde::de::Error::custom(format!(
                    "invalid or overlapping mention range {}..{}",
                    span.start, span.end
                )));
            }
        }
        Ok(subs)
    }
}

impl Substitutions {
    pub fn new() -> Self {
        Self::default()
    }

    /// 插入一个区间。区间非法或与已有区间重叠时返回 false
    pub fn insert(&mut self, start: usize, end: usize, mention: Mention) -> bool {
        if start > end || self.overlaps(start, end) {
            return false;
        }
        self.0.insert((start, end), mention);
        true
    }

    fn overlaps(&self, start: usize, end: usize) -> bool {
        self.0
            .keys()
            .any(|&(s, e)| (start < e && s < end) || (start == s && end == e))
    }

    /// 将 `other` 的所有区间平移 `offset` 后并入
    pub fn extend_shifted(&mut self, other: Substitutions, offset: usize) {
        for ((s, e), mention) in other.0 {
            self.insert(s + offset, e + offset, mention);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&(usize, usize), &Mention)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// 校验所有区间都落在 `[0, text_len]` 内且互不重叠
    pub fn is_valid_for(&self, text_len: usize) -> bool {
        let mut last_end = 0;
        for &(s, e) in self.0.keys() {
            if s > e || e > text_len || s < last_end {
                return false;
            }
            last_end = e;
        }
        true
    }
}

/// 二进制载荷句柄：媒体文件的本地存储位置
///
/// 载荷的生命周期由 `MediaStore` 管理，投递或发送完成后必须释放且只释放一次。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaFile {
    pub path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
}

impl MediaFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            mime: None,
            source_url: None,
        }
    }
}

/// 中间件交换的归一化消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedMessage {
    pub uid: String,
    pub msg_type: MsgType,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Substitutions::is_empty")]
    pub substitutions: Substitutions,
    pub chat: Chat,
    pub author: Member,
    /// 被引用 / 回复的消息
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<Box<NormalizedMessage>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<MediaFile>,
}

impl NormalizedMessage {
    pub fn new(msg_type: MsgType, chat: Chat, author: Member) -> Self {
        Self {
            uid: String::new(),
            msg_type,
            text: String::new(),
            substitutions: Substitutions::new(),
            chat,
            author,
            target: None,
            file: None,
        }
    }

    pub fn text(chat: Chat, author: Member, text: impl Into<String>) -> Self {
        let mut msg = Self::new(MsgType::Text, chat, author);
        msg.text = text.into();
        msg
    }

    pub fn with_uid(mut self, uid: impl Into<String>) -> Self {
        self.uid = uid.into();
        self
    }

    pub fn with_target(mut self, target: NormalizedMessage) -> Self {
        self.target = Some(Box::new(target));
        self
    }

    pub fn with_file(mut self, file: MediaFile) -> Self {
        self.file = Some(file);
        self
    }

    /// 文本长度 (字符数)，与 substitutions 的偏移单位一致
    pub fn text_len(&self) -> usize {
        self.text.chars().count()
    }
}
