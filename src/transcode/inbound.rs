//! 入站转换：mirai 消息链 -> 归一化消息
//!
//! 每个消息段先转换为若干片段 (Fragment)；文本与 @ 片段按顺序合并为一条带标注的文本消息，
//! 媒体片段各自成为独立消息并先于合并文本投递。

use super::truncate_preview;
use crate::config::{ConversionPolicy, TranscodeConfig};
use crate::directory::Directory;
use crate::error::{BridgeError, BridgeResult};
use crate::media::MediaStore;
use crate::model::{Chat, MediaFile, Member, Mention, MsgType, NormalizedMessage, Substitutions};
use crate::platform::segment::{ImageData, plain_text, source_id};
use crate::platform::Segment;
use crate::{debug, warn};
use std::sync::Arc;

/// 转换中间结果
#[derive(Debug, Clone, PartialEq)]
pub enum Fragment {
    /// 文本，可附带相对于自身起点的 @ 标注
    Text {
        text: String,
        substitutions: Substitutions,
    },
    /// 引用回复：预览文本并入合并文本，被引用消息挂到合并文本消息上
    Reply {
        target: Box<NormalizedMessage>,
        preview: String,
    },
    /// 非文本载荷，单独成为一条消息
    Media { msg_type: MsgType, file: MediaFile },
}

impl Fragment {
    pub fn text(text: impl Into<String>) -> Self {
        Fragment::Text {
            text: text.into(),
            substitutions: Substitutions::new(),
        }
    }

    /// 整段文本都是一个 @
    pub fn mention(text: impl Into<String>, mention: Mention) -> Self {
        let text = text.into();
        let mut substitutions = Substitutions::new();
        substitutions.insert(0, text.chars().count(), mention);
        Fragment::Text {
            text,
            substitutions,
        }
    }

    fn media_file(&self) -> Option<&MediaFile> {
        match self {
            Fragment::Media { file, .. } => Some(file),
            _ => None,
        }
    }
}

/// 合并片段
///
/// 媒体片段的 ID 为 `<chat>_<msgid>_<片段序号>`，合并文本的 ID 为 `<chat>_<msgid>`。
/// 标注区间按合并前的累计文本长度 (字符数) 平移。
pub fn merge(
    fragments: Vec<Fragment>,
    chat: &Chat,
    author: &Member,
    message_id: i64,
) -> Vec<NormalizedMessage> {
    let mut out = Vec::new();
    let mut text = String::new();
    let mut text_len = 0;
    let mut substitutions = Substitutions::new();
    let mut reply_to = None;

    for (idx, fragment) in fragments.into_iter().enumerate() {
        match fragment {
            Fragment::Text {
                text: part,
                substitutions: part_subs,
            } => {
                substitutions.extend_shifted(part_subs, text_len);
                text_len += part.chars().count();
                text.push_str(&part);
            }
            Fragment::Reply { target, preview } => {
                text_len += preview.chars().count();
                text.push_str(&preview);
                reply_to = Some(target);
            }
            Fragment::Media { msg_type, file } => {
                let msg = NormalizedMessage::new(msg_type, chat.clone(), author.clone())
                    .with_uid(format!("{}_{}_{}", chat.id, message_id, idx))
                    .with_file(file);
                out.push(msg);
            }
        }
    }

    if !text.is_empty() {
        let mut msg = NormalizedMessage::text(chat.clone(), author.clone(), text)
            .with_uid(format!("{}_{}", chat.id, message_id));
        msg.substitutions = substitutions;
        msg.target = reply_to;
        out.push(msg);
    }

    out
}

/// 卡片消息 (App / Json) 的提示文字
fn card_prompt(content: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(content).ok()?;
    value
        .get("prompt")?
        .as_str()
        .filter(|s| !s.is_empty())
        .map(String::from)
}

pub struct InboundTranscoder {
    directory: Arc<Directory>,
    media: Arc<dyn MediaStore>,
    policy: ConversionPolicy,
    quote_max_length: usize,
}

impl InboundTranscoder {
    pub fn new(
        directory: Arc<Directory>,
        media: Arc<dyn MediaStore>,
        config: &TranscodeConfig,
    ) -> Self {
        Self {
            directory,
            media,
            policy: config.conversion_policy,
            quote_max_length: config.quote_max_length,
        }
    }

    /// 转换一条完整的消息链
    pub async fn transcode(
        &self,
        chain: &[Segment],
        chat: &Chat,
        author: &Member,
    ) -> BridgeResult<Vec<NormalizedMessage>> {
        let message_id = source_id(chain)
            .ok_or_else(|| BridgeError::segment("Source", "message chain has no source"))?;

        // 第一个元素总是 Source
        let body = match chain.first() {
            Some(Segment::Source { .. }) => &chain[1..],
            _ => chain,
        };

        let mut fragments = Vec::new();
        for segment in body {
            match self.convert(segment, chat).await {
                Ok(parts) => fragments.extend(parts),
                Err(e) if self.policy == ConversionPolicy::BestEffort => {
                    warn!(
                        target: "Inbound",
                        "消息 {} 的 {} 段转换失败，已跳过: {}",
                        message_id,
                        segment.kind(),
                        e
                    );
                }
                Err(e) => {
                    for file in fragments.iter().filter_map(Fragment::media_file) {
                        self.media.release(file).await;
                    }
                    return Err(e);
                }
            }
        }

        Ok(merge(fragments, chat, author, message_id))
    }

    /// 单个消息段的转换，按段类型静态分派
    pub async fn convert(&self, segment: &Segment, chat: &Chat) -> BridgeResult<Vec<Fragment>> {
        let fragment = match segment {
            Segment::Source { .. } => return Ok(Vec::new()),
            Segment::Plain { text } => Fragment::text(text.clone()),
            Segment::At { target, display } => {
                let name = self.mention_name(chat, *target, display).await;
                Fragment::mention(
                    format!("@{}", name),
                    Mention::User {
                        uid: *target,
                        name,
                    },
                )
            }
            Segment::AtAll => Fragment::mention("@all", Mention::All),
            Segment::Face { face_id, name } => {
                if name.is_empty() {
                    Fragment::text(format!("[Face: {}]", face_id))
                } else {
                    Fragment::text(format!("[Face: {}]", name))
                }
            }
            Segment::Quote {
                id,
                sender_id,
                origin,
                ..
            } => self.reply(chat, *id, *sender_id, origin).await,
            Segment::Image(data) => {
                let msg_type = if data.is_gif() {
                    MsgType::Animation
                } else {
                    MsgType::Image
                };
                self.image(data, msg_type, "Image").await?
            }
            Segment::FlashImage(data) => self.image(data, MsgType::Image, "FlashImage").await?,
            Segment::Voice { url, .. } => {
                let url = url
                    .as_deref()
                    .ok_or_else(|| BridgeError::segment("Voice", "voice carries no url"))?;
                let file = self
                    .media
                    .fetch(url, MsgType::Voice)
                    .await
                    .map_err(|e| BridgeError::segment("Voice", e.to_string()))?;
                Fragment::Media {
                    msg_type: MsgType::Voice,
                    file,
                }
            }
            Segment::MarketFace { name, .. } => Fragment::text(format!("[Sticker: {}]", name)),
            Segment::Xml { .. } => Fragment::text("[XML]"),
            Segment::Json { json } => {
                Fragment::text(card_prompt(json).unwrap_or_else(|| "[JSON]".to_string()))
            }
            Segment::App { content } => {
                Fragment::text(card_prompt(content).unwrap_or_else(|| "[App]".to_string()))
            }
            Segment::Poke { name } => Fragment::text(format!("[Poke: {}]", name)),
            Segment::Dice { value } => Fragment::text(format!("[Dice: {}]", value)),
            Segment::MusicShare {
                title,
                summary,
                jump_url,
            } => Fragment::text(format!("[Music] {} - {}\n{}", title, summary, jump_url)),
            Segment::Forward { .. } => Fragment::text("[Forwarded messages]"),
            Segment::File { name, size, .. } => {
                Fragment::text(format!("[File: {} ({} bytes)]", name, size))
            }
            Segment::Invalid { kind, reason } => {
                return Err(BridgeError::segment(
                    "Invalid",
                    format!("malformed {} segment: {}", kind, reason),
                ));
            }
            Segment::Unsupported => {
                return Err(BridgeError::segment(
                    "Unsupported",
                    "segment type is not recognized",
                ));
            }
        };

        Ok(vec![fragment])
    }

    async fn image(
        &self,
        data: &ImageData,
        msg_type: MsgType,
        kind: &'static str,
    ) -> BridgeResult<Fragment> {
        let url = data
            .url
            .as_deref()
            .ok_or_else(|| BridgeError::segment(kind, "image carries no url"))?;
        let file = self
            .media
            .fetch(url, msg_type)
            .await
            .map_err(|e| BridgeError::segment(kind, e.to_string()))?;
        Ok(Fragment::Media { msg_type, file })
    }

    /// @ 显示名：备注 > 群名片 > 段自带的显示文本 > 陌生人昵称 > QQ 号
    async fn mention_name(&self, chat: &Chat, target: u64, display: &str) -> String {
        if let Some(member) = self.known_member(chat, target).await {
            return member.display_name();
        }

        let display = display.trim_start_matches('@');
        if !display.is_empty() {
            return display.to_string();
        }

        match self.directory.stranger_name(target).await {
            Ok(name) if !name.is_empty() => name,
            Ok(_) => target.to_string(),
            Err(e) => {
                debug!(target: "Inbound", "查询 {} 的昵称失败: {}", target, e);
                target.to_string()
            }
        }
    }

    /// 会话内已知的成员 (群名单或私聊对方)
    async fn known_member(&self, chat: &Chat, uid: u64) -> Option<Member> {
        if let Some(member) = chat.find_member(uid) {
            return Some(member.clone());
        }
        if let Some(other) = chat.other().filter(|m| m.uid == uid) {
            return Some(other);
        }
        if !chat.id.is_group() {
            return None;
        }

        let gid = chat.id.platform_id()?;
        match self.directory.group_member(gid, uid).await {
            Ok(member) => member,
            Err(e) => {
                debug!(target: "Inbound", "查询群 {} 成员 {} 失败: {}", gid, uid, e);
                None
            }
        }
    }

    async fn reply(&self, chat: &Chat, id: i64, sender_id: u64, origin: &[Segment]) -> Fragment {
        let quoted = plain_text(origin);
        let author = match chat.id.platform_id().filter(|_| chat.id.is_group()) {
            Some(gid) => self.directory.cached_member(gid, sender_id),
            None => chat.other().filter(|m| m.uid == sender_id),
        }
        .unwrap_or_else(|| Member::new(sender_id, String::new(), None, chat.id.clone()));

        let target = NormalizedMessage::text(chat.clone(), author, quoted.clone())
            .with_uid(format!("{}_{}", chat.id, id));

        Fragment::Reply {
            target: Box::new(target),
            preview: format!("「{}」\n", truncate_preview(&quoted, self.quote_max_length)),
        }
    }
}
