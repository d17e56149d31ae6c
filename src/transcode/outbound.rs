//! 出站转换与发送
//!
//! 归一化消息 -> mirai 消息链 -> 平台发送接口，发送成功后以平台返回的消息 ID 替换 `uid`。

use super::truncate_preview;
use crate::chat_id::ChatId;
use crate::config::{SendConfig, TranscodeConfig};
use crate::error::{BridgeError, BridgeResult};
use crate::info;
use crate::media::MediaStore;
use crate::model::{MsgType, NormalizedMessage};
use crate::platform::{PlatformApi, Segment, SendTarget, SentMessage};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// 编码为平台消息链
///
/// 文本 / 链接消息若引用了其它消息，先 @ 原作者，再把截断后的引用预览与正文用空行隔开。
pub fn encode(msg: &NormalizedMessage, quote_max_length: usize) -> BridgeResult<Vec<Segment>> {
    match msg.msg_type {
        MsgType::Text | MsgType::Link => {
            let mut chain = Vec::with_capacity(2);
            let text = match &msg.target {
                Some(target) => {
                    chain.push(Segment::at(target.author.uid));
                    format!(
                        "{}\n\n{}",
                        truncate_preview(&target.text, quote_max_length),
                        msg.text
                    )
                }
                None => msg.text.clone(),
            };
            chain.push(Segment::plain(text));
            Ok(chain)
        }
        MsgType::Image | MsgType::Sticker | MsgType::Animation => {
            let file = msg
                .file
                .as_ref()
                .ok_or(BridgeError::UnsupportedMessage(msg.msg_type))?;
            Ok(vec![Segment::image_path(file.path.to_string_lossy())])
        }
        other => Err(BridgeError::UnsupportedMessage(other)),
    }
}

/// 复合会话 ID -> 发送目标
pub fn send_target(chat: &ChatId) -> BridgeResult<SendTarget> {
    match chat {
        ChatId::Friend(id) => Ok(SendTarget::Friend(*id)),
        ChatId::Group(id) => Ok(SendTarget::Group(*id)),
        ChatId::Private { user, group } => Ok(SendTarget::Temp {
            user: *user,
            group: *group,
        }),
        ChatId::Other { .. } => Err(BridgeError::UnresolvedChat(chat.to_string())),
    }
}

pub struct OutboundSender {
    platform: Arc<dyn PlatformApi>,
    media: Arc<dyn MediaStore>,
    quote_max_length: usize,
    ordered: bool,
    /// 每个会话一把公平锁，保证同一会话的发送按到达顺序进行
    chat_locks: Mutex<HashMap<ChatId, Arc<tokio::sync::Mutex<()>>>>,
}

impl OutboundSender {
    pub fn new(
        platform: Arc<dyn PlatformApi>,
        media: Arc<dyn MediaStore>,
        transcode: &TranscodeConfig,
        send: &SendConfig,
    ) -> Self {
        Self {
            platform,
            media,
            quote_max_length: transcode.quote_max_length,
            ordered: send.ordered_per_chat,
            chat_locks: Mutex::new(HashMap::new()),
        }
    }

    /// 发送并回填平台消息 ID
    ///
    /// 无论成功与否，消息携带的载荷都会在返回前释放，返回的消息不再持有载荷。
    pub async fn send(&self, mut msg: NormalizedMessage) -> BridgeResult<NormalizedMessage> {
        let result = self.transmit(&msg).await;

        if let Some(file) = msg.file.take() {
            self.media.release(&file).await;
        }

        let sent = result?;
        info!(
            target: "Outbound",
            "已发送到 {} (messageId: {})",
            msg.chat.id,
            sent.message_id
        );
        msg.uid = sent.message_id.to_string();
        Ok(msg)
    }

    async fn transmit(&self, msg: &NormalizedMessage) -> BridgeResult<SentMessage> {
        let target = send_target(&msg.chat.id)?;
        let chain = encode(msg, self.quote_max_length)?;

        if !self.ordered {
            return self.platform.send_message(target, chain).await;
        }

        let lock = self.chat_lock(&msg.chat.id);
        let result = {
            let _turn = lock.lock().await;
            self.platform.send_message(target, chain).await
        };
        drop(lock);
        self.prune_locks();
        result
    }

    fn chat_lock(&self, chat: &ChatId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .chat_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(chat.clone()).or_default().clone()
    }

    /// 移除无人等待的会话锁
    fn prune_locks(&self) {
        let mut locks = self
            .chat_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }
}
