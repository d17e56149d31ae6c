//! 面向宿主的桥接入口
//!
//! 同步方法 (`list_chats`、`get_chat`、`send_message` 等) 供事件循环之外的调用方使用，
//! 内部经由 [`Executor`] 投递到事件循环执行；事件循环内部请使用对应的 `*_async` 方法。

use crate::bus::MiddlewareBus;
use crate::chat_id::{ChatId, from_composite_id};
use crate::config::BridgeConfig;
use crate::directory::Directory;
use crate::dispatch::{EventHandler, EventLoop, LoopState};
use crate::error::BridgeResult;
use crate::executor::Executor;
use crate::media::MediaStore;
use crate::model::{Chat, Member, NormalizedMessage};
use crate::platform::PlatformApi;
use crate::transcode::OutboundSender;
use std::sync::Arc;

pub struct Bridge {
    directory: Arc<Directory>,
    sender: Arc<OutboundSender>,
    executor: Arc<Executor>,
    event_loop: EventLoop,
}

impl Bridge {
    pub fn new(
        config: &BridgeConfig,
        platform: Arc<dyn PlatformApi>,
        media: Arc<dyn MediaStore>,
        bus: Arc<dyn MiddlewareBus>,
    ) -> Self {
        let directory = Arc::new(Directory::new(platform.clone(), &config.cache));
        let executor = Arc::new(Executor::new());
        let sender = Arc::new(OutboundSender::new(
            platform.clone(),
            media.clone(),
            &config.transcode,
            &config.send,
        ));
        let handler = Arc::new(EventHandler::new(
            directory.clone(),
            media,
            bus,
            &config.transcode,
        ));
        let event_loop = EventLoop::new(
            platform,
            handler,
            executor.clone(),
            config.mirai.reconnect_interval(),
        );

        Self {
            directory,
            sender,
            executor,
            event_loop,
        }
    }

    pub fn directory(&self) -> &Arc<Directory> {
        &self.directory
    }

    pub fn state(&self) -> LoopState {
        self.event_loop.state()
    }

    // ------------------------------------------------------------------------
    // 事件循环
    // ------------------------------------------------------------------------

    /// 开始接收事件，阻塞直到 `stop_polling`
    pub fn poll(&self) -> BridgeResult<()> {
        self.event_loop.poll()
    }

    pub fn stop_polling(&self) {
        self.event_loop.stop();
    }

    // ------------------------------------------------------------------------
    // 目录 (异步)
    // ------------------------------------------------------------------------

    /// 好友 ∪ 群
    pub async fn list_chats_async(&self) -> BridgeResult<Vec<Chat>> {
        list_chats(&self.directory).await
    }

    pub async fn get_chat_async(&self, composite_id: &str) -> BridgeResult<Option<Chat>> {
        let id = from_composite_id(composite_id)?;
        self.directory.resolve_chat(&id).await
    }

    pub async fn get_group_members_async(&self, group_id: u64) -> BridgeResult<Vec<Member>> {
        Ok(self.directory.group_members(group_id, true).await?.to_vec())
    }

    pub async fn send_message_async(
        &self,
        message: NormalizedMessage,
    ) -> BridgeResult<NormalizedMessage> {
        self.sender.send(message).await
    }

    // ------------------------------------------------------------------------
    // 目录 (同步)
    // ------------------------------------------------------------------------

    pub fn list_chats(&self) -> BridgeResult<Vec<Chat>> {
        let directory = self.directory.clone();
        self.executor
            .block_on(async move { list_chats(&directory).await })
    }

    /// 解析复合会话 ID；临时会话与未知前缀返回 None
    pub fn get_chat(&self, composite_id: &str) -> BridgeResult<Option<Chat>> {
        let id: ChatId = from_composite_id(composite_id)?;
        let directory = self.directory.clone();
        self.executor
            .block_on(async move { directory.resolve_chat(&id).await })
    }

    /// 群成员名单 (总是刷新)
    pub fn get_group_members(&self, group_id: u64) -> BridgeResult<Vec<Member>> {
        let directory = self.directory.clone();
        self.executor.block_on(async move {
            Ok(directory.group_members(group_id, true).await?.to_vec())
        })
    }

    /// 发送消息，返回以平台消息 ID 替换 `uid` 后的消息
    pub fn send_message(&self, message: NormalizedMessage) -> BridgeResult<NormalizedMessage> {
        let sender = self.sender.clone();
        self.executor
            .block_on(async move { sender.send(message).await })
    }
}

async fn list_chats(directory: &Directory) -> BridgeResult<Vec<Chat>> {
    let mut chats = directory.friend_chats().await?;
    chats.extend(directory.group_chats().await?);
    Ok(chats)
}
