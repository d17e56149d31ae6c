//! 中间件总线接口
//!
//! 桥接层只负责把转换好的消息推给总线，投递 / 路由语义由总线自己保证。

use crate::info;
use crate::model::{MsgType, NormalizedMessage};
use async_trait::async_trait;
use tokio::sync::mpsc;

#[async_trait]
pub trait MiddlewareBus: Send + Sync + 'static {
    /// 推送一条入站消息 (fire-and-forget)
    async fn deliver_message(&self, message: &NormalizedMessage);
}

/// 转发到 mpsc 通道，供宿主或测试消费
pub struct ChannelBus {
    tx: mpsc::UnboundedSender<NormalizedMessage>,
}

impl ChannelBus {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<NormalizedMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl MiddlewareBus for ChannelBus {
    async fn deliver_message(&self, message: &NormalizedMessage) {
        // 接收端已关闭时直接丢弃
        let _ = self.tx.send(message.clone());
    }
}

/// 仅打印日志的总线
#[derive(Debug, Default)]
pub struct LoggingBus;

#[async_trait]
impl MiddlewareBus for LoggingBus {
    async fn deliver_message(&self, message: &NormalizedMessage) {
        let body = match message.msg_type {
            MsgType::Text | MsgType::Link => message.text.clone(),
            other => match &message.file {
                Some(file) => format!("[{:?}] {}", other, file.path.display()),
                None => format!("[{:?}]", other),
            },
        };
        info!(
            target: "Bus",
            "{} | {}({}): {}",
            message.uid,
            message.author.display_name(),
            message.chat.display_name(),
            body
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Chat, Member};

    #[tokio::test]
    async fn test_channel_bus_forwards_in_order() {
        let (bus, mut rx) = ChannelBus::new();
        let chat = Chat::friend(1, "a", None);
        let author = chat.other().unwrap();

        for uid in ["x_1_0", "x_1"] {
            let msg = NormalizedMessage::text(chat.clone(), author.clone(), "t").with_uid(uid);
            bus.deliver_message(&msg).await;
        }

        assert_eq!(rx.recv().await.unwrap().uid, "x_1_0");
        assert_eq!(rx.recv().await.unwrap().uid, "x_1");
    }

    #[tokio::test]
    async fn test_channel_bus_ignores_closed_receiver() {
        let (bus, rx) = ChannelBus::new();
        drop(rx);
        let chat = Chat::group(1, "g");
        let msg = NormalizedMessage::text(chat.clone(), Member::new(2, "b", None, chat.id), "t");
        bus.deliver_message(&msg).await;
    }
}
