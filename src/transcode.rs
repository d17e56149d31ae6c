//! 消息转换
//!
//! - [`inbound`]：平台消息链 -> 归一化消息 (文本合并 + 媒体拆分)
//! - [`outbound`]：归一化消息 -> 平台消息链

pub mod inbound;
pub mod outbound;

pub use inbound::{Fragment, InboundTranscoder};
pub use outbound::{OutboundSender, encode};

/// 截断引用预览，超出 `max` 个字符时追加省略号
pub fn truncate_preview(text: &str, max: usize) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(max).collect();
    if chars.next().is_some() {
        format!("{}…", head)
    } else {
        head
    }
}
