use qq_bridge::prelude::*;
use qq_bridge::{error, info, log};
use std::sync::Arc;
use std::time::Duration;

fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());

    let manager = ConfigManager::new(&config_path);
    let config = manager.load()?;
    log::set_debug(config.debug);
    info!("配置已加载: {}", manager.path().display());

    let platform = Arc::new(MiraiClient::new(config.mirai.clone())?);
    let media = Arc::new(HttpMediaStore::new(
        config.media.download_dir.clone(),
        config.mirai.request_timeout(),
    )?);
    let bridge = Arc::new(Bridge::new(&config, platform, media, Arc::new(LoggingBus)));

    // Ctrl-C -> 停止事件循环
    {
        let bridge = bridge.clone();
        std::thread::spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    error!("无法注册 Ctrl-C 处理: {}", e);
                    return;
                }
            };
            if runtime.block_on(tokio::signal::ctrl_c()).is_ok() {
                bridge.stop_polling();
            }
        });
    }

    // 事件循环启动后列出会话
    {
        let bridge = bridge.clone();
        std::thread::spawn(move || {
            while bridge.state() != LoopState::Polling {
                std::thread::sleep(Duration::from_millis(50));
            }
            match bridge.list_chats() {
                Ok(chats) => info!("共 {} 个会话", chats.len()),
                Err(e) => error!("获取会话列表失败: {}", e),
            }
        });
    }

    bridge.poll()?;
    info!("已退出");
    Ok(())
}
