//! 事件分发循环
//!
//! 两个状态：Idle (无订阅) 与 Polling (订阅中)。
//! `poll` 在调用线程上建立新的单线程事件循环并阻塞运行，直到 `stop` 被调用；
//! 每个推送事件作为独立任务处理，任务内的错误与 panic 只记录日志，不影响循环。

use crate::bus::MiddlewareBus;
use crate::config::TranscodeConfig;
use crate::directory::Directory;
use crate::error::{BridgeError, BridgeResult};
use crate::executor::Executor;
use crate::media::MediaStore;
use crate::model::{Chat, MediaFile, Member};
use crate::platform::{PlatformApi, PlatformEvent, Segment};
use crate::transcode::InboundTranscoder;
use crate::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::runtime::{Builder, Handle};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinSet};

/// 停止后等待进行中事件处理的时长
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Polling,
}

// ============================================================================
// 单个事件的处理
// ============================================================================

type Resolved = (Vec<Segment>, Chat, Member);

/// 尚未交还的载荷
///
/// 处理任务 panic 或被取消时，剩余载荷在 Drop 中移入 `orphans`，
/// 由事件循环稍后统一释放。
struct PendingPayloads {
    files: Vec<MediaFile>,
    orphans: Arc<Mutex<Vec<MediaFile>>>,
}

impl PendingPayloads {
    fn take(&mut self, file: &MediaFile) {
        if let Some(pos) = self.files.iter().position(|f| f == file) {
            self.files.swap_remove(pos);
        }
    }
}

impl Drop for PendingPayloads {
    fn drop(&mut self) {
        if !self.files.is_empty() {
            lock(&self.orphans).append(&mut self.files);
        }
    }
}

pub struct EventHandler {
    directory: Arc<Directory>,
    media: Arc<dyn MediaStore>,
    bus: Arc<dyn MiddlewareBus>,
    transcoder: InboundTranscoder,
    orphans: Arc<Mutex<Vec<MediaFile>>>,
}

impl EventHandler {
    pub fn new(
        directory: Arc<Directory>,
        media: Arc<dyn MediaStore>,
        bus: Arc<dyn MiddlewareBus>,
        config: &TranscodeConfig,
    ) -> Self {
        let transcoder = InboundTranscoder::new(directory.clone(), media.clone(), config);
        Self {
            directory,
            media,
            bus,
            transcoder,
            orphans: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// 根据事件类型构造会话与发送者
    async fn resolve(&self, event: PlatformEvent) -> BridgeResult<Option<Resolved>> {
        let resolved = match event {
            PlatformEvent::GroupMessage {
                message_chain,
                sender,
            } => {
                let chat = Chat::group(sender.group.id, sender.group.name);
                let alias = self.directory.friend_remark(sender.id).await?;
                let author = Member::new(sender.id, sender.member_name, alias, chat.id.clone());
                (message_chain, chat, author)
            }
            PlatformEvent::FriendMessage {
                message_chain,
                sender,
            } => {
                let remark = Some(sender.remark).filter(|r| !r.is_empty());
                let chat = Chat::friend(sender.id, sender.nickname, remark);
                let author = chat.other().ok_or_else(|| {
                    BridgeError::Scheduler(format!("{} has no counterpart", chat.id))
                })?;
                (message_chain, chat, author)
            }
            PlatformEvent::TempMessage {
                message_chain,
                sender,
            } => {
                let chat = Chat::private(sender.id, sender.group.id, sender.member_name);
                let author = chat.other().ok_or_else(|| {
                    BridgeError::Scheduler(format!("{} has no counterpart", chat.id))
                })?;
                (message_chain, chat, author)
            }
            PlatformEvent::Other => return Ok(None),
        };
        Ok(Some(resolved))
    }

    /// 处理一个推送事件，返回投递到总线的消息数
    ///
    /// 消息按转换结果的顺序投递，载荷在交给总线后立即释放。
    pub async fn handle(&self, event: PlatformEvent) -> BridgeResult<usize> {
        let Some((chain, chat, author)) = self.resolve(event).await? else {
            return Ok(0);
        };

        let messages = self.transcoder.transcode(&chain, &chat, &author).await?;
        let mut pending = PendingPayloads {
            files: messages.iter().filter_map(|m| m.file.clone()).collect(),
            orphans: self.orphans.clone(),
        };

        for message in &messages {
            self.bus.deliver_message(message).await;
            if let Some(file) = &message.file {
                pending.take(file);
                self.media.release(file).await;
            }
        }
        Ok(messages.len())
    }

    /// 释放中断的处理任务遗留的载荷
    pub async fn release_orphans(&self) {
        let files = std::mem::take(&mut *lock(&self.orphans));
        if files.is_empty() {
            return;
        }

        warn!(target: "Loop", "释放 {} 个中断任务遗留的载荷", files.len());
        for file in &files {
            self.media.release(file).await;
        }
    }
}

// ============================================================================
// 事件循环
// ============================================================================

pub struct EventLoop {
    platform: Arc<dyn PlatformApi>,
    handler: Arc<EventHandler>,
    executor: Arc<Executor>,
    reconnect_interval: Duration,
    /// Polling 状态下持有停止信号的发送端
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    /// Idle 状态下收到的停止请求，由下一次 `poll` 消费
    stop_requested: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// 回收一个事件处理任务的结果，错误与 panic 在这里兜底
fn report(result: Result<BridgeResult<usize>, JoinError>) {
    match result {
        Ok(Ok(count)) => debug!(target: "Loop", "事件处理完成，投递 {} 条消息", count),
        Ok(Err(e)) => error!(target: "Loop", "事件处理失败: {}", e),
        Err(e) if e.is_panic() => {
            let payload = e.into_panic();
            let reason = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(target: "Loop", "事件处理任务崩溃: {}", reason);
        }
        Err(_) => debug!(target: "Loop", "事件处理任务已取消"),
    }
}

impl EventLoop {
    pub fn new(
        platform: Arc<dyn PlatformApi>,
        handler: Arc<EventHandler>,
        executor: Arc<Executor>,
        reconnect_interval: Duration,
    ) -> Self {
        Self {
            platform,
            handler,
            executor,
            reconnect_interval,
            shutdown: Mutex::new(None),
            stop_requested: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> LoopState {
        if lock(&self.shutdown).is_some() {
            LoopState::Polling
        } else {
            LoopState::Idle
        }
    }

    /// Idle -> Polling，阻塞直到 `stop` 被调用
    pub fn poll(&self) -> BridgeResult<()> {
        if Handle::try_current().is_ok() {
            return Err(BridgeError::Scheduler(
                "poll must be called from outside the event loop".into(),
            ));
        }

        let shutdown = {
            let mut slot = lock(&self.shutdown);
            if slot.is_some() {
                return Err(BridgeError::Scheduler("event loop is already polling".into()));
            }
            if self.stop_requested.swap(false, Ordering::SeqCst) {
                info!(target: "Loop", "启动前已收到停止信号，不再订阅");
                return Ok(());
            }
            let (tx, rx) = watch::channel(false);
            *slot = Some(tx);
            rx
        };

        let result = self.run_fresh_loop(shutdown);
        *lock(&self.shutdown) = None;
        info!(target: "Loop", "事件循环已停止");
        result
    }

    fn run_fresh_loop(&self, shutdown: watch::Receiver<bool>) -> BridgeResult<()> {
        let runtime = Builder::new_current_thread().enable_all().build()?;

        // 先释放上一次的会话
        if let Err(e) = runtime.block_on(self.platform.release()) {
            warn!(target: "Loop", "释放旧会话失败: {}", e);
        }

        self.executor.attach(runtime.handle().clone());
        info!(target: "Loop", "开始接收事件");
        runtime.block_on(self.run(shutdown));
        self.executor.detach();

        runtime.shutdown_timeout(Duration::from_secs(1));
        Ok(())
    }

    /// Polling -> Idle：发出停止信号，不再接收新事件
    ///
    /// Idle 时调用会被记下，下一次 `poll` 直接返回。
    pub fn stop(&self) {
        let slot = lock(&self.shutdown);
        match slot.as_ref() {
            Some(tx) => {
                let _ = tx.send(true);
                info!(target: "Loop", "收到停止信号");
            }
            None => {
                self.stop_requested.store(true, Ordering::SeqCst);
                info!(target: "Loop", "事件循环尚未运行，停止请求已记下");
            }
        }
    }

    async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut tasks = JoinSet::new();

        while !*shutdown.borrow() {
            let subscribed = tokio::select! {
                _ = shutdown.changed() => break,
                result = self.platform.subscribe() => result,
            };

            match subscribed {
                Ok(mut events) => {
                    if self.pump(&mut events, &mut tasks, &mut shutdown).await {
                        break;
                    }
                    warn!(target: "Loop", "事件流已断开");
                }
                Err(e) => error!(target: "Loop", "订阅事件失败: {}", e),
            }

            while let Some(result) = tasks.try_join_next() {
                report(result);
            }
            self.handler.release_orphans().await;

            info!(target: "Loop", "{}ms 后重连...", self.reconnect_interval.as_millis());
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(self.reconnect_interval) => {}
            }
        }

        self.drain(tasks).await;
    }

    /// 接收事件直到流结束 (返回 false) 或收到停止信号 (返回 true)
    async fn pump(
        &self,
        events: &mut mpsc::Receiver<PlatformEvent>,
        tasks: &mut JoinSet<BridgeResult<usize>>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        loop {
            tokio::select! {
                _ = shutdown.changed() => return true,
                Some(result) = tasks.join_next(), if !tasks.is_empty() => {
                    report(result);
                    self.handler.release_orphans().await;
                }
                event = events.recv() => match event {
                    Some(event) if event.is_message() => {
                        let handler = self.handler.clone();
                        tasks.spawn(async move { handler.handle(event).await });
                    }
                    Some(_) => {}
                    None => return false,
                },
            }
        }
    }

    /// 等待进行中的事件处理，超时后取消剩余任务
    async fn drain(&self, mut tasks: JoinSet<BridgeResult<usize>>) {
        if tasks.is_empty() {
            return;
        }

        info!(target: "Loop", "等待 {} 个进行中的事件处理", tasks.len());
        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            while let Some(result) = tasks.join_next().await {
                report(result);
            }
        })
        .await;

        if drained.is_err() {
            warn!(target: "Loop", "等待超时，取消剩余 {} 个任务", tasks.len());
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
        self.handler.release_orphans().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::ChannelBus;
    use crate::config::CacheConfig;
    use crate::media::testing::FakeMediaStore;
    use crate::platform::segment::ImageData;
    use crate::platform::testing::FakePlatform;
    use crate::platform::{FriendRecord, GroupRecord, MemberRecord};
    use std::sync::atomic::Ordering;

    fn group_event(msg_id: i64, chain: Vec<Segment>) -> PlatformEvent {
        let mut message_chain = vec![Segment::Source { id: msg_id, time: 0 }];
        message_chain.extend(chain);
        PlatformEvent::GroupMessage {
            message_chain,
            sender: MemberRecord {
                id: 1,
                member_name: "alice".into(),
                permission: "MEMBER".into(),
                special_title: String::new(),
                group: GroupRecord {
                    id: 100,
                    name: "Rustaceans".into(),
                    permission: "MEMBER".into(),
                },
            },
        }
    }

    struct Setup {
        platform: Arc<FakePlatform>,
        media: Arc<FakeMediaStore>,
        handler: Arc<EventHandler>,
        rx: mpsc::UnboundedReceiver<crate::model::NormalizedMessage>,
    }

    fn setup(platform: FakePlatform) -> Setup {
        let platform = Arc::new(platform);
        let directory = Arc::new(Directory::new(platform.clone(), &CacheConfig::default()));
        let media = Arc::new(FakeMediaStore::default());
        let (bus, rx) = ChannelBus::new();
        let handler = Arc::new(EventHandler::new(
            directory,
            media.clone(),
            Arc::new(bus),
            &TranscodeConfig::default(),
        ));
        Setup {
            platform,
            media,
            handler,
            rx,
        }
    }

    #[tokio::test]
    async fn test_group_event_author_carries_friend_remark() {
        let mut s = setup(FakePlatform::default().with_friend(1, "alice", "Ally"));

        let count = s
            .handler
            .handle(group_event(5, vec![Segment::plain("hi")]))
            .await
            .unwrap();
        assert_eq!(count, 1);

        let msg = s.rx.recv().await.unwrap();
        assert_eq!(msg.uid, "group_100_5");
        assert_eq!(msg.chat.name, "Rustaceans");
        assert_eq!(msg.author.name, "alice");
        assert_eq!(msg.author.alias.as_deref(), Some("Ally"));
    }

    #[tokio::test]
    async fn test_media_released_after_handoff() {
        let mut s = setup(FakePlatform::default());
        let image = Segment::Image(ImageData {
            image_id: Some("{X}.jpg".into()),
            url: Some("http://img/x.jpg".into()),
            path: None,
        });

        s.handler.handle(group_event(6, vec![image])).await.unwrap();

        let msg = s.rx.recv().await.unwrap();
        let file = msg.file.unwrap();
        assert_eq!(s.media.release_count(&file.path), 1);
    }

    /// 投递时 panic 或永不返回的总线
    struct BrokenBus {
        hang: bool,
    }

    #[async_trait::async_trait]
    impl MiddlewareBus for BrokenBus {
        async fn deliver_message(&self, _message: &crate::model::NormalizedMessage) {
            if self.hang {
                std::future::pending::<()>().await;
            }
            panic!("bus exploded");
        }
    }

    fn handler_with_bus(bus: BrokenBus) -> (Arc<EventHandler>, Arc<FakeMediaStore>) {
        let platform = Arc::new(FakePlatform::default());
        let directory = Arc::new(Directory::new(platform, &CacheConfig::default()));
        let media = Arc::new(FakeMediaStore::default());
        let handler = Arc::new(EventHandler::new(
            directory,
            media.clone(),
            Arc::new(bus),
            &TranscodeConfig::default(),
        ));
        (handler, media)
    }

    fn image_event(msg_id: i64) -> PlatformEvent {
        let image = Segment::Image(ImageData {
            image_id: Some("{Y}.jpg".into()),
            url: Some("http://img/y.jpg".into()),
            path: None,
        });
        group_event(msg_id, vec![image, Segment::plain("caption")])
    }

    #[tokio::test]
    async fn test_payload_released_when_bus_panics() {
        let (handler, media) = handler_with_bus(BrokenBus { hang: false });

        let task = {
            let handler = handler.clone();
            tokio::spawn(async move { handler.handle(image_event(20)).await })
        };
        assert!(task.await.unwrap_err().is_panic());
        assert_eq!(media.total_released(), 0);

        handler.release_orphans().await;
        assert_eq!(media.total_released(), 1);
        handler.release_orphans().await;
        assert_eq!(media.total_released(), 1);
    }

    #[tokio::test]
    async fn test_payload_released_when_task_aborted() {
        let (handler, media) = handler_with_bus(BrokenBus { hang: true });

        let task = {
            let handler = handler.clone();
            tokio::spawn(async move { handler.handle(image_event(21)).await })
        };
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        handler.release_orphans().await;
        assert_eq!(media.total_released(), 1);
    }

    #[tokio::test]
    async fn test_friend_and_temp_events() {
        let mut s = setup(FakePlatform::default());

        let friend = PlatformEvent::FriendMessage {
            message_chain: vec![Segment::Source { id: 1, time: 0 }, Segment::plain("yo")],
            sender: FriendRecord {
                id: 42,
                nickname: "bob".into(),
                remark: String::new(),
            },
        };
        s.handler.handle(friend).await.unwrap();
        let msg = s.rx.recv().await.unwrap();
        assert_eq!(msg.uid, "friend_42_1");
        assert_eq!(msg.author.uid, 42);
        assert_eq!(msg.author.alias, None);

        let PlatformEvent::GroupMessage {
            message_chain,
            sender,
        } = group_event(2, vec![Segment::plain("psst")])
        else {
            unreachable!()
        };
        s.handler
            .handle(PlatformEvent::TempMessage {
                message_chain,
                sender,
            })
            .await
            .unwrap();
        let msg = s.rx.recv().await.unwrap();
        assert_eq!(msg.uid, "private_1_100_2");
        assert_eq!(msg.chat.name, "alice");

        assert_eq!(s.handler.handle(PlatformEvent::Other).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_directory_failure_drops_event() {
        let s = setup(FakePlatform::default());
        s.platform.fail_friends.store(2, Ordering::SeqCst);

        let err = s
            .handler
            .handle(group_event(7, vec![Segment::plain("hi")]))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::DirectoryUnavailable { .. }));
    }

    #[test]
    fn test_poll_delivers_until_stopped_and_reconnects() {
        let mut s = setup(FakePlatform::default());
        let events = s.platform.event_sender();
        let event_loop = Arc::new(EventLoop::new(
            s.platform.clone(),
            s.handler.clone(),
            Arc::new(Executor::new()),
            Duration::from_millis(10),
        ));
        assert_eq!(event_loop.state(), LoopState::Idle);

        let runner = {
            let event_loop = event_loop.clone();
            std::thread::spawn(move || event_loop.poll())
        };

        events
            .blocking_send(group_event(8, vec![Segment::plain("one")]))
            .unwrap();
        let msg = s.rx.blocking_recv().unwrap();
        assert_eq!(msg.text, "one");
        assert_eq!(event_loop.state(), LoopState::Polling);
        assert!(matches!(event_loop.poll(), Err(BridgeError::Scheduler(_))));

        // 事件流断开后按间隔重新订阅
        drop(events);
        while s.platform.subscriptions.load(Ordering::SeqCst) < 3 {
            std::thread::sleep(Duration::from_millis(5));
        }

        event_loop.stop();
        runner.join().unwrap().unwrap();
        assert_eq!(event_loop.state(), LoopState::Idle);
    }

    #[test]
    fn test_stop_before_poll_is_not_lost() {
        let s = setup(FakePlatform::default());
        let event_loop = Arc::new(EventLoop::new(
            s.platform.clone(),
            s.handler.clone(),
            Arc::new(Executor::new()),
            Duration::from_millis(10),
        ));

        event_loop.stop();
        event_loop.poll().unwrap();
        assert_eq!(s.platform.subscriptions.load(Ordering::SeqCst), 0);
        assert_eq!(event_loop.state(), LoopState::Idle);

        // 停止请求只消费一次
        let _events = s.platform.event_sender();
        let runner = {
            let event_loop = event_loop.clone();
            std::thread::spawn(move || event_loop.poll())
        };
        while s.platform.subscriptions.load(Ordering::SeqCst) == 0 {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(event_loop.state(), LoopState::Polling);

        event_loop.stop();
        runner.join().unwrap().unwrap();
        assert_eq!(s.platform.subscriptions.load(Ordering::SeqCst), 1);
    }
}
