//! 集成测试共用的内存平台与媒体存储

#![allow(dead_code)]

use qq_bridge::platform::{
    FriendRecord, GroupRecord, MemberRecord, PlatformApi, PlatformEvent, ProfileRecord, Segment,
    SendTarget, SentMessage,
};
use qq_bridge::prelude::*;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use tokio::sync::mpsc;

#[derive(Default)]
pub struct MemoryPlatform {
    pub friends: Vec<FriendRecord>,
    pub groups: Vec<GroupRecord>,
    pub members: HashMap<u64, Vec<MemberRecord>>,
    pub friend_failures: AtomicUsize,
    pub friend_fetches: AtomicUsize,
    pub member_fetches: AtomicUsize,
    pub sent: Mutex<Vec<(SendTarget, Vec<Segment>)>>,
    pub subscriptions: AtomicUsize,
    events: Mutex<Option<mpsc::Receiver<PlatformEvent>>>,
    message_ids: AtomicI64,
}

impl MemoryPlatform {
    pub fn new() -> Self {
        let mut platform = Self::default();
        platform.friends.push(FriendRecord {
            id: 10,
            nickname: "alice".into(),
            remark: "Ali".into(),
        });
        platform.friends.push(FriendRecord {
            id: 11,
            nickname: "bob".into(),
            remark: String::new(),
        });
        platform.groups.push(group(100, "Rustaceans"));
        platform.members.insert(
            100,
            vec![member(100, 10, "alice-card"), member(100, 12345, "Member")],
        );
        platform.message_ids.store(9000, Ordering::SeqCst);
        platform
    }

    pub fn event_sender(&self) -> mpsc::Sender<PlatformEvent> {
        let (tx, rx) = mpsc::channel(16);
        *self.events.lock().unwrap() = Some(rx);
        tx
    }

    pub fn sent(&self) -> Vec<(SendTarget, Vec<Segment>)> {
        self.sent.lock().unwrap().clone()
    }
}

pub fn group(id: u64, name: &str) -> GroupRecord {
    GroupRecord {
        id,
        name: name.into(),
        permission: "MEMBER".into(),
    }
}

pub fn member(gid: u64, id: u64, name: &str) -> MemberRecord {
    MemberRecord {
        id,
        member_name: name.into(),
        permission: "MEMBER".into(),
        special_title: String::new(),
        group: group(gid, ""),
    }
}

pub fn group_message(msg_id: i64, sender: u64, segments: Vec<Segment>) -> PlatformEvent {
    let mut message_chain = vec![Segment::Source { id: msg_id, time: 0 }];
    message_chain.extend(segments);
    let mut sender = member(100, sender, "sender");
    sender.group = group(100, "Rustaceans");
    PlatformEvent::GroupMessage {
        message_chain,
        sender,
    }
}

#[async_trait]
impl PlatformApi for MemoryPlatform {
    async fn fetch_friends(&self) -> BridgeResult<Vec<FriendRecord>> {
        self.friend_fetches.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .friend_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(BridgeError::Transport("friendList: connection reset".into()));
        }
        Ok(self.friends.clone())
    }

    async fn fetch_groups(&self) -> BridgeResult<Vec<GroupRecord>> {
        Ok(self.groups.clone())
    }

    async fn fetch_group_members(&self, group_id: u64) -> BridgeResult<Vec<MemberRecord>> {
        self.member_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.members.get(&group_id).cloned().unwrap_or_default())
    }

    async fn fetch_profile(&self, uin: u64) -> BridgeResult<ProfileRecord> {
        Err(BridgeError::Transport(format!("userProfile {}: not found", uin)))
    }

    async fn send_message(
        &self,
        target: SendTarget,
        chain: Vec<Segment>,
    ) -> BridgeResult<SentMessage> {
        self.sent.lock().unwrap().push((target, chain));
        Ok(SentMessage {
            message_id: self.message_ids.fetch_add(1, Ordering::SeqCst) + 1,
        })
    }

    async fn subscribe(&self) -> BridgeResult<mpsc::Receiver<PlatformEvent>> {
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        self.events
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| BridgeError::Transport("connection refused".into()))
    }

    async fn release(&self) -> BridgeResult<()> {
        Ok(())
    }
}

/// 不访问网络的媒体存储，记录每个文件的释放次数
#[derive(Default)]
pub struct CountingMedia {
    pub released: Mutex<HashMap<PathBuf, usize>>,
}

impl CountingMedia {
    pub fn releases(&self, path: &Path) -> usize {
        self.released.lock().unwrap().get(path).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.released.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl MediaStore for CountingMedia {
    async fn fetch(&self, url: &str, _msg_type: MsgType) -> BridgeResult<MediaFile> {
        let name = url.rsplit('/').next().unwrap_or("blob");
        Ok(MediaFile::new(format!("/media/{}", name)))
    }

    async fn release(&self, file: &MediaFile) {
        *self
            .released
            .lock()
            .unwrap()
            .entry(file.path.clone())
            .or_default() += 1;
    }
}
