//! 目录缓存：好友列表、群列表、群成员、陌生人昵称
//!
//! 每类数据独立过期。缓存未命中时最多向平台请求两次，
//! 两次都失败则报告 `DirectoryUnavailable`。
//! 同一类数据的并发刷新会被合并为一次平台调用。

use crate::cache::TtlCache;
use crate::chat_id::ChatId;
use crate::config::CacheConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::model::{Chat, Member};
use crate::platform::{FriendRecord, GroupRecord, PlatformApi};
use crate::{debug, warn};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum InfoSlot {
    Friends,
    Groups,
}

#[derive(Debug, Clone)]
enum InfoList {
    Friends(Arc<Vec<FriendRecord>>),
    Groups(Arc<Vec<GroupRecord>>),
}

pub struct Directory {
    platform: Arc<dyn PlatformApi>,
    /// 好友列表与群列表共用一个两槽缓存
    info: Mutex<TtlCache<InfoSlot, InfoList>>,
    members: Mutex<TtlCache<u64, Arc<Vec<Member>>>>,
    strangers: Mutex<TtlCache<u64, String>>,
    friend_refresh: tokio::sync::Mutex<()>,
    group_refresh: tokio::sync::Mutex<()>,
    member_refresh: tokio::sync::Mutex<()>,
}

/// 缓存锁只在同步代码段内持有，中毒时直接取回内部数据
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// 最多尝试两次，仍失败则包装为 `DirectoryUnavailable`
async fn fetch_twice<T, F, Fut>(directory: &'static str, mut fetch: F) -> BridgeResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = BridgeResult<T>>,
{
    match fetch().await {
        Ok(value) => Ok(value),
        Err(first) => {
            warn!(target: "Directory", "刷新{}列表失败，重试一次: {}", directory, first);
            fetch()
                .await
                .map_err(|second| BridgeError::directory(directory, second))
        }
    }
}

impl Directory {
    pub fn new(platform: Arc<dyn PlatformApi>, config: &CacheConfig) -> Self {
        Self {
            platform,
            info: Mutex::new(TtlCache::new(
                config.info_capacity,
                Duration::from_secs(config.info_ttl_secs),
            )),
            members: Mutex::new(TtlCache::new(
                config.member_capacity,
                Duration::from_secs(config.member_ttl_secs),
            )),
            strangers: Mutex::new(TtlCache::new(
                config.stranger_capacity,
                Duration::from_secs(config.stranger_ttl_secs),
            )),
            friend_refresh: tokio::sync::Mutex::new(()),
            group_refresh: tokio::sync::Mutex::new(()),
            member_refresh: tokio::sync::Mutex::new(()),
        }
    }

    // ------------------------------------------------------------------------
    // 好友 / 群列表
    // ------------------------------------------------------------------------

    fn cached_friends(&self) -> Option<Arc<Vec<FriendRecord>>> {
        match lock(&self.info).get(&InfoSlot::Friends) {
            Some(InfoList::Friends(list)) => Some(list),
            _ => None,
        }
    }

    fn cached_groups(&self) -> Option<Arc<Vec<GroupRecord>>> {
        match lock(&self.info).get(&InfoSlot::Groups) {
            Some(InfoList::Groups(list)) => Some(list),
            _ => None,
        }
    }

    pub async fn friends(&self) -> BridgeResult<Arc<Vec<FriendRecord>>> {
        if let Some(list) = self.cached_friends() {
            return Ok(list);
        }

        let _refresh = self.friend_refresh.lock().await;
        // 等锁期间可能已有其它调用完成了刷新
        if let Some(list) = self.cached_friends() {
            return Ok(list);
        }

        let list = Arc::new(fetch_twice("friend", || self.platform.fetch_friends()).await?);
        debug!(target: "Directory", "好友列表已刷新 ({} 个)", list.len());
        lock(&self.info).insert(InfoSlot::Friends, InfoList::Friends(list.clone()));
        Ok(list)
    }

    pub async fn groups(&self) -> BridgeResult<Arc<Vec<GroupRecord>>> {
        if let Some(list) = self.cached_groups() {
            return Ok(list);
        }

        let _refresh = self.group_refresh.lock().await;
        if let Some(list) = self.cached_groups() {
            return Ok(list);
        }

        let list = Arc::new(fetch_twice("group", || self.platform.fetch_groups()).await?);
        debug!(target: "Directory", "群列表已刷新 ({} 个)", list.len());
        lock(&self.info).insert(InfoSlot::Groups, InfoList::Groups(list.clone()));
        Ok(list)
    }

    pub async fn friend(&self, uin: u64) -> BridgeResult<Option<FriendRecord>> {
        Ok(self.friends().await?.iter().find(|f| f.id == uin).cloned())
    }

    /// 好友备注，非好友或未设置备注时为 None
    pub async fn friend_remark(&self, uin: u64) -> BridgeResult<Option<String>> {
        Ok(self
            .friend(uin)
            .await?
            .map(|f| f.remark)
            .filter(|remark| !remark.is_empty()))
    }

    pub async fn group(&self, gid: u64) -> BridgeResult<Option<GroupRecord>> {
        Ok(self.groups().await?.iter().find(|g| g.id == gid).cloned())
    }

    pub async fn friend_chats(&self) -> BridgeResult<Vec<Chat>> {
        Ok(self
            .friends()
            .await?
            .iter()
            .map(|f| {
                let remark = Some(f.remark.clone()).filter(|r| !r.is_empty());
                Chat::friend(f.id, f.nickname.clone(), remark)
            })
            .collect())
    }

    pub async fn group_chats(&self) -> BridgeResult<Vec<Chat>> {
        Ok(self
            .groups()
            .await?
            .iter()
            .map(|g| Chat::group(g.id, g.name.clone()))
            .collect())
    }

    // ------------------------------------------------------------------------
    // 群成员
    // ------------------------------------------------------------------------

    /// 已缓存的群成员 (不触发刷新)
    pub fn cached_member(&self, gid: u64, uid: u64) -> Option<Member> {
        lock(&self.members)
            .get(&gid)
            .and_then(|list| list.iter().find(|m| m.uid == uid).cloned())
    }

    /// 群成员名单，`force` 为真时跳过缓存
    pub async fn group_members(&self, gid: u64, force: bool) -> BridgeResult<Arc<Vec<Member>>> {
        if !force && let Some(list) = lock(&self.members).get(&gid) {
            return Ok(list);
        }

        let _refresh = self.member_refresh.lock().await;
        if !force && let Some(list) = lock(&self.members).get(&gid) {
            return Ok(list);
        }

        let records = fetch_twice("member", || self.platform.fetch_group_members(gid)).await?;
        let friends = self.friends().await?;
        let chat = ChatId::Group(gid);

        let list: Arc<Vec<Member>> = Arc::new(
            records
                .into_iter()
                .map(|r| {
                    let alias = friends
                        .iter()
                        .find(|f| f.id == r.id)
                        .map(|f| f.remark.clone())
                        .filter(|remark| !remark.is_empty());
                    Member::new(r.id, r.member_name, alias, chat.clone())
                })
                .collect(),
        );

        debug!(target: "Directory", "群 {} 成员已刷新 ({} 人)", gid, list.len());
        lock(&self.members).insert(gid, list.clone());
        Ok(list)
    }

    /// 群成员，未命中缓存时刷新一次名单
    pub async fn group_member(&self, gid: u64, uid: u64) -> BridgeResult<Option<Member>> {
        if let Some(member) = self.cached_member(gid, uid) {
            return Ok(Some(member));
        }
        Ok(self
            .group_members(gid, false)
            .await?
            .iter()
            .find(|m| m.uid == uid)
            .cloned())
    }

    // ------------------------------------------------------------------------
    // 陌生人
    // ------------------------------------------------------------------------

    /// 非好友、非群成员的昵称 (userProfile)
    pub async fn stranger_name(&self, uin: u64) -> BridgeResult<String> {
        if let Some(name) = lock(&self.strangers).get(&uin) {
            return Ok(name);
        }

        let profile = self.platform.fetch_profile(uin).await?;
        lock(&self.strangers).insert(uin, profile.nickname.clone());
        Ok(profile.nickname)
    }

    // ------------------------------------------------------------------------
    // 会话解析
    // ------------------------------------------------------------------------

    /// 由复合 ID 构造完整的会话对象
    ///
    /// 群会话会强制刷新成员名单；临时会话与未知前缀无法解析，返回 None。
    pub async fn resolve_chat(&self, id: &ChatId) -> BridgeResult<Option<Chat>> {
        match id {
            ChatId::Friend(uin) => {
                let chat = match self.friend(*uin).await? {
                    Some(f) => {
                        let remark = Some(f.remark).filter(|r| !r.is_empty());
                        Chat::friend(f.id, f.nickname, remark)
                    }
                    None => Chat::friend(*uin, String::new(), None),
                };
                Ok(Some(chat))
            }
            ChatId::Group(gid) => {
                let name = self.group(*gid).await?.map(|g| g.name).unwrap_or_default();
                let members = self.group_members(*gid, true).await?;
                Ok(Some(Chat::group(*gid, name).with_members(members.to_vec())))
            }
            ChatId::Private { .. } | ChatId::Other { .. } => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::testing::FakePlatform;
    use std::sync::atomic::Ordering;

    fn directory(platform: Arc<FakePlatform>) -> Directory {
        Directory::new(platform, &CacheConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_friends_cached_until_ttl() {
        let platform = Arc::new(FakePlatform::default().with_friend(1, "alice", "Ali"));
        let dir = directory(platform.clone());

        assert_eq!(dir.friend_remark(1).await.unwrap().as_deref(), Some("Ali"));
        assert_eq!(dir.friend_remark(2).await.unwrap(), None);
        assert_eq!(platform.friend_fetches.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(601)).await;
        dir.friends().await.unwrap();
        dir.friends().await.unwrap();
        assert_eq!(platform.friend_fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_single_failure_is_retried() {
        let platform = Arc::new(FakePlatform::default().with_friend(1, "alice", ""));
        platform.fail_friends.store(1, Ordering::SeqCst);
        let dir = directory(platform.clone());

        let friends = dir.friends().await.unwrap();
        assert_eq!(friends.len(), 1);
        assert_eq!(platform.friend_fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_two_failures_make_directory_unavailable() {
        let platform = Arc::new(FakePlatform::default());
        platform.fail_friends.store(2, Ordering::SeqCst);
        let dir = directory(platform.clone());

        let err = dir.friend_remark(1).await.unwrap_err();
        assert!(matches!(
            err,
            BridgeError::DirectoryUnavailable {
                directory: "friend",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_empty_list_is_valid_and_cached() {
        let platform = Arc::new(FakePlatform::default());
        let dir = directory(platform.clone());

        assert!(dir.friends().await.unwrap().is_empty());
        assert!(dir.friends().await.unwrap().is_empty());
        assert_eq!(platform.friend_fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_members_carry_friend_remark_and_force_refresh() {
        let platform = Arc::new(
            FakePlatform::default()
                .with_friend(7, "bob", "Bobby")
                .with_member(100, 7, "bob-in-group")
                .with_member(100, 8, "carol"),
        );
        let dir = directory(platform.clone());

        let members = dir.group_members(100, false).await.unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].alias.as_deref(), Some("Bobby"));
        assert_eq!(members[1].alias, None);

        dir.group_members(100, false).await.unwrap();
        assert_eq!(platform.member_fetches.load(Ordering::SeqCst), 1);

        dir.group_members(100, true).await.unwrap();
        assert_eq!(platform.member_fetches.load(Ordering::SeqCst), 2);
        assert_eq!(dir.cached_member(100, 8).unwrap().name, "carol");
    }

    #[tokio::test]
    async fn test_member_fetch_retries_once_then_fails() {
        let platform = Arc::new(FakePlatform::default().with_member(100, 8, "carol"));
        let dir = directory(platform.clone());

        platform.fail_members.store(2, Ordering::SeqCst);
        let err = dir.group_members(100, false).await.unwrap_err();
        assert!(matches!(
            err,
            BridgeError::DirectoryUnavailable {
                directory: "member",
                ..
            }
        ));
        assert_eq!(platform.member_fetches.load(Ordering::SeqCst), 2);
        assert!(dir.cached_member(100, 8).is_none());

        // 单次失败由重试吸收
        platform.fail_members.store(1, Ordering::SeqCst);
        let members = dir.group_members(100, false).await.unwrap();
        assert_eq!(members[0].name, "carol");
        assert_eq!(platform.member_fetches.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_concurrent_misses_share_one_refresh() {
        let platform = Arc::new(FakePlatform::default().with_group(5, "g"));
        let dir = Arc::new(directory(platform.clone()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let dir = dir.clone();
                tokio::spawn(async move { dir.groups().await.map(|g| g.len()) })
            })
            .collect();
        for h in handles {
            assert_eq!(h.await.unwrap().unwrap(), 1);
        }
        assert_eq!(platform.group_fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stranger_name_is_cached() {
        let platform = Arc::new(FakePlatform::default().with_profile(9, "passerby"));
        let dir = directory(platform.clone());

        assert_eq!(dir.stranger_name(9).await.unwrap(), "passerby");
        assert_eq!(dir.stranger_name(9).await.unwrap(), "passerby");
        assert_eq!(platform.profile_fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_resolve_chat_variants() {
        let platform = Arc::new(
            FakePlatform::default()
                .with_friend(1, "alice", "Ali")
                .with_group(100, "Rustaceans")
                .with_member(100, 1, "alice"),
        );
        let dir = directory(platform.clone());

        let friend = dir.resolve_chat(&ChatId::Friend(1)).await.unwrap().unwrap();
        assert_eq!(friend.display_name(), "Ali");

        let group = dir.resolve_chat(&ChatId::Group(100)).await.unwrap().unwrap();
        assert_eq!(group.name, "Rustaceans");
        assert_eq!(group.members.len(), 1);

        let private = ChatId::Private { user: 1, group: 100 };
        assert!(dir.resolve_chat(&private).await.unwrap().is_none());
        let phone: ChatId = "phone_123".parse().unwrap();
        assert!(dir.resolve_chat(&phone).await.unwrap().is_none());
    }
}
