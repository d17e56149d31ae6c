//! mirai-api-http (v2) 客户端
//!
//! HTTP 接口负责会话、目录查询与消息发送；事件通过正向 WebSocket
//! `/message` 通道推送。

use super::{
    FriendRecord, GroupRecord, MemberRecord, PlatformApi, PlatformEvent, ProfileRecord, Segment,
    SendTarget, SentMessage,
};
use crate::config::MiraiConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::{debug, info, warn};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, protocol::Message as WsMessage},
};

const EVENT_BUFFER: usize = 256;

/// 会话失效 / 未认证
const CODE_SESSION_INVALID: i64 = 3;
const CODE_SESSION_UNVERIFIED: i64 = 4;

pub struct MiraiClient {
    config: MiraiConfig,
    client: reqwest::Client,
    /// 已绑定的 sessionKey
    session: Mutex<Option<String>>,
}

impl MiraiClient {
    pub fn new(config: MiraiConfig) -> BridgeResult<Self> {
        // 同一客户端会在不同运行时上使用，连接不跨运行时复用
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .pool_max_idle_per_host(0)
            .build()?;

        Ok(Self {
            config,
            client,
            session: Mutex::new(None),
        })
    }

    // ------------------------------------------------------------------------
    // 会话管理
    // ------------------------------------------------------------------------

    /// 获取 sessionKey，必要时先 verify + bind
    async fn session_key(&self) -> BridgeResult<String> {
        // 未配置 verifyKey 视为单会话模式，sessionKey 被服务端忽略
        if self.config.verify_key.is_empty() {
            return Ok(String::new());
        }

        let mut session = self.session.lock().await;
        if let Some(key) = session.as_ref() {
            return Ok(key.clone());
        }

        let resp = self
            .post_raw("verify", json!({ "verifyKey": self.config.verify_key }))
            .await
            .and_then(|json| check_response("verify", json))?;
        let key = resp["session"]
            .as_str()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| BridgeError::Transport("verify returned no session".into()))?
            .to_string();

        self.post_raw("bind", json!({ "sessionKey": key, "qq": self.config.qq }))
            .await
            .and_then(|json| check_response("bind", json))?;

        info!(target: "Mirai", "会话已绑定 (qq: {})", self.config.qq);
        *session = Some(key.clone());
        Ok(key)
    }

    async fn invalidate_session(&self) {
        let mut session = self.session.lock().await;
        if session.take().is_some() {
            warn!(target: "Mirai", "会话已失效，下次请求时重新认证");
        }
    }

    // ------------------------------------------------------------------------
    // HTTP 调用
    // ------------------------------------------------------------------------

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.http_base(), path.trim_start_matches('/'))
    }

    async fn post_raw(&self, path: &str, body: Value) -> BridgeResult<Value> {
        let resp = self.client.post(self.url(path)).json(&body).send().await?;
        Ok(resp.error_for_status()?.json().await?)
    }

    async fn get_raw(&self, path: &str, query: &[(&str, String)]) -> BridgeResult<Value> {
        let resp = self.client.get(self.url(path)).query(query).send().await?;
        Ok(resp.error_for_status()?.json().await?)
    }

    /// 携带 sessionKey 的请求结果检查，会话类错误顺带清除缓存的 sessionKey
    async fn check_session_response(&self, path: &str, json: Value) -> BridgeResult<Value> {
        if let Some(CODE_SESSION_INVALID | CODE_SESSION_UNVERIFIED) = json["code"].as_i64() {
            self.invalidate_session().await;
        }
        check_response(path, json)
    }

    /// 带 sessionKey 的 GET，取出 `data` 字段
    async fn get_list<T: DeserializeOwned>(
        &self,
        path: &str,
        target: Option<u64>,
    ) -> BridgeResult<Vec<T>> {
        let mut query = vec![("sessionKey", self.session_key().await?)];
        if let Some(target) = target {
            query.push(("target", target.to_string()));
        }

        let json = self.get_raw(path, &query).await?;
        let mut resp = self.check_session_response(path, json).await?;
        let data = resp
            .get_mut("data")
            .map(Value::take)
            .unwrap_or_else(|| Value::Array(Vec::new()));
        Ok(serde_json::from_value(data)?)
    }

    fn event_url(&self) -> BridgeResult<String> {
        let mut url = url::Url::parse(&self.config.ws_base())
            .and_then(|base| base.join("message"))
            .map_err(|e| BridgeError::Config(format!("invalid mirai address: {}", e)))?;

        {
            let mut pairs = url.query_pairs_mut();
            if !self.config.verify_key.is_empty() {
                pairs.append_pair("verifyKey", &self.config.verify_key);
            }
            pairs.append_pair("qq", &self.config.qq.to_string());
        }

        Ok(url.to_string())
    }
}

/// `code` 非 0 即失败 (无 `code` 字段的响应视为成功)
fn check_response(path: &str, json: Value) -> BridgeResult<Value> {
    let code = json["code"].as_i64().unwrap_or(0);
    if code == 0 {
        return Ok(json);
    }

    Err(BridgeError::Transport(format!(
        "{} failed: {} (code: {})",
        path,
        json["msg"].as_str().unwrap_or("unknown"),
        code
    )))
}

// ============================================================================
// WebSocket 帧
// ============================================================================

#[derive(Deserialize)]
struct WsFrame {
    #[serde(default, rename = "syncId")]
    sync_id: String,
    data: FrameData,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FrameData {
    Event(PlatformEvent),
    Status {
        code: i64,
        #[serde(default)]
        msg: String,
    },
}

enum Decoded {
    Event(PlatformEvent),
    /// 握手结果等状态帧
    Status,
    /// 服务端拒绝了连接 (认证失败等)
    Rejected(String),
}

/// 解析一帧推送数据
fn decode_frame(data: &mut [u8]) -> BridgeResult<Decoded> {
    let frame: WsFrame = simd_json::serde::from_slice(data)
        .map_err(|e| BridgeError::Transport(format!("malformed event frame: {}", e)))?;

    Ok(match frame.data {
        FrameData::Event(event) => Decoded::Event(event),
        FrameData::Status { code: 0, .. } => {
            debug!(target: "Mirai", "状态帧 (syncId: {:?})", frame.sync_id);
            Decoded::Status
        }
        FrameData::Status { code, msg } => Decoded::Rejected(format!("{} (code: {})", msg, code)),
    })
}

// ============================================================================
// PlatformApi 实现
// ============================================================================

#[async_trait]
impl PlatformApi for MiraiClient {
    async fn fetch_friends(&self) -> BridgeResult<Vec<FriendRecord>> {
        self.get_list("friendList", None).await
    }

    async fn fetch_groups(&self) -> BridgeResult<Vec<GroupRecord>> {
        self.get_list("groupList", None).await
    }

    async fn fetch_group_members(&self, group_id: u64) -> BridgeResult<Vec<MemberRecord>> {
        self.get_list("memberList", Some(group_id)).await
    }

    async fn fetch_profile(&self, uin: u64) -> BridgeResult<ProfileRecord> {
        let query = [
            ("sessionKey", self.session_key().await?),
            ("target", uin.to_string()),
        ];
        // userProfile 直接返回资料对象，没有 data 包装
        let json = self.get_raw("userProfile", &query).await?;
        let resp = self.check_session_response("userProfile", json).await?;
        Ok(serde_json::from_value(resp)?)
    }

    async fn send_message(
        &self,
        target: SendTarget,
        chain: Vec<Segment>,
    ) -> BridgeResult<SentMessage> {
        let key = self.session_key().await?;
        let (path, body) = match target {
            SendTarget::Friend(id) => (
                "sendFriendMessage",
                json!({ "sessionKey": key, "target": id, "messageChain": chain }),
            ),
            SendTarget::Group(id) => (
                "sendGroupMessage",
                json!({ "sessionKey": key, "target": id, "messageChain": chain }),
            ),
            SendTarget::Temp { user, group } => (
                "sendTempMessage",
                json!({ "sessionKey": key, "qq": user, "group": group, "messageChain": chain }),
            ),
        };

        let json = self.post_raw(path, body).await?;
        let resp = self.check_session_response(path, json).await?;
        let message_id = resp["messageId"]
            .as_i64()
            .ok_or_else(|| BridgeError::Transport(format!("{} returned no messageId", path)))?;

        debug!(target: "Mirai", "{} -> {:?} (messageId: {})", path, target, message_id);
        Ok(SentMessage { message_id })
    }

    async fn subscribe(&self) -> BridgeResult<mpsc::Receiver<PlatformEvent>> {
        let url = self.event_url()?;
        let request = url
            .parse::<http::Uri>()
            .map_err(|e| BridgeError::Config(format!("Invalid URL: {}", e)))?
            .into_client_request()?;

        let (ws_stream, _) = connect_async(request).await?;
        info!(target: "Mirai", "事件通道已连接: {}:{}", self.config.host, self.config.port);

        let (mut write, mut read) = ws_stream.split();
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);

        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => {
                        let mut bytes = text.as_bytes().to_vec();
                        match decode_frame(&mut bytes) {
                            Ok(Decoded::Event(event)) => {
                                if tx.send(event).await.is_err() {
                                    break;
                                }
                            }
                            Ok(Decoded::Status) => {}
                            Ok(Decoded::Rejected(reason)) => {
                                warn!(target: "Mirai", "事件通道被拒绝: {}", reason);
                                break;
                            }
                            Err(e) => warn!(target: "Mirai", "忽略无法解析的事件: {}", e),
                        }
                    }
                    Ok(WsMessage::Ping(payload)) => {
                        if write.send(WsMessage::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(target: "Mirai", "事件通道读取失败: {}", e);
                        break;
                    }
                }
            }
            warn!(target: "Mirai", "事件通道已断开");
        });

        Ok(rx)
    }

    async fn release(&self) -> BridgeResult<()> {
        let key = self.session.lock().await.take();
        if let Some(key) = key {
            let json = self
                .post_raw("release", json!({ "sessionKey": key, "qq": self.config.qq }))
                .await?;
            check_response("release", json)?;
            info!(target: "Mirai", "会话已释放");
        }
        Ok(())
    }
}
