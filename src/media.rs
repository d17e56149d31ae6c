//! 媒体载荷存储
//!
//! 入站图片 / 语音下载到本地临时文件后交给中间件；
//! 载荷在投递或发送结束后由桥接层调用 `release` 删除，且只删除一次。

use crate::error::{BridgeError, BridgeResult};
use crate::model::{MediaFile, MsgType};
use crate::{debug, warn};
use async_trait::async_trait;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

#[async_trait]
pub trait MediaStore: Send + Sync + 'static {
    /// 下载远端资源到本地
    async fn fetch(&self, url: &str, msg_type: MsgType) -> BridgeResult<MediaFile>;

    /// 释放本地载荷
    async fn release(&self, file: &MediaFile);
}

/// 基于 HTTP 下载 + 临时文件的默认实现
pub struct HttpMediaStore {
    client: reqwest::Client,
    dir: PathBuf,
}

impl HttpMediaStore {
    pub fn new(dir: Option<PathBuf>, timeout: Duration) -> BridgeResult<Self> {
        let dir = dir.unwrap_or_else(std::env::temp_dir);
        std::fs::create_dir_all(&dir)?;

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(0)
            .build()?;

        Ok(Self { client, dir })
    }

    pub fn dir(&self) -> &std::path::Path {
        &self.dir
    }
}

fn suffix_for(msg_type: MsgType, mime: Option<&str>) -> &'static str {
    match mime {
        Some("image/gif") => ".gif",
        Some("image/png") => ".png",
        Some("image/jpeg") => ".jpg",
        Some("image/webp") => ".webp",
        Some("audio/amr") => ".amr",
        Some("audio/silk") => ".silk",
        _ => match msg_type {
            MsgType::Animation => ".gif",
            MsgType::Voice => ".amr",
            _ => "",
        },
    }
}

/// 写入临时文件并保留 (不随句柄自动删除)
pub fn persist_bytes(dir: &std::path::Path, suffix: &str, bytes: &[u8]) -> BridgeResult<PathBuf> {
    let mut file = tempfile::Builder::new()
        .prefix("qq-bridge-")
        .suffix(suffix)
        .tempfile_in(dir)?;
    file.write_all(bytes)?;
    file.as_file().sync_all()?;
    file.into_temp_path()
        .keep()
        .map_err(|e| BridgeError::Io(e.error))
}

#[async_trait]
impl MediaStore for HttpMediaStore {
    async fn fetch(&self, url: &str, msg_type: MsgType) -> BridgeResult<MediaFile> {
        let resp = self.client.get(url).send().await?.error_for_status()?;
        let mime = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string());
        let bytes = resp.bytes().await?;

        let dir = self.dir.clone();
        let suffix = suffix_for(msg_type, mime.as_deref());
        let path = tokio::task::spawn_blocking(move || persist_bytes(&dir, suffix, &bytes))
            .await
            .map_err(|e| BridgeError::Io(std::io::Error::other(e)))??;

        debug!(target: "Media", "已下载 {} -> {}", url, path.display());
        Ok(MediaFile {
            path,
            mime,
            source_url: Some(url.to_string()),
        })
    }

    async fn release(&self, file: &MediaFile) {
        match tokio::fs::remove_file(&file.path).await {
            Ok(()) => debug!(target: "Media", "已释放 {}", file.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(target: "Media", "释放 {} 失败: {}", file.path.display(), e),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! 单元测试用的媒体存储：不访问网络，记录释放次数

    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeMediaStore {
        pub fail_urls: Mutex<Vec<String>>,
        pub fetched: Mutex<Vec<PathBuf>>,
        pub released: Mutex<HashMap<PathBuf, usize>>,
    }

    impl FakeMediaStore {
        pub fn release_count(&self, path: &std::path::Path) -> usize {
            self.released.lock().unwrap().get(path).copied().unwrap_or(0)
        }

        pub fn total_released(&self) -> usize {
            self.released.lock().unwrap().values().sum()
        }
    }

    #[async_trait]
    impl MediaStore for FakeMediaStore {
        async fn fetch(&self, url: &str, _msg_type: MsgType) -> BridgeResult<MediaFile> {
            if self.fail_urls.lock().unwrap().iter().any(|u| u == url) {
                return Err(BridgeError::Transport(format!("download {} failed", url)));
            }
            let path = PathBuf::from(format!("/fake/{}", url.rsplit('/').next().unwrap_or(url)));
            self.fetched.lock().unwrap().push(path.clone());
            let mut file = MediaFile::new(path);
            file.source_url = Some(url.to_string());
            Ok(file)
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
}
