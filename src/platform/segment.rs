//! mirai 消息段 (Message Chain 中的单个元素)
//!
//! 线上格式为 `{"type": "Plain", "text": "..."}` 这样的扁平对象。
//! 未识别的类型统一落入 `Unsupported`，由入站转换按失败策略处理。
//! 类型已知但字段不合法的段 (如 `"name": null`) 解码为 `Invalid`，不影响同链其它段。

use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ImageData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl ImageData {
    /// 图片 ID 以 `.gif` 结尾视为动图
    pub fn is_gif(&self) -> bool {
        self.image_id
            .as_deref()
            .map(|id| id.to_ascii_lowercase().ends_with(".gif"))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum Segment {
    /// 消息来源 (总是消息链的第一个元素)
    Source {
        id: i64,
        #[serde(default)]
        time: i64,
    },
    /// 引用回复
    Quote {
        id: i64,
        #[serde(default)]
        group_id: u64,
        sender_id: u64,
        #[serde(default)]
        target_id: u64,
        #[serde(default, deserialize_with = "deserialize_chain")]
        origin: Vec<Segment>,
    },
    At {
        target: u64,
        #[serde(default)]
        display: String,
    },
    AtAll,
    Face {
        #[serde(default)]
        face_id: i64,
        #[serde(default)]
        name: String,
    },
    Plain {
        text: String,
    },
    Image(ImageData),
    FlashImage(ImageData),
    Voice {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        voice_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
        #[serde(default)]
        length: u64,
    },
    MarketFace {
        id: i64,
        #[serde(default)]
        name: String,
    },
    Xml {
        xml: String,
    },
    Json {
        json: String,
    },
    App {
        content: String,
    },
    Poke {
        name: String,
    },
    Dice {
        value: u8,
    },
    MusicShare {
        #[serde(default)]
        title: String,
        #[serde(default)]
        summary: String,
        #[serde(default)]
        jump_url: String,
    },
    Forward {
        #[serde(default)]
        node_list: Vec<serde_json::Value>,
    },
    File {
        id: String,
        name: String,
        #[serde(default)]
        size: u64,
    },
    /// 类型可识别但内容无法解析，仅在入站方向出现
    #[serde(skip)]
    Invalid { kind: String, reason: String },
    #[serde(other)]
    Unsupported,
}

impl Segment {
    pub fn plain(text: impl Into<String>) -> Self {
        Segment::Plain { text: text.into() }
    }

    pub fn at(target: u64) -> Self {
        Segment::At {
            target,
            display: String::new(),
        }
    }

    /// 以本地路径引用的图片
    pub fn image_path(path: impl Into<String>) -> Self {
        Segment::Image(ImageData {
            path: Some(path.into()),
            ..Default::default()
        })
    }

    /// 段类型名，用于日志与错误信息
    pub fn kind(&self) -> &'static str {
        match self {
            Segment::Source { .. } => "Source",
            Segment::Quote { .. } => "Quote",
            Segment::At { .. } => "At",
            Segment::AtAll => "AtAll",
            Segment::Face { .. } => "Face",
            Segment::Plain { .. } => "Plain",
            Segment::Image(_) => "Image",
            Segment::FlashImage(_) => "FlashImage",
            Segment::Voice { .. } => "Voice",
            Segment::MarketFace { .. } => "MarketFace",
            Segment::Xml { .. } => "Xml",
            Segment::Json { .. } => "Json",
            Segment::App { .. } => "App",
            Segment::Poke { .. } => "Poke",
            Segment::Dice { .. } => "Dice",
            Segment::MusicShare { .. } => "MusicShare",
            Segment::Forward { .. } => "Forward",
            Segment::File { .. } => "File",
            Segment::Invalid { .. } => "Invalid",
            Segment::Unsupported => "Unsupported",
        }
    }
}

/// 逐段解码消息链
///
/// 单个段解析失败时替换为 `Segment::Invalid`，整条链 (以及所在事件) 仍然可用。
pub fn deserialize_chain<'de, D>(deserializer: D) -> Result<Vec<Segment>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Vec::<serde_json::Value>::deserialize(deserializer)?;
    Ok(raw.into_iter().map(decode_segment).collect())
}

fn decode_segment(value: serde_json::Value) -> Segment {
    let kind = value
        .get("type")
        .and_then(|t| t.as_str())
        .unwrap_or("?")
        .to_string();
    serde_json::from_value(value).unwrap_or_else(|e| Segment::Invalid {
        kind,
        reason: e.to_string(),
    })
}

/// 从消息链中取出来源消息 ID
pub fn source_id(chain: &[Segment]) -> Option<i64> {
    chain.iter().find_map(|seg| match seg {
        Segment::Source { id, .. } => Some(*id),
        _ => None,
    })
}

/// 消息链的纯文本近似 (用于引用预览)
pub fn plain_text(chain: &[Segment]) -> String {
    let mut out = String::new();
    for seg in chain {
        match seg {
            Segment::Plain { text } => out.push_str(text),
            Segment::At { target, display } => {
                if display.is_empty() {
                    out.push_str(&format!("@{}", target));
                } else if display.starts_with('@') {
                    out.push_str(display);
                } else {
                    out.push('@');
                    out.push_str(display);
                }
            }
            Segment::AtAll => out.push_str("@all"),
            Segment::Face { name, .. } if !name.is_empty() => {
                out.push_str(&format!("[{}]", name));
            }
            Segment::Image(_) | Segment::FlashImage(_) => out.push_str("[Image]"),
            Segment::Voice { .. } => out.push_str("[Voice]"),
            _ => {}
        }
    }
    out
}
