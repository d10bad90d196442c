/// オブジェクトメタデータ
///
/// メッセージ属性からS3オブジェクトのContent-Typeとユーザーメタデータを導出する。
use std::collections::HashMap;

use tracing::warn;

use super::InboundMessage;

/// Content-Typeとして扱うメッセージ属性名
const CONTENT_TYPE_ATTRIBUTES: [&str; 2] = ["content-type", "ContentType"];

/// S3ユーザーメタデータの合計サイズ上限（キーと値のバイト数）
pub const MAX_USER_METADATA_BYTES: usize = 2048;

/// 本文がJSONの場合のContent-Type
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// 本文がJSON以外の場合のContent-Type
pub const BINARY_CONTENT_TYPE: &str = "application/octet-stream";

/// S3オブジェクトに付与するメタデータ
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectMetadata {
    /// Content-Type
    pub content_type: String,
    /// ユーザーメタデータ（`x-amz-meta-*`）
    pub user_metadata: HashMap<String, String>,
}

impl ObjectMetadata {
    /// メッセージからメタデータを導出
    ///
    /// Content-Type属性（大文字小文字を区別しない）があればそれを使い、
    /// なければ本文がJSONかどうかで決める。
    /// S3が受け付けないキーや値（ASCII以外など）、小文字化して重複するキー、
    /// 合計サイズの上限を超える属性は警告を出して除外する。
    pub fn from_message(message: &InboundMessage) -> Self {
        let attributes = message.attributes();
        let message_id = message.id().unwrap_or_default();

        let content_type = attributes
            .iter()
            .find(|(name, _)| is_content_type_attribute(name))
            .map(|(_, value)| value.clone())
            .unwrap_or_else(|| detect_content_type(message.body()).to_string());

        let mut user_metadata = HashMap::new();
        let mut total_bytes = 0;
        for (name, value) in attributes
            .iter()
            .filter(|(name, _)| !is_content_type_attribute(name))
        {
            if !is_valid_metadata_key(name) || !is_valid_metadata_value(value) {
                warn!(message_id, attribute = %name, "S3メタデータに使用できない属性を除外");
                continue;
            }

            let key = name.to_ascii_lowercase();
            if user_metadata.contains_key(&key) {
                // 属性はキー順に走査されるため、先に現れた値を残す
                warn!(message_id, attribute = %name, "小文字化すると重複する属性を除外");
                continue;
            }

            let size = key.len() + value.len();
            if total_bytes + size > MAX_USER_METADATA_BYTES {
                warn!(
                    message_id,
                    attribute = %name,
                    size,
                    limit = MAX_USER_METADATA_BYTES,
                    "S3メタデータの上限を超えるため属性を除外"
                );
                continue;
            }

            total_bytes += size;
            user_metadata.insert(key, value.clone());
        }

        Self {
            content_type,
            user_metadata,
        }
    }

    /// ユーザーメタデータの合計サイズ（キーと値のバイト数）
    pub fn user_metadata_bytes(&self) -> usize {
        self.user_metadata
            .iter()
            .map(|(key, value)| key.len() + value.len())
            .sum()
    }
}

fn is_content_type_attribute(name: &str) -> bool {
    CONTENT_TYPE_ATTRIBUTES
        .iter()
        .any(|candidate| candidate.eq_ignore_ascii_case(name))
}

/// 本文がJSONとして解釈できればJSON、それ以外はバイナリ
fn detect_content_type(body: &[u8]) -> &'static str {
    if serde_json::from_slice::<serde_json::Value>(body).is_ok() {
        JSON_CONTENT_TYPE
    } else {
        BINARY_CONTENT_TYPE
    }
}

fn is_valid_metadata_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

fn is_valid_metadata_value(value: &str) -> bool {
    value.chars().all(|c| c.is_ascii() && !c.is_ascii_control())
}
