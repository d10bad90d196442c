/// アップロード結果
///
/// 1回の呼び出しにおけるメッセージごとの処理結果。永続化はしない。
use std::fmt;

/// アップロードの成否
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// オブジェクトを書き込んだ
    Success,
    /// 失敗した（理由を含む）
    Failure(String),
}

impl fmt::Display for UploadOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadOutcome::Success => write!(f, "success"),
            UploadOutcome::Failure(reason) => write!(f, "failure: {}", reason),
        }
    }
}

/// メッセージ1件分の結果
///
/// `message_id`はSQSの`messageId`。IDを持たないメッセージは`None`となり、
/// 部分バッチ失敗レスポンスには載せられない。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadResult {
    /// メッセージID
    pub message_id: Option<String>,
    /// 書き込み先キー（キーを導出できなかった場合は`None`）
    pub key: Option<String>,
    /// 成否
    pub outcome: UploadOutcome,
}

impl UploadResult {
    /// 成功結果を作成
    pub fn success(message_id: Option<String>, key: impl Into<String>) -> Self {
        Self {
            message_id,
            key: Some(key.into()),
            outcome: UploadOutcome::Success,
        }
    }

    /// 失敗結果を作成
    pub fn failure(
        message_id: Option<String>,
        key: Option<String>,
        reason: impl fmt::Display,
    ) -> Self {
        Self {
            message_id,
            key,
            outcome: UploadOutcome::Failure(reason.to_string()),
        }
    }

    /// 成功したかどうか
    pub fn is_success(&self) -> bool {
        self.outcome == UploadOutcome::Success
    }
}
