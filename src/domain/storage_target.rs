// 書き込み先バケットとキープレフィックス
//
// プロセス起動時に一度だけ解決し、以後は変更しない。

use chrono::Utc;
use rand::Rng;
use thiserror::Error;

/// StorageTarget構築のエラー型
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageTargetError {
    /// バケット名が空
    #[error("Bucket name must not be empty")]
    EmptyBucket,
}

/// アップロード先
///
/// `bucket`は空でないことを保証する。`key_prefix`は前後の`/`を除去して保持する。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageTarget {
    bucket: String,
    key_prefix: String,
}

impl StorageTarget {
    /// 新しいStorageTargetを作成
    ///
    /// # 戻り値
    /// * `Ok(StorageTarget)` - 作成成功
    /// * `Err(StorageTargetError::EmptyBucket)` - バケット名が空または空白のみ
    pub fn new(
        bucket: impl Into<String>,
        key_prefix: impl AsRef<str>,
    ) -> Result<Self, StorageTargetError> {
        let bucket = bucket.into();
        if bucket.trim().is_empty() {
            return Err(StorageTargetError::EmptyBucket);
        }

        Ok(Self {
            bucket,
            key_prefix: key_prefix.as_ref().trim_matches('/').to_string(),
        })
    }

    /// バケット名を取得
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// キープレフィックスを取得
    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    /// メッセージIDからオブジェクトキーを導出
    ///
    /// 同じメッセージIDは常に同じキーになるため、再配信時は上書きされる。
    pub fn object_key(&self, message_id: &str) -> String {
        self.prefixed(message_id)
    }

    /// IDを持たないメッセージ用のキーを生成
    ///
    /// `telemetry-<UNIX秒>-<5桁の数字>.json`の形式。再配信時の冪等性はない。
    pub fn fallback_object_key(&self) -> String {
        let mut rng = rand::thread_rng();
        let suffix: String = (0..5)
            .map(|_| char::from(b'0' + rng.gen_range(1..10u8)))
            .collect();
        self.prefixed(&format!(
            "telemetry-{}-{}.json",
            Utc::now().timestamp(),
            suffix
        ))
    }

    fn prefixed(&self, name: &str) -> String {
        if self.key_prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.key_prefix, name)
        }
    }
}
