/// 転送Lambdaの設定
///
/// 起動時に環境変数から一度だけ読み込み、以後は変更しない。
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::domain::retry_policy::{DEFAULT_BASE_DELAY_MS, DEFAULT_MAX_ATTEMPTS};
use crate::domain::{RetryPolicy, StorageTarget};

/// 書き込み先バケット名（必須）
pub const BUCKET_NAME_VAR: &str = "TELEMETRY_TEMPORARY_BUCKET_NAME";
/// オブジェクトキーのプレフィックス
pub const KEY_PREFIX_VAR: &str = "TELEMETRY_KEY_PREFIX";
/// 同時アップロード数
pub const CONCURRENCY_VAR: &str = "UPLOAD_CONCURRENCY";
/// 最大試行回数
pub const MAX_ATTEMPTS_VAR: &str = "UPLOAD_MAX_ATTEMPTS";
/// 基本待機時間（ミリ秒）
pub const BASE_DELAY_MS_VAR: &str = "UPLOAD_BASE_DELAY_MS";
/// S3エンドポイントの上書き（ローカル検証用）
pub const S3_ENDPOINT_URL_VAR: &str = "S3_ENDPOINT_URL";

/// デフォルトのキープレフィックス
pub const DEFAULT_KEY_PREFIX: &str = "telemetry";
/// デフォルトの同時アップロード数
pub const DEFAULT_CONCURRENCY: usize = 8;

/// 設定読み込みのエラー型
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// 必須の環境変数が設定されていない
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// 環境変数が空
    #[error("Environment variable is empty: {0}")]
    EmptyEnvVar(String),

    /// 環境変数の値が不正
    #[error("Invalid value for {name}: {value}")]
    InvalidEnvVar {
        /// 環境変数名
        name: String,
        /// 設定されていた値
        value: String,
    },
}

/// 転送Lambdaの設定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    target: StorageTarget,
    retry_policy: RetryPolicy,
    concurrency: usize,
    s3_endpoint_url: Option<String>,
}

impl RelayConfig {
    /// 明示的な値で設定を作成（テスト用）
    pub fn new(target: StorageTarget, retry_policy: RetryPolicy, concurrency: usize) -> Self {
        Self {
            target,
            retry_policy,
            concurrency: concurrency.max(1),
            s3_endpoint_url: None,
        }
    }

    /// プロセスの環境変数から設定を読み込み
    ///
    /// # 環境変数
    /// - `TELEMETRY_TEMPORARY_BUCKET_NAME`: 書き込み先バケット名（必須、空不可）
    /// - `TELEMETRY_KEY_PREFIX`: キープレフィックス（デフォルト: telemetry）
    /// - `UPLOAD_CONCURRENCY`: 同時アップロード数（デフォルト: 8）
    /// - `UPLOAD_MAX_ATTEMPTS`: 最大試行回数（デフォルト: 3）
    /// - `UPLOAD_BASE_DELAY_MS`: 基本待機時間（デフォルト: 200）
    /// - `S3_ENDPOINT_URL`: S3エンドポイントの上書き（任意）
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// 任意の参照関数から設定を読み込み
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let bucket = lookup(BUCKET_NAME_VAR)
            .ok_or_else(|| ConfigError::MissingEnvVar(BUCKET_NAME_VAR.to_string()))?;
        let key_prefix = lookup(KEY_PREFIX_VAR).unwrap_or_else(|| DEFAULT_KEY_PREFIX.to_string());
        let target = StorageTarget::new(bucket, key_prefix)
            .map_err(|_| ConfigError::EmptyEnvVar(BUCKET_NAME_VAR.to_string()))?;

        let concurrency: usize = parse_or(&lookup, CONCURRENCY_VAR, DEFAULT_CONCURRENCY)?;
        let max_attempts: u32 = parse_or(&lookup, MAX_ATTEMPTS_VAR, DEFAULT_MAX_ATTEMPTS)?;
        let base_delay_ms: u64 = parse_or(&lookup, BASE_DELAY_MS_VAR, DEFAULT_BASE_DELAY_MS)?;

        if concurrency == 0 {
            return Err(ConfigError::InvalidEnvVar {
                name: CONCURRENCY_VAR.to_string(),
                value: "0".to_string(),
            });
        }
        if max_attempts == 0 {
            return Err(ConfigError::InvalidEnvVar {
                name: MAX_ATTEMPTS_VAR.to_string(),
                value: "0".to_string(),
            });
        }

        let s3_endpoint_url = lookup(S3_ENDPOINT_URL_VAR).filter(|url| !url.trim().is_empty());

        Ok(Self {
            target,
            retry_policy: RetryPolicy::new(max_attempts, Duration::from_millis(base_delay_ms)),
            concurrency,
            s3_endpoint_url,
        })
    }

    /// 書き込み先を取得
    pub fn target(&self) -> &StorageTarget {
        &self.target
    }

    /// 再試行ポリシーを取得
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// 同時アップロード数を取得
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// S3エンドポイントの上書きを取得
    pub fn s3_endpoint_url(&self) -> Option<&str> {
        self.s3_endpoint_url.as_deref()
    }
}

/// 任意の数値設定を読み込む（未設定ならデフォルト値）
fn parse_or<F, T>(lookup: &F, name: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(name) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidEnvVar {
                name: name.to_string(),
                value,
            }),
    }
}
