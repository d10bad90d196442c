//! オブジェクトストレージ操作モジュール
//!
//! 転送Lambdaの唯一の永続化経路であるput-object操作を抽象化する。
//! - `ObjectStorage`: テスト用に差し替え可能なトレイト
//! - `S3ObjectStorage`: AWS S3 SDKを使用した実装

use async_trait::async_trait;
use aws_config::retry::RetryConfig;
use aws_config::{BehaviorVersion, SdkConfig};
use aws_sdk_s3::Client as S3Client;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::operation::put_object::PutObjectError;
use aws_sdk_s3::primitives::ByteStream;
use thiserror::Error;
use tracing::{debug, warn};

use crate::domain::ObjectMetadata;

/// 再試行対象とするHTTPステータス
const TRANSIENT_STATUS_CODES: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// 再試行対象とするS3エラーコード
const TRANSIENT_ERROR_CODES: [&str; 7] = [
    "SlowDown",
    "RequestTimeout",
    "InternalError",
    "ServiceUnavailable",
    "Throttling",
    "ThrottlingException",
    "RequestTimeTooSkewed",
];

/// オブジェクトストレージ操作のエラー型
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// 一時的なエラー（スロットリング、タイムアウト、ネットワーク）
    #[error("Transient storage error: {0}")]
    Transient(String),

    /// 再試行しても解消しないエラー（権限不足、バケット不在など）
    #[error("Permanent storage error: {0}")]
    Permanent(String),
}

impl StorageError {
    /// 再試行可能かどうか
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Transient(_))
    }
}

/// オブジェクトストレージ操作トレイト（テスト用の抽象化）
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// オブジェクトを書き込む
    ///
    /// 同じキーへの書き込みは上書きとなる。
    ///
    /// # 引数
    /// * `bucket` - バケット名
    /// * `key` - オブジェクトキー
    /// * `body` - オブジェクト本文
    /// * `metadata` - Content-Typeとユーザーメタデータ
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        metadata: &ObjectMetadata,
    ) -> Result<(), StorageError>;
}

/// AWS S3 SDKを使用したオブジェクトストレージ実装
#[derive(Debug, Clone)]
pub struct S3ObjectStorage {
    client: S3Client,
}

impl S3ObjectStorage {
    /// 新しいS3ObjectStorageを作成
    pub fn new(client: S3Client) -> Self {
        Self { client }
    }

    /// AWS設定からクライアントを作成
    ///
    /// 再試行はハンドラー側のポリシーで行うため、SDKの再試行は無効にする。
    /// `endpoint_url`を指定した場合はパススタイルでアクセスする。
    pub async fn from_config(endpoint_url: Option<&str>) -> Self {
        let config = aws_config::defaults(BehaviorVersion::latest())
            .retry_config(RetryConfig::disabled())
            .load()
            .await;
        Self::new(Self::client_from(&config, endpoint_url))
    }

    /// SdkConfigからS3クライアントを構築
    pub fn client_from(config: &SdkConfig, endpoint_url: Option<&str>) -> S3Client {
        let mut builder = aws_sdk_s3::config::Builder::from(config);
        if let Some(url) = endpoint_url {
            builder = builder.endpoint_url(url).force_path_style(true);
        }
        S3Client::from_conf(builder.build())
    }
}

#[async_trait]
impl ObjectStorage for S3ObjectStorage {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        metadata: &ObjectMetadata,
    ) -> Result<(), StorageError> {
        debug!(
            bucket = %bucket,
            key = %key,
            size = body.len(),
            "S3 PutObject開始"
        );

        let result = self
            .client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type(&metadata.content_type)
            .set_metadata(if metadata.user_metadata.is_empty() {
                None
            } else {
                Some(metadata.user_metadata.clone())
            })
            .send()
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) => {
                let storage_error = classify_put_object_error(&err);
                warn!(
                    bucket = %bucket,
                    key = %key,
                    retryable = storage_error.is_retryable(),
                    error = %DisplayErrorContext(&err),
                    "S3 PutObjectエラー"
                );
                Err(storage_error)
            }
        }
    }
}

/// PutObjectのSDKエラーを一時的/恒久的に分類する
pub fn classify_put_object_error(err: &SdkError<PutObjectError, HttpResponse>) -> StorageError {
    let message = DisplayErrorContext(err).to_string();
    match err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            StorageError::Transient(message)
        }
        SdkError::ServiceError(context) => {
            let status = context.raw().status().as_u16();
            let code = context.err().code();
            if is_transient_status(status) || code.is_some_and(is_transient_code) {
                StorageError::Transient(message)
            } else {
                StorageError::Permanent(message)
            }
        }
        _ => StorageError::Permanent(message),
    }
}

/// 再試行対象のHTTPステータスか
pub fn is_transient_status(status: u16) -> bool {
    TRANSIENT_STATUS_CODES.contains(&status)
}

/// 再試行対象のS3エラーコードか
pub fn is_transient_code(code: &str) -> bool {
    TRANSIENT_ERROR_CODES.contains(&code)
}
