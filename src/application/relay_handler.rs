/// 転送ハンドラー
///
/// SQSバッチの各メッセージをS3へアップロードし、失敗したメッセージIDのみを
/// 部分バッチ失敗レスポンスとして返す。
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use aws_lambda_events::event::sqs::{BatchItemFailure, SqsBatchResponse, SqsEvent, SqsMessage};
use futures::stream::{self, StreamExt};
use lambda_runtime::LambdaEvent;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::domain::{
    InboundMessage, ObjectMetadata, RetryPolicy, StorageTarget, UploadResult, full_jitter,
    retry_with_backoff,
};
use crate::infrastructure::{ObjectStorage, RelayConfig, StorageError};

/// 呼び出し期限の手前で処理を打ち切るまでの余裕（ミリ秒）
pub const DEADLINE_MARGIN_MS: u64 = 1_000;

/// 期限切れで打ち切ったメッセージの失敗理由
pub const DEADLINE_EXCEEDED_REASON: &str = "invocation deadline exceeded";

/// 転送ハンドラーのエラー型
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// messageIdを持たないメッセージが失敗した（部分バッチ失敗として報告できない）
    #[error("{0} message(s) without messageId failed; the whole batch must be redelivered")]
    UnreportableFailure(usize),
}

/// 1回の呼び出しの処理結果
///
/// 入力メッセージと同じ順序で、メッセージごとに1件の`UploadResult`を持つ。
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    results: Vec<UploadResult>,
}

impl BatchReport {
    pub fn new(results: Vec<UploadResult>) -> Self {
        Self { results }
    }

    pub fn results(&self) -> &[UploadResult] {
        &self.results
    }

    pub fn success_count(&self) -> usize {
        self.results.iter().filter(|r| r.is_success()).count()
    }

    pub fn failure_count(&self) -> usize {
        self.results.len() - self.success_count()
    }

    /// 失敗したメッセージのID（IDを持たないものは含まない）
    pub fn failed_message_ids(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|r| !r.is_success())
            .filter_map(|r| r.message_id.as_deref())
            .collect()
    }

    /// 部分バッチ失敗レスポンスに変換
    ///
    /// # 戻り値
    /// * `Ok(SqsBatchResponse)` - 失敗したメッセージIDの一覧
    /// * `Err(RelayError::UnreportableFailure)` - IDのないメッセージが失敗した
    pub fn into_batch_response(self) -> Result<SqsBatchResponse, RelayError> {
        let unreportable = self
            .results
            .iter()
            .filter(|r| !r.is_success() && r.message_id.is_none())
            .count();
        if unreportable > 0 {
            return Err(RelayError::UnreportableFailure(unreportable));
        }

        let batch_item_failures = self
            .failed_message_ids()
            .into_iter()
            .map(|id| BatchItemFailure {
                item_identifier: id.to_string(),
            })
            .collect();

        Ok(SqsBatchResponse {
            batch_item_failures,
        })
    }
}

/// SQSメッセージをS3へ転送するハンドラー
pub struct RelayHandler<S>
where
    S: ObjectStorage,
{
    /// オブジェクトストレージ
    storage: S,
    /// 書き込み先
    target: StorageTarget,
    /// 再試行ポリシー
    retry_policy: RetryPolicy,
    /// 同時アップロード数
    concurrency: usize,
    /// バックオフに適用するジッター
    jitter: fn(Duration) -> Duration,
}

impl<S> RelayHandler<S>
where
    S: ObjectStorage,
{
    /// 新しいRelayHandlerを作成
    pub fn new(storage: S, config: &RelayConfig) -> Self {
        Self {
            storage,
            target: config.target().clone(),
            retry_policy: *config.retry_policy(),
            concurrency: config.concurrency(),
            jitter: full_jitter,
        }
    }

    /// ジッター関数を差し替える
    pub fn with_jitter(mut self, jitter: fn(Duration) -> Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// SQSイベントを処理
    ///
    /// # 処理フロー
    /// 1. Lambdaコンテキストから呼び出し期限を取得
    /// 2. 各メッセージを並列にアップロード
    /// 3. 失敗したメッセージIDを部分バッチ失敗レスポンスとして返す
    pub async fn handle_event(
        &self,
        event: LambdaEvent<SqsEvent>,
    ) -> Result<SqsBatchResponse, RelayError> {
        let deadline = remaining_budget(event.context.deadline, SystemTime::now())
            .map(|budget| Instant::now() + budget);

        let report = self.relay_batch(&event.payload.records, deadline).await;
        report.into_batch_response()
    }

    /// バッチ内の全メッセージを処理
    ///
    /// 同時実行数は`concurrency`で制限する。期限に達した時点で未完了の
    /// メッセージは失敗として扱う（既に完了した書き込みはそのまま残る）。
    pub async fn relay_batch(
        &self,
        records: &[SqsMessage],
        deadline: Option<Instant>,
    ) -> BatchReport {
        info!(
            record_count = records.len(),
            bucket = self.target.bucket(),
            "SQSバッチ処理開始"
        );

        let mut slots: Vec<Option<UploadResult>> = vec![None; records.len()];
        {
            let mut uploads = stream::iter(records.iter().enumerate())
                .map(|(index, record)| async move { (index, self.relay_record(record).await) })
                .buffer_unordered(self.concurrency);

            let collect = async {
                while let Some((index, result)) = uploads.next().await {
                    slots[index] = Some(result);
                }
            };

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, collect).await.is_err() {
                        warn!("呼び出し期限に達したため未完了のアップロードを打ち切り");
                    }
                }
                None => collect.await,
            }
        }

        let results: Vec<UploadResult> = slots
            .into_iter()
            .zip(records)
            .map(|(slot, record)| {
                slot.unwrap_or_else(|| {
                    UploadResult::failure(record.message_id.clone(), None, DEADLINE_EXCEEDED_REASON)
                })
            })
            .collect();

        let report = BatchReport::new(results);
        info!(
            record_count = records.len(),
            success_count = report.success_count(),
            failure_count = report.failure_count(),
            "SQSバッチ処理完了"
        );
        report
    }

    /// SQSレコード1件を処理
    async fn relay_record(&self, record: &SqsMessage) -> UploadResult {
        match InboundMessage::try_from(record) {
            Ok(message) => self.relay_message(&message).await,
            Err(err) => {
                error!(
                    message_id = record.message_id.as_deref().unwrap_or_default(),
                    error = %err,
                    "メッセージを読み取れないため失敗として報告"
                );
                UploadResult::failure(record.message_id.clone(), None, err)
            }
        }
    }

    /// メッセージ1件をアップロード
    ///
    /// 一時的なエラーはポリシーに従って再試行し、恒久的なエラーは即座に失敗とする。
    #[instrument(skip(self, message), fields(message_id = message.id().unwrap_or_default()))]
    pub async fn relay_message(&self, message: &InboundMessage) -> UploadResult {
        let message_id = message.id().map(str::to_string);
        let key = match message.id() {
            Some(id) => self.target.object_key(id),
            None => {
                warn!("messageIdがないためタイムスタンプベースのキーを使用");
                self.target.fallback_object_key()
            }
        };
        let metadata = ObjectMetadata::from_message(message);

        let storage = &self.storage;
        let bucket = self.target.bucket();
        let key_ref = key.as_str();
        let metadata_ref = &metadata;
        let body = message.body();

        let result = retry_with_backoff(
            &self.retry_policy,
            self.jitter,
            StorageError::is_retryable,
            move |attempt| {
                debug!(attempt = attempt, key = %key_ref, "アップロード試行");
                storage.put_object(bucket, key_ref, body.to_vec(), metadata_ref)
            },
        )
        .await;

        match result {
            Ok(()) => {
                info!(key = %key, "アップロード成功");
                UploadResult::success(message_id, key)
            }
            Err(err) if err.is_retryable() => {
                error!(
                    key = %key,
                    max_attempts = self.retry_policy.max_attempts(),
                    error = %err,
                    "再試行上限に達したためアップロード失敗"
                );
                let reason = format!(
                    "retries exhausted after {} attempts: {}",
                    self.retry_policy.max_attempts(),
                    err
                );
                UploadResult::failure(message_id, Some(key), reason)
            }
            Err(err) => {
                error!(key = %key, error = %err, "再試行不能なエラーでアップロード失敗");
                UploadResult::failure(message_id, Some(key), err)
            }
        }
    }
}

/// 呼び出し期限までに使える時間
///
/// `deadline_ms`はUNIXエポックからのミリ秒。0は期限なしとして扱う。
/// 期限から`DEADLINE_MARGIN_MS`を差し引き、既に過ぎていればゼロを返す。
pub fn remaining_budget(deadline_ms: u64, now: SystemTime) -> Option<Duration> {
    if deadline_ms == 0 {
        return None;
    }
    let deadline = UNIX_EPOCH + Duration::from_millis(deadline_ms);
    let remaining = deadline.duration_since(now).unwrap_or(Duration::ZERO);
    Some(remaining.saturating_sub(Duration::from_millis(DEADLINE_MARGIN_MS)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{UploadOutcome, no_jitter};
    use crate::infrastructure::logging::init_test_logging;
    use crate::infrastructure::object_storage::tests::MockObjectStorage;
    use async_trait::async_trait;
    use lambda_runtime::Context;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // ==================== テストヘルパー ====================

    const BUCKET: &str = "telemetry-tmp";

    fn test_config(concurrency: usize) -> RelayConfig {
        RelayConfig::new(
            StorageTarget::new(BUCKET, "telemetry").unwrap(),
            RetryPolicy::default(),
            concurrency,
        )
    }

    /// テスト用のRelayHandlerを作成
    fn create_test_handler() -> (RelayHandler<MockObjectStorage>, MockObjectStorage) {
        init_test_logging();
        let storage = MockObjectStorage::new();
        let handler = RelayHandler::new(storage.clone(), &test_config(8)).with_jitter(no_jitter);
        (handler, storage)
    }

    fn record(id: &str, body: &str) -> SqsMessage {
        SqsMessage {
            message_id: Some(id.to_string()),
            body: Some(body.to_string()),
            ..Default::default()
        }
    }

    fn permanent(reason: &str) -> StorageError {
        StorageError::Permanent(reason.to_string())
    }

    fn transient(reason: &str) -> StorageError {
        StorageError::Transient(reason.to_string())
    }

    // ==================== バッチ処理テスト ====================

    #[tokio::test(start_paused = true)]
    async fn test_partial_batch_failure_scenario() {
        let (handler, storage) = create_test_handler();
        storage.fail_always("telemetry/m3", permanent("AccessDenied"));

        let records = vec![
            record("m1", r#"{"application":"web"}"#),
            record("m2", r#"{"application":"api"}"#),
            record("m3", r#"{"application":"batch"}"#),
        ];
        let report = handler.relay_batch(&records, None).await;

        assert_eq!(report.results().len(), 3);
        assert_eq!(report.failed_message_ids(), vec!["m3"]);
        assert!(storage.object(BUCKET, "telemetry/m1").is_some());
        assert!(storage.object(BUCKET, "telemetry/m2").is_some());
        assert!(storage.object(BUCKET, "telemetry/m3").is_none());
        // 恒久的なエラーは再試行しない
        assert_eq!(storage.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_results_keep_input_order() {
        let (handler, storage) = create_test_handler();
        storage.fail_times("telemetry/a", vec![transient("SlowDown")]);

        let records = vec![record("a", "1"), record("b", "2"), record("c", "3")];
        let report = handler.relay_batch(&records, None).await;

        let ids: Vec<_> = report
            .results()
            .iter()
            .map(|r| r.message_id.as_deref().unwrap())
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(report.success_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_result_per_message_including_malformed() {
        let (handler, storage) = create_test_handler();

        let malformed = SqsMessage {
            message_id: Some("no-body".to_string()),
            ..Default::default()
        };
        let records = vec![record("m1", "x"), malformed, record("m2", "y")];
        let report = handler.relay_batch(&records, None).await;

        assert_eq!(report.results().len(), records.len());
        assert_eq!(report.failed_message_ids(), vec!["no-body"]);
        assert_eq!(
            report.results()[1].outcome,
            UploadOutcome::Failure("No body found in the SQS message".to_string())
        );
        // 本文のないメッセージはアップロードを試みない
        assert_eq!(storage.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_redelivery_overwrites_same_key() {
        let (handler, storage) = create_test_handler();

        handler.relay_batch(&[record("m1", "first")], None).await;
        handler.relay_batch(&[record("m1", "second")], None).await;

        assert_eq!(storage.object_count(), 1);
        assert_eq!(
            storage.object(BUCKET, "telemetry/m1").unwrap().body,
            b"second".to_vec()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_within_budget_are_not_failures() {
        let (handler, storage) = create_test_handler();
        storage.fail_times(
            "telemetry/m1",
            vec![transient("SlowDown"), transient("RequestTimeout")],
        );

        let report = handler.relay_batch(&[record("m1", "x")], None).await;

        assert!(report.failed_message_ids().is_empty());
        assert_eq!(storage.call_count(), 3);
        assert!(storage.object(BUCKET, "telemetry/m1").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_exceeding_budget_are_failures() {
        let (handler, storage) = create_test_handler();
        storage.fail_always("telemetry/m1", transient("SlowDown"));

        let report = handler.relay_batch(&[record("m1", "x")], None).await;

        assert_eq!(report.failed_message_ids(), vec!["m1"]);
        assert_eq!(storage.call_count(), 3);
        match &report.results()[0].outcome {
            UploadOutcome::Failure(reason) => {
                assert!(reason.starts_with("retries exhausted after 3 attempts"));
            }
            UploadOutcome::Success => panic!("Expected failure"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_metadata_is_attached() {
        let (handler, storage) = create_test_handler();

        handler
            .relay_batch(&[record("m1", r#"{"type":"Trace"}"#)], None)
            .await;

        let stored = storage.object(BUCKET, "telemetry/m1").unwrap();
        assert_eq!(stored.metadata.content_type, "application/json");
    }

    // ==================== messageIdなしのテスト ====================

    #[tokio::test(start_paused = true)]
    async fn test_message_without_id_uses_fallback_key() {
        let (handler, storage) = create_test_handler();
        let records = vec![SqsMessage {
            body: Some("x".to_string()),
            ..Default::default()
        }];

        let report = handler.relay_batch(&records, None).await;

        assert_eq!(report.success_count(), 1);
        let key = report.results()[0].key.clone().unwrap();
        assert!(key.starts_with("telemetry/telemetry-"));
        assert!(key.ends_with(".json"));
        assert_eq!(storage.object_count(), 1);
        assert!(report.into_batch_response().is_ok());
    }

    #[test]
    fn test_failed_message_without_id_is_unreportable() {
        let report = BatchReport::new(vec![
            UploadResult::success(Some("m1".to_string()), "telemetry/m1"),
            UploadResult::failure(None, None, "No body found in the SQS message"),
        ]);

        assert_eq!(
            report.into_batch_response().unwrap_err(),
            RelayError::UnreportableFailure(1)
        );
    }

    // ==================== 並列度・期限のテスト ====================

    /// 同時実行数を記録するストレージ
    #[derive(Clone, Default)]
    struct ConcurrencyProbe {
        in_flight: Arc<AtomicUsize>,
        max_in_flight: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ObjectStorage for ConcurrencyProbe {
        async fn put_object(
            &self,
            _bucket: &str,
            _key: &str,
            _body: Vec<u8>,
            _metadata: &ObjectMetadata,
        ) -> Result<(), StorageError> {
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// 応答しないストレージ
    struct StalledStorage;

    #[async_trait]
    impl ObjectStorage for StalledStorage {
        async fn put_object(
            &self,
            _bucket: &str,
            _key: &str,
            _body: Vec<u8>,
            _metadata: &ObjectMetadata,
        ) -> Result<(), StorageError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_is_bounded() {
        let probe = ConcurrencyProbe::default();
        let handler = RelayHandler::new(probe.clone(), &test_config(2));

        let records: Vec<_> = (0..6).map(|i| record(&format!("m{i}"), "x")).collect();
        let report = handler.relay_batch(&records, None).await;

        assert_eq!(report.success_count(), 6);
        assert_eq!(probe.max_in_flight.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_abandons_in_flight_uploads() {
        let handler = RelayHandler::new(StalledStorage, &test_config(8));
        let records = vec![record("m1", "x"), record("m2", "y")];

        let deadline = Instant::now() + Duration::from_secs(1);
        let report = handler.relay_batch(&records, Some(deadline)).await;

        assert_eq!(report.results().len(), 2);
        assert_eq!(report.failed_message_ids(), vec!["m1", "m2"]);
        assert_eq!(
            report.results()[0].outcome,
            UploadOutcome::Failure(DEADLINE_EXCEEDED_REASON.to_string())
        );
    }

    #[test]
    fn test_remaining_budget() {
        let now = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let now_ms = 1_700_000_000_000u64;

        assert_eq!(remaining_budget(0, now), None);
        assert_eq!(
            remaining_budget(now_ms + 5_000, now),
            Some(Duration::from_millis(4_000))
        );
        assert_eq!(remaining_budget(now_ms + 500, now), Some(Duration::ZERO));
        assert_eq!(remaining_budget(now_ms - 500, now), Some(Duration::ZERO));
    }

    // ==================== handle_event テスト ====================

    #[tokio::test(start_paused = true)]
    async fn test_handle_event_returns_batch_item_failures() {
        let (handler, storage) = create_test_handler();
        storage.fail_always("telemetry/m3", permanent("NoSuchBucket"));

        let event = SqsEvent {
            records: vec![record("m1", "a"), record("m2", "b"), record("m3", "c")],
        };
        let response = handler
            .handle_event(LambdaEvent::new(event, Context::default()))
            .await
            .unwrap();

        assert_eq!(response.batch_item_failures.len(), 1);
        assert_eq!(response.batch_item_failures[0].item_identifier, "m3");
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_event_all_success() {
        let (handler, _) = create_test_handler();

        let event = SqsEvent {
            records: vec![record("m1", "a")],
        };
        let response = handler
            .handle_event(LambdaEvent::new(event, Context::default()))
            .await
            .unwrap();

        assert!(response.batch_item_failures.is_empty());
    }
}
