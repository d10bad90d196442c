/// SQS→S3 テレメトリ転送Lambda関数
///
/// telemetry-data-queueから受け取ったメッセージを一時バケットにアップロードし、
/// 失敗したメッセージIDのみを部分バッチ失敗として返す。
use std::sync::Arc;

use aws_lambda_events::event::sqs::{SqsBatchResponse, SqsEvent};
use lambda_runtime::{Error, LambdaEvent, service_fn};
use telemetry_sqs_to_s3::application::RelayHandler;
use telemetry_sqs_to_s3::infrastructure::{
    ObjectStorage, RelayConfig, S3ObjectStorage, init_logging,
};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Error> {
    // 構造化ログを初期化
    init_logging();

    // 設定は起動時に一度だけ読み込む（バケット未設定なら起動失敗）
    let config = match RelayConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "設定読み込み失敗");
            return Err(err.into());
        }
    };

    info!(
        bucket = config.target().bucket(),
        key_prefix = config.target().key_prefix(),
        concurrency = config.concurrency(),
        max_attempts = config.retry_policy().max_attempts(),
        "転送Lambdaを初期化"
    );

    let storage = S3ObjectStorage::from_config(config.s3_endpoint_url()).await;
    let relay = Arc::new(RelayHandler::new(storage, &config));

    // Lambda関数を初期化して実行
    let func = service_fn(move |event| {
        let relay = Arc::clone(&relay);
        async move { handler(&relay, event).await }
    });
    lambda_runtime::run(func).await?;
    Ok(())
}

/// Lambda関数のメインハンドラー
///
/// # 処理フロー
/// 1. 各SQSメッセージをS3にアップロード
/// 2. 処理結果をログに記録
/// 3. 失敗したメッセージIDを返す（SQSはそれらのみを再配信する）
async fn handler<S: ObjectStorage>(
    relay: &RelayHandler<S>,
    event: LambdaEvent<SqsEvent>,
) -> Result<SqsBatchResponse, Error> {
    info!(
        request_id = %event.context.request_id,
        record_count = event.payload.records.len(),
        "SQSイベントを受信"
    );

    match relay.handle_event(event).await {
        Ok(response) => Ok(response),
        Err(err) => {
            // バッチ全体を失敗として返し、全メッセージを再配信させる
            error!(error = %err, "部分バッチ失敗として報告できない失敗");
            Err(err.into())
        }
    }
}
