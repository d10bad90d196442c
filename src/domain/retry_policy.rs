//! 指数バックオフによる再試行
//!
//! 再試行ポリシーと汎用の再試行ヘルパーを提供する。
//! アップロード処理とは独立しており、任意の非同期操作に適用できる。

use std::fmt;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

/// デフォルトの最大試行回数（初回を含む）
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// デフォルトの基本待機時間（ミリ秒）
pub const DEFAULT_BASE_DELAY_MS: u64 = 200;

/// デフォルトの最大待機時間（ミリ秒）
pub const DEFAULT_MAX_DELAY_MS: u64 = 5_000;

/// 再試行ポリシー
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
        }
    }
}

impl RetryPolicy {
    /// 新しいRetryPolicyを作成
    ///
    /// `max_attempts`は1未満にならないよう切り上げる。
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS).max(base_delay),
        }
    }

    /// 最大待機時間を指定
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// 最大試行回数を取得
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// 基本待機時間を取得
    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    /// n回目の再試行前の待機時間（ジッター適用前）
    ///
    /// `base_delay * 2^(retry - 1)`を`max_delay`で頭打ちにする。`retry`は1始まり。
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

/// フルジッター: `[0, delay]`の一様乱数
pub fn full_jitter(delay: Duration) -> Duration {
    let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
    Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
}

/// ジッターなし
pub fn no_jitter(delay: Duration) -> Duration {
    delay
}

/// 指数バックオフで操作を再試行する
///
/// # 引数
/// * `policy` - 再試行ポリシー
/// * `jitter` - 待機時間に適用する関数
/// * `is_retryable` - エラーが再試行可能か判定する関数
/// * `operation` - 試行番号（1始まり）を受け取る非同期操作
///
/// # 戻り値
/// * `Ok(T)` - いずれかの試行が成功
/// * `Err(E)` - 再試行不能なエラー、または最大試行回数に達した時点の最後のエラー
pub async fn retry_with_backoff<T, E, F, Fut, J, R>(
    policy: &RetryPolicy,
    jitter: J,
    is_retryable: R,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    J: Fn(Duration) -> Duration,
    R: Fn(&E) -> bool,
    E: fmt::Display,
{
    let mut attempt = 1;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < policy.max_attempts() && is_retryable(&err) => {
                let delay = jitter(policy.delay_for_retry(attempt));
                warn!(
                    attempt = attempt,
                    max_attempts = policy.max_attempts(),
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "一時的なエラーのため再試行"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
