// アプリケーション層モジュール
pub mod relay_handler;

// 再エクスポート
pub use relay_handler::{BatchReport, RelayError, RelayHandler};
