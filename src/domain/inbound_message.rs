//! 受信メッセージ
//!
//! SQSレコードをアップロード対象のメッセージに変換する。
//! 本文は不透明なバイト列として扱い、スキーマ検証は行わない。

use std::collections::BTreeMap;

use aws_lambda_events::event::sqs::SqsMessage;
use thiserror::Error;

/// SQSのシステム属性のうちメタデータへ引き継ぐ送信時刻
const SENT_TIMESTAMP_ATTRIBUTE: &str = "SentTimestamp";

/// 送信時刻を格納するメタデータキー
pub const SENT_TIMESTAMP_METADATA_KEY: &str = "sqs-sent-timestamp";

/// メッセージ変換のエラー型
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MessageError {
    /// 本文が存在しない
    #[error("No body found in the SQS message")]
    MissingBody,
}

/// バッチ内の1メッセージ
///
/// 受信後は変更しない。`id`はSQSの`messageId`で、存在しない場合は`None`。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    id: Option<String>,
    body: Vec<u8>,
    attributes: BTreeMap<String, String>,
}

impl InboundMessage {
    /// 明示的な値でメッセージを作成
    pub fn new(
        id: Option<String>,
        body: impl Into<Vec<u8>>,
        attributes: BTreeMap<String, String>,
    ) -> Self {
        Self {
            id,
            body: body.into(),
            attributes,
        }
    }

    /// メッセージIDを取得
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// 本文を取得
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// 属性を取得
    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }
}

impl TryFrom<&SqsMessage> for InboundMessage {
    type Error = MessageError;

    /// SQSレコードから変換する
    ///
    /// 文字列値を持つメッセージ属性（String/Number型）のみを引き継ぐ。
    /// Binary型の属性は読み捨てる。
    fn try_from(record: &SqsMessage) -> Result<Self, Self::Error> {
        let body = record.body.as_ref().ok_or(MessageError::MissingBody)?;

        let mut attributes: BTreeMap<String, String> = record
            .message_attributes
            .iter()
            .filter_map(|(name, attribute)| {
                attribute
                    .string_value
                    .as_ref()
                    .map(|value| (name.clone(), value.clone()))
            })
            .collect();

        if let Some(sent_timestamp) = record.attributes.get(SENT_TIMESTAMP_ATTRIBUTE) {
            attributes.insert(
                SENT_TIMESTAMP_METADATA_KEY.to_string(),
                sent_timestamp.clone(),
            );
        }

        Ok(Self {
            id: record.message_id.clone(),
            body: body.as_bytes().to_vec(),
            attributes,
        })
    }
}
