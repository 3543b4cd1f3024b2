//! SQS Queue integration for async job processing
//!
//! Provides:
//! - SQS client wrapper with retry logic
//! - Message serialization/deserialization
//! - The document processing job message

use crate::config;
use crate::errors::{AppError, Result};
use aws_sdk_sqs::types::Message;
use aws_sdk_sqs::Client as SqsClient;
use backoff::{future::retry, ExponentialBackoff};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// SQS queue settings for one queue
#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// Queue URL
    pub url: String,
    /// Visibility timeout in seconds
    pub visibility_timeout: i32,
    /// Wait time for long polling (seconds)
    pub wait_time_seconds: i32,
    /// Maximum number of messages per poll
    pub max_messages: i32,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            url: String::new(),
            visibility_timeout: 1800,
            wait_time_seconds: 20,
            max_messages: 1,
        }
    }
}

impl QueueSettings {
    /// Settings for the document processing queue; one message per poll
    pub fn processing(config: &config::QueueConfig) -> Result<Self> {
        let url = config
            .processing_queue_url
            .clone()
            .ok_or_else(|| AppError::Configuration {
                message: "queue.processing_queue_url is not set".to_string(),
            })?;

        Ok(Self {
            url,
            visibility_timeout: config.visibility_timeout_secs as i32,
            wait_time_seconds: config.poll_timeout_secs.min(20) as i32,
            max_messages: 1,
        })
    }
}

/// SQS Queue client wrapper
pub struct Queue {
    client: SqsClient,
    settings: QueueSettings,
}

fn send_backoff() -> ExponentialBackoff {
    ExponentialBackoff {
        max_elapsed_time: Some(Duration::from_secs(10)),
        ..Default::default()
    }
}

impl Queue {
    /// Create a new queue client
    pub async fn new(settings: QueueSettings) -> Result<Self> {
        let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        let client = SqsClient::new(&aws_config);

        Ok(Self { client, settings })
    }

    /// Create with existing AWS client
    pub fn with_client(client: SqsClient, settings: QueueSettings) -> Self {
        Self { client, settings }
    }

    /// Queue URL this client talks to
    pub fn url(&self) -> &str {
        &self.settings.url
    }

    /// Send a message to the queue
    pub async fn send<T: Serialize>(&self, message: &T) -> Result<String> {
        self.send_with_delay(message, None).await
    }

    /// Send a message with delay
    pub async fn send_delayed<T: Serialize>(&self, message: &T, delay_seconds: i32) -> Result<String> {
        self.send_with_delay(message, Some(delay_seconds)).await
    }

    async fn send_with_delay<T: Serialize>(&self, message: &T, delay_seconds: Option<i32>) -> Result<String> {
        let body = serde_json::to_string(message).map_err(|e| AppError::QueueError {
            message: format!("Failed to serialize message: {}", e),
        })?;

        let result = retry(send_backoff(), || {
            let mut request = self
                .client
                .send_message()
                .queue_url(&self.settings.url)
                .message_body(&body);
            if let Some(delay) = delay_seconds {
                request = request.delay_seconds(delay);
            }
            async move {
                request.send().await.map_err(|e| {
                    backoff::Error::transient(AppError::QueueError {
                        message: format!("Failed to send message: {}", e),
                    })
                })
            }
        })
        .await?;

        let message_id = result.message_id.unwrap_or_default();
        debug!(message_id = %message_id, ?delay_seconds, "Message sent to queue");

        Ok(message_id)
    }

    /// Receive messages from the queue
    pub async fn receive(&self) -> Result<Vec<Message>> {
        let result = self
            .client
            .receive_message()
            .queue_url(&self.settings.url)
            .max_number_of_messages(self.settings.max_messages)
            .visibility_timeout(self.settings.visibility_timeout)
            .wait_time_seconds(self.settings.wait_time_seconds)
            .send()
            .await
            .map_err(|e| AppError::QueueError {
                message: format!("Failed to receive messages: {}", e),
            })?;

        let messages = result.messages.unwrap_or_default();
        debug!(count = messages.len(), "Received messages from queue");

        Ok(messages)
    }

    /// Delete a message after processing
    pub async fn delete(&self, receipt_handle: &str) -> Result<()> {
        self.client
            .delete_message()
            .queue_url(&self.settings.url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| AppError::QueueError {
                message: format!("Failed to delete message: {}", e),
            })?;

        debug!("Message deleted from queue");
        Ok(())
    }

    /// Change visibility timeout (extend processing time)
    pub async fn extend_visibility(&self, receipt_handle: &str, additional_seconds: i32) -> Result<()> {
        self.client
            .change_message_visibility()
            .queue_url(&self.settings.url)
            .receipt_handle(receipt_handle)
            .visibility_timeout(additional_seconds)
            .send()
            .await
            .map_err(|e| AppError::QueueError {
                message: format!("Failed to extend visibility: {}", e),
            })?;

        debug!(additional_seconds, "Extended message visibility");
        Ok(())
    }

    /// Parse message body as JSON
    pub fn parse_message<T: DeserializeOwned>(message: &Message) -> Result<T> {
        let body = message.body.as_ref().ok_or_else(|| AppError::QueueError {
            message: "Message has no body".to_string(),
        })?;

        parse_body(body)
    }
}

/// Parse a raw message body as JSON
pub fn parse_body<T: DeserializeOwned>(body: &str) -> Result<T> {
    serde_json::from_str(body).map_err(|e| AppError::QueueError {
        message: format!("Failed to parse message: {}", e),
    })
}

/// Document processing job message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessDocumentMessage {
    pub document_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_template_id: Option<Uuid>,
    #[serde(default)]
    pub extract_globals: bool,
    /// Zero-based delivery attempt, bumped on every re-enqueue
    #[serde(default)]
    pub attempt: u32,
}

impl ProcessDocumentMessage {
    /// Copy of this job for the next delivery attempt
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_message_defaults() {
        let id = Uuid::new_v4();
        let body = format!(r#"{{"document_id":"{}","file_path":"p/doc.pdf"}}"#, id);
        let msg: ProcessDocumentMessage = parse_body(&body).unwrap();

        assert_eq!(msg.document_id, id);
        assert_eq!(msg.file_path.as_deref(), Some("p/doc.pdf"));
        assert_eq!(msg.attempt, 0);
        assert!(!msg.extract_globals);
        assert_eq!(msg.next_attempt().attempt, 1);
    }

    #[test]
    fn test_malformed_body_is_queue_error() {
        let err = parse_body::<ProcessDocumentMessage>("{not json").unwrap_err();
        assert!(matches!(err, AppError::QueueError { .. }));
    }

    #[test]
    fn test_processing_settings_require_url() {
        let err = QueueSettings::processing(&config::QueueConfig::default()).unwrap_err();
        assert!(matches!(err, AppError::Configuration { .. }));

        let settings = QueueSettings::processing(&config::QueueConfig {
            processing_queue_url: Some("https://sqs.local/q".into()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(settings.max_messages, 1);
        assert_eq!(settings.visibility_timeout, 1800);
    }
}
