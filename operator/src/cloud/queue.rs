//! SQS-backed pull queue: long-poll receive plus delete. The queue
//! monitor owns all envelope parsing; this client only moves bytes.

use crate::util::Error;
use aws_sdk_sqs::Client;

/// Defaults used when no CLI override is supplied.
pub const RECEIVE_MAX_MESSAGES: i32 = 5;
pub const RECEIVE_WAIT_SECONDS: i32 = 20;
pub const VISIBILITY_TIMEOUT_SECONDS: i32 = 20;

#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub body: String,
    pub receipt_handle: String,
}

#[async_trait::async_trait]
pub trait QueueClient: Send + Sync {
    async fn receive(&self) -> Result<Vec<QueueMessage>, Error>;
    async fn delete(&self, receipt_handle: &str) -> Result<(), Error>;
}

pub struct QueueClientOptions {
    pub max_messages: i32,
    pub wait_seconds: i32,
    pub visibility_timeout_seconds: i32,
}

impl Default for QueueClientOptions {
    fn default() -> Self {
        QueueClientOptions {
            max_messages: RECEIVE_MAX_MESSAGES,
            wait_seconds: RECEIVE_WAIT_SECONDS,
            visibility_timeout_seconds: VISIBILITY_TIMEOUT_SECONDS,
        }
    }
}

pub struct SqsQueueClient {
    client: Client,
    queue_url: String,
    options: QueueClientOptions,
}

impl SqsQueueClient {
    pub fn new(client: Client, queue_url: impl Into<String>, options: QueueClientOptions) -> Self {
        SqsQueueClient {
            client,
            queue_url: queue_url.into(),
            options,
        }
    }
}

#[async_trait::async_trait]
impl QueueClient for SqsQueueClient {
    async fn receive(&self) -> Result<Vec<QueueMessage>, Error> {
        let resp = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(self.options.max_messages)
            .wait_time_seconds(self.options.wait_seconds)
            .visibility_timeout(self.options.visibility_timeout_seconds)
            .send()
            .await
            .map_err(Error::aws)?;

        Ok(resp
            .messages()
            .iter()
            .filter_map(|m| {
                Some(QueueMessage {
                    body: m.body()?.to_string(),
                    receipt_handle: m.receipt_handle()?.to_string(),
                })
            })
            .collect())
    }

    async fn delete(&self, receipt_handle: &str) -> Result<(), Error> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(Error::aws)?;
        Ok(())
    }
}
