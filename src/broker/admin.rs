use std::time::Duration;

use crate::transport::{http_base, is_valid_name};
use crate::utils::error::{BrokerError, Result, TransportError};

/// nsqlookupd administration over HTTP.
#[derive(Debug, Clone)]
pub(crate) struct TopicAdmin {
    http: reqwest::Client,
    timeout: Duration,
    user_agent: String,
}

impl TopicAdmin {
    pub fn new(timeout: Duration, user_agent: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            timeout,
            user_agent: user_agent.into(),
        }
    }

    /// `POST /topic/create?topic=<topic>` with an empty body. Any 2xx status
    /// counts as created, including for topics that already exist.
    pub async fn create_topic(&self, lookupd: &str, topic: &str) -> Result<()> {
        if !is_valid_name(topic) {
            return Err(BrokerError::validation(
                "CreateTopic",
                format!("invalid topic name '{topic}'"),
            ));
        }

        let url = format!("{}/topic/create", http_base(lookupd));
        let response = self
            .http
            .post(&url)
            .query(&[("topic", topic)])
            .header(reqwest::header::USER_AGENT, &self.user_agent)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|err| BrokerError::TopicCreation {
                topic: topic.to_string(),
                status: None,
                source: TransportError::Http(err),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(BrokerError::TopicCreation {
                topic: topic.to_string(),
                status: Some(status.as_u16()),
                source: TransportError::HttpStatus(status.as_u16()),
            });
        }
        tracing::debug!(topic, lookupd, status = status.as_u16(), "topic created");
        Ok(())
    }
}
