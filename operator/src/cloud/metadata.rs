//! Instance Metadata Service (IMDS) client: the four metadata monitors'
//! sole collaborator.

use crate::util::Error;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use std::time::Duration;

const TOKEN_PATH: &str = "/latest/api/token";
const SPOT_PATH: &str = "/latest/meta-data/spot/instance-action";
const SCHEDULED_PATH: &str = "/latest/meta-data/events/maintenance/scheduled";
const ASG_TARGET_STATE_PATH: &str = "/latest/meta-data/autoscaling/target-lifecycle-state";
const REBALANCE_PATH: &str = "/latest/meta-data/events/recommendations/rebalance";

#[derive(Debug, Deserialize)]
pub struct SpotItnDoc {
    pub action: String,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct ScheduledEventDoc {
    #[serde(rename = "Code")]
    pub code: String,
    #[serde(rename = "Description")]
    pub description: String,
    #[serde(rename = "EventId")]
    pub event_id: String,
    #[serde(rename = "NotBefore")]
    pub not_before: String,
    #[serde(rename = "NotAfter")]
    pub not_after: Option<String>,
    #[serde(rename = "State")]
    pub state: String,
}

impl ScheduledEventDoc {
    /// Parses the Go-style `"2 Jan 2006 15:04:05 GMT"` timestamp. NotAfter
    /// degrades to NotBefore's value when it fails to parse.
    pub fn not_before(&self) -> Result<DateTime<Utc>, Error> {
        parse_imds_time(&self.not_before)
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
            .as_deref()
            .and_then(|s| parse_imds_time(s).ok())
            .unwrap_or_else(|| self.not_before().unwrap_or_else(|_| Utc::now()))
    }
}

fn parse_imds_time(s: &str) -> Result<DateTime<Utc>, Error> {
    let naive = NaiveDateTime::parse_from_str(s, "%e %b %Y %H:%M:%S GMT")?;
    Ok(naive.and_utc())
}

#[derive(Debug, Deserialize)]
pub struct RebalanceDoc {
    pub notice_time: DateTime<Utc>,
}

#[async_trait::async_trait]
pub trait MetadataClient: Send + Sync {
    async fn spot_itn(&self) -> Result<Option<SpotItnDoc>, Error>;
    async fn scheduled_events(&self) -> Result<Vec<ScheduledEventDoc>, Error>;
    async fn asg_target_state(&self) -> Result<Option<String>, Error>;
    async fn rebalance_recommendation(&self) -> Result<Option<RebalanceDoc>, Error>;
}

pub struct ImdsClient {
    http: reqwest::Client,
    base_url: String,
}

impl ImdsClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        ImdsClient {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .expect("reqwest client"),
            base_url: base_url.into(),
        }
    }

    async fn token(&self) -> Result<String, Error> {
        let resp = self
            .http
            .put(format!("{}{TOKEN_PATH}", self.base_url))
            .header("X-aws-ec2-metadata-token-ttl-seconds", "21600")
            .send()
            .await?;
        Ok(resp.text().await.unwrap_or_default())
    }

    async fn get(&self, path: &str) -> Result<Option<String>, Error> {
        let token = self.token().await.unwrap_or_default();
        let resp = self
            .http
            .get(format!("{}{path}", self.base_url))
            .header("X-aws-ec2-metadata-token", token)
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = resp.error_for_status()?;
        Ok(Some(resp.text().await?))
    }
}

#[async_trait::async_trait]
impl MetadataClient for ImdsClient {
    async fn spot_itn(&self) -> Result<Option<SpotItnDoc>, Error> {
        match self.get(SPOT_PATH).await? {
            Some(body) => Ok(Some(serde_json::from_str(&body)?)),
            None => Ok(None),
        }
    }

    async fn scheduled_events(&self) -> Result<Vec<ScheduledEventDoc>, Error> {
        match self.get(SCHEDULED_PATH).await? {
            Some(body) => Ok(serde_json::from_str(&body)?),
            None => Ok(Vec::new()),
        }
    }

    async fn asg_target_state(&self) -> Result<Option<String>, Error> {
        match self.get(ASG_TARGET_STATE_PATH).await? {
            Some(body) if body.trim().is_empty() => Ok(None),
            Some(body) => Ok(Some(body.trim().to_string())),
            None => Ok(None),
        }
    }

    async fn rebalance_recommendation(&self) -> Result<Option<RebalanceDoc>, Error> {
        match self.get(REBALANCE_PATH).await? {
            Some(body) => Ok(Some(serde_json::from_str(&body)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_go_style_timestamp_without_leading_zero() {
        let parsed = parse_imds_time("21 Jan 2019 09:00:43 GMT").unwrap();
        assert_eq!(parsed.to_rfc3339(), "2019-01-21T09:00:43+00:00");
    }

    #[test]
    fn parses_single_digit_day() {
        let parsed = parse_imds_time("2 Jan 2019 09:00:43 GMT").unwrap();
        assert_eq!(parsed.format("%Y-%m-%d").to_string(), "2019-01-02");
    }

    #[test]
    fn not_after_degrades_to_not_before_on_parse_failure() {
        let doc = ScheduledEventDoc {
            code: "system-reboot".to_string(),
            description: String::new(),
            event_id: "evt-1".to_string(),
            not_before: "21 Jan 2019 09:00:43 GMT".to_string(),
            not_after: Some("garbage".to_string()),
            state: "active".to_string(),
        };
        assert_eq!(doc.not_after(), doc.not_before().unwrap());
    }
}
