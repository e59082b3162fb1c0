//! EC2 client: instance lookup and tag resolution for the queue monitor's
//! instance-id -> node-name resolution step.

use crate::util::Error;
use aws_sdk_ec2::Client;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct InstanceInfo {
    pub instance_id: String,
    pub private_dns_name: Option<String>,
    pub instance_type: Option<String>,
    pub state: Option<String>,
    pub tags: HashMap<String, String>,
}

#[async_trait::async_trait]
pub trait Ec2Client: Send + Sync {
    async fn describe_instance(&self, instance_id: &str) -> Result<Option<InstanceInfo>, Error>;
    /// DescribeTags, paginated, merged into a flat map.
    async fn describe_tags(&self, instance_id: &str) -> Result<HashMap<String, String>, Error>;
}

pub struct AwsEc2Client {
    client: Client,
}

impl AwsEc2Client {
    pub fn new(client: Client) -> Self {
        AwsEc2Client { client }
    }
}

#[async_trait::async_trait]
impl Ec2Client for AwsEc2Client {
    async fn describe_instance(&self, instance_id: &str) -> Result<Option<InstanceInfo>, Error> {
        let resp = self
            .client
            .describe_instances()
            .instance_ids(instance_id)
            .send()
            .await
            .map_err(Error::aws)?;

        let instance = resp
            .reservations()
            .iter()
            .flat_map(|r| r.instances())
            .next()
            .cloned();

        let Some(instance) = instance else {
            return Ok(None);
        };

        let tags = instance
            .tags()
            .iter()
            .filter_map(|t| Some((t.key()?.to_string(), t.value().unwrap_or_default().to_string())))
            .collect();

        Ok(Some(InstanceInfo {
            instance_id: instance.instance_id().unwrap_or_default().to_string(),
            private_dns_name: instance.private_dns_name().map(str::to_string).filter(|s| !s.is_empty()),
            instance_type: instance.instance_type().map(|t| t.as_str().to_string()),
            state: instance.state().and_then(|s| s.name()).map(|n| n.as_str().to_string()),
            tags,
        }))
    }

    async fn describe_tags(&self, instance_id: &str) -> Result<HashMap<String, String>, Error> {
        let filter = aws_sdk_ec2::types::Filter::builder()
            .name("resource-id")
            .values(instance_id)
            .build();

        let mut tags = HashMap::new();
        let mut next_token: Option<String> = None;
        loop {
            let mut req = self.client.describe_tags().filters(filter.clone());
            if let Some(token) = &next_token {
                req = req.next_token(token);
            }
            let resp = req.send().await.map_err(Error::aws)?;
            for tag in resp.tags() {
                if let (Some(key), value) = (tag.key(), tag.value()) {
                    tags.insert(key.to_string(), value.unwrap_or_default().to_string());
                }
            }
            next_token = resp.next_token().map(str::to_string);
            if next_token.is_none() {
                break;
            }
        }
        Ok(tags)
    }
}
