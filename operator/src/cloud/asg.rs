//! Auto Scaling Group client: lifecycle-action completion/heartbeat and
//! the membership lookups the queue monitor's managed-tag filter needs.

use crate::util::Error;
use aws_sdk_autoscaling::types::LifecycleActionResult;
use aws_sdk_autoscaling::Client;

#[async_trait::async_trait]
pub trait AsgClient: Send + Sync {
    async fn complete_lifecycle_action(
        &self,
        asg_name: &str,
        hook_name: &str,
        token: &str,
        instance_id: &str,
    ) -> Result<(), Error>;

    /// Extends the hook's timeout. Returns `true` if the hook is already
    /// gone (a terminal validation error -- stop the heartbeat loop).
    async fn record_heartbeat(
        &self,
        asg_name: &str,
        hook_name: &str,
        token: &str,
        instance_id: &str,
    ) -> Result<bool, Error>;

    async fn describe_autoscaling_group_for_instance(&self, instance_id: &str) -> Result<Option<String>, Error>;

    async fn describe_hook_timeout(&self, asg_name: &str, hook_name: &str) -> Result<Option<i64>, Error>;
}

pub struct AwsAsgClient {
    client: Client,
}

impl AwsAsgClient {
    pub fn new(client: Client) -> Self {
        AwsAsgClient { client }
    }
}

/// A lifecycle-action API error meaning "no active lifecycle action" --
/// the hook is already resolved, so the heartbeat loop should stop rather
/// than keep retrying.
fn is_no_active_lifecycle_action(err: &aws_sdk_autoscaling::Error) -> bool {
    err.to_string().to_lowercase().contains("no active lifecycle action")
}

#[async_trait::async_trait]
impl AsgClient for AwsAsgClient {
    async fn complete_lifecycle_action(
        &self,
        asg_name: &str,
        hook_name: &str,
        token: &str,
        instance_id: &str,
    ) -> Result<(), Error> {
        self.client
            .complete_lifecycle_action()
            .auto_scaling_group_name(asg_name)
            .lifecycle_hook_name(hook_name)
            .lifecycle_action_token(token)
            .instance_id(instance_id)
            .lifecycle_action_result(LifecycleActionResult::Continue)
            .send()
            .await
            .map_err(|e| Error::aws(aws_sdk_autoscaling::Error::from(e)))?;
        Ok(())
    }

    async fn record_heartbeat(
        &self,
        asg_name: &str,
        hook_name: &str,
        token: &str,
        instance_id: &str,
    ) -> Result<bool, Error> {
        let result = self
            .client
            .record_lifecycle_action_heartbeat()
            .auto_scaling_group_name(asg_name)
            .lifecycle_hook_name(hook_name)
            .lifecycle_action_token(token)
            .instance_id(instance_id)
            .send()
            .await;

        match result {
            Ok(_) => Ok(false),
            Err(e) => {
                let err = aws_sdk_autoscaling::Error::from(e);
                if is_no_active_lifecycle_action(&err) {
                    Ok(true)
                } else {
                    Err(Error::aws(err))
                }
            }
        }
    }

    async fn describe_autoscaling_group_for_instance(&self, instance_id: &str) -> Result<Option<String>, Error> {
        let resp = self
            .client
            .describe_auto_scaling_instances()
            .instance_ids(instance_id)
            .send()
            .await
            .map_err(Error::aws)?;
        Ok(resp
            .auto_scaling_instances()
            .first()
            .map(|i| i.auto_scaling_group_name().to_string()))
    }

    async fn describe_hook_timeout(&self, asg_name: &str, hook_name: &str) -> Result<Option<i64>, Error> {
        let resp = self
            .client
            .describe_lifecycle_hooks()
            .auto_scaling_group_name(asg_name)
            .lifecycle_hook_names(hook_name)
            .send()
            .await
            .map_err(Error::aws)?;
        Ok(resp.lifecycle_hooks().first().map(|h| h.heartbeat_timeout()))
    }
}
