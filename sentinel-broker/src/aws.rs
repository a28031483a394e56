//! Long-lived AWS client handles.
//!
//! Built once at startup from the ambient credential chain and shared by
//! reference for the life of the process. SDK clients are internally
//! reference-counted and safe for concurrent use.

use std::time::Duration;

use aws_config::BehaviorVersion;
use aws_config::timeout::TimeoutConfig;

#[derive(Clone)]
pub struct AwsHandles {
    pub sts: aws_sdk_sts::Client,
    pub ssm: aws_sdk_ssm::Client,
    pub kms: aws_sdk_kms::Client,
    pub dynamodb: aws_sdk_dynamodb::Client,
    pub sns: aws_sdk_sns::Client,
    pub secrets: aws_sdk_secretsmanager::Client,
}

impl AwsHandles {
    /// Load the default credential chain and construct every client with
    /// per-call timeouts. One outbound call never runs longer than the
    /// operation timeout; the overall request deadline is enforced above
    /// this layer.
    pub async fn load() -> Self {
        let timeouts = TimeoutConfig::builder()
            .operation_timeout(Duration::from_secs(10))
            .operation_attempt_timeout(Duration::from_secs(5))
            .build();
        let config = aws_config::defaults(BehaviorVersion::latest())
            .timeout_config(timeouts)
            .load()
            .await;
        AwsHandles {
            sts: aws_sdk_sts::Client::new(&config),
            ssm: aws_sdk_ssm::Client::new(&config),
            kms: aws_sdk_kms::Client::new(&config),
            dynamodb: aws_sdk_dynamodb::Client::new(&config),
            sns: aws_sdk_sns::Client::new(&config),
            secrets: aws_sdk_secretsmanager::Client::new(&config),
        }
    }
}
