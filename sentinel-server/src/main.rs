use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use sentinel_broker::approval::{ApprovalSettings, ApprovalStore, AutoApproveRule};
use sentinel_broker::breakglass::{BreakGlassSettings, BreakGlassStore};
use sentinel_broker::config::BrokerConfig;
use sentinel_broker::notify::Notifier;
use sentinel_broker::policy_loader::PolicyLoader;
use sentinel_broker::posture::{HttpMdmProvider, PostureClient};
use sentinel_broker::ratelimit::BrokerRateLimiter;
use sentinel_broker::vendor::{AuditSink, Vendor};
use sentinel_broker::AwsHandles;
use sentinel_core::audit::AuditLog;
use sentinel_core::ratelimit::{MemoryRateLimiter, RateLimitConfig};

use sentinel_server::auth::BoundToken;
use sentinel_server::config::ServerConfig;
use sentinel_server::handlers::ServerState;

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs in production (SENTINEL_LOG_JSON=1), human-readable otherwise.
    let json_logs = std::env::var("SENTINEL_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env()
        .add_directive("sentinel_server=info".parse()?)
        .add_directive("sentinel_broker=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let server_config = ServerConfig::parse();
    let transport = server_config
        .transport()
        .map_err(|e| anyhow::anyhow!(e))?;
    let broker_config = BrokerConfig::from_env();

    let aws = AwsHandles::load().await;

    let notifier = Arc::new(Notifier::new(
        broker_config
            .sns_topic_arn
            .clone()
            .map(|arn| (aws.sns.clone(), arn)),
        broker_config.webhook_urls.clone(),
    ));

    let limiter = Arc::new(BrokerRateLimiter::new(
        broker_config.vend_limit,
        broker_config
            .ratelimit_table
            .clone()
            .map(|table| (aws.dynamodb.clone(), table)),
    ));

    let loader = Arc::new(PolicyLoader::new(
        aws.ssm.clone(),
        aws.kms.clone(),
        broker_config.parameter_root.clone(),
        broker_config.signing_key_id.clone(),
        broker_config.enforce_signatures,
        broker_config.policy_cache_ttl,
    ));

    let posture = broker_config.mdm_url.clone().map(|url| {
        Arc::new(PostureClient::new(
            HttpMdmProvider::new(
                url,
                aws.secrets.clone(),
                broker_config.mdm_token_secret_id.clone(),
                broker_config.mdm_token_cache_ttl,
            ),
            broker_config.mdm_fail_mode,
            broker_config.posture_cache_ttl,
        ))
    });

    let auto_approve: Vec<AutoApproveRule> = match server_config.auto_approve {
        Some(ref yaml) => serde_yaml::from_str(yaml).context("parsing auto-approve rules")?,
        None => Vec::new(),
    };
    let approvals = Arc::new(ApprovalStore::new(
        aws.dynamodb.clone(),
        broker_config.approvals_table.clone(),
        ApprovalSettings {
            request_ttl: chrono::Duration::from_std(broker_config.request_ttl)
                .unwrap_or_else(|_| chrono::Duration::hours(1)),
            max_duration_seconds: broker_config.max_request_duration.as_secs() as i64,
            approvers: broker_config.approvers.clone(),
            auto_approve,
        },
        Arc::clone(&limiter),
        Arc::clone(&notifier),
    ));

    let breakglass = Arc::new(BreakGlassStore::new(
        aws.dynamodb.clone(),
        broker_config.breakglass_table.clone(),
        BreakGlassSettings {
            max_duration_seconds: broker_config.breakglass_max_duration.as_secs() as i64,
            authorized_users: broker_config.breakglass_users.clone(),
            privileged_closers: broker_config
                .approvers
                .get("*")
                .cloned()
                .unwrap_or_default(),
        },
        Arc::clone(&limiter),
        Arc::clone(&notifier),
    ));

    let audit_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&server_config.audit_log)
        .with_context(|| format!("opening audit log {}", server_config.audit_log.display()))?;
    let audit: Arc<AuditSink> = Arc::new(AuditLog::new(
        broker_config.audit_key.clone(),
        Box::new(audit_file) as Box<dyn std::io::Write + Send>,
    ));

    let vendor = Arc::new(Vendor::new(
        aws.sts.clone(),
        aws.dynamodb.clone(),
        loader,
        posture,
        approvals,
        breakglass,
        Arc::clone(&limiter),
        Arc::clone(&notifier),
        audit,
        broker_config,
    ));

    // Background expiry sweeps for approvals and break-glass events.
    if server_config.sweep_interval_secs > 0 {
        let sweeper = Arc::clone(&vendor);
        let interval = Duration::from_secs(server_config.sweep_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                sweeper.sweep().await;
            }
        });
    }

    let token_required = server_config.require_token || matches!(transport, sentinel_server::Transport::Tcp(_));
    let state = Arc::new(ServerState {
        vendor,
        token: BoundToken::generate(),
        token_required,
        owner_uid: unsafe { libc::getuid() },
        gate: MemoryRateLimiter::new(RateLimitConfig {
            requests_per_window: 60,
            window: Duration::from_secs(60),
            burst_size: 20,
        }),
        deadline: Duration::from_secs(server_config.request_deadline_secs),
        sessions: parking_lot::Mutex::new(HashMap::new()),
    });

    sentinel_server::server::run(transport, state).await
}
