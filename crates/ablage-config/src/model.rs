use ablage_alert::{
    EngineOptions, InhibitRuleDefinition, Inhibitor, RouteConfig, RuleGroup, RuleGroupDefinition,
};
use ablage_core::{MetricKind, OutOfOrderPolicy, OverflowPolicy};
use ablage_notify::{RetryPolicy, WebhookConfig};
use ablage_tsdb::StoreOptions;
use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

/// 顶层配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AblageConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub evaluation: EvaluationConfig,
    #[serde(default)]
    pub route: RouteConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
    /// 内联规则组
    #[serde(default)]
    pub rule_groups: Vec<RuleGroupDefinition>,
    /// 额外的规则文件，相对路径以主配置文件所在目录为基准
    #[serde(default)]
    pub rule_files: Vec<PathBuf>,
    #[serde(default)]
    pub inhibit_rules: Vec<InhibitRuleDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_retention", with = "humantime_serde")]
    pub retention: Duration,
    #[serde(default = "default_ingestion_lag", with = "humantime_serde")]
    pub ingestion_lag: Duration,
    #[serde(default = "default_lookback", with = "humantime_serde")]
    pub lookback: Duration,
    /// 清理过期序列、刷新存储统计的间隔
    #[serde(default = "default_housekeeping_interval", with = "humantime_serde")]
    pub housekeeping_interval: Duration,
    /// 按指标类型覆盖乱序策略，如 `gauge = "reject"`
    #[serde(default)]
    pub out_of_order: HashMap<MetricKind, OutOfOrderPolicy>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            retention: default_retention(),
            ingestion_lag: default_ingestion_lag(),
            lookback: default_lookback(),
            housekeeping_interval: default_housekeeping_interval(),
            out_of_order: HashMap::new(),
        }
    }
}

impl StorageConfig {
    pub fn store_options(&self) -> Result<StoreOptions> {
        let convert = |value: Duration, what: &str| {
            chrono::Duration::from_std(value).with_context(|| format!("storage.{} out of range", what))
        };
        Ok(StoreOptions {
            retention: convert(self.retention, "retention")?,
            ingestion_lag: convert(self.ingestion_lag, "ingestion_lag")?,
            lookback: convert(self.lookback, "lookback")?,
            policy_overrides: self.out_of_order.clone(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationConfig {
    /// resolved 实例的默认保留时长，规则可单独覆盖
    #[serde(default = "default_resolved_retention", with = "humantime_serde")]
    pub resolved_retention: Duration,
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            resolved_retention: default_resolved_retention(),
            flush_interval: default_flush_interval(),
        }
    }
}

/// 一个具名 webhook 渠道
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookChannel {
    pub name: String,
    #[serde(flatten)]
    pub config: WebhookConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default)]
    pub overflow_policy: OverflowPolicy,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default = "default_dedup_ttl", with = "humantime_serde")]
    pub dedup_ttl: Duration,
    /// 是否启用日志渠道
    #[serde(default = "default_true")]
    pub log_channel: bool,
    #[serde(default)]
    pub webhooks: Vec<WebhookChannel>,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            overflow_policy: OverflowPolicy::default(),
            retry: RetryPolicy::default(),
            dedup_ttl: default_dedup_ttl(),
            log_channel: true,
            webhooks: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    #[serde(default = "default_drain_timeout", with = "humantime_serde")]
    pub drain_timeout: Duration,
    #[serde(default = "default_cleanup_timeout", with = "humantime_serde")]
    pub cleanup_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout: default_drain_timeout(),
            cleanup_timeout: default_cleanup_timeout(),
        }
    }
}

impl AblageConfig {
    /// 检查配置的一致性，并确认所有规则与抑制规则都能编译
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            bail!("server.port must be greater than 0");
        }
        if self.storage.retention.is_zero() {
            bail!("storage.retention must be greater than 0");
        }
        if self.storage.lookback.is_zero() {
            bail!("storage.lookback must be greater than 0");
        }
        if self.storage.ingestion_lag >= self.storage.retention {
            bail!(
                "storage.ingestion_lag ({:?}) must be shorter than storage.retention ({:?})",
                self.storage.ingestion_lag,
                self.storage.retention
            );
        }
        if self.storage.housekeeping_interval.is_zero() {
            bail!("storage.housekeeping_interval must be greater than 0");
        }
        if self.evaluation.flush_interval.is_zero() {
            bail!("evaluation.flush_interval must be greater than 0");
        }
        if self.notify.queue_capacity == 0 {
            bail!("notify.queue_capacity must be greater than 0");
        }
        if self.notify.retry.max_attempts == 0 {
            bail!("notify.retry.max_attempts must be at least 1");
        }
        if self.notify.retry.initial_backoff > self.notify.retry.max_backoff {
            bail!("notify.retry.initial_backoff cannot exceed notify.retry.max_backoff");
        }

        let mut channels = HashSet::new();
        for webhook in &self.notify.webhooks {
            if webhook.config.url.trim().is_empty() {
                bail!("webhook {} has an empty url", webhook.name);
            }
            if !channels.insert(webhook.name.as_str()) {
                bail!("duplicate webhook name: {}", webhook.name);
            }
        }

        let mut groups = HashSet::new();
        for group in &self.rule_groups {
            if !groups.insert(group.name.as_str()) {
                bail!("duplicate rule group: {}", group.name);
            }
        }

        self.compile_rule_groups()?;
        self.compile_inhibitor()?;
        Ok(())
    }

    pub fn compile_rule_groups(&self) -> Result<Vec<RuleGroup>> {
        self.rule_groups
            .iter()
            .map(|definition| {
                RuleGroup::compile(definition).map_err(|e| anyhow!("rule group {}: {}", definition.name, e))
            })
            .collect()
    }

    pub fn compile_inhibitor(&self) -> Result<Inhibitor> {
        Inhibitor::compile(&self.inhibit_rules).map_err(|e| anyhow!(e))
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            resolved_retention: self.evaluation.resolved_retention,
            route: self.route.clone(),
            flush_interval: self.evaluation.flush_interval,
        }
    }

    pub fn rule_count(&self) -> usize {
        self.rule_groups.iter().map(|g| g.rules.len()).sum()
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9464
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_retention() -> Duration {
    Duration::from_secs(6 * 3600)
}

fn default_ingestion_lag() -> Duration {
    Duration::from_secs(5)
}

fn default_lookback() -> Duration {
    Duration::from_secs(300)
}

fn default_housekeeping_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_resolved_retention() -> Duration {
    Duration::from_secs(15 * 60)
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_dedup_ttl() -> Duration {
    Duration::from_secs(24 * 3600)
}

fn default_true() -> bool {
    true
}

fn default_drain_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_cleanup_timeout() -> Duration {
    Duration::from_secs(60)
}
