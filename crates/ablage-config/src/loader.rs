use crate::model::AblageConfig;
use ablage_alert::RuleGroupDefinition;
use anyhow::{anyhow, Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// 环境变量前缀，如 `ABLAGE__SERVER__PORT=9000`
const ENV_PREFIX: &str = "ABLAGE";

/// 规则文件格式
#[derive(Debug, Deserialize)]
struct RuleFile {
    #[serde(default)]
    groups: Vec<RuleGroupDefinition>,
}

/// 配置加载器
pub struct ConfigLoader {
    path: PathBuf,
    use_env: bool,
}

impl ConfigLoader {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            use_env: true,
        }
    }

    /// 不读取环境变量覆盖
    pub fn without_env(mut self) -> Self {
        self.use_env = false;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 加载主配置、合并规则文件并校验
    pub fn load(&self) -> Result<AblageConfig> {
        let mut config = self.load_raw()?;

        let base = self.path.parent().map(Path::to_path_buf).unwrap_or_default();
        for file in config.rule_files.clone() {
            let path = if file.is_absolute() { file } else { base.join(file) };
            let groups = load_rule_file(&path)?;
            debug!(path = %path.display(), groups = groups.len(), "Loaded rule file");
            config.rule_groups.extend(groups);
        }

        config
            .validate()
            .with_context(|| format!("invalid configuration in {}", self.path.display()))?;

        info!(
            path = %self.path.display(),
            groups = config.rule_groups.len(),
            rules = config.rule_count(),
            "Configuration loaded"
        );
        Ok(config)
    }

    /// 只解析主配置文件（含环境变量覆盖），不合并规则文件也不校验
    pub fn load_raw(&self) -> Result<AblageConfig> {
        let path = self
            .path
            .to_str()
            .ok_or_else(|| anyhow!("Invalid config path: {}", self.path.display()))?;

        let mut builder = Config::builder().add_source(File::new(path, FileFormat::Toml));
        if self.use_env {
            builder = builder.add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            );
        }

        let config = builder
            .build()
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        config
            .try_deserialize()
            .with_context(|| format!("failed to parse {}", self.path.display()))
    }
}

fn load_rule_file(path: &Path) -> Result<Vec<RuleGroupDefinition>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read rule file {}", path.display()))?;
    let file: RuleFile = toml::from_str(&content)
        .with_context(|| format!("failed to parse rule file {}", path.display()))?;
    Ok(file.groups)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LogFormat;
    use ablage_core::{NoDataState, OverflowPolicy};
    use std::fs;
    use std::time::Duration;
    use tempfile::tempdir;

    const MAIN: &str = r#"
rule_files = ["rules/slo.toml"]

[server]
port = 9500

[logging]
level = "debug"
format = "json"

[storage]
retention = "2h"
ingestion_lag = "10s"

[storage.out_of_order]
gauge = "reject"

[route]
group_by = ["service"]
group_wait = "10s"

[notify]
queue_capacity = 16
overflow_policy = "reject"
dedup_ttl = "1h"

[notify.retry]
max_attempts = 5
initial_backoff = "1s"

[[notify.webhooks]]
name = "ops"
url = "http://localhost:9000/hook"
timeout = "3s"

[[rule_groups]]
name = "api"
interval = "15s"

[[rule_groups.rules]]
alert = "HighErrorRate"
expr = "sum by (service) (rate(errors_total[5m])) / sum by (service) (rate(requests_total[5m])) > 0.05"
for = "5m"
severity = "critical"
no_data_state = "keep_state"
annotations = { summary = "{{ $labels.service }} error ratio {{ $value | humanizePercentage }}" }

[[inhibit_rules]]
source_match = '{severity="critical"}'
target_match = '{severity="warning"}'
equal = ["service"]
"#;

    const RULES: &str = r#"
[[groups]]
name = "slo"
interval = "1m"

[[groups.rules]]
alert = "ErrorBudgetBurn"
expr = "burn_rate(error_ratio, 0.999) > 14.4"
for = "2m"
resolved_retention = "30m"
"#;

    fn write_config(main: &str) -> tempfile::TempDir {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("rules")).unwrap();
        fs::write(dir.path().join("ablage.toml"), main).unwrap();
        fs::write(dir.path().join("rules/slo.toml"), RULES).unwrap();
        dir
    }

    #[test]
    fn test_load_full_config() {
        let dir = write_config(MAIN);
        let config = ConfigLoader::new(dir.path().join("ablage.toml"))
            .without_env()
            .load()
            .unwrap();

        assert_eq!(config.server.port, 9500);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.storage.retention, Duration::from_secs(7200));
        assert_eq!(config.route.group_wait, Duration::from_secs(10));
        assert_eq!(config.route.group_interval, Duration::from_secs(300));
        assert_eq!(config.notify.overflow_policy, OverflowPolicy::Reject);
        assert_eq!(config.notify.retry.max_attempts, 5);
        assert_eq!(config.notify.webhooks[0].config.timeout, Duration::from_secs(3));
        assert_eq!(config.inhibit_rules.len(), 1);

        assert_eq!(config.rule_groups.len(), 2);
        assert_eq!(config.rule_groups[0].rules[0].no_data_state, NoDataState::KeepState);
        assert_eq!(config.rule_groups[1].name, "slo");
        assert_eq!(
            config.rule_groups[1].rules[0].resolved_retention,
            Some(Duration::from_secs(1800))
        );

        let groups = config.compile_rule_groups().unwrap();
        assert_eq!(groups[0].interval, Duration::from_secs(15));
    }

    #[test]
    fn test_missing_rule_file_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ablage.toml");
        fs::write(&path, "rule_files = [\"missing.toml\"]\n").unwrap();

        let err = ConfigLoader::new(&path).without_env().load().unwrap_err();
        assert!(format!("{:#}", err).contains("missing.toml"));
    }

    #[test]
    fn test_invalid_expression_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ablage.toml");
        fs::write(
            &path,
            r#"
[[rule_groups]]
name = "broken"

[[rule_groups.rules]]
alert = "Bad"
expr = "up =="
"#,
        )
        .unwrap();

        let err = ConfigLoader::new(&path).without_env().load().unwrap_err();
        assert!(format!("{:#}", err).contains("rule group broken"));
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ablage.toml");
        fs::write(&path, "").unwrap();

        let config = ConfigLoader::new(&path).without_env().load().unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert!(config.notify.log_channel);
        assert!(config.rule_groups.is_empty());
    }
}
