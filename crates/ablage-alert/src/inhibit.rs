//! 告警抑制
//!
//! 当某个 firing 告警匹配 source、另一告警匹配 target，且 `equal` 中的标签取值一致时，
//! target 告警的通知被抑制。抑制关系每轮根据当前 firing 集合重新计算。

use crate::expr::parse_matchers;
use ablage_core::{matches_all, AblageError, LabelMatcher, Labels, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 配置文件中的抑制规则
///
/// ```toml
/// [[inhibit_rules]]
/// source_match = '{severity="critical"}'
/// target_match = '{severity="warning"}'
/// equal = ["service"]
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InhibitRuleDefinition {
    #[serde(default)]
    pub source_match: String,
    #[serde(default)]
    pub target_match: String,
    #[serde(default)]
    pub equal: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct InhibitRule {
    pub source_matchers: Vec<LabelMatcher>,
    pub target_matchers: Vec<LabelMatcher>,
    pub equal: Vec<String>,
}

impl InhibitRule {
    pub fn new(source_matchers: Vec<LabelMatcher>, target_matchers: Vec<LabelMatcher>, equal: Vec<String>) -> Self {
        Self {
            source_matchers,
            target_matchers,
            equal,
        }
    }

    pub fn compile(definition: &InhibitRuleDefinition) -> Result<Self> {
        let parse = |what: &str, input: &str| {
            parse_matchers(input).map_err(|e| AblageError::Config(format!("inhibit rule {}: {}", what, e)))
        };
        Ok(Self::new(
            parse("source_match", &definition.source_match)?,
            parse("target_match", &definition.target_match)?,
            definition.equal.clone(),
        ))
    }

    /// `source` 是否抑制 `target`，缺失的标签按空字符串比较
    pub fn inhibits(&self, source: &Labels, target: &Labels) -> bool {
        matches_all(&self.source_matchers, source)
            && matches_all(&self.target_matchers, target)
            && self.equal.iter().all(|name| source.value(name) == target.value(name))
    }
}

/// 一条抑制记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Suppression {
    /// 生效的抑制规则在配置中的下标
    pub rule_index: usize,
    /// 抑制源告警的指纹
    pub source: String,
}

#[derive(Debug, Clone, Default)]
pub struct Inhibitor {
    rules: Vec<InhibitRule>,
}

impl Inhibitor {
    pub fn new(rules: Vec<InhibitRule>) -> Self {
        Self { rules }
    }

    pub fn compile(definitions: &[InhibitRuleDefinition]) -> Result<Self> {
        definitions
            .iter()
            .map(InhibitRule::compile)
            .collect::<Result<Vec<_>>>()
            .map(Self::new)
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// 判断单个告警是否被抑制
    ///
    /// 多条规则同时生效时，返回配置中靠前的那一条。告警不会抑制自身。
    pub fn check(&self, firing: &[Labels], target: &Labels) -> Option<Suppression> {
        let target_fp = target.fingerprint();
        self.rules.iter().enumerate().find_map(|(rule_index, rule)| {
            firing
                .iter()
                .filter(|source| source.fingerprint() != target_fp)
                .find(|source| rule.inhibits(source, target))
                .map(|source| Suppression {
                    rule_index,
                    source: source.fingerprint(),
                })
        })
    }

    /// 计算 `alerts` 中被抑制的告警，按指纹索引
    pub fn compute<'a>(
        &self,
        firing: &[Labels],
        alerts: impl IntoIterator<Item = &'a Labels>,
    ) -> BTreeMap<String, Suppression> {
        if self.rules.is_empty() {
            return BTreeMap::new();
        }
        alerts
            .into_iter()
            .filter_map(|labels| self.check(firing, labels).map(|s| (labels.fingerprint(), s)))
            .collect()
    }
}
