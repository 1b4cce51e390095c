//! 注解模板
//!
//! 支持的占位符：
//! - `{{ $value }}`
//! - `{{ $labels.name }}`
//! - `{{ $value | humanize }}` / `{{ $value | humanizePercentage }}`
//! - `{{ printf "%.2f" $value }}`

use ablage_core::{AblageError, Labels, Result};

#[derive(Debug, Clone, PartialEq)]
enum ValueFormat {
    Plain,
    Humanize,
    Percentage,
    Fixed(usize),
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Value(ValueFormat),
    Label(String),
}

/// 预编译的注解模板
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(source: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut rest = source;

        while let Some(start) = rest.find("{{") {
            if start > 0 {
                segments.push(Segment::Literal(rest[..start].to_string()));
            }
            let after = &rest[start + 2..];
            let end = after
                .find("}}")
                .ok_or_else(|| AblageError::Template(format!("unclosed '{{{{' in {:?}", source)))?;
            segments.push(parse_action(after[..end].trim(), source)?);
            rest = &after[end + 2..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn render(&self, labels: &Labels, value: f64) -> String {
        let mut out = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Label(name) => out.push_str(labels.value(name)),
                Segment::Value(format) => out.push_str(&format_value(value, format)),
            }
        }
        out
    }
}

fn parse_action(action: &str, source: &str) -> Result<Segment> {
    let unsupported = || AblageError::Template(format!("unsupported action {{{{ {} }}}} in {:?}", action, source));

    if let Some(name) = action.strip_prefix("$labels.") {
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(unsupported());
        }
        return Ok(Segment::Label(name.to_string()));
    }

    if let Some(rest) = action.strip_prefix("printf") {
        let rest = rest.trim();
        let (format, arg) = rest
            .strip_prefix('"')
            .and_then(|r| r.split_once('"'))
            .ok_or_else(unsupported)?;
        if arg.trim() != "$value" {
            return Err(unsupported());
        }
        let precision = format
            .strip_prefix("%.")
            .and_then(|f| f.strip_suffix('f'))
            .and_then(|p| p.parse::<usize>().ok())
            .ok_or_else(unsupported)?;
        return Ok(Segment::Value(ValueFormat::Fixed(precision)));
    }

    let mut parts = action.split('|').map(str::trim);
    if parts.next() != Some("$value") {
        return Err(unsupported());
    }
    let format = match parts.next() {
        None => ValueFormat::Plain,
        Some("humanize") => ValueFormat::Humanize,
        Some("humanizePercentage") => ValueFormat::Percentage,
        Some(_) => return Err(unsupported()),
    };
    if parts.next().is_some() {
        return Err(unsupported());
    }
    Ok(Segment::Value(format))
}

fn format_value(value: f64, format: &ValueFormat) -> String {
    match format {
        ValueFormat::Plain => value.to_string(),
        ValueFormat::Fixed(precision) => format!("{:.*}", precision, value),
        ValueFormat::Percentage => format!("{}%", trim_decimal(&format!("{:.4}", value * 100.0))),
        ValueFormat::Humanize => humanize(value),
    }
}

/// 以 SI 前缀缩写数值，如 `1234567` → `1.2346M`
fn humanize(value: f64) -> String {
    if !value.is_finite() || value == 0.0 {
        return value.to_string();
    }

    const PREFIXES: [(f64, &str); 6] = [
        (1e15, "P"),
        (1e12, "T"),
        (1e9, "G"),
        (1e6, "M"),
        (1e3, "k"),
        (1.0, ""),
    ];

    let abs = value.abs();
    let (scale, prefix) = PREFIXES
        .iter()
        .copied()
        .find(|(scale, _)| abs >= *scale)
        .unwrap_or((1.0, ""));

    format!("{}{}", trim_decimal(&format!("{:.4}", value / scale)), prefix)
}

fn trim_decimal(text: &str) -> &str {
    if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.')
    } else {
        text
    }
}
