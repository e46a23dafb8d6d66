//! Aggregation rule parsing and metric-name templating.
//!
//! Rules follow the classic line format
//! `output_template (frequency) = method input_pattern`, e.g.
//!
//! ```text
//! <env>.applications.<app>.all.requests (60) = sum <env>.applications.<app>.*.requests
//! ```
//!
//! `<field>` captures one dotted component, `<<field>>` captures the
//! remainder of the name, and `*` matches within a single component. The
//! output template substitutes captured fields back in.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use snafu::{ResultExt, Snafu};
use tracing::warn;

use super::AggregationMethod;

static RULE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<output>\S+)\s+\((?P<frequency>\d+)\)\s*=\s*(?P<method>\S+)\s+(?P<pattern>\S+)$")
        .expect("rule line regex is valid")
});

#[derive(Debug, Snafu)]
pub enum RuleError {
    #[snafu(display("failed to read rules from {}: {source}", path.display()))]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[snafu(display("malformed rule line {line_no}: '{line}'"))]
    Malformed { line_no: usize, line: String },
    #[snafu(display("rule line {line_no}: {source}"))]
    Method {
        line_no: usize,
        source: super::UnknownMethod,
    },
    #[snafu(display("rule line {line_no} derives an unusable pattern: {source}"))]
    Pattern {
        line_no: usize,
        source: regex::Error,
    },
}

/// One parsed aggregation rule.
#[derive(Debug)]
pub struct AggregationRule {
    output_template: String,
    frequency: u64,
    method: AggregationMethod,
    pattern: Regex,
}

impl AggregationRule {
    pub fn parse(line: &str, line_no: usize) -> Result<Self, RuleError> {
        let caps = RULE_LINE.captures(line.trim()).ok_or_else(|| RuleError::Malformed {
            line_no,
            line: line.to_string(),
        })?;

        let method: AggregationMethod = caps["method"].parse().context(MethodSnafu { line_no })?;
        let frequency: u64 = caps["frequency"]
            .parse()
            .ok()
            .filter(|f| *f > 0)
            .ok_or_else(|| RuleError::Malformed {
                line_no,
                line: line.to_string(),
            })?;
        let pattern = build_pattern(&caps["pattern"]).context(PatternSnafu { line_no })?;

        Ok(AggregationRule {
            output_template: caps["output"].to_string(),
            frequency,
            method,
            pattern,
        })
    }

    /// The aggregate name this rule derives for `metric`, or `None` when the
    /// rule does not match.
    pub fn aggregate_metric(&self, metric: &str) -> Option<String> {
        let caps = self.pattern.captures(metric)?;
        let mut output = self.output_template.clone();
        for name in self.pattern.capture_names().flatten() {
            if let Some(value) = caps.name(name) {
                output = output.replace(&format!("<{name}>"), value.as_str());
            }
        }
        Some(output)
    }

    pub fn frequency(&self) -> u64 {
        self.frequency
    }

    pub fn method(&self) -> AggregationMethod {
        self.method
    }
}

/// Translate a dotted input pattern into an anchored regex.
fn build_pattern(input: &str) -> Result<Regex, regex::Error> {
    let mut parts = Vec::new();
    for part in input.split('.') {
        if let (Some(i), Some(j)) = (part.find("<<"), part.find(">>")) {
            let field = &part[i + 2..j];
            parts.push(format!("{}(?P<{}>.+){}", &part[..i], field, &part[j + 2..]));
        } else if let (Some(i), Some(j)) = (part.find('<'), part.find('>')) {
            let field = &part[i + 1..j];
            parts.push(format!(
                "{}(?P<{}>[^.]+){}",
                &part[..i],
                field,
                &part[j + 1..]
            ));
        } else if part == "*" {
            parts.push("[^.]+".to_string());
        } else {
            parts.push(part.replace('*', "[^.]*"));
        }
    }
    Regex::new(&format!("^{}$", parts.join(r"\.")))
}

/// An ordered rule set; the first matching rule wins.
#[derive(Debug, Default)]
pub struct AggregationRules {
    rules: Vec<AggregationRule>,
}

impl AggregationRules {
    /// Parse a rules file's contents. Blank lines and `#` comments are
    /// skipped.
    pub fn parse(text: &str) -> Result<Self, RuleError> {
        let mut rules = Vec::new();
        for (idx, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            rules.push(AggregationRule::parse(line, idx + 1)?);
        }
        Ok(AggregationRules { rules })
    }

    pub fn load(path: &Path) -> Result<Self, RuleError> {
        let text = std::fs::read_to_string(path).context(IoSnafu { path })?;
        Self::parse(&text)
    }

    /// First rule matching `metric`, with the derived aggregate name. A rule
    /// whose output equals its input would feed itself forever, so it is
    /// skipped.
    pub fn first_match(&self, metric: &str) -> Option<(String, &AggregationRule)> {
        for rule in &self.rules {
            if let Some(output) = rule.aggregate_metric(metric) {
                if output == metric {
                    warn!(
                        message = "Aggregation rule matches its own output, skipping.",
                        %metric,
                    );
                    continue;
                }
                return Some((output, rule));
            }
        }
        None
    }

    /// Every derived aggregate name for `metric`, one per matching rule,
    /// with self-feeding rules skipped. Routing wants all of them where the
    /// aggregation stage itself stops at the first.
    pub fn all_matches(&self, metric: &str) -> Vec<String> {
        self.rules
            .iter()
            .filter_map(|rule| rule.aggregate_metric(metric))
            .filter(|output| output != metric)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_classic_line_format() {
        let rules = AggregationRules::parse(
            "# roll all per-host request counts up\n\
             <env>.applications.<app>.all.requests (60) = sum <env>.applications.<app>.*.requests\n",
        )
        .unwrap();
        assert_eq!(rules.len(), 1);

        let (output, rule) = rules
            .first_match("prod.applications.api.host42.requests")
            .unwrap();
        assert_eq!(output, "prod.applications.api.all.requests");
        assert_eq!(rule.frequency(), 60);
        assert_eq!(rule.method(), AggregationMethod::Sum);
    }

    #[test]
    fn double_bracket_field_captures_the_remainder() {
        let rules = AggregationRules::parse("stats.<rest> (10) = avg collectd.<<rest>>").unwrap();
        let (output, _) = rules.first_match("collectd.host.cpu.idle").unwrap();
        assert_eq!(output, "stats.host.cpu.idle");
    }

    #[test]
    fn patterns_are_anchored() {
        let rules = AggregationRules::parse("agg.<n> (10) = sum foo.<n>").unwrap();
        assert!(rules.first_match("prefix.foo.bar").is_none());
        assert!(rules.first_match("foo.bar.suffix").is_none());
        assert!(rules.first_match("foo.bar").is_some());
    }

    #[test]
    fn first_matching_rule_wins() {
        let rules = AggregationRules::parse(
            "first.<n> (10) = sum metrics.<n>\n\
             second.<n> (20) = max metrics.<n>\n",
        )
        .unwrap();
        let (output, rule) = rules.first_match("metrics.cpu").unwrap();
        assert_eq!(output, "first.cpu");
        assert_eq!(rule.frequency(), 10);
    }

    #[test]
    fn self_feeding_rule_is_skipped() {
        let rules = AggregationRules::parse("foo.<n> (10) = sum foo.<n>").unwrap();
        assert!(rules.first_match("foo.bar").is_none());
    }

    #[test]
    fn malformed_lines_are_rejected() {
        assert!(AggregationRules::parse("not a rule at all").is_err());
        assert!(AggregationRules::parse("out (x) = sum in").is_err());
        assert!(AggregationRules::parse("out (0) = sum in").is_err());
        assert!(AggregationRules::parse("out (10) = p99 in").is_err());
    }
}
