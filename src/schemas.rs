//! Storage, aggregation, and relay schema files.
//!
//! All three share a line-oriented, section-per-rule format:
//!
//! ```text
//! [frequent]
//! pattern = ^servers\.
//! retentions = 10s:6h,1m:7d,10m:5y
//!
//! [default]
//! pattern = .*
//! retentions = 60:1440
//! ```
//!
//! Rules are searched in declared order and the first match wins; a
//! well-formed file ends with a terminal default. Parsed snapshots are
//! immutable and swapped atomically by the reload watcher, so readers see
//! either the old set or the new one, never a torn state.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use indexmap::IndexMap;
use regex::Regex;
use snafu::{OptionExt, ResultExt, Snafu};
use tracing::{error, info};

use crate::aggregator::AggregationMethod;
use crate::routers::{Destination, RelayRule};

#[derive(Debug, Snafu)]
pub enum SchemaError {
    #[snafu(display("failed to read {}: {source}", path.display()))]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[snafu(display("line {line_no}: entry outside of any [section]"))]
    OrphanEntry { line_no: usize },
    #[snafu(display("line {line_no}: expected 'key = value'"))]
    BadEntry { line_no: usize },
    #[snafu(display("section [{section}] is missing required key '{key}'"))]
    MissingKey { section: String, key: String },
    #[snafu(display("section [{section}] has an invalid pattern: {source}"))]
    BadPattern {
        section: String,
        source: regex::Error,
    },
    #[snafu(display("section [{section}]: invalid retention '{def}': {reason}"))]
    BadRetention {
        section: String,
        def: String,
        reason: String,
    },
    #[snafu(display("section [{section}]: {source}"))]
    BadMethod {
        section: String,
        source: crate::aggregator::UnknownMethod,
    },
    #[snafu(display("section [{section}]: invalid value for '{key}'"))]
    BadValue { section: String, key: String },
    #[snafu(display("no rule carries 'default = true'"))]
    NoDefaultRule,
}

/// One on-disk archive: `(resolution seconds, retention points)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Archive {
    pub seconds_per_point: u32,
    pub points: u32,
}

/// A named storage rule: the first pattern to match a new metric decides
/// its archive layout.
#[derive(Clone, Debug)]
pub struct StorageSchema {
    pub name: String,
    pub pattern: Regex,
    pub archives: Vec<Archive>,
}

/// A named aggregation rule for file creation: x-files-factor and the
/// downsampling method.
#[derive(Clone, Debug)]
pub struct AggregationSchema {
    pub name: String,
    pub pattern: Regex,
    pub x_files_factor: f64,
    pub aggregation_method: AggregationMethod,
}

/// Ordered storage rules; first match wins.
#[derive(Clone, Debug, Default)]
pub struct StorageSchemas {
    schemas: Vec<StorageSchema>,
}

impl StorageSchemas {
    pub fn new(schemas: Vec<StorageSchema>) -> Self {
        StorageSchemas { schemas }
    }

    pub fn matching(&self, metric: &str) -> Option<&StorageSchema> {
        self.schemas.iter().find(|s| s.pattern.is_match(metric))
    }

    pub fn parse(text: &str) -> Result<Self, SchemaError> {
        let mut schemas = Vec::new();
        for (name, entries) in parse_sections(text)? {
            let pattern = required(&name, &entries, "pattern")?;
            let pattern = Regex::new(pattern).context(BadPatternSnafu { section: name.as_str() })?;
            let retentions = required(&name, &entries, "retentions")?;
            let archives = retentions
                .split(',')
                .map(|def| parse_retention_def(&name, def.trim()))
                .collect::<Result<Vec<_>, _>>()?;
            schemas.push(StorageSchema {
                name,
                pattern,
                archives,
            });
        }
        Ok(StorageSchemas { schemas })
    }

    pub fn load(path: &Path) -> Result<Self, SchemaError> {
        let text = std::fs::read_to_string(path).context(IoSnafu { path })?;
        Self::parse(&text)
    }
}

/// Ordered aggregation rules; first match wins. An empty set is valid and
/// means whisper defaults apply everywhere.
#[derive(Clone, Debug, Default)]
pub struct AggregationSchemas {
    schemas: Vec<AggregationSchema>,
}

impl AggregationSchemas {
    pub fn new(schemas: Vec<AggregationSchema>) -> Self {
        AggregationSchemas { schemas }
    }

    pub fn matching(&self, metric: &str) -> Option<&AggregationSchema> {
        self.schemas.iter().find(|s| s.pattern.is_match(metric))
    }

    pub fn parse(text: &str) -> Result<Self, SchemaError> {
        let mut schemas = Vec::new();
        for (name, entries) in parse_sections(text)? {
            let pattern = required(&name, &entries, "pattern")?;
            let pattern = Regex::new(pattern).context(BadPatternSnafu { section: name.as_str() })?;
            let x_files_factor: f64 = required(&name, &entries, "xFilesFactor")?
                .parse()
                .ok()
                .filter(|f| (0.0..=1.0).contains(f))
                .context(BadValueSnafu {
                    section: name.as_str(),
                    key: "xFilesFactor",
                })?;
            let aggregation_method: AggregationMethod =
                required(&name, &entries, "aggregationMethod")?
                    .parse()
                    .context(BadMethodSnafu { section: name.as_str() })?;
            schemas.push(AggregationSchema {
                name,
                pattern,
                x_files_factor,
                aggregation_method,
            });
        }
        Ok(AggregationSchemas { schemas })
    }

    pub fn load(path: &Path) -> Result<Self, SchemaError> {
        let text = std::fs::read_to_string(path).context(IoSnafu { path })?;
        Self::parse(&text)
    }
}

/// Parse relay rules (`pattern` or `default = true`, plus `destinations`).
/// Exactly the rule order of the file is preserved; at least one default
/// rule is required.
pub fn parse_relay_rules(text: &str) -> Result<Vec<RelayRule>, SchemaError> {
    let mut rules = Vec::new();
    let mut saw_default = false;
    for (name, entries) in parse_sections(text)? {
        let is_default = entries
            .get("default")
            .map(|v| matches!(v.as_str(), "true" | "1" | "yes"))
            .unwrap_or(false);
        saw_default |= is_default;

        let pattern = match entries.get("pattern") {
            Some(pattern) => {
                Some(Regex::new(pattern).context(BadPatternSnafu { section: name.as_str() })?)
            }
            None if is_default => None,
            None => {
                return Err(SchemaError::MissingKey {
                    section: name,
                    key: "pattern".into(),
                })
            }
        };

        let destinations = required(&name, &entries, "destinations")?
            .split(',')
            .map(|spec| {
                spec.trim()
                    .parse::<Destination>()
                    .map_err(|_| SchemaError::BadValue {
                        section: name.clone(),
                        key: "destinations".into(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        rules.push(RelayRule {
            pattern,
            destinations,
            is_default,
        });
    }

    if !saw_default {
        return Err(SchemaError::NoDefaultRule);
    }
    Ok(rules)
}

pub fn load_relay_rules(path: &Path) -> Result<Vec<RelayRule>, SchemaError> {
    let text = std::fs::read_to_string(path).context(IoSnafu { path })?;
    parse_relay_rules(&text)
}

fn parse_sections(text: &str) -> Result<Vec<(String, IndexMap<String, String>)>, SchemaError> {
    let mut sections: Vec<(String, IndexMap<String, String>)> = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            sections.push((name.trim().to_string(), IndexMap::new()));
            continue;
        }
        let (key, value) = line
            .split_once('=')
            .ok_or(SchemaError::BadEntry { line_no: idx + 1 })?;
        let section = sections
            .last_mut()
            .ok_or(SchemaError::OrphanEntry { line_no: idx + 1 })?;
        section
            .1
            .insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(sections)
}

fn required<'a>(
    section: &str,
    entries: &'a IndexMap<String, String>,
    key: &str,
) -> Result<&'a str, SchemaError> {
    entries
        .get(key)
        .map(String::as_str)
        .context(MissingKeySnafu { section, key })
}

/// Whisper's retention grammar: `resolution:retention` where either side is
/// a bare number (seconds / points) or a number with a `s m h d w y` unit.
/// A unit-suffixed retention is a time span divided by the resolution.
fn parse_retention_def(section: &str, def: &str) -> Result<Archive, SchemaError> {
    let bad = |reason: &str| SchemaError::BadRetention {
        section: section.to_string(),
        def: def.to_string(),
        reason: reason.to_string(),
    };

    let (resolution, retention) = def.split_once(':').ok_or_else(|| bad("expected ':'"))?;

    let seconds_per_point =
        parse_time_spec(resolution.trim()).ok_or_else(|| bad("bad resolution"))?;
    if seconds_per_point == 0 {
        return Err(bad("resolution must be positive"));
    }

    let retention = retention.trim();
    let points = if retention.chars().all(|c| c.is_ascii_digit()) {
        retention.parse::<u32>().map_err(|_| bad("bad point count"))?
    } else {
        let span = parse_time_spec(retention).ok_or_else(|| bad("bad retention"))?;
        span / seconds_per_point
    };
    if points == 0 {
        return Err(bad("retention must be positive"));
    }

    Ok(Archive {
        seconds_per_point,
        points,
    })
}

/// `"10" -> 10`, `"6h" -> 21600`; `None` on anything else.
fn parse_time_spec(spec: &str) -> Option<u32> {
    if spec.is_empty() || !spec.is_ascii() {
        return None;
    }
    if spec.chars().all(|c| c.is_ascii_digit()) {
        return spec.parse().ok();
    }
    let (number, unit) = spec.split_at(spec.len() - 1);
    let number: u32 = number.parse().ok()?;
    let multiplier = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3_600,
        "d" => 86_400,
        "w" => 604_800,
        "y" => 31_536_000,
        _ => return None,
    };
    number.checked_mul(multiplier)
}

/// Paths the reload watcher re-reads. The aggregation file is optional; a
/// missing path yields an empty rule set.
#[derive(Clone, Debug)]
pub struct SchemaFiles {
    pub storage: PathBuf,
    pub aggregation: Option<PathBuf>,
}

/// The live schema snapshots. Readers dereference once per operation; the
/// reload watcher swaps whole snapshots in.
pub struct SchemaStore {
    storage: ArcSwap<StorageSchemas>,
    aggregation: ArcSwap<AggregationSchemas>,
    files: Option<SchemaFiles>,
}

impl SchemaStore {
    /// Build from already-parsed snapshots; `reload` becomes a no-op.
    pub fn fixed(storage: StorageSchemas, aggregation: AggregationSchemas) -> Self {
        SchemaStore {
            storage: ArcSwap::from_pointee(storage),
            aggregation: ArcSwap::from_pointee(aggregation),
            files: None,
        }
    }

    /// Parse from files. Any error here is fatal to startup.
    pub fn from_files(files: SchemaFiles) -> Result<Self, SchemaError> {
        let (storage, aggregation) = Self::read(&files)?;
        Ok(SchemaStore {
            storage: ArcSwap::from_pointee(storage),
            aggregation: ArcSwap::from_pointee(aggregation),
            files: Some(files),
        })
    }

    fn read(files: &SchemaFiles) -> Result<(StorageSchemas, AggregationSchemas), SchemaError> {
        let storage = StorageSchemas::load(&files.storage)?;
        let aggregation = match &files.aggregation {
            Some(path) => AggregationSchemas::load(path)?,
            None => AggregationSchemas::default(),
        };
        Ok((storage, aggregation))
    }

    pub fn storage(&self) -> Arc<StorageSchemas> {
        self.storage.load_full()
    }

    pub fn aggregation(&self) -> Arc<AggregationSchemas> {
        self.aggregation.load_full()
    }

    /// Re-parse the schema files and swap the snapshots in. A failed parse
    /// keeps the previous snapshots in place.
    pub fn reload(&self) {
        let Some(files) = &self.files else {
            return;
        };
        match Self::read(files) {
            Ok((storage, aggregation)) => {
                self.storage.store(Arc::new(storage));
                self.aggregation.store(Arc::new(aggregation));
                info!(message = "Reloaded storage and aggregation schemas.");
            }
            Err(error) => {
                error!(
                    message = "Failed to reload schemas, keeping previous.",
                    %error,
                );
            }
        }
    }
}
