//! Offline prefetch schedule
//!
//! A profiling run produces a line-oriented log. The parser walks it once and
//! builds a [`ProfileSchedule`]: for every logical operation index, the region
//! identifiers and tensor identifiers to prefetch before that operation runs.
//!
//! # Log grammar
//!
//! - `Op - ... op_id: <n> ...` sets the current operation for the lines below it
//! - a line containing `MemAlloc` lists region ids as `<n>:` tokens
//! - a line containing `TenAlloc` lists tensor ids as `<n>:` tokens
//! - anything else is ignored
//!
//! # Example
//!
//! ```
//! use uvm_advisor::schedule::ProfileSchedule;
//!
//! let log = "Op - name: aten::linear op_id: 5\n\
//!            MemAlloc 10:2097152 20:4096\n\
//!            TenAlloc 30:2097152\n";
//!
//! let schedule = ProfileSchedule::parse_str(log)?;
//! let entry = schedule.get(5).unwrap();
//! assert_eq!(entry.region_ids, vec![10, 20]);
//! assert_eq!(entry.tensor_ids, vec![30]);
//! # Ok::<(), uvm_advisor::error::ScheduleError>(())
//! ```

use crate::config::Granularity;
use crate::error::ScheduleError;
use regex::Regex;
use std::collections::HashMap;
use std::io::BufRead;
use std::path::Path;

const OP_MARKER: &str = "Op -";
const OP_ID_FIELD: &str = "op_id:";
const REGION_MARKER: &str = "MemAlloc";
const TENSOR_MARKER: &str = "TenAlloc";
const ID_TOKEN_PATTERN: &str = r"(\d+):";

/// Identifiers to prefetch ahead of one operation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleEntry {
    /// Region ids, in log order
    pub region_ids: Vec<u64>,
    /// Tensor ids, in log order
    pub tensor_ids: Vec<u64>,
}

impl ScheduleEntry {
    /// The list consulted for the given granularity
    pub fn ids(&self, granularity: Granularity) -> &[u64] {
        match granularity {
            Granularity::Object => &self.region_ids,
            Granularity::Tensor => &self.tensor_ids,
        }
    }
}

/// Operation-indexed prefetch schedule, immutable once built
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileSchedule {
    entries: HashMap<u64, ScheduleEntry>,
}

impl ProfileSchedule {
    /// Build a schedule directly from entries
    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (u64, ScheduleEntry)>,
    {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    /// Parse the profile log at `path`
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ScheduleError> {
        let path = path.as_ref();
        let file = std::fs::File::open(path).map_err(|source| ScheduleError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse_reader(std::io::BufReader::new(file)).map_err(|err| match err {
            ScheduleError::Io { source, .. } => ScheduleError::Io {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    /// Parse a profile log held in memory
    pub fn parse_str(log: &str) -> Result<Self, ScheduleError> {
        Self::parse_reader(log.as_bytes())
    }

    /// Parse a profile log from any buffered reader
    ///
    /// Any malformed integer, or an allocation line with no preceding `Op -`
    /// line, fails the whole parse.
    pub fn parse_reader<R: BufRead>(reader: R) -> Result<Self, ScheduleError> {
        let token_re = Regex::new(ID_TOKEN_PATTERN).expect("static id pattern is valid");
        let mut entries: HashMap<u64, ScheduleEntry> = HashMap::new();
        let mut current_op: Option<u64> = None;

        for (idx, line) in reader.lines().enumerate() {
            let line_no = idx + 1;
            let line = line.map_err(|source| ScheduleError::Io {
                path: Default::default(),
                source,
            })?;

            if line.starts_with(OP_MARKER) {
                if let Some(op_id) = parse_op_id(&line, line_no)? {
                    current_op = Some(op_id);
                }
                continue;
            }

            let granularity = if line.contains(REGION_MARKER) {
                Granularity::Object
            } else if line.contains(TENSOR_MARKER) {
                Granularity::Tensor
            } else {
                continue;
            };

            let op_id = current_op.ok_or(ScheduleError::MissingOpContext { line: line_no })?;
            let entry = entries.entry(op_id).or_default();
            let list = match granularity {
                Granularity::Object => &mut entry.region_ids,
                Granularity::Tensor => &mut entry.tensor_ids,
            };

            for caps in token_re.captures_iter(&line) {
                let token = &caps[1];
                let id = token
                    .parse::<u64>()
                    .map_err(|e| ScheduleError::InvalidInteger {
                        line: line_no,
                        token: token.to_string(),
                        reason: e.to_string(),
                    })?;
                list.push(id);
            }
        }

        tracing::debug!(operations = entries.len(), "profile schedule parsed");

        Ok(Self { entries })
    }

    /// Entry for `op_id`, if the profile scheduled anything for it
    pub fn get(&self, op_id: u64) -> Option<&ScheduleEntry> {
        self.entries.get(&op_id)
    }

    /// Identifiers to prefetch for `op_id` at `granularity`; empty when unscheduled
    pub fn ids(&self, op_id: u64, granularity: Granularity) -> &[u64] {
        self.entries
            .get(&op_id)
            .map(|entry| entry.ids(granularity))
            .unwrap_or(&[])
    }

    /// Number of operations with an entry
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Scheduled operation indices in ascending order
    pub fn op_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.entries.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn total_region_ids(&self) -> usize {
        self.entries.values().map(|e| e.region_ids.len()).sum()
    }

    pub fn total_tensor_ids(&self) -> usize {
        self.entries.values().map(|e| e.tensor_ids.len()).sum()
    }
}

/// Extract the `op_id:` value from an `Op -` line
///
/// Returns `Ok(None)` when the line carries no `op_id:` field.
fn parse_op_id(line: &str, line_no: usize) -> Result<Option<u64>, ScheduleError> {
    let Some(pos) = line.find(OP_ID_FIELD) else {
        return Ok(None);
    };
    let rest = line[pos + OP_ID_FIELD.len()..].trim_start();
    let digits: &str = {
        let end = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        &rest[..end]
    };

    let invalid = |reason: String| ScheduleError::InvalidInteger {
        line: line_no,
        token: rest.split_whitespace().next().unwrap_or("").to_string(),
        reason,
    };

    if digits.is_empty() {
        return Err(invalid("expected a non-negative decimal op_id".to_string()));
    }
    digits
        .parse::<u64>()
        .map(Some)
        .map_err(|e| invalid(e.to_string()))
}
