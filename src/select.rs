//!
//! Which arrays to read, and when.
//!
//! [`ArraySelection`] holds per-array enable flags discovered from a file's
//! schema. [`TimeStepTracker`] decides whether an array's stored values must
//! be (re)read when stepping through a time series, keyed on the `TimeStep`
//! attribute and, for appended arrays, the payload offset.
//!

use std::collections::BTreeMap;
use std::fmt;

/// Per-array enable flags, keyed by array name.
///
/// Arrays never mentioned are enabled; disabling is an explicit act.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct ArraySelection {
    flags: BTreeMap<String, bool>,
}

impl ArraySelection {
    pub fn new() -> Self {
        Default::default()
    }

    /// Record an array name found in a file's schema without changing its
    /// enabled state.
    pub fn discover(&mut self, name: &str) {
        self.flags.entry(name.to_string()).or_insert(true);
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.flags.get(name).copied().unwrap_or(true)
    }

    pub fn set_enabled(&mut self, name: &str, enabled: bool) {
        self.flags.insert(name.to_string(), enabled);
    }

    /// Names discovered so far, in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.flags.keys().map(|s| s.as_str())
    }

    /// Merge another selection's names, keeping existing flags.
    pub fn union(&mut self, other: &ArraySelection) {
        for (name, &enabled) in &other.flags {
            self.flags.entry(name.clone()).or_insert(enabled);
        }
    }

    /// Copy all flags from `other`, overriding existing ones.
    ///
    /// Used to push a summary reader's selections down into piece readers.
    pub fn copy_from(&mut self, other: &ArraySelection) {
        for (name, &enabled) in &other.flags {
            self.flags.insert(name.clone(), enabled);
        }
    }
}

impl fmt::Display for ArraySelection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (name, enabled) in &self.flags {
            writeln!(f, "{} {}", if *enabled { "+" } else { "-" }, name)?;
        }
        Ok(())
    }
}

/// Read/skip state of one array across time steps.
#[derive(Clone, Debug, PartialEq)]
struct TimeStepRecord {
    /// Last time step whose inline values were stored, -1 initially.
    last_time_step: i64,
    /// Last appended payload offset stored, -1 initially.
    last_offset: i64,
}

impl Default for TimeStepRecord {
    fn default() -> Self {
        TimeStepRecord {
            last_time_step: -1,
            last_offset: -1,
        }
    }
}

/// Decides per array whether stored values are stale for the requested time
/// step.
///
/// Appended arrays are tracked by payload offset (equal offsets mean shared,
/// still-valid data); inline arrays by the time step they were last read at.
/// One array must not mix both schemes within a series. Records are kept per
/// `(array, piece)` pair since each piece decodes its own tuple range.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct TimeStepTracker {
    records: BTreeMap<(String, usize), TimeStepRecord>,
}

impl TimeStepTracker {
    pub fn new() -> Self {
        Default::default()
    }

    /// Forget all per-array state, e.g. when the piece set changes.
    pub fn reset(&mut self) {
        self.records.clear();
    }

    /// Whether the array's values must be read for `current_time_step`,
    /// updating the record when the answer is yes.
    ///
    /// `piece` identifies the piece being decoded, `array_steps` is the
    /// array's `TimeStep` attribute (empty if absent), `num_time_steps` the
    /// file's declared step count and `offset` the appended payload offset if
    /// the array is appended.
    ///
    /// Returns `Err` with the declared step count if the attribute lists more
    /// steps than the file declares.
    pub fn needs_read(
        &mut self,
        name: &str,
        piece: usize,
        array_steps: &[i32],
        num_time_steps: usize,
        current_time_step: i32,
        offset: Option<i64>,
    ) -> Result<bool, TimeStepError> {
        if array_steps.len() > num_time_steps {
            return Err(TimeStepError {
                name: name.to_string(),
                declared: num_time_steps,
                listed: array_steps.len(),
            });
        }
        let record = self.records.entry((name.to_string(), piece)).or_default();

        if array_steps.is_empty() && num_time_steps == 0 {
            // Not a time series: read exactly once.
            debug_assert_eq!(record.last_time_step, -1);
            record.last_time_step = current_time_step as i64;
            return Ok(true);
        }

        if !array_steps.is_empty() && !array_steps.contains(&current_time_step) {
            // The array does not participate in this step.
            return Ok(false);
        }

        if let Some(offset) = offset {
            // Appended data: reread only when the payload moved.
            debug_assert_eq!(record.last_time_step, -1);
            if record.last_offset == offset {
                return Ok(false);
            }
            record.last_offset = offset;
            return Ok(true);
        }

        if array_steps.is_empty() {
            // File has steps but this array is step-agnostic: one read.
            if record.last_time_step == -1 {
                record.last_time_step = current_time_step as i64;
                return Ok(true);
            }
            return Ok(false);
        }

        // Inline data listed for specific steps: reread unless the stored
        // values already belong to a step in the list.
        if record.last_time_step >= 0 && array_steps.contains(&(record.last_time_step as i32)) {
            return Ok(false);
        }
        record.last_time_step = current_time_step as i64;
        Ok(true)
    }
}

/// An array's `TimeStep` attribute lists more steps than the file declares.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeStepError {
    pub name: String,
    pub declared: usize,
    pub listed: usize,
}

impl fmt::Display for TimeStepError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Array {:?} lists {} time steps but the file declares {}",
            self.name, self.listed, self.declared
        )
    }
}

impl std::error::Error for TimeStepError {}
