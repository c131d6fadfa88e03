//! Per-day sub-jobs of sub-daily variables and their merge into one
//! daily artifact per month.

use crate::error::{ProcessorError, Result};
use crate::models::WorkUnit;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Outcome of one per-day sub-job
#[derive(Debug, Clone)]
pub struct DayPartial {
    pub day: u32,
    /// Artifact of the day, or the reason the day failed
    pub result: std::result::Result<PathBuf, String>,
}

/// Collects per-day partials and releases them only when the month is whole
#[derive(Debug)]
pub struct AggregationScheduler {
    key: String,
    expected_days: u32,
    partials: Vec<DayPartial>,
}

impl AggregationScheduler {
    pub fn for_unit(unit: &WorkUnit) -> Self {
        Self {
            key: unit.checkpoint_key().to_string(),
            expected_days: unit.days_in_month(),
            partials: Vec::with_capacity(unit.days_in_month() as usize),
        }
    }

    pub fn expected_days(&self) -> u32 {
        self.expected_days
    }

    pub fn record(&mut self, partial: DayPartial) {
        self.partials.push(partial);
    }

    pub fn record_success(&mut self, day: u32, artifact: PathBuf) {
        self.record(DayPartial {
            day,
            result: Ok(artifact),
        });
    }

    pub fn record_failure(&mut self, day: u32, reason: impl Into<String>) {
        self.record(DayPartial {
            day,
            result: Err(reason.into()),
        });
    }

    /// Day artifacts in calendar order, or the missing and failed days
    pub fn into_ordered_inputs(self) -> Result<Vec<PathBuf>> {
        let mut by_day: BTreeMap<u32, std::result::Result<PathBuf, String>> = BTreeMap::new();
        for partial in self.partials {
            if partial.day == 0 || partial.day > self.expected_days {
                return Err(ProcessorError::stage(
                    "aggregate",
                    format!("{}: day {} outside 1-{}", self.key, partial.day, self.expected_days),
                ));
            }
            if by_day.insert(partial.day, partial.result).is_some() {
                return Err(ProcessorError::stage(
                    "aggregate",
                    format!("{}: day {} reported twice", self.key, partial.day),
                ));
            }
        }

        let received = by_day.values().filter(|r| r.is_ok()).count();
        let missing: Vec<u32> = (1..=self.expected_days)
            .filter(|day| !by_day.contains_key(day))
            .collect();
        let failed: Vec<u32> = by_day
            .iter()
            .filter(|(_, result)| result.is_err())
            .map(|(day, _)| *day)
            .collect();

        if !missing.is_empty() || !failed.is_empty() {
            return Err(ProcessorError::IncompleteAggregation {
                key: self.key,
                expected: self.expected_days,
                received,
                missing,
                failed,
            });
        }

        Ok(by_day.into_values().filter_map(|r| r.ok()).collect())
    }
}
