//! Trial records and the search history.
use std::collections::BTreeSet;
use std::fmt;
use std::io::Write;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::space::Assignment;
use crate::TrialId;

/// Final state of a trial.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialStatus {
    /// Ran to its stopping condition.
    Completed,
    /// Stopped early by the pruner.
    Pruned,
    /// The recommender errored or panicked.
    Failed,
}

impl fmt::Display for TrialStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            TrialStatus::Completed => "completed",
            TrialStatus::Pruned => "pruned",
            TrialStatus::Failed => "failed",
        })
    }
}

/// Everything recorded about one trial.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    /// Trial identifier, in suggestion order.
    pub trial_id: TrialId,
    /// Hyperparameters the trial ran with, fixed ones included.
    pub params: Assignment,
    /// Seed the recommender was built with.
    pub seed: u64,
    /// Final state.
    pub status: TrialStatus,
    /// Best target value for completed trials, last reported value for
    /// pruned ones, `None` when nothing was measured.
    pub value: Option<f64>,
    /// `(step, value)` pairs reported to the pruner.
    pub intermediate_values: Vec<(usize, f64)>,
    /// Step that produced `value`.
    pub best_step: Option<usize>,
    /// Number of training steps run.
    pub n_steps: usize,
    /// Wall-clock duration.
    pub elapsed: Duration,
    /// Failure message of failed trials.
    pub error: Option<String>,
}

impl TrialRecord {
    /// Whether the trial completed with a value.
    pub fn is_completed(&self) -> bool {
        self.status == TrialStatus::Completed && self.value.is_some()
    }
}

/// The completed record with the highest value, lowest id on ties.
pub(crate) fn best_of<'a, I>(records: I) -> Option<&'a TrialRecord>
where
    I: IntoIterator<Item = &'a TrialRecord>,
{
    records
        .into_iter()
        .filter(|record| record.is_completed())
        .fold(None, |best: Option<&TrialRecord>, record| match best {
            Some(current) if !beats(record, current) => Some(current),
            _ => Some(record),
        })
}

fn beats(challenger: &TrialRecord, current: &TrialRecord) -> bool {
    let challenger_value = challenger.value.unwrap_or(f64::NEG_INFINITY);
    let current_value = current.value.unwrap_or(f64::NEG_INFINITY);

    challenger_value > current_value
        || (challenger_value == current_value && challenger.trial_id < current.trial_id)
}

/// Trial records ordered by trial id.
///
/// Records are only ever added; an existing record is never replaced.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SearchHistory {
    records: Vec<TrialRecord>,
}

impl SearchHistory {
    /// An empty history.
    pub fn new() -> Self {
        SearchHistory::default()
    }

    /// Add a record at its id position.
    pub fn push(&mut self, record: TrialRecord) {
        let position = self
            .records
            .partition_point(|existing| existing.trial_id < record.trial_id);
        self.records.insert(position, record);
    }

    /// Records in id order.
    pub fn records(&self) -> &[TrialRecord] {
        &self.records
    }

    /// Iterate in id order.
    pub fn iter(&self) -> impl Iterator<Item = &TrialRecord> {
        self.records.iter()
    }

    /// Record of `trial_id`.
    pub fn get(&self, trial_id: TrialId) -> Option<&TrialRecord> {
        self.records
            .binary_search_by_key(&trial_id, |record| record.trial_id)
            .ok()
            .map(|idx| &self.records[idx])
    }

    /// Number of trials.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no trial has finished.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of trials with `status`.
    pub fn count(&self, status: TrialStatus) -> usize {
        self.records
            .iter()
            .filter(|record| record.status == status)
            .count()
    }

    /// Best completed trial.
    pub fn best(&self) -> Option<&TrialRecord> {
        best_of(&self.records)
    }

    /// Write the history as a CSV table with one column per hyperparameter.
    pub fn write_csv<W: Write>(&self, writer: W) -> Result<(), csv::Error> {
        let param_names: BTreeSet<&str> = self
            .records
            .iter()
            .flat_map(|record| record.params.keys().map(String::as_str))
            .collect();

        let mut writer = csv::Writer::from_writer(writer);

        let mut header = vec![
            "trial_id",
            "status",
            "value",
            "best_step",
            "n_steps",
            "elapsed_secs",
        ];
        header.extend(param_names.iter().cloned());
        writer.write_record(&header)?;

        for record in &self.records {
            let mut row = vec![
                record.trial_id.to_string(),
                record.status.to_string(),
                record
                    .value
                    .map(|value| value.to_string())
                    .unwrap_or_default(),
                record
                    .best_step
                    .map(|step| step.to_string())
                    .unwrap_or_default(),
                record.n_steps.to_string(),
                record.elapsed.as_secs_f64().to_string(),
            ];
            row.extend(param_names.iter().map(|name| {
                record
                    .params
                    .get(*name)
                    .map(|value| value.to_string())
                    .unwrap_or_default()
            }));
            writer.write_record(&row)?;
        }

        writer.flush()?;

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::optimization::space::ParamValue;

    pub(crate) fn record(trial_id: TrialId, status: TrialStatus, value: Option<f64>) -> TrialRecord {
        let mut params = Assignment::new();
        params.insert("x".to_owned(), ParamValue::Float(trial_id as f64 / 10.0));

        TrialRecord {
            trial_id,
            params,
            seed: trial_id as u64,
            status,
            value,
            intermediate_values: Vec::new(),
            best_step: value.map(|_| 1),
            n_steps: 1,
            elapsed: Duration::from_millis(5),
            error: None,
        }
    }

    #[test]
    fn history_is_ordered_by_id() {
        let mut history = SearchHistory::new();
        history.push(record(2, TrialStatus::Completed, Some(0.1)));
        history.push(record(0, TrialStatus::Pruned, Some(0.3)));
        history.push(record(1, TrialStatus::Failed, None));

        let ids: Vec<TrialId> = history.iter().map(|record| record.trial_id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(history.get(1).unwrap().status, TrialStatus::Failed);
        assert_eq!(history.count(TrialStatus::Pruned), 1);
    }

    #[test]
    fn best_ignores_pruned_and_breaks_ties_by_id() {
        let mut history = SearchHistory::new();
        history.push(record(3, TrialStatus::Completed, Some(0.5)));
        history.push(record(0, TrialStatus::Pruned, Some(0.9)));
        history.push(record(1, TrialStatus::Completed, Some(0.5)));
        history.push(record(2, TrialStatus::Failed, None));

        assert_eq!(history.best().unwrap().trial_id, 1);

        let mut none = SearchHistory::new();
        none.push(record(0, TrialStatus::Failed, None));
        assert!(none.best().is_none());
    }

    #[test]
    fn csv_export() {
        let mut history = SearchHistory::new();
        history.push(record(0, TrialStatus::Completed, Some(0.25)));
        history.push(record(1, TrialStatus::Failed, None));

        let mut buffer = Vec::new();
        history.write_csv(&mut buffer).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines[0], "trial_id,status,value,best_step,n_steps,elapsed_secs,x");
        assert_eq!(lines[1], "0,completed,0.25,1,1,0.005,0");
        assert_eq!(lines[2], "1,failed,,,1,0.005,0.1");
    }

    #[test]
    fn json_export() {
        let mut history = SearchHistory::new();
        history.push(record(0, TrialStatus::Completed, Some(0.25)));
        let json = serde_json::to_value(&history).unwrap();

        assert_eq!(json[0]["status"], "completed");
        assert_eq!(json[0]["params"]["x"], 0.0);
    }
}
