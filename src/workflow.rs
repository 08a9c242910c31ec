use log::{info, warn};

use crate::error::Result;
use crate::experiment::Experiment;
use crate::operations::Operation;

// ---------------------------------------------------------------------------
// Workflow state
// ---------------------------------------------------------------------------

/// One step of a workflow: an operation and its cached result.
pub struct WorkflowItem {
    pub operation: Box<dyn Operation>,

    /// Result of the last successful run (None until run, or after a
    /// failure upstream).
    pub result: Option<Experiment>,
}

/// A linear chain of operations over an imported experiment, independent of
/// any UI. Each stage consumes the previous stage's result.
pub struct Workflow {
    /// The imported experiment every run starts from.
    base: Experiment,

    pub items: Vec<WorkflowItem>,

    /// Status / error message from the last run.
    pub status_message: Option<String>,
}

impl Workflow {
    pub fn new(base: Experiment) -> Self {
        Self {
            base,
            items: Vec::new(),
            status_message: None,
        }
    }

    pub fn base(&self) -> &Experiment {
        &self.base
    }

    /// Append an operation. Existing cached results stay valid.
    pub fn push(&mut self, operation: Box<dyn Operation>) {
        self.items.push(WorkflowItem {
            operation,
            result: None,
        });
    }

    /// Run every stage in order. Stops at the first failure, leaving the
    /// failed stage and everything after it without a result.
    pub fn run(&mut self) -> Result<&Experiment> {
        self.status_message = None;
        for item in &mut self.items {
            item.result = None;
        }

        for i in 0..self.items.len() {
            let input = match i {
                0 => &self.base,
                _ => self.items[i - 1]
                    .result
                    .as_ref()
                    .unwrap_or(&self.base),
            };
            let op = &self.items[i].operation;
            match op.apply(input) {
                Ok(next) => {
                    info!("stage {i} ({} '{}') done", op.friendly_id(), op.name());
                    self.items[i].result = Some(next);
                }
                Err(e) => {
                    warn!("stage {i} ({} '{}') failed: {e}", op.friendly_id(), op.name());
                    self.status_message = Some(format!("{}: {e}", op.name()));
                    return Err(e);
                }
            }
        }
        Ok(self.result())
    }

    /// The last stage's result, or the base experiment if nothing has run.
    pub fn result(&self) -> &Experiment {
        self.items
            .iter()
            .rev()
            .find_map(|item| item.result.as_ref())
            .unwrap_or(&self.base)
    }

    /// Result of stage `index`, if it ran successfully.
    pub fn stage_result(&self, index: usize) -> Option<&Experiment> {
        self.items.get(index)?.result.as_ref()
    }
}
