//! The boot state machine.
//!
//! One generic loop over a static stage table. The sequencer owns the
//! cursor: only [`Sequencer::step`] moves it, and only forward.

use crate::error::BootError;

use super::context::BootContext;
use super::stage::{run_stage, BootStage, FailurePolicy, Flow, Precondition, Retries, BOOT_STAGES};
use super::system::BootSystem;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootState {
    /// About to run the stage at this index.
    Running(usize),
    /// Every stage completed; the root is ready for switch-root.
    Succeeded,
    /// Terminal. The pipeline is never retried from here.
    RescueShell {
        stage: Option<&'static str>,
        reason: String,
    },
}

impl BootState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, BootState::Running(_))
    }
}

/// What happened to one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Succeeded { attempts: u32 },
    /// An optional precondition did not hold.
    Skipped,
    /// Failed, but the stage's policy let the pipeline continue.
    Degraded(String),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageRecord {
    pub stage: &'static str,
    pub outcome: Outcome,
}

/// Final state of a run together with everything it discovered.
#[derive(Debug)]
pub struct BootReport {
    pub state: BootState,
    pub context: BootContext,
    pub history: Vec<StageRecord>,
}

impl BootReport {
    pub fn ran(&self, stage: &str) -> bool {
        self.history
            .iter()
            .any(|r| r.stage == stage && !matches!(r.outcome, Outcome::Skipped))
    }
}

enum Gate {
    Run,
    Skip,
    Blocked(String),
}

/// A stage is optional when an operator-supplied parameter gates it.
fn is_optional(stage: &BootStage) -> bool {
    stage
        .preconditions
        .iter()
        .any(|p| matches!(p, Precondition::Param(_)))
}

pub struct Sequencer<'a, S: BootSystem> {
    stages: &'static [BootStage],
    state: BootState,
    context: BootContext,
    system: &'a mut S,
    history: Vec<StageRecord>,
}

impl<'a, S: BootSystem> Sequencer<'a, S> {
    pub fn new(system: &'a mut S, context: BootContext) -> Self {
        Self::with_stages(system, context, BOOT_STAGES)
    }

    pub fn with_stages(
        system: &'a mut S,
        context: BootContext,
        stages: &'static [BootStage],
    ) -> Self {
        Self {
            stages,
            state: BootState::Running(0),
            context,
            system,
            history: Vec::new(),
        }
    }

    pub fn state(&self) -> &BootState {
        &self.state
    }

    pub fn context(&self) -> &BootContext {
        &self.context
    }

    pub fn history(&self) -> &[StageRecord] {
        &self.history
    }

    /// Drive the pipeline to a terminal state.
    pub fn run(mut self) -> BootReport {
        while !self.state.is_terminal() {
            self.step();
        }
        BootReport {
            state: self.state,
            context: self.context,
            history: self.history,
        }
    }

    /// Run the current stage and move to the next state.
    pub fn step(&mut self) -> &BootState {
        let BootState::Running(index) = self.state else {
            return &self.state;
        };
        let stages = self.stages;
        let Some(stage) = stages.get(index) else {
            tracing::info!("all boot stages complete");
            self.state = BootState::Succeeded;
            return &self.state;
        };

        match self.gate(stage) {
            Gate::Run => self.execute(index, stage),
            Gate::Skip => {
                tracing::info!(stage = stage.name, "skipped");
                self.record(stage, Outcome::Skipped);
                self.state = BootState::Running(index + 1);
            }
            Gate::Blocked(reason) => {
                tracing::error!(stage = stage.name, %reason, "cannot run");
                self.record(stage, Outcome::Failed(reason.clone()));
                self.rescue(stage, reason);
            }
        }
        &self.state
    }

    fn gate(&self, stage: &BootStage) -> Gate {
        for precondition in stage.preconditions {
            match precondition {
                Precondition::Always => {}
                Precondition::Param(param) => {
                    if !self.context.params().has(*param) {
                        return Gate::Skip;
                    }
                }
                Precondition::PriorSuccess => match self.history.last() {
                    None => {}
                    Some(StageRecord {
                        outcome: Outcome::Succeeded { .. } | Outcome::Skipped,
                        ..
                    }) => {}
                    Some(record) => {
                        return Gate::Blocked(format!(
                            "previous stage '{}' did not complete",
                            record.stage
                        ))
                    }
                },
            }
        }
        Gate::Run
    }

    fn execute(&mut self, index: usize, stage: &'static BootStage) {
        let budget = match stage.retries {
            Retries::None => 0,
            Retries::Policy => self.context.retry().stage_retries,
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            tracing::info!(stage = stage.name, attempt, "running");

            let error: BootError = match run_stage(stage.kind, &mut self.context, self.system) {
                Ok(Flow::Continue) => {
                    tracing::info!(stage = stage.name, "done");
                    self.record(stage, Outcome::Succeeded { attempts: attempt });
                    self.state = BootState::Running(index + 1);
                    return;
                }
                Ok(Flow::Rescue(reason)) => {
                    self.record(stage, Outcome::Succeeded { attempts: attempt });
                    self.rescue(stage, reason);
                    return;
                }
                Err(e) => e,
            };

            if error.is_transient() && attempt <= budget {
                tracing::warn!(stage = stage.name, attempt, error = %error, "retrying");
                continue;
            }

            if stage.policy == FailurePolicy::SkipIfAbsent && is_optional(stage) {
                tracing::warn!(stage = stage.name, error = %error, "failed, continuing");
                self.record(stage, Outcome::Degraded(error.to_string()));
                self.state = BootState::Running(index + 1);
            } else {
                tracing::error!(stage = stage.name, error = %error, "failed");
                self.record(stage, Outcome::Failed(error.to_string()));
                self.rescue(stage, error.to_string());
            }
            return;
        }
    }

    fn record(&mut self, stage: &BootStage, outcome: Outcome) {
        self.history.push(StageRecord {
            stage: stage.name,
            outcome,
        });
    }

    fn rescue(&mut self, stage: &BootStage, reason: String) {
        self.state = BootState::RescueShell {
            stage: Some(stage.name),
            reason,
        };
    }
}
