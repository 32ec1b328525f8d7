//! Shared fixtures for the integration tests.
//!
//! Steps, compensations and the finalizer all write to one journal so tests
//! can assert on the exact interleaving of calls.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use stepchain::{Compensation, Context, ErrorEntry, Finalize, Step, StepResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub amount: i64,
}

pub fn order(id: &str, amount: i64) -> Order {
    Order {
        id: id.to_string(),
        amount,
    }
}

pub type Ctx = Context<Order, Vec<String>>;

#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: String) {
        self.0.lock().unwrap().push(entry);
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.0.lock().unwrap().iter().filter(|e| *e == entry).count()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }
}

/// What a scripted step does on one call
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Outcome {
    /// 200, records the step in context state
    Ok,
    /// 202, success but not yet final
    Pending,
    /// Failed result with the given status
    Fail(u16),
    /// Returns an error
    Fault,
}

pub struct ScriptedStep {
    id: String,
    journal: Journal,
    script: Mutex<VecDeque<Outcome>>,
    fallback: Outcome,
    delay: Option<Duration>,
}

impl ScriptedStep {
    pub fn new(id: &str, journal: &Journal) -> Self {
        Self {
            id: id.to_string(),
            journal: journal.clone(),
            script: Mutex::new(VecDeque::new()),
            fallback: Outcome::Ok,
            delay: None,
        }
    }

    /// Outcomes for the first calls, in order
    pub fn then(self, outcomes: &[Outcome]) -> Self {
        *self.script.lock().unwrap() = outcomes.iter().copied().collect();
        self
    }

    /// Outcome once the script is used up
    pub fn otherwise(mut self, outcome: Outcome) -> Self {
        self.fallback = outcome;
        self
    }

    pub fn sleeping(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl Step<Order, Vec<String>> for ScriptedStep {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(&self, ctx: &mut Ctx) -> Result<StepResult> {
        self.journal.push(format!("step:{}", self.id));

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.fallback);

        match outcome {
            Outcome::Ok => {
                ctx.state.push(self.id.clone());
                Ok(StepResult::ok(json!({
                    "step": self.id,
                    "order": ctx.request.id,
                    "state": ctx.state,
                })))
            }
            Outcome::Pending => Ok(StepResult::empty()
                .with_status(202)
                .with_payload(json!({ "step": self.id }))),
            Outcome::Fail(status) => Ok(StepResult::failure(
                status,
                ErrorEntry::new(format!("{} rejected", self.id)).with_code("rejected"),
            )),
            Outcome::Fault => anyhow::bail!("{} backend unavailable", self.id),
        }
    }
}

pub struct Undo {
    id: String,
    journal: Journal,
    fail: bool,
}

impl Undo {
    pub fn new(id: &str, journal: &Journal) -> Self {
        Self {
            id: id.to_string(),
            journal: journal.clone(),
            fail: false,
        }
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }
}

#[async_trait]
impl Compensation<Order> for Undo {
    fn id(&self) -> &str {
        &self.id
    }

    async fn compensate(&self, request: &Order) -> Result<()> {
        self.journal.push(format!("undo:{}:{}", self.id, request.id));
        if self.fail {
            anyhow::bail!("{} could not be undone", self.id);
        }
        Ok(())
    }
}

pub struct Finalizer {
    journal: Journal,
    replacement: Option<StepResult>,
    failures_left: AtomicU32,
}

impl Finalizer {
    pub fn new(journal: &Journal) -> Self {
        Self {
            journal: journal.clone(),
            replacement: None,
            failures_left: AtomicU32::new(0),
        }
    }

    pub fn replacing(mut self, result: StepResult) -> Self {
        self.replacement = Some(result);
        self
    }

    pub fn failing(self) -> Self {
        self.failing_times(u32::MAX)
    }

    /// Fail the first `times` calls
    pub fn failing_times(self, times: u32) -> Self {
        self.failures_left.store(times, Ordering::SeqCst);
        self
    }
}

#[async_trait]
impl Finalize<Order, Vec<String>> for Finalizer {
    async fn finalize(&self, ctx: &mut Ctx) -> Result<Option<StepResult>> {
        let status = ctx.response.as_ref().map(|r| r.status_code).unwrap_or(0);
        self.journal.push(format!("finalize:{}", status));

        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            anyhow::bail!("audit log unavailable");
        }
        Ok(self.replacement.clone())
    }
}
