//! Map-reduce orchestrator.
//!
//! Every item runs as its own single-step sub-execution of the `map` step.
//! Outputs are folded into an accumulator with the reduce expression.
//!
//! - Sequential: one item at a time, folded before the next one starts.
//! - Parallel: contiguous batches of `parallelism` items. Items of a batch
//!   run concurrently, batches run one after another, and each batch is
//!   folded in item order once all of its members have finished.
//!
//! The reduce expression always sees the same bindings, whichever mode runs
//! it: `results` (accumulator so far) and `_` (one item output), also
//! available as `_result` and `_item`. The expression text is never rewritten.

use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;

use taskloom_types::remote::RemoteList;
use taskloom_types::task::{Cursor, Workflow, WorkflowStep};

use super::activity::{ActivityCall, ActivityError, ActivityInvoker};
use super::context::StepContext;
use super::continuation::ContinuationManager;
use super::error::ExecutionError;
use super::expression::{ExpressionError, TaskEvaluator};

/// Reduce expression used when a step does not name one: append each
/// output to the accumulator.
pub const DEFAULT_REDUCE: &str = "results|append(_)";

pub fn map_item_name(parent: &Cursor, index: usize) -> String {
    format!("{}.mapreduce[{index}]", parent.scope_name())
}

pub fn parallel_item_name(parent: &Cursor, batch: usize, slot: usize) -> String {
    format!("PAR:{}.mapreduce[{batch}][{slot}]", parent.scope_name())
}

/// Effective batch size for a requested parallelism.
///
/// The request is capped at `max`; anything that does not leave more than
/// one concurrent item is rejected.
pub fn validate_parallelism(requested: i64, max: usize) -> Result<usize, ExecutionError> {
    let cap = i64::try_from(max).unwrap_or(i64::MAX);
    let effective = requested.min(cap);
    if effective <= 1 {
        return Err(ExecutionError::InvalidParallelism {
            requested,
            effective,
        });
    }
    // effective > 1 and <= max, so the conversion cannot fail
    Ok(usize::try_from(effective).unwrap_or(max))
}

/// Split `0..len` into contiguous ranges of at most `size` items.
pub fn partition_batches(len: usize, size: usize) -> Vec<Range<usize>> {
    let size = size.max(1);
    (0..len)
        .step_by(size)
        .map(|start| start..(start + size).min(len))
        .collect()
}

// ---------------------------------------------------------------------------
// Reducer
// ---------------------------------------------------------------------------

/// Callable fold built from a reduce expression.
#[derive(Clone)]
pub struct Reducer {
    expression: String,
    evaluator: Arc<TaskEvaluator>,
}

impl Reducer {
    pub fn new(expression: impl Into<String>, evaluator: Arc<TaskEvaluator>) -> Self {
        Self {
            expression: expression.into(),
            evaluator,
        }
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Fold one item output into the accumulator.
    ///
    /// `base` supplies the step's bindings (`state`, `inputs`, ...); the
    /// fold names shadow any binding of the same name.
    pub fn fold_one(&self, base: &Value, result: Value, item: Value) -> Result<Value, ExpressionError> {
        let mut bindings = match base {
            Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        };
        bindings.insert("results".to_string(), result.clone());
        bindings.insert("_result".to_string(), result);
        bindings.insert("_".to_string(), item.clone());
        bindings.insert("_item".to_string(), item);
        self.evaluator
            .evaluate(&self.expression, &Value::Object(bindings))
    }

    /// Fold `items` into `initial` left to right.
    pub fn fold_all(
        &self,
        base: &Value,
        initial: Value,
        items: Vec<Value>,
    ) -> Result<Value, ExpressionError> {
        items
            .into_iter()
            .try_fold(initial, |acc, item| self.fold_one(base, acc, item))
    }
}

impl std::fmt::Debug for Reducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reducer")
            .field("expression", &self.expression)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// MapReduceOrchestrator
// ---------------------------------------------------------------------------

/// The step-level inputs of one map-reduce run.
pub struct MapRequest<'r> {
    pub context: &'r StepContext,
    pub map_step: &'r WorkflowStep,
    pub items: Vec<Value>,
    /// Fold expression; `DEFAULT_REDUCE` when absent.
    pub reduce: Option<&'r str>,
    pub initial: Value,
    pub previous_inputs: &'r RemoteList,
}

pub struct MapReduceOrchestrator<'a> {
    continuation: &'a ContinuationManager,
    activities: &'a ActivityInvoker,
    evaluator: Arc<TaskEvaluator>,
    max_parallelism: usize,
    evaluate_timeout: Duration,
}

impl<'a> MapReduceOrchestrator<'a> {
    pub fn new(
        continuation: &'a ContinuationManager,
        activities: &'a ActivityInvoker,
        evaluator: Arc<TaskEvaluator>,
        max_parallelism: usize,
        evaluate_timeout: Duration,
    ) -> Self {
        Self {
            continuation,
            activities,
            evaluator,
            max_parallelism,
            evaluate_timeout,
        }
    }

    /// Map items one at a time, folding each output before the next item
    /// starts.
    pub async fn execute_sequential(&self, request: MapRequest<'_>) -> Result<Value, ExecutionError> {
        let MapRequest {
            context,
            map_step,
            items,
            reduce,
            initial,
            previous_inputs,
        } = request;
        let reducer = self.reducer(reduce);
        let base = context.bindings();
        let token = self.continuation.runtime().cancellation().clone();

        tracing::info!(
            workflow = %context.cursor.workflow,
            step = context.cursor.step,
            items = items.len(),
            "sequential map-reduce started"
        );

        let mut result = initial;
        for (index, item) in items.into_iter().enumerate() {
            if token.is_cancelled() {
                return Err(ExecutionError::Cancelled);
            }
            let output = self
                .map_item(
                    context,
                    map_item_name(&context.cursor, index),
                    map_step,
                    item,
                    previous_inputs,
                )
                .await?;
            result = self.reduce(&reducer, &base, result, vec![output]).await?;
        }
        Ok(result)
    }

    /// Map items in contiguous batches of `parallelism`, folding each batch
    /// in item order once every member has finished.
    ///
    /// A failing member aborts the step with `BatchFailure`; its running
    /// siblings are dropped and no further batch starts.
    pub async fn execute_parallel(
        &self,
        request: MapRequest<'_>,
        parallelism: i64,
    ) -> Result<Value, ExecutionError> {
        let MapRequest {
            context,
            map_step,
            items,
            reduce,
            initial,
            previous_inputs,
        } = request;
        let size = validate_parallelism(parallelism, self.max_parallelism)?;
        let reducer = self.reducer(reduce);
        let base = context.bindings();
        let token = self.continuation.runtime().cancellation().clone();
        let batches = partition_batches(items.len(), size);

        tracing::info!(
            workflow = %context.cursor.workflow,
            step = context.cursor.step,
            items = items.len(),
            parallelism = size,
            batches = batches.len(),
            "parallel map-reduce started"
        );

        let mut result = initial;
        for (batch, range) in batches.into_iter().enumerate() {
            if token.is_cancelled() {
                return Err(ExecutionError::Cancelled);
            }

            let mut in_flight = FuturesUnordered::new();
            for (slot, index) in range.clone().enumerate() {
                let item = items[index].clone();
                let name = parallel_item_name(&context.cursor, batch, slot);
                in_flight.push(async move {
                    self.map_item(context, name, map_step, item, previous_inputs)
                        .await
                        .map(|output| (slot, output))
                });
            }

            let mut outputs: Vec<Option<Value>> = vec![None; range.len()];
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        tracing::info!(batch, "batch cancelled");
                        return Err(ExecutionError::Cancelled);
                    }
                    next = in_flight.next() => match next {
                        Some(Ok((slot, output))) => outputs[slot] = Some(output),
                        Some(Err(err)) => {
                            if err.is_cancelled() || token.is_cancelled() {
                                return Err(ExecutionError::Cancelled);
                            }
                            tracing::error!(batch, error = %err, "batch member failed");
                            return Err(ExecutionError::BatchFailure {
                                batch,
                                source: Box::new(err),
                            });
                        }
                        None => break,
                    }
                }
            }

            let outputs: Vec<Value> = outputs
                .into_iter()
                .map(|output| output.unwrap_or(Value::Null))
                .collect();
            tracing::info!(batch, members = outputs.len(), "batch finished");
            result = self.reduce(&reducer, &base, result, outputs).await?;
        }
        Ok(result)
    }

    fn reducer(&self, reduce: Option<&str>) -> Reducer {
        Reducer::new(reduce.unwrap_or(DEFAULT_REDUCE), self.evaluator.clone())
    }

    async fn map_item(
        &self,
        context: &StepContext,
        name: String,
        map_step: &WorkflowStep,
        item: Value,
        previous_inputs: &RemoteList,
    ) -> Result<Value, ExecutionError> {
        let inputs = self.activities.offloader().append(previous_inputs, item).await?;
        let input = context
            .execution_input
            .with_workflow(Workflow::single_step(name.clone(), map_step.clone()));

        self.continuation
            .delegate(input, Cursor::start(name), inputs, &context.user_state)
            .await
    }

    async fn reduce(
        &self,
        reducer: &Reducer,
        base: &Value,
        result: Value,
        outputs: Vec<Value>,
    ) -> Result<Value, ExecutionError> {
        let reducer = reducer.clone();
        let base = base.clone();
        let call = ActivityCall::new("reduce", move || {
            let folded = reducer
                .fold_all(&base, result.clone(), outputs.clone())
                .map_err(ActivityError::from);
            async move { folded }
        })
        .with_timeout(self.evaluate_timeout);

        self.activities
            .invoke(self.continuation.runtime().as_ref(), call)
            .await
    }
}
