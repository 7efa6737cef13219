//! In-process engine assembly.
//!
//! `LocalEngine` wires the task execution workflow to the local runtime, a
//! blob store for offloaded payloads and an execution repository, and hands
//! out the `ExecutionService` that drives submissions.

use std::path::Path;
use std::sync::Arc;

use taskloom_core::engine::expression::TaskEvaluator;
use taskloom_core::engine::offload::{BlobStore, PayloadOffloader};
use taskloom_core::engine::ports::{ModelClient, ToolExecutor};
use taskloom_core::engine::steps::StepActivities;
use taskloom_core::engine::workflow::TaskExecutionWorkflow;
use taskloom_core::repository::execution::ExecutionRepository;
use taskloom_core::service::execution::ExecutionService;
use taskloom_types::config::EngineConfig;

use crate::blob::fs::FsBlobStore;
use crate::config::load_engine_config;
use crate::runtime::LocalRuntime;
use crate::sqlite::execution::SqliteExecutionRepository;
use crate::sqlite::pool::DatabasePool;

#[derive(Debug, thiserror::Error)]
pub enum EngineOpenError {
    #[error("failed to prepare data directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to open database: {0}")]
    Database(#[from] sqlx::Error),
}

pub struct LocalEngine<R: ExecutionRepository + 'static> {
    service: ExecutionService<R, LocalRuntime>,
    runtime: LocalRuntime,
    config: EngineConfig,
}

impl<R: ExecutionRepository + 'static> LocalEngine<R> {
    pub fn new(
        repository: Arc<R>,
        store: Arc<dyn BlobStore>,
        model: Arc<dyn ModelClient>,
        tools: Arc<dyn ToolExecutor>,
        config: EngineConfig,
    ) -> Self {
        let evaluator = Arc::new(TaskEvaluator::new());
        let steps = StepActivities::new(evaluator, model, tools);
        let offloader = PayloadOffloader::new(store, config.offload_threshold_bytes);
        let workflow =
            TaskExecutionWorkflow::new(repository.clone(), steps, offloader, config.clone());
        let runtime = LocalRuntime::new(Arc::new(workflow), config.history_event_limit);

        tracing::debug!(
            max_parallelism = config.max_parallelism,
            offload_threshold_bytes = config.offload_threshold_bytes,
            history_event_limit = config.history_event_limit,
            "local engine assembled"
        );

        Self {
            service: ExecutionService::new(repository, runtime.clone()),
            runtime,
            config,
        }
    }

    pub fn service(&self) -> &ExecutionService<R, LocalRuntime> {
        &self.service
    }

    pub fn runtime(&self) -> &LocalRuntime {
        &self.runtime
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

impl LocalEngine<SqliteExecutionRepository> {
    /// Open the persistent engine rooted at `data_dir`.
    ///
    /// Reads `engine.toml`, opens (and migrates) `taskloom.db` and stores
    /// offloaded payloads under `blobs/`.
    pub async fn open(
        data_dir: &Path,
        model: Arc<dyn ModelClient>,
        tools: Arc<dyn ToolExecutor>,
    ) -> Result<Self, EngineOpenError> {
        tokio::fs::create_dir_all(data_dir).await?;

        let config = load_engine_config(data_dir).await;
        let pool = DatabasePool::open(data_dir).await?;
        let repository = Arc::new(SqliteExecutionRepository::new(pool));
        let store = Arc::new(FsBlobStore::new(data_dir.join("blobs")));

        tracing::info!(data_dir = %data_dir.display(), "engine opened");
        Ok(Self::new(repository, store, model, tools, config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use serde_json::{Value, json};
    use uuid::Uuid;

    use taskloom_core::engine::activity::ActivityError;
    use taskloom_core::engine::error::ExecutionError;
    use taskloom_core::engine::ports::{ModelRequest, ToolInvocation};
    use taskloom_core::repository::SortOrder;
    use taskloom_core::service::execution::SubmitExecution;
    use taskloom_types::execution::{ExecutionStatus, TransitionType};
    use taskloom_types::remote::RemoteRef;
    use taskloom_types::config::RetryPolicyConfig;
    use taskloom_types::task::{
        ForeachDo, MAIN_WORKFLOW, TaskDefinition, ToolDef, ToolKind, Workflow, WorkflowStep,
    };

    use crate::blob::memory::InMemoryBlobStore;
    use crate::memory::InMemoryExecutionRepository;

    /// Replies "hello, <last message content>".
    struct GreetingModel;

    impl ModelClient for GreetingModel {
        fn complete<'a>(
            &'a self,
            request: &'a ModelRequest,
        ) -> Pin<Box<dyn Future<Output = Result<Value, ActivityError>> + Send + 'a>> {
            Box::pin(async move {
                let last = request
                    .messages
                    .last()
                    .and_then(|m| m.get("content"))
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                Ok(json!({
                    "choices": [{
                        "finish_reason": "stop",
                        "message": { "role": "assistant", "content": format!("hello, {last}") }
                    }]
                }))
            })
        }
    }

    struct NoTools;

    impl ToolExecutor for NoTools {
        fn execute<'a>(
            &'a self,
            invocation: &'a ToolInvocation,
        ) -> Pin<Box<dyn Future<Output = Result<Value, ActivityError>> + Send + 'a>> {
            let name = invocation.tool.name.clone();
            Box::pin(async move { Err(ActivityError::validation(format!("no tool '{name}'"))) })
        }
    }

    fn exprs(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn evaluate(pairs: &[(&str, &str)]) -> WorkflowStep {
        WorkflowStep::Evaluate {
            evaluate: exprs(pairs),
        }
    }

    fn task(workflows: Vec<Workflow>) -> TaskDefinition {
        TaskDefinition {
            id: Uuid::now_v7(),
            name: "engine-test".to_string(),
            description: None,
            workflows,
            tools: vec![],
            metadata: BTreeMap::new(),
        }
    }

    fn main_only(steps: Vec<WorkflowStep>) -> TaskDefinition {
        task(vec![Workflow::new(MAIN_WORKFLOW, steps)])
    }

    fn request(task: TaskDefinition, arguments: Value) -> SubmitExecution {
        SubmitExecution {
            task,
            agent_id: Uuid::now_v7(),
            user_id: None,
            arguments,
        }
    }

    fn letters() -> Value {
        json!({ "items": ["a", "b", "c", "d", "e"] })
    }

    fn map_letters(map: WorkflowStep, parallelism: Option<i64>) -> WorkflowStep {
        WorkflowStep::MapReduce {
            over: "_.items".into(),
            map: Box::new(map),
            reduce: None,
            initial: json!([]),
            parallelism,
        }
    }

    /// Always fails with a transient error and counts the attempts.
    #[derive(Default)]
    struct FlakyService {
        calls: AtomicUsize,
    }

    impl ToolExecutor for FlakyService {
        fn execute<'a>(
            &'a self,
            _invocation: &'a ToolInvocation,
        ) -> Pin<Box<dyn Future<Output = Result<Value, ActivityError>> + Send + 'a>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Err(ActivityError::transient("service unavailable")) })
        }
    }

    fn engine_with(
        config: EngineConfig,
        store: Arc<dyn BlobStore>,
    ) -> (
        Arc<LocalEngine<InMemoryExecutionRepository>>,
        Arc<InMemoryExecutionRepository>,
    ) {
        engine_with_tools(config, store, Arc::new(NoTools))
    }

    fn engine_with_tools(
        config: EngineConfig,
        store: Arc<dyn BlobStore>,
        tools: Arc<dyn ToolExecutor>,
    ) -> (
        Arc<LocalEngine<InMemoryExecutionRepository>>,
        Arc<InMemoryExecutionRepository>,
    ) {
        let repository = Arc::new(InMemoryExecutionRepository::new());
        let engine = LocalEngine::new(
            repository.clone(),
            store,
            Arc::new(GreetingModel),
            tools,
            config,
        );
        (Arc::new(engine), repository)
    }

    fn engine() -> (
        Arc<LocalEngine<InMemoryExecutionRepository>>,
        Arc<InMemoryExecutionRepository>,
    ) {
        engine_with(EngineConfig::default(), Arc::new(InMemoryBlobStore::new()))
    }

    async fn transition_types(
        engine: &LocalEngine<InMemoryExecutionRepository>,
        execution_id: &Uuid,
    ) -> Vec<TransitionType> {
        engine
            .service()
            .transitions(execution_id, SortOrder::Asc)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.transition_type)
            .collect()
    }

    async fn wait_for_pending(
        engine: &LocalEngine<InMemoryExecutionRepository>,
        execution_id: Uuid,
        count: usize,
    ) -> Vec<String> {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let pending = engine.service().pending_inputs(execution_id);
                if pending.len() >= count {
                    return pending;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("pending inputs never appeared")
    }

    #[tokio::test]
    async fn multi_step_task_runs_to_completion() {
        let (engine, _) = engine();
        let steps = vec![
            WorkflowStep::SetValue {
                set: exprs(&[("greeted", "_.name")]),
            },
            WorkflowStep::Log {
                log: "greeting {{ _.name }}".into(),
            },
            WorkflowStep::GetValue {
                get: "greeted".into(),
            },
            evaluate(&[("who", "_"), ("first", "inputs[0].name")]),
        ];
        let input = engine
            .service()
            .create_execution(request(main_only(steps), json!({ "name": "ada" })))
            .await
            .unwrap();
        let id = input.execution_id;

        let output = engine.service().run(input).await.unwrap();
        assert_eq!(output, json!({ "who": "ada", "first": "ada" }));

        let record = engine.service().get_execution(&id).await.unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::Succeeded);
        assert_eq!(record.output, Some(output));

        assert_eq!(
            transition_types(&engine, &id).await,
            vec![
                TransitionType::Init,
                TransitionType::Step,
                TransitionType::Step,
                TransitionType::Step,
                TransitionType::Finish,
            ]
        );
        assert!(!engine.runtime().is_running(id));
    }

    #[tokio::test]
    async fn invalid_task_is_rejected_before_anything_is_stored() {
        let (engine, repository) = engine();
        let err = engine
            .service()
            .submit(request(task(vec![Workflow::new("helper", vec![])]), json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::InvalidTask(_)));
        assert!(repository.is_empty());
    }

    #[tokio::test]
    async fn sequential_and_parallel_map_reduce_agree() {
        let (engine, _) = engine();
        let map = evaluate(&[("v", "_")]);

        let sequential = engine
            .service()
            .submit(request(main_only(vec![map_letters(map.clone(), None)]), letters()))
            .await
            .unwrap();
        let parallel = engine
            .service()
            .submit(request(main_only(vec![map_letters(map, Some(2))]), letters()))
            .await
            .unwrap();

        assert_eq!(
            sequential,
            json!([{ "v": "a" }, { "v": "b" }, { "v": "c" }, { "v": "d" }, { "v": "e" }])
        );
        assert_eq!(parallel, sequential);
    }

    #[tokio::test]
    async fn foreach_collects_one_output_per_item() {
        let (engine, _) = engine();
        let steps = vec![WorkflowStep::Foreach {
            foreach: ForeachDo {
                items: "_.items".into(),
                step: Box::new(evaluate(&[("upper", "_|upper")])),
            },
        }];

        let output = engine
            .service()
            .submit(request(main_only(steps), json!({ "items": ["x", "y"] })))
            .await
            .unwrap();
        assert_eq!(output, json!([{ "upper": "X" }, { "upper": "Y" }]));
    }

    #[tokio::test]
    async fn map_items_fold_correctly_when_history_is_exhausted() {
        let config = EngineConfig {
            history_event_limit: 1,
            ..EngineConfig::default()
        };
        let (engine, _) = engine_with(config, Arc::new(InMemoryBlobStore::new()));
        let steps = vec![
            map_letters(evaluate(&[("v", "_")]), None),
            evaluate(&[("count", "_|length")]),
        ];

        let output = engine
            .service()
            .submit(request(main_only(steps), letters()))
            .await
            .unwrap();
        assert_eq!(output, json!({ "count": 5 }));
    }

    #[tokio::test]
    async fn parallel_map_reduce_rejects_parallelism_below_two() {
        let (engine, _) = engine();
        let err = engine
            .service()
            .submit(request(
                main_only(vec![map_letters(evaluate(&[("v", "_")]), Some(0))]),
                letters(),
            ))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ExecutionError::InvalidParallelism { requested: 0, .. }
        ));
    }

    #[tokio::test]
    async fn failing_batch_member_stops_later_batches() {
        let (engine, _) = engine();
        let map = WorkflowStep::IfElse {
            condition: "_ == 'c'".into(),
            then: Box::new(WorkflowStep::Error {
                error: "bad item".into(),
            }),
            otherwise: Some(Box::new(evaluate(&[("v", "_")]))),
        };
        let input = engine
            .service()
            .create_execution(request(main_only(vec![map_letters(map, Some(2))]), letters()))
            .await
            .unwrap();
        let id = input.execution_id;

        let err = engine.service().run(input).await.unwrap_err();
        assert!(matches!(err, ExecutionError::BatchFailure { batch: 1, .. }));
        assert!(err.to_string().starts_with("Error in batch 1"));

        let record = engine.service().get_execution(&id).await.unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::Failed);

        let transitions = engine
            .service()
            .transitions(&id, SortOrder::Asc)
            .await
            .unwrap();
        assert!(
            transitions
                .iter()
                .all(|t| !t.current.workflow.contains("mapreduce[2]"))
        );
        assert!(transitions.iter().any(|t| t.transition_type == TransitionType::Error));
    }

    #[tokio::test]
    async fn wait_for_input_resumes_with_provided_value() {
        let (engine, _) = engine();
        let steps = vec![
            WorkflowStep::WaitForInput {
                info: json!({ "question": "approve?" }),
            },
            evaluate(&[("approved", "_.approved")]),
        ];
        let input = engine
            .service()
            .create_execution(request(main_only(steps), json!({})))
            .await
            .unwrap();
        let id = input.execution_id;

        let runner = engine.clone();
        let handle = tokio::spawn(async move { runner.service().run(input).await });

        let pending = wait_for_pending(&engine, id, 1).await;
        assert!(pending[0].starts_with(&id.to_string()));
        let record = engine.service().get_execution(&id).await.unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::AwaitingInput);

        assert!(
            engine
                .service()
                .provide_input(id, None, json!({ "approved": true }))
        );
        let output = handle.await.unwrap().unwrap();
        assert_eq!(output, json!({ "approved": true }));

        let types = transition_types(&engine, &id).await;
        assert!(types.contains(&TransitionType::Wait));
        assert!(types.contains(&TransitionType::Resume));
        assert_eq!(types.last(), Some(&TransitionType::Finish));
    }

    #[tokio::test]
    async fn wait_for_input_times_out() {
        let config = EngineConfig {
            wait_for_input_timeout_secs: Some(1),
            ..EngineConfig::default()
        };
        let (engine, _) = engine_with(config, Arc::new(InMemoryBlobStore::new()));
        let err = engine
            .service()
            .submit(request(
                main_only(vec![WorkflowStep::WaitForInput { info: json!(null) }]),
                json!({}),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::InputTimeout(_)));
    }

    #[tokio::test]
    async fn cancelling_parallel_waits_cancels_the_execution() {
        let (engine, _) = engine();
        let map = WorkflowStep::WaitForInput { info: json!(null) };
        let input = engine
            .service()
            .create_execution(request(main_only(vec![map_letters(map, Some(2))]), letters()))
            .await
            .unwrap();
        let id = input.execution_id;

        let runner = engine.clone();
        let handle = tokio::spawn(async move { runner.service().run(input).await });

        wait_for_pending(&engine, id, 2).await;
        assert!(engine.service().cancel(id));

        let err = handle.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());

        let record = engine.service().get_execution(&id).await.unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::Cancelled);
        assert!(
            transition_types(&engine, &id)
                .await
                .contains(&TransitionType::Cancelled)
        );
        assert!(engine.service().pending_inputs(id).is_empty());
    }

    #[tokio::test]
    async fn yield_runs_another_workflow_and_continues() {
        let (engine, _) = engine();
        let main = Workflow::new(
            MAIN_WORKFLOW,
            vec![
                WorkflowStep::Yield {
                    workflow: "lookup".into(),
                    arguments: exprs(&[("name", "_.name")]),
                },
                evaluate(&[("result", "_.who")]),
            ],
        );
        let lookup = Workflow::new(
            "lookup",
            vec![WorkflowStep::Return {
                value: exprs(&[("who", "_.name")]),
            }],
        );
        let output = engine
            .service()
            .submit(request(task(vec![main, lookup]), json!({ "name": "ada" })))
            .await
            .unwrap();
        assert_eq!(output, json!({ "result": "ada" }));
    }

    #[tokio::test]
    async fn prompt_step_uses_the_model_client() {
        let (engine, _) = engine();
        let steps = vec![WorkflowStep::Prompt {
            prompt: json!("meet {{ _.name }}"),
            settings: json!({}),
            unwrap: true,
            auto_run_tools: false,
        }];
        let output = engine
            .service()
            .submit(request(main_only(steps), json!({ "name": "ada" })))
            .await
            .unwrap();
        assert_eq!(output, json!("hello, meet ada"));
    }

    #[tokio::test]
    async fn large_outputs_are_offloaded_and_read_back() {
        let store = Arc::new(InMemoryBlobStore::new());
        let config = EngineConfig {
            offload_threshold_bytes: 64,
            ..EngineConfig::default()
        };
        let (engine, _) = engine_with(config, store.clone());
        let text = "x".repeat(500);
        let steps = vec![
            evaluate(&[("text", "_.text")]),
            evaluate(&[("echo", "_.text")]),
        ];
        let input = engine
            .service()
            .create_execution(request(main_only(steps), json!({ "text": text })))
            .await
            .unwrap();
        let id = input.execution_id;

        let output = engine.service().run(input).await.unwrap();
        assert_eq!(output, json!({ "echo": text }));
        assert!(!store.is_empty());

        let transitions = engine
            .service()
            .transitions(&id, SortOrder::Asc)
            .await
            .unwrap();
        assert!(transitions.iter().any(|t| RemoteRef::is_reference(&t.output)));
    }

    #[tokio::test]
    async fn arguments_shaped_like_a_reference_are_plain_data() {
        let (engine, _) = engine();
        let lookalike = json!({ "$remote": { "store_key": "nowhere", "size_bytes": 7 } });
        let steps = vec![
            evaluate(&[("echo", "_")]),
            evaluate(&[("again", "_.echo"), ("first", "inputs[0]")]),
        ];

        let output = engine
            .service()
            .submit(request(main_only(steps), lookalike.clone()))
            .await
            .unwrap();
        assert_eq!(output, json!({ "again": lookalike, "first": lookalike }));
    }

    #[tokio::test]
    async fn long_runs_continue_as_new_without_changing_the_result() {
        let config = EngineConfig {
            history_event_limit: 2,
            ..EngineConfig::default()
        };
        let (engine, _) = engine_with(config, Arc::new(InMemoryBlobStore::new()));
        let steps = vec![
            evaluate(&[("a", "'v'")]),
            evaluate(&[("b", "_.a")]),
            evaluate(&[("c", "_.b")]),
            evaluate(&[("d", "_.c"), ("first", "inputs[1].a")]),
        ];
        let input = engine
            .service()
            .create_execution(request(main_only(steps), json!({})))
            .await
            .unwrap();
        let id = input.execution_id;

        let output = engine.service().run(input).await.unwrap();
        assert_eq!(output, json!({ "d": "v", "first": "v" }));

        let types = transition_types(&engine, &id).await;
        assert_eq!(types.iter().filter(|t| **t == TransitionType::Init).count(), 1);
        assert_eq!(types.iter().filter(|t| **t == TransitionType::Step).count(), 3);
        assert_eq!(types.last(), Some(&TransitionType::Finish));
    }

    #[tokio::test]
    async fn failing_tool_after_earlier_steps_is_attempted_per_retry_policy_only() {
        let config = EngineConfig {
            retry: RetryPolicyConfig {
                max_attempts: 2,
                initial_interval_ms: 1,
                max_interval_ms: 1,
                ..RetryPolicyConfig::default()
            },
            ..EngineConfig::default()
        };
        let service = Arc::new(FlakyService::default());
        let (engine, _) =
            engine_with_tools(config, Arc::new(InMemoryBlobStore::new()), service.clone());

        let mut definition = main_only(vec![
            WorkflowStep::Log { log: "a".into() },
            WorkflowStep::Log { log: "b".into() },
            WorkflowStep::ToolCall {
                tool: "svc".into(),
                arguments: json!({}),
            },
        ]);
        definition.tools = vec![ToolDef {
            name: "svc".into(),
            kind: ToolKind::Integration,
            description: None,
            spec: Value::Null,
        }];
        let input = engine
            .service()
            .create_execution(request(definition, json!({})))
            .await
            .unwrap();
        let id = input.execution_id;

        let err = engine.service().run(input).await.unwrap_err();
        assert!(matches!(err, ExecutionError::ActivityFailure { .. }));
        assert_eq!(service.calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            transition_types(&engine, &id).await,
            vec![
                TransitionType::Init,
                TransitionType::Step,
                TransitionType::Step,
                TransitionType::Error,
            ]
        );

        let record = engine.service().get_execution(&id).await.unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn open_persists_executions_in_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("data");
        let engine = LocalEngine::open(&data_dir, Arc::new(GreetingModel), Arc::new(NoTools))
            .await
            .unwrap();
        assert_eq!(engine.config(), &EngineConfig::default());

        let input = engine
            .service()
            .create_execution(request(
                main_only(vec![evaluate(&[("who", "_.name")])]),
                json!({ "name": "ada" }),
            ))
            .await
            .unwrap();
        let id = input.execution_id;
        let output = engine.service().run(input).await.unwrap();
        assert_eq!(output, json!({ "who": "ada" }));

        let record = engine.service().get_execution(&id).await.unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::Succeeded);
        let transitions = engine
            .service()
            .transitions(&id, SortOrder::Desc)
            .await
            .unwrap();
        assert_eq!(transitions[0].transition_type, TransitionType::Finish);
        assert!(data_dir.join("taskloom.db").exists());
    }
}
