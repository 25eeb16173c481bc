use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use job_coordinator::{
    CompletionOutcome, CoordinatorConfig, CoordinatorError, CoordinatorResult, PollExit,
    TrainingCoordinator, UiGenerator, UiRequest,
};
use ml_service::{
    DeployedEndpoint, JobState, MlService, RemoteJob, ServiceError, ServiceResult,
    TrainingRequest,
};
use state_store::{Role, SessionStore, Stage, TrainingJobRecord};

#[derive(Debug, Clone, Copy)]
enum Step {
    /// A state reported three minutes after creation.
    State(JobState),
    /// A state reported the given number of seconds after creation.
    At(JobState, i64),
    Error,
}

/// Replays a per-job script of states; the last step repeats forever.
#[derive(Default)]
struct ScriptedService {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    on_create: Mutex<Vec<Step>>,
    no_model: bool,
    deploy_fails: bool,
    created: AtomicUsize,
    status_calls: AtomicUsize,
    list_calls: AtomicUsize,
    deploy_calls: AtomicUsize,
}

impl ScriptedService {
    fn script(&self, job_name: &str, steps: &[Step]) {
        self.scripts
            .lock()
            .unwrap()
            .insert(job_name.to_string(), steps.iter().copied().collect());
    }

    fn remote(&self, job_name: &str, state: JobState) -> RemoteJob {
        self.remote_at(job_name, state, 180)
    }

    fn remote_at(&self, job_name: &str, state: JobState, elapsed_secs: i64) -> RemoteJob {
        RemoteJob {
            name: job_name.to_string(),
            display_name: format!("{}-display", job_name),
            state,
            create_time: Utc::now() - chrono::Duration::seconds(elapsed_secs),
            end_time: None,
            model_name: (state == JobState::Succeeded && !self.no_model)
                .then(|| format!("models/{}", job_name)),
            error_message: (state == JobState::Failed).then(|| "bad target column".to_string()),
        }
    }

    fn next_step(&self, job_name: &str) -> Option<Step> {
        let mut scripts = self.scripts.lock().unwrap();
        let queue = scripts.get_mut(job_name)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().copied()
        }
    }
}

#[async_trait]
impl MlService for ScriptedService {
    async fn create_training_job(&self, request: &TrainingRequest) -> ServiceResult<RemoteJob> {
        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        let name = format!("jobs/{}", n);
        let steps = self.on_create.lock().unwrap().clone();
        self.script(&name, &steps);
        let mut job = self.remote(&name, JobState::Queued);
        job.display_name = request.display_name.clone();
        Ok(job)
    }

    async fn get_training_job(&self, job_name: &str) -> ServiceResult<RemoteJob> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        match self.next_step(job_name) {
            Some(Step::State(state)) => Ok(self.remote(job_name, state)),
            Some(Step::At(state, secs)) => Ok(self.remote_at(job_name, state, secs)),
            Some(Step::Error) => Err(ServiceError::Api {
                status: 503,
                message: "backend unavailable".to_string(),
            }),
            None => Err(ServiceError::Api {
                status: 404,
                message: format!("{} not found", job_name),
            }),
        }
    }

    async fn list_succeeded_jobs(&self) -> ServiceResult<Vec<RemoteJob>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let scripts = self.scripts.lock().unwrap();
        Ok(scripts
            .iter()
            .filter(|(_, steps)| {
                matches!(
                    steps.front(),
                    Some(Step::State(JobState::Succeeded)) | Some(Step::At(JobState::Succeeded, _))
                )
            })
            .map(|(name, _)| self.remote(name, JobState::Succeeded))
            .collect())
    }

    async fn deploy_model(&self, model_name: &str, _display_name: &str) -> ServiceResult<DeployedEndpoint> {
        self.deploy_calls.fetch_add(1, Ordering::SeqCst);
        if self.deploy_fails {
            return Err(ServiceError::Api {
                status: 500,
                message: "quota exceeded".to_string(),
            });
        }
        Ok(DeployedEndpoint {
            endpoint_name: format!("endpoints/for-{}", model_name),
            url: format!("https://ml.example/endpoints/for-{}:predict", model_name),
        })
    }
}

#[derive(Default)]
struct CountingUi {
    fail: bool,
    calls: AtomicUsize,
}

#[async_trait]
impl UiGenerator for CountingUi {
    async fn generate(&self, request: &UiRequest) -> CoordinatorResult<PathBuf> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(CoordinatorError::UiGeneration("template missing".to_string()));
        }
        Ok(PathBuf::from(format!("/generated/{}/prediction-ui.json", request.model.id)))
    }
}

struct Harness {
    _dir: TempDir,
    state_path: PathBuf,
    store: Arc<SessionStore>,
    service: Arc<ScriptedService>,
    ui: Arc<CountingUi>,
    coordinator: TrainingCoordinator,
}

async fn harness_with(service: ScriptedService, ui: CountingUi, config: CoordinatorConfig) -> Harness {
    let dir = TempDir::new().unwrap();
    let state_path = dir.path().join("platform-state.json");
    let store = Arc::new(SessionStore::load(&state_path).await.unwrap());
    let service = Arc::new(service);
    let ui = Arc::new(ui);
    let coordinator = TrainingCoordinator::new(
        Arc::clone(&store),
        service.clone(),
        ui.clone(),
        config,
    );
    Harness {
        _dir: dir,
        state_path,
        store,
        service,
        ui,
        coordinator,
    }
}

async fn harness(service: ScriptedService) -> Harness {
    harness_with(service, CountingUi::default(), CoordinatorConfig::default()).await
}

/// Put `session_id` into training on `job_name` the way `start_training` would.
async fn seed_training(store: &SessionStore, session_id: &str, job_name: &str) {
    store
        .insert_training_job(TrainingJobRecord {
            id: format!("tj-{}", job_name),
            job_name: job_name.to_string(),
            display_name: "churn model".to_string(),
            dataset_id: None,
            target_column: Some("churned".to_string()),
            session_id: session_id.to_string(),
            created_at: Utc::now(),
        })
        .await
        .unwrap();
    store
        .update(session_id, |s| s.begin_training(job_name))
        .await
        .unwrap();
}

fn request() -> TrainingRequest {
    TrainingRequest {
        display_name: "churn model".to_string(),
        dataset_uri: "file:///data/churn.csv".to_string(),
        target_column: "churned".to_string(),
        feature_columns: vec!["age".to_string(), "plan".to_string()],
    }
}

fn assistant_messages(session: &state_store::Session) -> usize {
    session
        .conversation_history
        .iter()
        .filter(|m| m.role == Role::Assistant)
        .count()
}

#[tokio::test]
async fn test_completion_runs_once() {
    let h = harness(ScriptedService::default()).await;
    h.service.script("jobs/a", &[Step::State(JobState::Succeeded)]);
    seed_training(&h.store, "s-1", "jobs/a").await;

    let first = h.coordinator.complete("s-1").await;
    assert!(matches!(first, CompletionOutcome::Deployed { simulated: false, .. }));
    let second = h.coordinator.complete("s-1").await;
    assert_eq!(second, CompletionOutcome::NoActiveJob);

    let session = h.store.get("s-1").await;
    assert_eq!(assistant_messages(&session), 1);
    assert!(session.completion_notified);
    assert_eq!(session.stage, Stage::Deployed);
    assert!(session.current_training_job.is_none());
    assert_eq!(session.last_training_job.as_deref(), Some("jobs/a"));
    assert!(session.current_model.is_some());
    assert!(session.current_endpoint.is_some());
    assert!(session.custom_ui_path.is_some());

    assert_eq!(h.service.deploy_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.ui.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.store.snapshot().await.models.len(), 1);
}

#[tokio::test]
async fn test_model_record_carries_training_metadata() {
    let h = harness(ScriptedService::default()).await;
    h.service.script("jobs/a", &[Step::State(JobState::Succeeded)]);
    seed_training(&h.store, "s-1", "jobs/a").await;

    h.coordinator.complete("s-1").await;

    let model = h.store.find_model_by_job("jobs/a").await.unwrap();
    assert_eq!(model.target_column.as_deref(), Some("churned"));
    assert_eq!(model.remote_model_name.as_deref(), Some("models/jobs/a"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_triggers_are_single_flight() {
    let h = harness(ScriptedService::default()).await;
    h.service.script("jobs/a", &[Step::State(JobState::Succeeded)]);
    seed_training(&h.store, "s-1", "jobs/a").await;

    let workflow = Arc::clone(h.coordinator.workflow());
    let mut tasks = Vec::new();
    for _ in 0..4 {
        let workflow = Arc::clone(&workflow);
        tasks.push(tokio::spawn(async move { workflow.run_completion("s-1", true).await }));
    }

    let mut deployed = 0;
    for task in tasks {
        if matches!(task.await.unwrap(), CompletionOutcome::Deployed { .. }) {
            deployed += 1;
        }
    }

    assert_eq!(deployed, 1);
    assert_eq!(assistant_messages(&h.store.get("s-1").await), 1);
    assert_eq!(h.service.deploy_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_notified_session_is_left_alone() {
    let h = harness(ScriptedService::default()).await;
    h.service.script("jobs/a", &[Step::State(JobState::Succeeded)]);
    seed_training(&h.store, "s-1", "jobs/a").await;
    h.store
        .update("s-1", |s| s.completion_notified = true)
        .await
        .unwrap();

    let (a, b) = tokio::join!(h.coordinator.complete("s-1"), h.coordinator.complete("s-1"));
    assert_eq!(a, CompletionOutcome::AlreadyNotified);
    assert_eq!(b, CompletionOutcome::AlreadyNotified);
    assert!(h.store.get("s-1").await.conversation_history.is_empty());
    assert_eq!(h.service.status_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_failed_job() {
    let h = harness(ScriptedService::default()).await;
    h.service.script("jobs/a", &[Step::State(JobState::Failed)]);
    seed_training(&h.store, "s-1", "jobs/a").await;

    assert_eq!(h.coordinator.complete("s-1").await, CompletionOutcome::Failed);

    let session = h.store.get("s-1").await;
    assert_eq!(session.stage, Stage::TrainingFailed);
    assert!(session.completion_notified);
    assert!(session.current_training_job.is_none());
    assert_eq!(session.conversation_history.len(), 1);
    assert!(session.conversation_history[0].text.contains("bad target column"));
    assert_eq!(h.service.deploy_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_still_running_changes_nothing() {
    let h = harness(ScriptedService::default()).await;
    h.service.script("jobs/a", &[Step::State(JobState::Running)]);
    seed_training(&h.store, "s-1", "jobs/a").await;

    let outcome = h.coordinator.complete("s-1").await;
    match outcome {
        CompletionOutcome::StillRunning(snapshot) => {
            assert!(snapshot.percentage > 0 && snapshot.percentage < 100);
        }
        other => panic!("unexpected outcome {:?}", other),
    }

    let session = h.store.get("s-1").await;
    assert_eq!(session.stage, Stage::Training);
    assert!(!session.completion_notified);
    assert!(session.conversation_history.is_empty());
}

#[tokio::test]
async fn test_registration_failure() {
    let service = ScriptedService {
        no_model: true,
        ..Default::default()
    };
    let h = harness(service).await;
    h.service.script("jobs/a", &[Step::State(JobState::Succeeded)]);
    seed_training(&h.store, "s-1", "jobs/a").await;

    assert_eq!(h.coordinator.complete("s-1").await, CompletionOutcome::RegistrationFailed);

    let session = h.store.get("s-1").await;
    assert!(session.completion_notified);
    assert_eq!(session.stage, Stage::TrainingFailed);
    assert_eq!(session.conversation_history.len(), 1);
    assert_eq!(h.service.deploy_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.ui.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_deploy_failure_falls_back_to_simulated_endpoint() {
    let service = ScriptedService {
        deploy_fails: true,
        ..Default::default()
    };
    let h = harness(service).await;
    h.service.script("jobs/a", &[Step::State(JobState::Succeeded)]);
    seed_training(&h.store, "s-1", "jobs/a").await;

    let outcome = h.coordinator.complete("s-1").await;
    let CompletionOutcome::Deployed { endpoint_id, simulated, .. } = outcome else {
        panic!("expected a deployment, got {:?}", outcome);
    };
    assert!(simulated);

    let endpoint = h.store.find_endpoint(&endpoint_id).await.unwrap();
    assert!(endpoint.simulated);
    assert_eq!(endpoint.url, format!("/predict/{}", endpoint_id));

    let session = h.store.get("s-1").await;
    assert_eq!(session.stage, Stage::Deployed);
    assert!(session.conversation_history[0].text.contains("simulated"));
}

#[tokio::test]
async fn test_ui_failure_still_deploys() {
    let h = harness_with(
        ScriptedService::default(),
        CountingUi {
            fail: true,
            ..Default::default()
        },
        CoordinatorConfig::default(),
    )
    .await;
    h.service.script("jobs/a", &[Step::State(JobState::Succeeded)]);
    seed_training(&h.store, "s-1", "jobs/a").await;

    let outcome = h.coordinator.complete("s-1").await;
    assert!(matches!(outcome, CompletionOutcome::Deployed { ui_path: None, .. }));

    let session = h.store.get("s-1").await;
    assert_eq!(session.stage, Stage::Deployed);
    assert!(session.custom_ui_path.is_none());
    assert_eq!(session.conversation_history.len(), 1);
}

#[tokio::test]
async fn test_status_error_during_completion_is_a_failure() {
    let h = harness(ScriptedService::default()).await;
    h.service.script("jobs/a", &[Step::Error]);
    seed_training(&h.store, "s-1", "jobs/a").await;

    assert_eq!(h.coordinator.complete("s-1").await, CompletionOutcome::Failed);
    let session = h.store.get("s-1").await;
    assert_eq!(session.stage, Stage::TrainingFailed);
    assert!(session.conversation_history[0].text.contains("ERROR"));
}

#[tokio::test(start_paused = true)]
async fn test_poller_drives_job_to_deployment() {
    let h = harness(ScriptedService::default()).await;
    *h.service.on_create.lock().unwrap() = vec![
        Step::At(JobState::Queued, 0),
        Step::At(JobState::Running, 30),
        Step::At(JobState::Running, 270),
        Step::At(JobState::Succeeded, 540),
    ];

    let mut updates = h.coordinator.poller().subscribe();
    let (job, handle) = h
        .coordinator
        .start_training("s-1", request(), Some("d-1".to_string()))
        .await
        .unwrap();
    assert_eq!(job.name, "jobs/1");
    assert!(h.coordinator.registry().is_monitoring("jobs/1").await);

    let session = h.store.get("s-1").await;
    assert_eq!(session.stage, Stage::Training);
    assert_eq!(session.target_column.as_deref(), Some("churned"));
    assert_eq!(session.current_dataset.as_deref(), Some("d-1"));

    // A second monitor for the same job spawns nothing.
    assert!(h.coordinator.poller().monitor("jobs/1", "s-1").await.is_none());

    let exit = handle.unwrap().await.unwrap();
    assert!(matches!(exit, PollExit::Terminal(CompletionOutcome::Deployed { .. })));
    assert!(!h.coordinator.registry().is_monitoring("jobs/1").await);

    let mut percentages = Vec::new();
    while let Ok(update) = updates.try_recv() {
        assert_eq!(update.session_id, "s-1");
        assert_eq!(update.job_name, "jobs/1");
        percentages.push(update.snapshot.percentage);
    }
    assert_eq!(percentages, vec![5, 20, 85, 100]);

    // Four polls plus the completion workflow's own status check.
    assert_eq!(h.service.status_calls.load(Ordering::SeqCst), 5);

    let session = h.store.get("s-1").await;
    assert_eq!(session.stage, Stage::Deployed);
    assert_eq!(assistant_messages(&session), 1);
    assert_eq!(
        session.conversation_history[0].metadata.as_ref().unwrap()["type"],
        "training_complete"
    );
}

#[tokio::test(start_paused = true)]
async fn test_second_monitor_is_a_no_op() {
    let h = harness(ScriptedService::default()).await;
    h.service.script("jobs/a", &[Step::State(JobState::Running)]);
    seed_training(&h.store, "s-1", "jobs/a").await;

    let poller = h.coordinator.poller();
    let first = poller.monitor("jobs/a", "s-1").await;
    let second = poller.monitor("jobs/a", "s-1").await;
    assert!(first.is_some());
    assert!(second.is_none());
    assert_eq!(h.coordinator.registry().len().await, 1);

    // Ticks at 0, 10, 20 and 30s: one status call each, not two.
    tokio::time::sleep(Duration::from_secs(35)).await;
    assert_eq!(h.service.status_calls.load(Ordering::SeqCst), 4);

    first.unwrap().abort();
}

#[tokio::test]
async fn test_start_training_rejects_outstanding_job() {
    let h = harness(ScriptedService::default()).await;
    seed_training(&h.store, "s-1", "jobs/a").await;

    let err = h
        .coordinator
        .start_training("s-1", request(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::TrainingInProgress(_)));
    assert_eq!(h.service.created.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_new_job_rearms_completion() {
    let h = harness(ScriptedService::default()).await;
    h.service.script("jobs/a", &[Step::State(JobState::Failed)]);
    seed_training(&h.store, "s-1", "jobs/a").await;
    assert_eq!(h.coordinator.complete("s-1").await, CompletionOutcome::Failed);

    *h.service.on_create.lock().unwrap() = vec![Step::State(JobState::Succeeded)];
    let (job, handle) = h.coordinator.start_training("s-1", request(), None).await.unwrap();
    assert!(!h.store.get("s-1").await.completion_notified);

    let exit = handle.unwrap().await.unwrap();
    assert!(matches!(exit, PollExit::Terminal(CompletionOutcome::Deployed { .. })));

    let session = h.store.get("s-1").await;
    assert_eq!(session.conversation_history.len(), 2);
    assert_eq!(session.last_training_job.as_deref(), Some(job.name.as_str()));
}

#[tokio::test(start_paused = true)]
async fn test_single_status_error_fails_fast() {
    let h = harness(ScriptedService::default()).await;
    *h.service.on_create.lock().unwrap() = vec![Step::Error];

    let (_, handle) = h.coordinator.start_training("s-1", request(), None).await.unwrap();
    let exit = handle.unwrap().await.unwrap();
    assert_eq!(exit, PollExit::StatusErrors(CompletionOutcome::Failed));

    let session = h.store.get("s-1").await;
    assert_eq!(session.stage, Stage::TrainingFailed);
    assert!(session.completion_notified);
    assert_eq!(assistant_messages(&session), 1);
    let metadata = session.conversation_history[0].metadata.as_ref().unwrap();
    assert_eq!(metadata["type"], "training_failed");
    assert_eq!(metadata["progress"]["realState"], "ERROR");
    assert_eq!(h.service.deploy_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_status_error_tolerance() {
    let config = CoordinatorConfig {
        status_error_tolerance: 3,
        ..Default::default()
    };
    let h = harness_with(ScriptedService::default(), CountingUi::default(), config).await;
    *h.service.on_create.lock().unwrap() = vec![
        Step::Error,
        Step::Error,
        Step::State(JobState::Running),
        Step::State(JobState::Succeeded),
    ];

    let (_, handle) = h.coordinator.start_training("s-1", request(), None).await.unwrap();
    let exit = handle.unwrap().await.unwrap();
    assert!(matches!(exit, PollExit::Terminal(CompletionOutcome::Deployed { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_poller_abandons_after_ceiling() {
    let config = CoordinatorConfig {
        max_monitor_minutes: 1,
        ..Default::default()
    };
    let h = harness_with(ScriptedService::default(), CountingUi::default(), config).await;
    *h.service.on_create.lock().unwrap() = vec![Step::State(JobState::Running)];

    let (_, handle) = h.coordinator.start_training("s-1", request(), None).await.unwrap();
    let exit = handle.unwrap().await.unwrap();
    assert_eq!(exit, PollExit::Abandoned);

    // Polls at 0, 10, ..., 50s; the 60s tick hits the ceiling.
    assert_eq!(h.service.status_calls.load(Ordering::SeqCst), 6);
    let session = h.store.get("s-1").await;
    assert_eq!(session.stage, Stage::Training);
    assert!(!session.completion_notified);
    assert!(session.conversation_history.is_empty());
    assert!(!h.coordinator.registry().is_monitoring("jobs/1").await);
}

#[tokio::test]
async fn test_sweep_finishes_unmonitored_sessions() {
    let h = harness(ScriptedService::default()).await;
    h.service.script("jobs/a", &[Step::State(JobState::Succeeded)]);
    h.service.script("jobs/b", &[Step::State(JobState::Running)]);
    seed_training(&h.store, "s-a", "jobs/a").await;
    seed_training(&h.store, "s-b", "jobs/b").await;

    let poller = h.coordinator.poller();
    assert_eq!(poller.sweep_once().await, 1);
    assert_eq!(poller.sweep_once().await, 0);

    assert_eq!(h.store.get("s-a").await.stage, Stage::Deployed);
    assert_eq!(h.store.get("s-b").await.stage, Stage::Training);
    assert_eq!(assistant_messages(&h.store.get("s-a").await), 1);
}

#[tokio::test]
async fn test_sweep_respects_status_error_tolerance() {
    let config = CoordinatorConfig {
        status_error_tolerance: 3,
        ..Default::default()
    };
    let h = harness_with(ScriptedService::default(), CountingUi::default(), config).await;
    h.service.script(
        "jobs/a",
        &[Step::Error, Step::State(JobState::Running), Step::State(JobState::Succeeded)],
    );
    seed_training(&h.store, "s-1", "jobs/a").await;

    let poller = h.coordinator.poller();
    assert_eq!(poller.sweep_once().await, 0);
    let session = h.store.get("s-1").await;
    assert_eq!(session.stage, Stage::Training);
    assert!(!session.completion_notified);
    assert!(session.conversation_history.is_empty());

    // Running, then the job finishes and is deployed normally.
    assert_eq!(poller.sweep_once().await, 0);
    assert_eq!(poller.sweep_once().await, 1);
    let session = h.store.get("s-1").await;
    assert_eq!(session.stage, Stage::Deployed);
    assert_eq!(assistant_messages(&session), 1);
}

#[tokio::test]
async fn test_sweep_fails_job_once_error_budget_is_spent() {
    let config = CoordinatorConfig {
        status_error_tolerance: 2,
        ..Default::default()
    };
    let h = harness_with(ScriptedService::default(), CountingUi::default(), config).await;
    h.service.script("jobs/a", &[Step::Error]);
    seed_training(&h.store, "s-1", "jobs/a").await;

    let poller = h.coordinator.poller();
    assert_eq!(poller.sweep_once().await, 0);
    assert_eq!(h.store.get("s-1").await.stage, Stage::Training);

    assert_eq!(poller.sweep_once().await, 1);
    let session = h.store.get("s-1").await;
    assert_eq!(session.stage, Stage::TrainingFailed);
    assert_eq!(assistant_messages(&session), 1);
}

#[tokio::test]
async fn test_status_check_error_within_tolerance_keeps_training() {
    let config = CoordinatorConfig {
        status_error_tolerance: 3,
        ..Default::default()
    };
    let h = harness_with(ScriptedService::default(), CountingUi::default(), config).await;
    h.service.script("jobs/a", &[Step::Error, Step::State(JobState::Running)]);
    seed_training(&h.store, "s-1", "jobs/a").await;

    let status = h.coordinator.training_status("s-1").await;
    assert!(status.has_active_job);
    assert_eq!(status.progress.real_state, "ERROR");
    assert_eq!(status.stage, "training");

    let session = h.store.get("s-1").await;
    assert!(!session.completion_notified);
    assert!(session.conversation_history.is_empty());

    let CompletionOutcome::StillRunning(_) = h.coordinator.complete("s-1").await else {
        panic!("expected the job to still be running");
    };
}

#[tokio::test]
async fn test_system_error_retires_job() {
    let h = harness(ScriptedService::default()).await;
    h.service.script("jobs/a", &[Step::State(JobState::Succeeded)]);
    seed_training(&h.store, "s-1", "jobs/a").await;

    // Every later save fails: the temp file path is taken by a directory.
    std::fs::create_dir(h.state_path.with_file_name("platform-state.json.tmp")).unwrap();

    assert_eq!(h.coordinator.complete("s-1").await, CompletionOutcome::SystemError);

    let session = h.store.get("s-1").await;
    assert!(session.completion_notified);
    assert_eq!(session.stage, Stage::TrainingFailed);
    assert!(session.current_training_job.is_none());
    assert_eq!(session.last_training_job.as_deref(), Some("jobs/a"));
    assert_eq!(assistant_messages(&session), 1);
    assert_eq!(
        session.conversation_history[0].metadata.as_ref().unwrap()["type"],
        "completion_error"
    );

    let status = h.coordinator.training_status("s-1").await;
    assert!(!status.has_active_job);
    assert_eq!(h.coordinator.complete("s-1").await, CompletionOutcome::NoActiveJob);
}

#[tokio::test(start_paused = true)]
async fn test_restart_resumes_persisted_jobs() {
    let h = harness(ScriptedService::default()).await;
    seed_training(&h.store, "s-1", "jobs/a").await;
    h.store.save().await.unwrap();

    // A fresh process: same state file, same remote service, empty registry.
    let store = Arc::new(SessionStore::load(&h.state_path).await.unwrap());
    h.service.script(
        "jobs/a",
        &[Step::State(JobState::Running), Step::State(JobState::Succeeded)],
    );
    let restarted = TrainingCoordinator::new(
        Arc::clone(&store),
        h.service.clone(),
        h.ui.clone(),
        CoordinatorConfig::default(),
    );

    let handles = restarted.poller().resume_active_jobs().await;
    assert_eq!(handles.len(), 1);
    for handle in handles {
        let exit = handle.await.unwrap();
        assert!(matches!(exit, PollExit::Terminal(CompletionOutcome::Deployed { .. })));
    }

    let session = store.get("s-1").await;
    assert_eq!(session.stage, Stage::Deployed);
    assert_eq!(assistant_messages(&session), 1);

    // The sweep after the fact finds nothing left to do.
    assert_eq!(restarted.poller().sweep_once().await, 0);
}

#[tokio::test]
async fn test_status_check_triggers_completion() {
    let h = harness(ScriptedService::default()).await;
    h.service.script("jobs/a", &[Step::State(JobState::Succeeded)]);
    seed_training(&h.store, "s-1", "jobs/a").await;

    let status = h.coordinator.training_status("s-1").await;
    assert!(status.has_active_job);
    assert!(status.is_complete);
    assert_eq!(status.progress.percentage, 100);
    assert_eq!(status.job_status.as_deref(), Some("succeeded"));
    assert_eq!(status.stage, "deployed");

    let idle = h.coordinator.training_status("s-1").await;
    assert!(!idle.has_active_job);
    assert_eq!(idle.progress.percentage, 0);
    assert_eq!(assistant_messages(&h.store.get("s-1").await), 1);
}

#[tokio::test]
async fn test_manual_deploy() {
    let h = harness(ScriptedService::default()).await;
    h.service.script("jobs/a", &[Step::State(JobState::Succeeded)]);
    seed_training(&h.store, "s-1", "jobs/a").await;
    h.coordinator.complete("s-1").await;

    let model_id = h.store.get("s-1").await.current_model.unwrap();
    let endpoint = h.coordinator.deploy_model("s-1", None).await.unwrap();
    assert_eq!(endpoint.model_id, model_id);
    assert_eq!(h.store.get("s-1").await.current_endpoint, Some(endpoint.id));

    let missing = h.coordinator.deploy_model("s-1", Some("nope")).await.unwrap_err();
    assert!(matches!(missing, CoordinatorError::NotFound(_)));
}
