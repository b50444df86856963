//! End-to-end tests: engine, orchestrator, scheduler and triggers together.

#[cfg(test)]
mod tests {
    use crate::artifacts::MissingArtifactPolicy;
    use crate::config::EngineConfig;
    use crate::core::{
        BuildDefinition, Dependency, Project, PublishMode, RunRequest, RunStatus, StepDefinition, StepStatus,
        TriggerCause, TriggerDefinition, VcsRoot,
    };
    use crate::engine::Engine;
    use crate::errors::TollgateError;
    use crate::events::{names, CollectingEventSink, EventSink};
    use crate::params::MASK;
    use crate::pipeline::{resolve, JitterStrategy, RetryPolicy};
    use crate::sandbox::ExecutionSandbox;
    use crate::testing::{
        sample_parameters, sample_project, MockSandbox, Script, ARTIFACT_SUMMARY, BUILD, GENERAL, SAMPLE_VCS_ROOT,
    };
    use crate::triggers::TriggerEvent;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    const SUMMARY: &str = r#"{"published":["microservice-gradle-plugin-1.0.0.jar"]}"#;

    fn fast_config(work: &TempDir) -> EngineConfig {
        EngineConfig {
            work_root: work.path().to_path_buf(),
            retry: RetryPolicy::default()
                .with_base_delay_ms(1)
                .with_jitter(JitterStrategy::None),
            termination_grace_secs: 1,
            ..EngineConfig::default()
        }
    }

    fn engine(project: Project, sandbox: &Arc<MockSandbox>, config: EngineConfig) -> (Engine, Arc<CollectingEventSink>) {
        let events = Arc::new(CollectingEventSink::new());
        let engine = Engine::builder(project)
            .config(config)
            .sandbox(Arc::clone(sandbox) as Arc<dyn ExecutionSandbox>)
            .events(Arc::clone(&events) as Arc<dyn EventSink>)
            .parameters(sample_parameters())
            .build()
            .unwrap();
        (engine, events)
    }

    fn publishing_sandbox() -> MockSandbox {
        MockSandbox::new().on("maven-publish", Script::write(ARTIFACT_SUMMARY, SUMMARY))
    }

    fn single(build: BuildDefinition) -> Project {
        Project::builder("single").build_type(build).build().unwrap()
    }

    fn diamond() -> Project {
        Project::builder("diamond")
            .build_type(BuildDefinition::regular("Lib", "Lib").with_step(StepDefinition::exec("LIB", "make", &["lib"])))
            .build_type(
                BuildDefinition::regular("Api", "Api")
                    .with_dependency(Dependency::snapshot("Lib"))
                    .with_step(StepDefinition::exec("API", "make", &["api"])),
            )
            .build_type(
                BuildDefinition::regular("Web", "Web")
                    .with_dependency(Dependency::snapshot("Lib"))
                    .with_step(StepDefinition::exec("WEB", "make", &["web"])),
            )
            .build_type(
                BuildDefinition::composite("All", "All")
                    .with_dependency(Dependency::snapshot("Api"))
                    .with_dependency(Dependency::snapshot("Web")),
            )
            .build()
            .unwrap()
    }

    fn triggered_project() -> Project {
        Project::builder("triggers")
            .vcs_root(VcsRoot::new("Repo", "https://example.com/repo.git").with_branch_spec("+:refs/heads/*"))
            .build_type(
                BuildDefinition::regular("Compile", "Compile")
                    .with_vcs_root("Repo")
                    .with_step(StepDefinition::exec("COMPILE", "make", &["all"]))
                    .with_trigger(TriggerDefinition::vcs()),
            )
            .build_type(
                BuildDefinition::regular("Deploy", "Deploy")
                    .with_step(StepDefinition::exec("DEPLOY", "deploy", &["--env", "dev"]))
                    .with_trigger(TriggerDefinition::finished_build("Compile")),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn test_sample_project_order() {
        let project = sample_project();
        assert_eq!(resolve(&project, GENERAL).unwrap(), vec!["Build".to_string(), "General".to_string()]);
        assert_eq!(resolve(&project, BUILD).unwrap(), vec!["Build".to_string()]);
    }

    #[tokio::test]
    async fn test_build_on_feature_branch_skips_third_party_publication() {
        let work = TempDir::new().unwrap();
        let sandbox = Arc::new(publishing_sandbox());
        let (engine, _) = engine(sample_project(), &sandbox, fast_config(&work));

        let report = engine.run(RunRequest::manual(BUILD, "feature-x", false)).await.unwrap();

        assert_eq!(report.status, RunStatus::Success);
        let run = report.target_run().unwrap();
        let statuses: Vec<(&str, StepStatus)> = run.steps.iter().map(|s| (s.step_id.as_str(), s.status)).collect();
        assert_eq!(
            statuses,
            vec![
                ("PRELOAD_DOCKER_IMAGES", StepStatus::Success),
                ("RUNNER_20", StepStatus::Success),
                ("BUILD", StepStatus::Success),
                ("PUBLISH_ARTIFACT_TO_DEV_BY_BUILD_NUMBER", StepStatus::Success),
                ("PUBLISH_ARTIFACT_TO_THIRD_PARTY", StepStatus::Skipped),
            ]
        );

        let paths: Vec<&str> = run.artifacts.iter().map(|a| a.path.as_str()).collect();
        assert_eq!(paths, vec!["published_artifacts.json"]);
        assert!(run.checkout_dir.join(ARTIFACT_SUMMARY).exists());
        assert_eq!(sandbox.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_build_substitutes_parameters_and_masks_secrets() {
        let work = TempDir::new().unwrap();
        let sandbox = Arc::new(publishing_sandbox());
        let (engine, _) = engine(sample_project(), &sandbox, fast_config(&work));

        let report = engine.run(RunRequest::manual(BUILD, "feature-x", false)).await.unwrap();
        let run = report.target_run().unwrap();

        let gradle = sandbox
            .command_lines()
            .into_iter()
            .find(|line| line.contains("buildArtifactsForAllModule"))
            .unwrap();
        assert!(gradle.contains("-PrepoUser=automation"));
        assert!(gradle.contains("-PrepoPass=s3cr3t-automation"));
        assert!(gradle.contains("-PgitBranch=feature-x"));

        let images: Vec<String> = sandbox.environments().iter().map(|e| e.image.clone()).collect();
        assert!(images.contains(&"registry.dev.example.com/teamcity/docker-images-loader:latest".to_string()));

        let log_ref = run.step("BUILD").unwrap().log_ref.clone().unwrap();
        let log = engine.logs().get(&log_ref).unwrap();
        assert!(!log.contains("s3cr3t-automation"));
        assert!(log.contains(&format!("-PrepoPass={MASK}")));
    }

    #[tokio::test]
    async fn test_build_on_default_branch_publishes_to_third_party() {
        let work = TempDir::new().unwrap();
        let sandbox = Arc::new(publishing_sandbox());
        let (engine, _) = engine(sample_project(), &sandbox, fast_config(&work));

        let report = engine.run(RunRequest::manual(BUILD, "main", true)).await.unwrap();

        assert!(report.is_success());
        let run = report.target_run().unwrap();
        assert_eq!(run.step("PUBLISH_ARTIFACT_TO_THIRD_PARTY").unwrap().status, StepStatus::Success);
        let publishes = sandbox
            .command_lines()
            .iter()
            .filter(|line| line.contains("maven-publish"))
            .count();
        assert_eq!(publishes, 2);
    }

    #[tokio::test]
    async fn test_general_collects_build_artifacts() {
        let work = TempDir::new().unwrap();
        let sandbox = Arc::new(publishing_sandbox());
        let (engine, events) = engine(sample_project(), &sandbox, fast_config(&work));

        let report = engine.run(RunRequest::manual(GENERAL, "main", true)).await.unwrap();

        assert_eq!(report.status, RunStatus::Success);
        let order: Vec<&str> = report.runs.iter().map(|r| r.build_id.as_str()).collect();
        assert_eq!(order, vec!["Build", "General"]);

        let general = report.run_for(GENERAL).unwrap();
        assert_eq!(general.status, RunStatus::Success);
        assert!(general.steps.is_empty());
        let artifact = general
            .artifacts
            .iter()
            .find(|a| a.path == "dependencies/published_artifacts.json")
            .unwrap();
        let content = engine.artifacts().read(&artifact.id).await.unwrap();
        assert_eq!(String::from_utf8(content).unwrap(), SUMMARY);

        assert_eq!(events.events_of_type(names::ARTIFACTS_COPIED).len(), 1);
    }

    #[tokio::test]
    async fn test_failed_build_fails_general_without_running_it() {
        let work = TempDir::new().unwrap();
        let sandbox = Arc::new(publishing_sandbox().on("buildArtifactsForAllModule", Script::exit(1)));
        let (engine, _) = engine(sample_project(), &sandbox, fast_config(&work));

        let report = engine.run(RunRequest::manual(GENERAL, "main", true)).await.unwrap();

        assert_eq!(report.status, RunStatus::Failed);
        let build = report.run_for(BUILD).unwrap();
        assert_eq!(build.status, RunStatus::Failed);
        let failure = build.failure.as_ref().unwrap();
        assert_eq!(failure.code, "step_failed");
        assert_eq!(failure.step_id.as_deref(), Some("BUILD"));
        assert!(build.artifacts.is_empty());
        assert!(!sandbox.command_lines().iter().any(|line| line.contains("maven-publish")));

        let general = report.run_for(GENERAL).unwrap();
        assert_eq!(general.status, RunStatus::Failed);
        assert_eq!(general.failure.as_ref().unwrap().code, "dependency_failed");
        assert!(general.started_at.is_none());
        assert!(general.artifacts.is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_image_fails_at_first_step_using_it() {
        let work = TempDir::new().unwrap();
        let sandbox = Arc::new(publishing_sandbox().with_unavailable_image("bellsoft/liberica-openjdk-alpine:11"));
        let (engine, _) = engine(sample_project(), &sandbox, fast_config(&work));

        let report = engine.run(RunRequest::manual(BUILD, "main", true)).await.unwrap();

        let run = report.target_run().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        let failure = run.failure.as_ref().unwrap();
        assert_eq!(failure.code, "image_unavailable");
        assert_eq!(failure.step_id.as_deref(), Some("RUNNER_20"));
        assert_eq!(run.steps.len(), 2);
    }

    #[tokio::test]
    async fn test_transient_acquisition_failures_are_retried() {
        let work = TempDir::new().unwrap();
        let sandbox = Arc::new(MockSandbox::new().exhausted_for(2));
        let project = single(BuildDefinition::regular("Lint", "Lint").with_step(StepDefinition::exec("LINT", "lint", &[])));
        let (engine, _) = engine(project, &sandbox, fast_config(&work));

        let report = engine.run(RunRequest::manual("Lint", "main", true)).await.unwrap();

        assert!(report.is_success());
        assert_eq!(report.target_run().unwrap().step("LINT").unwrap().attempts, 3);
        assert_eq!(sandbox.acquire_attempts(), 3);
        assert_eq!(sandbox.acquired(), 1);
    }

    #[tokio::test]
    async fn test_best_effort_failure_does_not_fail_run() {
        let work = TempDir::new().unwrap();
        let sandbox = Arc::new(MockSandbox::new().on("lint", Script::exit(3)));
        let project = single(
            BuildDefinition::regular("Check", "Check")
                .with_step(StepDefinition::exec("LINT", "lint", &["--strict"]).best_effort())
                .with_step(StepDefinition::exec("TEST", "test", &[])),
        );
        let (engine, _) = engine(project, &sandbox, fast_config(&work));

        let report = engine.run(RunRequest::manual("Check", "main", true)).await.unwrap();

        let run = report.target_run().unwrap();
        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(run.step("LINT").unwrap().status, StepStatus::Failed);
        assert_eq!(run.step("LINT").unwrap().exit_code, Some(3));
        assert_eq!(run.step("TEST").unwrap().status, StepStatus::Success);
        assert!(run.failure.is_none());
    }

    #[tokio::test]
    async fn test_failure_aborts_remaining_steps() {
        let work = TempDir::new().unwrap();
        let sandbox = Arc::new(MockSandbox::new().on("compile", Script::exit(1)));
        let project = single(
            BuildDefinition::regular("Chain", "Chain")
                .with_step(StepDefinition::exec("COMPILE", "compile", &[]))
                .with_step(StepDefinition::exec("PACKAGE", "package", &[])),
        );
        let (engine, _) = engine(project, &sandbox, fast_config(&work));

        let report = engine.run(RunRequest::manual("Chain", "main", true)).await.unwrap();

        let run = report.target_run().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.steps.len(), 1);
        assert!(run.step("PACKAGE").is_none());
        assert_eq!(sandbox.commands().len(), 1);
    }

    fn reporting_build(mode: PublishMode) -> BuildDefinition {
        BuildDefinition::regular("Report", "Report")
            .with_publish_mode(mode)
            .with_artifact_rules("out/** => reports")
            .with_step(StepDefinition::exec("WRITE", "write-report", &[]))
            .with_step(StepDefinition::exec("VERIFY", "verify", &[]))
    }

    #[tokio::test]
    async fn test_publish_always_keeps_artifacts_of_failed_run() {
        let work = TempDir::new().unwrap();
        let sandbox = Arc::new(
            MockSandbox::new()
                .on("write-report", Script::write("out/summary.txt", "3 failures"))
                .on("verify", Script::exit(1)),
        );
        let (engine, events) = engine(single(reporting_build(PublishMode::Always)), &sandbox, fast_config(&work));

        let report = engine.run(RunRequest::manual("Report", "main", true)).await.unwrap();

        let run = report.target_run().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        let paths: Vec<&str> = run.artifacts.iter().map(|a| a.path.as_str()).collect();
        assert_eq!(paths, vec!["reports/summary.txt"]);
        assert_eq!(events.events_of_type(names::ARTIFACTS_PUBLISHED).len(), 1);
    }

    #[tokio::test]
    async fn test_publish_successful_skips_failed_run() {
        let work = TempDir::new().unwrap();
        let sandbox = Arc::new(
            MockSandbox::new()
                .on("write-report", Script::write("out/summary.txt", "3 failures"))
                .on("verify", Script::exit(1)),
        );
        let (engine, events) = engine(single(reporting_build(PublishMode::Successful)), &sandbox, fast_config(&work));

        let report = engine.run(RunRequest::manual("Report", "main", true)).await.unwrap();

        let run = report.target_run().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.artifacts.is_empty());
        assert!(engine.artifacts().list(run.id).await.unwrap().is_empty());
        assert!(events.events_of_type(names::ARTIFACTS_PUBLISHED).is_empty());
    }

    #[tokio::test]
    async fn test_publish_never_stores_nothing() {
        let work = TempDir::new().unwrap();
        let sandbox = Arc::new(MockSandbox::new().on("write-report", Script::write("out/summary.txt", "clean")));
        let (engine, _) = engine(single(reporting_build(PublishMode::Never)), &sandbox, fast_config(&work));

        let report = engine.run(RunRequest::manual("Report", "main", true)).await.unwrap();

        let run = report.target_run().unwrap();
        assert_eq!(run.status, RunStatus::Success);
        assert!(run.checkout_dir.join("out/summary.txt").exists());
        assert!(engine.artifacts().list(run.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_artifacts_fail_run_under_fail_policy() {
        let work = TempDir::new().unwrap();
        let sandbox = Arc::new(MockSandbox::new());
        let config = EngineConfig {
            missing_artifact_policy: MissingArtifactPolicy::Fail,
            ..fast_config(&work)
        };
        let (engine, _) = engine(sample_project(), &sandbox, config);

        let report = engine.run(RunRequest::manual(BUILD, "main", true)).await.unwrap();

        let run = report.target_run().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.failure.as_ref().unwrap().code, "artifact_publication");
        assert!(run.steps.iter().all(|s| s.status == StepStatus::Success));
    }

    #[tokio::test]
    async fn test_missing_artifacts_only_warn_by_default() {
        let work = TempDir::new().unwrap();
        let sandbox = Arc::new(MockSandbox::new());
        let (engine, _) = engine(sample_project(), &sandbox, fast_config(&work));

        let report = engine.run(RunRequest::manual(GENERAL, "main", true)).await.unwrap();

        assert_eq!(report.status, RunStatus::Success);
        assert!(report.run_for(BUILD).unwrap().artifacts.is_empty());
        assert!(report.run_for(GENERAL).unwrap().artifacts.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_mid_step_releases_sandbox() {
        let work = TempDir::new().unwrap();
        let sandbox = Arc::new(MockSandbox::new().on("serve", Script::Hang));
        let project = single(
            BuildDefinition::regular("Long", "Long")
                .with_step(StepDefinition::exec("SERVE", "serve", &["--forever"]))
                .with_step(StepDefinition::exec("AFTER", "after", &[])),
        );
        let (engine, _) = engine(project, &sandbox, fast_config(&work));

        let (report, cancelled) = tokio::join!(engine.run(RunRequest::manual("Long", "main", true)), async {
            for _ in 0..1000 {
                if !sandbox.commands().is_empty() {
                    let runs = engine.runs().runs_for("Long");
                    if let Some(run) = runs.first() {
                        return engine.cancel(run.id, "user abort");
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            false
        });

        assert!(cancelled);
        let report = report.unwrap();
        assert_eq!(report.status, RunStatus::Cancelled);
        let run = report.target_run().unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
        assert_eq!(run.step("SERVE").unwrap().status, StepStatus::Cancelled);
        assert!(run.step("AFTER").is_none());
        let failure = run.failure.as_ref().unwrap();
        assert_eq!(failure.code, "cancelled");
        assert_eq!(failure.step_id.as_deref(), Some("SERVE"));
        assert_eq!(sandbox.outstanding(), 0);
        assert!(sandbox.terminated() >= 1);
    }

    #[tokio::test]
    async fn test_cancel_before_start_runs_nothing() {
        let work = TempDir::new().unwrap();
        let sandbox = Arc::new(MockSandbox::new());
        let project = single(BuildDefinition::regular("Lint", "Lint").with_step(StepDefinition::exec("LINT", "lint", &[])));
        let (engine, _) = engine(project, &sandbox, fast_config(&work));
        let scheduler = engine.scheduler();

        let run = scheduler
            .create_run(engine.project(), &RunRequest::manual("Lint", "main", true))
            .await
            .unwrap();
        assert!(scheduler.cancel(run.id, "superseded"));
        let run = scheduler.execute(engine.project(), run).await.unwrap();

        assert_eq!(run.status, RunStatus::Cancelled);
        assert!(run.steps.is_empty());
        assert_eq!(sandbox.acquire_attempts(), 0);
        assert!(!scheduler.cancel(run.id, "again"));
    }

    #[tokio::test]
    async fn test_successful_dependency_run_is_reused() {
        let work = TempDir::new().unwrap();
        let sandbox = Arc::new(publishing_sandbox());
        let (engine, _) = engine(sample_project(), &sandbox, fast_config(&work));

        let first = engine.run(RunRequest::manual(BUILD, "main", true)).await.unwrap();
        let commands = sandbox.commands().len();
        let second = engine.run(RunRequest::manual(GENERAL, "main", true)).await.unwrap();

        assert!(second.is_success());
        assert_eq!(second.reused, vec![first.target_run().unwrap().id]);
        assert_eq!(sandbox.commands().len(), commands);
        let general = second.run_for(GENERAL).unwrap();
        assert!(general
            .artifacts
            .iter()
            .any(|a| a.path == "dependencies/published_artifacts.json"));
    }

    #[tokio::test]
    async fn test_reuse_disabled_runs_dependency_again() {
        let work = TempDir::new().unwrap();
        let sandbox = Arc::new(publishing_sandbox());
        let config = EngineConfig {
            reuse_successful_runs: false,
            ..fast_config(&work)
        };
        let (engine, _) = engine(sample_project(), &sandbox, config);

        engine.run(RunRequest::manual(BUILD, "main", true)).await.unwrap();
        let second = engine.run(RunRequest::manual(GENERAL, "main", true)).await.unwrap();

        assert!(second.reused.is_empty());
        assert_eq!(second.run_for(BUILD).unwrap().build_number, 2);
    }

    #[tokio::test]
    async fn test_reuse_is_per_branch() {
        let work = TempDir::new().unwrap();
        let sandbox = Arc::new(publishing_sandbox());
        let (engine, _) = engine(sample_project(), &sandbox, fast_config(&work));

        engine.run(RunRequest::manual(BUILD, "main", true)).await.unwrap();
        let other = engine.run(RunRequest::manual(GENERAL, "feature-x", false)).await.unwrap();

        assert!(other.reused.is_empty());
        assert_eq!(other.run_for(BUILD).unwrap().branch, "feature-x");
    }

    #[tokio::test]
    async fn test_diamond_dependents_start_after_shared_dependency() {
        let work = TempDir::new().unwrap();
        let sandbox = Arc::new(MockSandbox::new());
        let config = EngineConfig {
            max_parallel_runs: 2,
            ..fast_config(&work)
        };
        let (engine, _) = engine(diamond(), &sandbox, config);

        let report = engine.run(RunRequest::manual("All", "main", true)).await.unwrap();

        assert!(report.is_success());
        assert_eq!(report.runs.len(), 4);
        assert_eq!(report.runs.last().unwrap().build_id, "All");
        let lib_done = report.run_for("Lib").unwrap().finished_at.unwrap();
        for id in ["Api", "Web"] {
            assert!(report.run_for(id).unwrap().started_at.unwrap() >= lib_done);
        }
        let all_started = report.run_for("All").unwrap().started_at.unwrap();
        assert!(all_started >= report.run_for("Api").unwrap().finished_at.unwrap());
        assert!(all_started >= report.run_for("Web").unwrap().finished_at.unwrap());
    }

    #[tokio::test]
    async fn test_cycle_is_rejected_before_any_run() {
        let work = TempDir::new().unwrap();
        let sandbox = Arc::new(MockSandbox::new());
        let project = Project::builder("cyclic")
            .build_type(BuildDefinition::regular("A", "A").with_dependency(Dependency::snapshot("B")))
            .build_type(BuildDefinition::regular("B", "B").with_dependency(Dependency::snapshot("A")))
            .build()
            .unwrap();
        let (engine, _) = engine(project, &sandbox, fast_config(&work));

        let err = engine.run(RunRequest::manual("A", "main", true)).await.unwrap_err();

        match err {
            TollgateError::CycleDetected(e) => assert_eq!(e.cycle_path, vec!["A", "B", "A"]),
            other => panic!("expected a cycle, got {other}"),
        }
        assert!(engine.runs().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_build_is_rejected() {
        let work = TempDir::new().unwrap();
        let sandbox = Arc::new(MockSandbox::new());
        let (engine, _) = engine(sample_project(), &sandbox, fast_config(&work));

        let err = engine.run(RunRequest::manual("Nope", "main", true)).await.unwrap_err();
        assert!(matches!(err, TollgateError::UnknownBuild(id) if id == "Nope"));
    }

    #[tokio::test]
    async fn test_run_events_in_lifecycle_order() {
        let work = TempDir::new().unwrap();
        let sandbox = Arc::new(MockSandbox::new());
        let project = single(BuildDefinition::regular("Lint", "Lint").with_step(StepDefinition::exec("LINT", "lint", &[])));
        let (engine, events) = engine(project, &sandbox, fast_config(&work));

        engine.run(RunRequest::manual("Lint", "main", true)).await.unwrap();

        assert_eq!(
            events.event_types(),
            vec![
                names::RUN_CREATED,
                names::RUN_STARTED,
                names::STEP_FINISHED,
                names::ARTIFACTS_PUBLISHED,
                names::RUN_FINISHED,
            ]
        );
        let (_, payload) = events.events_of_type(names::RUN_FINISHED).pop().unwrap();
        assert_eq!(payload.unwrap()["status"], "success");
    }

    #[tokio::test]
    async fn test_vcs_change_on_sample_root_runs_build() {
        let work = TempDir::new().unwrap();
        let sandbox = Arc::new(publishing_sandbox());
        let (engine, events) = engine(sample_project(), &sandbox, fast_config(&work));

        engine.submit(TriggerEvent::VcsChange {
            vcs_root: SAMPLE_VCS_ROOT.to_string(),
            git_ref: "refs/heads/main".to_string(),
            revision: "4f1c2e9".to_string(),
        });
        let reports = engine.drain_queue().await.unwrap();

        assert_eq!(reports.len(), 1);
        let run = reports[0].target_run().unwrap();
        assert_eq!(run.build_id, BUILD);
        assert_eq!(run.branch, "main");
        assert!(run.is_default_branch);
        assert!(matches!(&run.cause, TriggerCause::Vcs { revision } if revision == "4f1c2e9"));
        assert_eq!(events.events_of_type(names::TRIGGER_FIRED).len(), 1);
    }

    #[tokio::test]
    async fn test_finished_build_trigger_chains_runs() {
        let work = TempDir::new().unwrap();
        let sandbox = Arc::new(MockSandbox::new());
        let (engine, _) = engine(triggered_project(), &sandbox, fast_config(&work));

        engine.submit(TriggerEvent::VcsChange {
            vcs_root: "Repo".to_string(),
            git_ref: "refs/heads/feature-x".to_string(),
            revision: "abc123".to_string(),
        });
        let reports = engine.drain_queue().await.unwrap();

        let targets: Vec<&str> = reports.iter().map(|r| r.target.as_str()).collect();
        assert_eq!(targets, vec!["Compile", "Deploy"]);
        let compile = reports[0].target_run().unwrap();
        let deploy = reports[1].target_run().unwrap();
        assert_eq!(deploy.branch, "feature-x");
        assert!(!deploy.is_default_branch);
        assert!(matches!(
            &deploy.cause,
            TriggerCause::FinishedBuild { upstream, run_id } if upstream == "Compile" && *run_id == compile.id
        ));
    }

    #[tokio::test]
    async fn test_failed_upstream_does_not_fire_finished_build_trigger() {
        let work = TempDir::new().unwrap();
        let sandbox = Arc::new(MockSandbox::new().on("make", Script::exit(2)));
        let (engine, _) = engine(triggered_project(), &sandbox, fast_config(&work));

        engine.submit(TriggerEvent::VcsChange {
            vcs_root: "Repo".to_string(),
            git_ref: "refs/heads/main".to_string(),
            revision: "abc123".to_string(),
        });
        let reports = engine.drain_queue().await.unwrap();

        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].status, RunStatus::Failed);
        assert!(engine.triggers().pending_requests().is_empty());
    }

    #[tokio::test]
    async fn test_ref_outside_branch_spec_is_ignored() {
        let work = TempDir::new().unwrap();
        let sandbox = Arc::new(MockSandbox::new());
        let (engine, _) = engine(triggered_project(), &sandbox, fast_config(&work));

        engine.submit(TriggerEvent::VcsChange {
            vcs_root: "Repo".to_string(),
            git_ref: "refs/tags/v1.0.0".to_string(),
            revision: "abc123".to_string(),
        });
        let reports = engine.drain_queue().await.unwrap();

        assert!(reports.is_empty());
        assert!(sandbox.commands().is_empty());
    }

    #[tokio::test]
    async fn test_artifact_retention_prunes_old_runs() {
        let work = TempDir::new().unwrap();
        let sandbox = Arc::new(publishing_sandbox());
        let config = EngineConfig {
            artifact_retention: Some(1),
            reuse_successful_runs: false,
            ..fast_config(&work)
        };
        let (engine, _) = engine(sample_project(), &sandbox, config);

        let first = engine.run(RunRequest::manual(BUILD, "main", true)).await.unwrap();
        let second = engine.run(RunRequest::manual(BUILD, "main", true)).await.unwrap();

        let first_id = first.target_run().unwrap().id;
        let second_id = second.target_run().unwrap().id;
        assert!(engine.artifacts().list(first_id).await.unwrap().is_empty());
        assert_eq!(engine.artifacts().list(second_id).await.unwrap().len(), 1);
    }

    fn retained_project() -> Project {
        Project::builder("retention")
            .build_type(
                BuildDefinition::regular("Package", "Package")
                    .with_param("mode", "release")
                    .with_step(StepDefinition::exec("PACKAGE", "make", &["%mode%"]))
                    .with_artifact_rules("out/app.jar")
                    .with_publish_mode(PublishMode::Always),
            )
            .build_type(
                BuildDefinition::composite("Bundle", "Bundle")
                    .with_dependency(Dependency::artifacts("Package", "app.jar => dependencies")),
            )
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_retention_never_reuses_a_pruned_run() {
        let work = TempDir::new().unwrap();
        let sandbox = Arc::new(
            MockSandbox::new()
                .on("make release", Script::write("out/app.jar", "jar"))
                .on("make broken", Script::exit(1)),
        );
        let config = EngineConfig {
            artifact_retention: Some(1),
            ..fast_config(&work)
        };
        let (engine, _) = engine(retained_project(), &sandbox, config);

        let good = engine.run(RunRequest::manual("Package", "main", true)).await.unwrap();
        assert_eq!(good.status, RunStatus::Success);
        let good_run = good.target_run().unwrap().clone();
        assert_eq!(good_run.artifacts.len(), 1);

        let broken = engine
            .run(RunRequest::manual("Package", "main", true).with_param("mode", "broken"))
            .await
            .unwrap();
        assert_eq!(broken.status, RunStatus::Failed);

        assert!(engine.runs().get(good_run.id).is_none());
        let good_log = good_run.step("PACKAGE").and_then(|s| s.log_ref.clone()).unwrap();
        assert!(engine.logs().get(&good_log).is_none());

        let bundle = engine.run(RunRequest::manual("Bundle", "main", true)).await.unwrap();

        assert_eq!(bundle.status, RunStatus::Success);
        assert!(bundle.reused.is_empty());
        assert_eq!(bundle.run_for("Package").unwrap().build_number, 3);
        let bundled: Vec<&str> = bundle
            .run_for("Bundle")
            .unwrap()
            .artifacts
            .iter()
            .map(|a| a.path.as_str())
            .collect();
        assert_eq!(bundled, vec!["dependencies/app.jar"]);
    }

    #[tokio::test]
    async fn test_unwritable_work_root_fails_the_run() {
        let work = TempDir::new().unwrap();
        let blocker = work.path().join("not-a-dir");
        std::fs::write(&blocker, "file").unwrap();
        let sandbox = Arc::new(publishing_sandbox());
        let config = EngineConfig {
            work_root: blocker,
            ..fast_config(&work)
        };
        let (engine, _) = engine(sample_project(), &sandbox, config);

        let report = engine.run(RunRequest::manual(BUILD, "main", true)).await.unwrap();

        assert_eq!(report.status, RunStatus::Failed);
        let run = report.target_run().unwrap();
        assert_eq!(run.failure.as_ref().unwrap().code, "checkout_unavailable");
        assert!(run.started_at.is_none());
        let stored: Vec<RunStatus> = engine.runs().runs_for(BUILD).iter().map(|r| r.status).collect();
        assert_eq!(stored, vec![RunStatus::Failed]);
        assert!(sandbox.command_lines().is_empty());
    }
}
