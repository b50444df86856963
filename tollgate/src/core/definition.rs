//! Declarative build, step, dependency and trigger definitions.
//!
//! Definitions are plain data. They are validated and frozen by
//! [`ProjectBuilder`](crate::core::ProjectBuilder); runs never mutate them.

use super::Condition;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Identifier of a build definition.
pub type BuildId = String;

/// Whether a build runs its own steps or only aggregates dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildType {
    /// A build with steps.
    #[default]
    Regular,
    /// A gate build: dependency resolution plus artifact aggregation.
    Composite,
}

/// When a finished run publishes its artifact rules output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishMode {
    /// Publish on every finished run, failed and cancelled ones included.
    Always,
    /// Publish only when the run succeeded.
    #[default]
    Successful,
    /// Never publish.
    Never,
}

impl PublishMode {
    /// Returns true if a run finishing with `status` publishes artifacts.
    #[must_use]
    pub fn publishes(&self, status: super::RunStatus) -> bool {
        match self {
            Self::Always => status.is_terminal(),
            Self::Successful => status == super::RunStatus::Success,
            Self::Never => false,
        }
    }
}

/// Image reference plus opaque run parameters for a sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionEnvironment {
    /// Container image; empty means run on the host.
    #[serde(default)]
    pub image: String,
    /// Run parameters (mounts, env vars), one entry per line.
    #[serde(default)]
    pub run_parameters: Vec<String>,
    /// Working directory inside the sandbox.
    #[serde(default)]
    pub working_dir: Option<String>,
}

impl ExecutionEnvironment {
    /// Creates an environment for an image with no run parameters.
    #[must_use]
    pub fn image(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Self::default()
        }
    }

    /// Adds run parameters from a multi-line block, one non-empty line each.
    #[must_use]
    pub fn with_run_parameters(mut self, block: &str) -> Self {
        self.run_parameters.extend(
            block
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(String::from),
        );
        self
    }

    /// Returns true if the environment runs directly on the host.
    #[must_use]
    pub fn is_host(&self) -> bool {
        self.image.trim().is_empty()
    }
}

/// What a step invokes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// Runs an executable with arguments.
    Exec {
        /// Executable path.
        path: String,
        /// Ordered arguments.
        #[serde(default)]
        arguments: Vec<String>,
    },
    /// Invokes a build tool (gradle, maven, ...) with tasks.
    BuildTool {
        /// Tool name, e.g. "gradle".
        tool: String,
        /// Tasks to run, in order.
        #[serde(default)]
        tasks: Vec<String>,
        /// Extra tool parameters such as `-Pkey=value`.
        #[serde(default)]
        parameters: Vec<String>,
        /// Use the project's wrapper script (`./gradlew`) instead of the tool.
        #[serde(default)]
        use_wrapper: bool,
    },
}

impl StepKind {
    /// The unresolved command line: executable first.
    #[must_use]
    pub fn command_line(&self) -> Vec<String> {
        match self {
            Self::Exec { path, arguments } => {
                let mut cmd = vec![path.clone()];
                cmd.extend(arguments.iter().cloned());
                cmd
            }
            Self::BuildTool {
                tool,
                tasks,
                parameters,
                use_wrapper,
            } => {
                let exe = if *use_wrapper {
                    format!("./{tool}w")
                } else {
                    tool.clone()
                };
                let mut cmd = vec![exe];
                cmd.extend(parameters.iter().cloned());
                cmd.extend(tasks.iter().cloned());
                cmd
            }
        }
    }
}

/// One step of a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Unique id within the build.
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// What the step runs.
    pub kind: StepKind,
    /// Sandbox environment; `None` runs on the host.
    #[serde(default)]
    pub environment: Option<ExecutionEnvironment>,
    /// Predicate evaluated once when the step is reached.
    #[serde(default)]
    pub condition: Option<Condition>,
    /// A failed best-effort step does not fail the run.
    #[serde(default)]
    pub best_effort: bool,
    /// Timeout for the command.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl StepDefinition {
    fn with_kind(id: impl Into<String>, kind: StepKind) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            kind,
            environment: None,
            condition: None,
            best_effort: false,
            timeout_secs: None,
        }
    }

    /// Creates an exec step.
    #[must_use]
    pub fn exec(id: impl Into<String>, path: impl Into<String>, arguments: &[&str]) -> Self {
        Self::with_kind(
            id,
            StepKind::Exec {
                path: path.into(),
                arguments: arguments.iter().map(|s| (*s).to_string()).collect(),
            },
        )
    }

    /// Creates a build tool step using the tool's wrapper script.
    #[must_use]
    pub fn build_tool(id: impl Into<String>, tool: impl Into<String>, tasks: &[&str]) -> Self {
        Self::with_kind(
            id,
            StepKind::BuildTool {
                tool: tool.into(),
                tasks: tasks.iter().map(|s| (*s).to_string()).collect(),
                parameters: Vec::new(),
                use_wrapper: true,
            },
        )
    }

    /// Sets the display name.
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Adds build tool parameters; ignored for exec steps.
    #[must_use]
    pub fn with_tool_parameters(mut self, block: &str) -> Self {
        if let StepKind::BuildTool { parameters, .. } = &mut self.kind {
            parameters.extend(
                block
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(String::from),
            );
        }
        self
    }

    /// Runs the step inside the given environment.
    #[must_use]
    pub fn in_environment(mut self, environment: ExecutionEnvironment) -> Self {
        self.environment = Some(environment);
        self
    }

    /// Guards the step with a condition.
    #[must_use]
    pub fn when(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    /// Marks the step best-effort.
    #[must_use]
    pub fn best_effort(mut self) -> Self {
        self.best_effort = true;
        self
    }

    /// Sets the step timeout.
    #[must_use]
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }
}

/// How a dependency constrains the dependent build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    /// Ordering only.
    Snapshot,
    /// Ordering plus an artifact copy into the dependent run.
    Artifact,
}

/// A dependency of one build on another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    /// The build depended upon.
    pub target: BuildId,
    /// Snapshot or artifact.
    pub kind: DependencyKind,
    /// Rules selecting which artifacts to copy (artifact dependencies).
    #[serde(default)]
    pub artifact_rules: String,
    /// Clear the destination namespace before copying.
    #[serde(default)]
    pub clean_destination: bool,
}

impl Dependency {
    /// An ordering-only dependency.
    #[must_use]
    pub fn snapshot(target: impl Into<BuildId>) -> Self {
        Self {
            target: target.into(),
            kind: DependencyKind::Snapshot,
            artifact_rules: String::new(),
            clean_destination: false,
        }
    }

    /// An artifact dependency copying what `rules` select.
    #[must_use]
    pub fn artifacts(target: impl Into<BuildId>, rules: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            kind: DependencyKind::Artifact,
            artifact_rules: rules.into(),
            clean_destination: false,
        }
    }

    /// Clears the destination before copying.
    #[must_use]
    pub fn clean_destination(mut self) -> Self {
        self.clean_destination = true;
        self
    }
}

/// An event source that enqueues runs of a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerDefinition {
    /// Fires on commits to the build's VCS root.
    Vcs {
        /// Extra `+:`/`-:` filter over logical branch names.
        #[serde(default)]
        branch_filter: Option<String>,
    },
    /// Fires when a run of an upstream build finishes.
    FinishedBuild {
        /// The upstream build.
        upstream: BuildId,
        /// Only fire when the upstream run succeeded.
        #[serde(default = "default_true")]
        successful_only: bool,
        /// Extra filter over logical branch names.
        #[serde(default)]
        branch_filter: Option<String>,
    },
}

fn default_true() -> bool {
    true
}

impl TriggerDefinition {
    /// A VCS trigger without a branch filter.
    #[must_use]
    pub fn vcs() -> Self {
        Self::Vcs { branch_filter: None }
    }

    /// A finished-build trigger firing on upstream success.
    #[must_use]
    pub fn finished_build(upstream: impl Into<BuildId>) -> Self {
        Self::FinishedBuild {
            upstream: upstream.into(),
            successful_only: true,
            branch_filter: None,
        }
    }
}

/// A declarative build pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildDefinition {
    /// Unique id.
    pub id: BuildId,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Regular or composite.
    #[serde(default)]
    pub build_type: BuildType,
    /// Templates whose steps and parameters are merged in.
    #[serde(default)]
    pub templates: Vec<String>,
    /// VCS root the build checks out.
    #[serde(default)]
    pub vcs_root: Option<String>,
    /// Step definitions.
    #[serde(default)]
    pub steps: Vec<StepDefinition>,
    /// Explicit execution order by step id.
    #[serde(default)]
    pub steps_order: Vec<String>,
    /// Dependencies on other builds.
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    /// Triggers.
    #[serde(default)]
    pub triggers: Vec<TriggerDefinition>,
    /// Build-scoped parameters.
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    /// Artifact publication mode.
    #[serde(default)]
    pub publish_mode: PublishMode,
    /// Artifact rules applied at publication.
    #[serde(default)]
    pub artifact_rules: String,
}

impl BuildDefinition {
    fn with_type(id: impl Into<BuildId>, name: impl Into<String>, build_type: BuildType) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            build_type,
            templates: Vec::new(),
            vcs_root: None,
            steps: Vec::new(),
            steps_order: Vec::new(),
            dependencies: Vec::new(),
            triggers: Vec::new(),
            parameters: BTreeMap::new(),
            publish_mode: PublishMode::default(),
            artifact_rules: String::new(),
        }
    }

    /// Creates a regular build.
    #[must_use]
    pub fn regular(id: impl Into<BuildId>, name: impl Into<String>) -> Self {
        Self::with_type(id, name, BuildType::Regular)
    }

    /// Creates a composite build.
    #[must_use]
    pub fn composite(id: impl Into<BuildId>, name: impl Into<String>) -> Self {
        Self::with_type(id, name, BuildType::Composite)
    }

    /// Attaches a template.
    #[must_use]
    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.templates.push(template.into());
        self
    }

    /// Sets the VCS root.
    #[must_use]
    pub fn with_vcs_root(mut self, root: impl Into<String>) -> Self {
        self.vcs_root = Some(root.into());
        self
    }

    /// Appends a step.
    #[must_use]
    pub fn with_step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    /// Sets the explicit step order.
    #[must_use]
    pub fn with_steps_order(mut self, order: &[&str]) -> Self {
        self.steps_order = order.iter().map(|s| (*s).to_string()).collect();
        self
    }

    /// Adds a dependency.
    #[must_use]
    pub fn with_dependency(mut self, dependency: Dependency) -> Self {
        self.dependencies.push(dependency);
        self
    }

    /// Adds a trigger.
    #[must_use]
    pub fn with_trigger(mut self, trigger: TriggerDefinition) -> Self {
        self.triggers.push(trigger);
        self
    }

    /// Sets a build parameter.
    #[must_use]
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    /// Sets the publish mode.
    #[must_use]
    pub fn with_publish_mode(mut self, mode: PublishMode) -> Self {
        self.publish_mode = mode;
        self
    }

    /// Sets the artifact rules.
    #[must_use]
    pub fn with_artifact_rules(mut self, rules: impl Into<String>) -> Self {
        self.artifact_rules = rules.into();
        self
    }

    /// Distinct ids of the builds this one depends on, in declaration order.
    #[must_use]
    pub fn dependency_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = Vec::new();
        for dep in &self.dependencies {
            if !ids.contains(&dep.target.as_str()) {
                ids.push(&dep.target);
            }
        }
        ids
    }

    /// Artifact dependencies only.
    pub fn artifact_dependencies(&self) -> impl Iterator<Item = &Dependency> {
        self.dependencies
            .iter()
            .filter(|dep| dep.kind == DependencyKind::Artifact)
    }

    /// Returns true for composite builds.
    #[must_use]
    pub fn is_composite(&self) -> bool {
        self.build_type == BuildType::Composite
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::RunStatus;

    #[test]
    fn test_publish_mode() {
        assert!(PublishMode::Always.publishes(RunStatus::Failed));
        assert!(PublishMode::Always.publishes(RunStatus::Success));
        assert!(PublishMode::Successful.publishes(RunStatus::Success));
        assert!(!PublishMode::Successful.publishes(RunStatus::Failed));
        assert!(!PublishMode::Never.publishes(RunStatus::Success));
    }

    #[test]
    fn test_exec_command_line() {
        let step = StepDefinition::exec("PRELOAD", "/usr/local/bin/docker-entrypoint.sh", &["load"]);
        assert_eq!(
            step.kind.command_line(),
            vec!["/usr/local/bin/docker-entrypoint.sh", "load"]
        );
        assert_eq!(step.name, "PRELOAD");
    }

    #[test]
    fn test_build_tool_command_line() {
        let step = StepDefinition::build_tool("BUILD", "gradle", &["clean", "buildArtifactsForAllModule"])
            .with_tool_parameters("-PrepoUser=%repoUser%\n  -PgitBranch=%build.branch%\n");

        assert_eq!(
            step.kind.command_line(),
            vec![
                "./gradlew",
                "-PrepoUser=%repoUser%",
                "-PgitBranch=%build.branch%",
                "clean",
                "buildArtifactsForAllModule",
            ]
        );
    }

    #[test]
    fn test_environment_run_parameters_block() {
        let env = ExecutionEnvironment::image("bellsoft/liberica-openjdk-alpine:11")
            .with_run_parameters("\n  --env \"A=1\"\n\n  -v /var/run/docker.sock:/var/run/docker.sock\n");

        assert_eq!(env.run_parameters.len(), 2);
        assert_eq!(env.run_parameters[0], "--env \"A=1\"");
        assert!(!env.is_host());
        assert!(ExecutionEnvironment::default().is_host());
    }

    #[test]
    fn test_dependency_ids_deduplicated() {
        let def = BuildDefinition::composite("General", "General")
            .with_dependency(Dependency::snapshot("Build"))
            .with_dependency(Dependency::artifacts("Build", "** => dependencies").clean_destination());

        assert_eq!(def.dependency_ids(), vec!["Build"]);
        assert_eq!(def.artifact_dependencies().count(), 1);
        assert!(def.is_composite());
    }

    #[test]
    fn test_definition_deserialize_defaults() {
        let json = r#"{
            "id": "Build",
            "steps": [{"id": "BUILD", "kind": {"type": "exec", "path": "make"}}],
            "triggers": [{"type": "finished_build", "upstream": "Lib"}]
        }"#;
        let def: BuildDefinition = serde_json::from_str(json).unwrap();

        assert_eq!(def.build_type, BuildType::Regular);
        assert_eq!(def.publish_mode, PublishMode::Successful);
        assert_eq!(def.steps[0].kind.command_line(), vec!["make"]);
        assert_eq!(
            def.triggers[0],
            TriggerDefinition::FinishedBuild {
                upstream: "Lib".into(),
                successful_only: true,
                branch_filter: None,
            }
        );
    }
}
