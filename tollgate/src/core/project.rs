//! Projects: VCS roots, templates and build definitions validated together.

use super::{BuildDefinition, StepDefinition, TriggerDefinition};
use crate::artifacts::ArtifactRules;
use crate::errors::{codes, ConfigurationError, ErrorInfo};
use crate::triggers::BranchSpec;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// A git repository builds check out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VcsRoot {
    /// Unique id.
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Clone URL.
    pub url: String,
    /// Branches the root monitors.
    #[serde(default = "default_branch_spec")]
    pub branch_spec: String,
    /// Full ref of the default branch.
    #[serde(default = "default_branch")]
    pub default_branch: String,
}

fn default_branch_spec() -> String {
    "+:refs/heads/*".to_string()
}

fn default_branch() -> String {
    "refs/heads/main".to_string()
}

impl VcsRoot {
    /// Creates a root with the default branch spec.
    #[must_use]
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            url: url.into(),
            branch_spec: default_branch_spec(),
            default_branch: default_branch(),
        }
    }

    /// Sets the branch spec.
    #[must_use]
    pub fn with_branch_spec(mut self, spec: impl Into<String>) -> Self {
        self.branch_spec = spec.into();
        self
    }

    /// Sets the default branch ref.
    #[must_use]
    pub fn with_default_branch(mut self, git_ref: impl Into<String>) -> Self {
        self.default_branch = git_ref.into();
        self
    }
}

/// Steps and parameters shared by several builds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildTemplate {
    /// Unique id.
    pub id: String,
    /// Template steps.
    #[serde(default)]
    pub steps: Vec<StepDefinition>,
    /// Template step order.
    #[serde(default)]
    pub steps_order: Vec<String>,
    /// Template parameters.
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

impl BuildTemplate {
    /// Creates an empty template.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            steps: Vec::new(),
            steps_order: Vec::new(),
            parameters: BTreeMap::new(),
        }
    }

    /// Appends a step.
    #[must_use]
    pub fn with_step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    /// Sets a parameter.
    #[must_use]
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }
}

/// The structured document a project is loaded from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectDocument {
    /// Project id.
    #[serde(default)]
    pub id: String,
    /// VCS roots.
    #[serde(default)]
    pub vcs_roots: Vec<VcsRoot>,
    /// Templates.
    #[serde(default)]
    pub templates: Vec<BuildTemplate>,
    /// Build definitions.
    #[serde(default)]
    pub builds: Vec<BuildDefinition>,
    /// Project (global scope) parameters.
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

/// A validated, immutable set of build definitions.
#[derive(Debug, Clone)]
pub struct Project {
    id: String,
    vcs_roots: HashMap<String, VcsRoot>,
    builds: Vec<Arc<BuildDefinition>>,
    index: HashMap<String, usize>,
    parameters: BTreeMap<String, String>,
}

impl Project {
    /// Starts building a project.
    #[must_use]
    pub fn builder(id: impl Into<String>) -> ProjectBuilder {
        ProjectBuilder::new(id)
    }

    /// Validates a deserialized project document.
    pub fn from_document(doc: ProjectDocument) -> Result<Self, ConfigurationError> {
        let mut builder = ProjectBuilder::new(doc.id);
        for root in doc.vcs_roots {
            builder = builder.vcs_root(root);
        }
        for template in doc.templates {
            builder = builder.template(template);
        }
        for build in doc.builds {
            builder = builder.build_type(build);
        }
        for (name, value) in doc.parameters {
            builder = builder.param(name, value);
        }
        builder.build()
    }

    /// Parses and validates a JSON project document.
    pub fn from_json(json: &str) -> Result<Self, crate::errors::TollgateError> {
        let doc: ProjectDocument = serde_json::from_str(json)?;
        Ok(Self::from_document(doc)?)
    }

    /// Project id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Looks up a build definition.
    #[must_use]
    pub fn build(&self, id: &str) -> Option<&Arc<BuildDefinition>> {
        self.index.get(id).map(|&i| &self.builds[i])
    }

    /// All builds in declaration order.
    pub fn builds(&self) -> impl Iterator<Item = &Arc<BuildDefinition>> {
        self.builds.iter()
    }

    /// Looks up a VCS root.
    #[must_use]
    pub fn vcs_root(&self, id: &str) -> Option<&VcsRoot> {
        self.vcs_roots.get(id)
    }

    /// Project-level parameters.
    #[must_use]
    pub fn parameters(&self) -> &BTreeMap<String, String> {
        &self.parameters
    }

    /// Declaration position of a build, used for deterministic ordering.
    #[must_use]
    pub fn position(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }
}

/// Builder performing every registration-time check.
#[derive(Debug, Clone, Default)]
pub struct ProjectBuilder {
    id: String,
    vcs_roots: Vec<VcsRoot>,
    templates: Vec<BuildTemplate>,
    builds: Vec<BuildDefinition>,
    parameters: BTreeMap<String, String>,
}

impl ProjectBuilder {
    /// Creates a builder.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Registers a VCS root.
    #[must_use]
    pub fn vcs_root(mut self, root: VcsRoot) -> Self {
        self.vcs_roots.push(root);
        self
    }

    /// Registers a template.
    #[must_use]
    pub fn template(mut self, template: BuildTemplate) -> Self {
        self.templates.push(template);
        self
    }

    /// Registers a build definition.
    #[must_use]
    pub fn build_type(mut self, build: BuildDefinition) -> Self {
        self.builds.push(build);
        self
    }

    /// Sets a project parameter.
    #[must_use]
    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    /// Validates everything and freezes the project.
    ///
    /// Templates are merged into their builds and each build's steps are
    /// stored in effective execution order. Dependency cycles are not
    /// rejected here; they only block the targets that reach them.
    /// Finished-build triggers that fire each other in a loop are
    /// rejected.
    pub fn build(self) -> Result<Project, ConfigurationError> {
        let mut vcs_roots = HashMap::new();
        for root in self.vcs_roots {
            require_id(&root.id, "VCS root")?;
            BranchSpec::parse(&root.branch_spec).map_err(|e| {
                ConfigurationError::coded(
                    codes::INVALID_BRANCH_SPEC,
                    format!("VCS root '{}' has an invalid branch spec: {e}", root.id),
                )
            })?;
            if vcs_roots.contains_key(&root.id) {
                return Err(duplicate("VCS root", &root.id));
            }
            vcs_roots.insert(root.id.clone(), root);
        }

        let mut templates = HashMap::new();
        for template in self.templates {
            require_id(&template.id, "template")?;
            if templates.contains_key(&template.id) {
                return Err(duplicate("template", &template.id));
            }
            templates.insert(template.id.clone(), template);
        }

        let mut ids = HashSet::new();
        for build in &self.builds {
            require_id(&build.id, "build")?;
            if !ids.insert(build.id.clone()) {
                return Err(duplicate("build", &build.id));
            }
        }

        let mut builds = Vec::with_capacity(self.builds.len());
        let mut index = HashMap::new();
        for build in self.builds {
            let build = merge_templates(build, &templates)?;
            validate_build(&build, &ids, &vcs_roots)?;
            index.insert(build.id.clone(), builds.len());
            builds.push(Arc::new(build));
        }

        if let Some(cycle) = trigger_cycle(&builds) {
            let path = cycle.join(" -> ");
            return Err(ConfigurationError::new(format!("Finished-build triggers form a cycle: {path}"))
                .for_build(&cycle[0])
                .with_error_info(
                    ErrorInfo::new(codes::TRIGGER_CYCLE, format!("Builds trigger each other: {path}"))
                        .with_fix_hint("Remove one finished-build trigger in the cycle.")
                        .with_context_entry("cycle_path", path.clone()),
                ));
        }

        Ok(Project {
            id: self.id,
            vcs_roots,
            builds,
            index,
            parameters: self.parameters,
        })
    }
}

fn require_id(id: &str, what: &str) -> Result<(), ConfigurationError> {
    if id.trim().is_empty() {
        return Err(ConfigurationError::coded(
            codes::EMPTY_ID,
            format!("A {what} id cannot be empty or whitespace-only"),
        ));
    }
    Ok(())
}

fn duplicate(what: &str, id: &str) -> ConfigurationError {
    ConfigurationError::coded(codes::DUPLICATE_ID, format!("Duplicate {what} id '{id}'"))
}

/// Merges templates and normalises the step order.
fn merge_templates(
    mut build: BuildDefinition,
    templates: &HashMap<String, BuildTemplate>,
) -> Result<BuildDefinition, ConfigurationError> {
    let mut seen = HashSet::new();
    for step in &build.steps {
        if !seen.insert(step.id.clone()) {
            return Err(ConfigurationError::new(format!(
                "Build '{}' defines step '{}' more than once",
                build.id, step.id
            ))
            .for_build(&build.id)
            .with_error_info(ErrorInfo::new(codes::DUPLICATE_STEP, "Step ids must be unique")));
        }
    }

    let mut steps: Vec<StepDefinition> = Vec::new();
    let mut template_order: Vec<String> = Vec::new();
    let mut parameters = BTreeMap::new();

    for template_id in &build.templates {
        let template = templates.get(template_id).ok_or_else(|| {
            ConfigurationError::new(format!(
                "Build '{}' uses unknown template '{template_id}'",
                build.id
            ))
            .for_build(&build.id)
            .with_error_info(ErrorInfo::new(codes::UNKNOWN_TEMPLATE, "Template not found"))
        })?;
        for step in &template.steps {
            steps.retain(|s| s.id != step.id);
            steps.push(step.clone());
        }
        template_order.extend(template.steps_order.iter().cloned());
        parameters.extend(template.parameters.clone());
    }

    for step in std::mem::take(&mut build.steps) {
        if let Some(existing) = steps.iter_mut().find(|s| s.id == step.id) {
            *existing = step;
        } else {
            steps.push(step);
        }
    }
    parameters.extend(std::mem::take(&mut build.parameters));

    let declared_order = if build.steps_order.is_empty() {
        template_order
    } else {
        std::mem::take(&mut build.steps_order)
    };

    let mut ordered = Vec::with_capacity(steps.len());
    for id in &declared_order {
        if ordered.iter().any(|s: &StepDefinition| &s.id == id) {
            continue;
        }
        let step = steps.iter().find(|s| &s.id == id).ok_or_else(|| {
            ConfigurationError::new(format!(
                "Build '{}' lists step '{id}' in its steps order but defines no such step",
                build.id
            ))
            .for_build(&build.id)
            .with_error_info(
                ErrorInfo::new(codes::MISSING_STEP, format!("Step '{id}' not found"))
                    .with_fix_hint("Define the step, attach the template providing it, or drop it from the order."),
            )
        })?;
        ordered.push(step.clone());
    }
    for step in steps {
        if !ordered.iter().any(|s| s.id == step.id) {
            ordered.push(step);
        }
    }

    build.steps_order = ordered.iter().map(|s| s.id.clone()).collect();
    build.steps = ordered;
    build.parameters = parameters;
    Ok(build)
}

fn validate_build(
    build: &BuildDefinition,
    ids: &HashSet<String>,
    vcs_roots: &HashMap<String, VcsRoot>,
) -> Result<(), ConfigurationError> {
    if build.is_composite() && !build.steps.is_empty() {
        return Err(ConfigurationError::coded(
            codes::COMPOSITE_STEPS,
            format!("Composite build '{}' cannot declare steps", build.id),
        )
        .for_build(&build.id));
    }

    if let Some(root) = &build.vcs_root {
        if !vcs_roots.contains_key(root) {
            return Err(ConfigurationError::coded(
                codes::UNKNOWN_VCS_ROOT,
                format!("Build '{}' uses unknown VCS root '{root}'", build.id),
            )
            .for_build(&build.id));
        }
    }

    ArtifactRules::parse(&build.artifact_rules).map_err(|e| invalid_rule(&build.id, &e))?;

    for dep in &build.dependencies {
        if dep.target == build.id {
            return Err(ConfigurationError::coded(
                codes::SELF_DEPENDENCY,
                format!("Build '{}' cannot depend on itself", build.id),
            )
            .for_build(&build.id));
        }
        if !ids.contains(&dep.target) {
            return Err(unknown_build(&build.id, &dep.target));
        }
        ArtifactRules::parse(&dep.artifact_rules).map_err(|e| invalid_rule(&build.id, &e))?;
    }

    for trigger in &build.triggers {
        let filter = match trigger {
            TriggerDefinition::Vcs { branch_filter } => {
                if build.vcs_root.is_none() {
                    return Err(ConfigurationError::coded(
                        codes::UNKNOWN_VCS_ROOT,
                        format!("Build '{}' has a VCS trigger but no VCS root", build.id),
                    )
                    .for_build(&build.id));
                }
                branch_filter
            }
            TriggerDefinition::FinishedBuild {
                upstream,
                branch_filter,
                ..
            } => {
                if !ids.contains(upstream) {
                    return Err(unknown_build(&build.id, upstream));
                }
                branch_filter
            }
        };
        if let Some(filter) = filter {
            BranchSpec::parse(filter).map_err(|e| {
                ConfigurationError::coded(
                    codes::INVALID_BRANCH_SPEC,
                    format!("Build '{}' has an invalid trigger branch filter: {e}", build.id),
                )
                .for_build(&build.id)
            })?;
        }
    }

    Ok(())
}

/// Finds a loop in the "upstream finishing fires downstream" graph. The
/// path starts and ends with the same build.
fn trigger_cycle(builds: &[Arc<BuildDefinition>]) -> Option<Vec<String>> {
    let mut fires: HashMap<&str, Vec<&str>> = HashMap::new();
    for build in builds {
        for trigger in &build.triggers {
            if let TriggerDefinition::FinishedBuild { upstream, .. } = trigger {
                fires.entry(upstream.as_str()).or_default().push(build.id.as_str());
            }
        }
    }

    let mut done: HashSet<&str> = HashSet::new();
    for root in builds.iter().map(|b| b.id.as_str()) {
        if done.contains(root) {
            continue;
        }
        let mut path: Vec<&str> = vec![root];
        let mut next: Vec<usize> = vec![0];
        while let Some(&node) = path.last() {
            let Some(index) = next.last_mut() else { break };
            let downstream = fires.get(node).and_then(|targets| targets.get(*index)).copied();
            *index += 1;
            match downstream {
                Some(target) if path.contains(&target) => {
                    let start = path.iter().position(|n| *n == target).unwrap_or(0);
                    let mut cycle: Vec<String> = path[start..].iter().map(|n| (*n).to_string()).collect();
                    cycle.push(target.to_string());
                    return Some(cycle);
                }
                Some(target) if !done.contains(target) => {
                    path.push(target);
                    next.push(0);
                }
                Some(_) => {}
                None => {
                    done.insert(node);
                    path.pop();
                    next.pop();
                }
            }
        }
    }
    None
}

fn unknown_build(build: &str, target: &str) -> ConfigurationError {
    ConfigurationError::new(format!("Build '{build}' references unknown build '{target}'"))
        .for_build(build)
        .with_error_info(
            ErrorInfo::new(codes::UNKNOWN_BUILD, format!("Build '{target}' not found"))
                .with_fix_hint("Register the referenced build in the same project."),
        )
}

fn invalid_rule(build: &str, err: &impl std::fmt::Display) -> ConfigurationError {
    ConfigurationError::coded(
        codes::INVALID_RULE,
        format!("Build '{build}' has invalid artifact rules: {err}"),
    )
    .for_build(build)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Dependency, StepDefinition};
    use pretty_assertions::assert_eq;

    fn step(id: &str) -> StepDefinition {
        StepDefinition::exec(id, "true", &[])
    }

    #[test]
    fn test_template_steps_merged_in_order() {
        let project = Project::builder("p")
            .template(BuildTemplate::new("SetBuildNumber").with_step(step("RUNNER_20")).with_param("a", "template"))
            .build_type(
                BuildDefinition::regular("Build", "Build")
                    .with_template("SetBuildNumber")
                    .with_step(step("PRELOAD"))
                    .with_step(step("BUILD"))
                    .with_steps_order(&["PRELOAD", "RUNNER_20", "BUILD"])
                    .with_param("a", "own"),
            )
            .build()
            .unwrap();

        let build = project.build("Build").unwrap();
        assert_eq!(build.steps_order, vec!["PRELOAD", "RUNNER_20", "BUILD"]);
        assert_eq!(build.steps[1].id, "RUNNER_20");
        assert_eq!(build.parameters.get("a").map(String::as_str), Some("own"));
    }

    #[test]
    fn test_unlisted_steps_appended() {
        let project = Project::builder("p")
            .build_type(
                BuildDefinition::regular("Build", "Build")
                    .with_step(step("A"))
                    .with_step(step("B"))
                    .with_step(step("C"))
                    .with_steps_order(&["C", "A"]),
            )
            .build()
            .unwrap();

        assert_eq!(project.build("Build").unwrap().steps_order, vec!["C", "A", "B"]);
    }

    #[test]
    fn test_missing_step_in_order_rejected() {
        let err = Project::builder("p")
            .build_type(
                BuildDefinition::regular("Build", "Build")
                    .with_step(step("BUILD"))
                    .with_steps_order(&["RUNNER_20", "BUILD"]),
            )
            .build()
            .unwrap_err();

        assert_eq!(err.code(), Some(codes::MISSING_STEP));
        assert_eq!(err.build.as_deref(), Some("Build"));
    }

    #[test]
    fn test_duplicate_step_rejected() {
        let err = Project::builder("p")
            .build_type(BuildDefinition::regular("Build", "Build").with_step(step("A")).with_step(step("A")))
            .build()
            .unwrap_err();
        assert_eq!(err.code(), Some(codes::DUPLICATE_STEP));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let err = Project::builder("p")
            .build_type(BuildDefinition::composite("General", "General").with_dependency(Dependency::snapshot("Build")))
            .build()
            .unwrap_err();
        assert_eq!(err.code(), Some(codes::UNKNOWN_BUILD));
    }

    #[test]
    fn test_composite_with_steps_rejected() {
        let err = Project::builder("p")
            .build_type(BuildDefinition::composite("General", "General").with_step(step("A")))
            .build()
            .unwrap_err();
        assert_eq!(err.code(), Some(codes::COMPOSITE_STEPS));
    }

    #[test]
    fn test_self_dependency_rejected() {
        let err = Project::builder("p")
            .build_type(BuildDefinition::regular("A", "A").with_dependency(Dependency::snapshot("A")))
            .build()
            .unwrap_err();
        assert_eq!(err.code(), Some(codes::SELF_DEPENDENCY));
    }

    #[test]
    fn test_vcs_trigger_requires_root() {
        let err = Project::builder("p")
            .build_type(BuildDefinition::regular("A", "A").with_trigger(TriggerDefinition::vcs()))
            .build()
            .unwrap_err();
        assert_eq!(err.code(), Some(codes::UNKNOWN_VCS_ROOT));
    }

    #[test]
    fn test_mutual_finished_build_triggers_rejected() {
        let err = Project::builder("p")
            .build_type(BuildDefinition::regular("A", "A").with_trigger(TriggerDefinition::finished_build("B")))
            .build_type(BuildDefinition::regular("B", "B").with_trigger(TriggerDefinition::finished_build("A")))
            .build()
            .unwrap_err();

        assert_eq!(err.code(), Some(codes::TRIGGER_CYCLE));
        assert_eq!(err.build.as_deref(), Some("A"));
        let info = err.error_info.unwrap();
        assert_eq!(info.context.get("cycle_path").map(String::as_str), Some("A -> B -> A"));
    }

    #[test]
    fn test_self_triggering_build_rejected() {
        let err = Project::builder("p")
            .build_type(BuildDefinition::regular("Nightly", "Nightly").with_trigger(TriggerDefinition::finished_build("Nightly")))
            .build()
            .unwrap_err();
        assert_eq!(err.code(), Some(codes::TRIGGER_CYCLE));
        assert!(err.message.ends_with("Nightly -> Nightly"));
    }

    #[test]
    fn test_trigger_chain_without_loop_accepted() {
        let project = Project::builder("p")
            .build_type(BuildDefinition::regular("Compile", "Compile"))
            .build_type(BuildDefinition::regular("Test", "Test").with_trigger(TriggerDefinition::finished_build("Compile")))
            .build_type(BuildDefinition::regular("Deploy", "Deploy").with_trigger(TriggerDefinition::finished_build("Test")))
            .build_type(BuildDefinition::regular("Audit", "Audit").with_trigger(TriggerDefinition::finished_build("Compile")))
            .build();
        assert!(project.is_ok());
    }

    #[test]
    fn test_cycles_are_not_a_registration_error() {
        let project = Project::builder("p")
            .build_type(BuildDefinition::regular("A", "A").with_dependency(Dependency::snapshot("B")))
            .build_type(BuildDefinition::regular("B", "B").with_dependency(Dependency::snapshot("A")))
            .build();
        assert!(project.is_ok());
    }

    #[test]
    fn test_from_json_document() {
        let json = r#"{
            "id": "MicroserviceGradlePlugin",
            "vcs_roots": [{"id": "Vcs", "url": "https://example.com/repo.git"}],
            "builds": [
                {"id": "Build", "vcs_root": "Vcs", "triggers": [{"type": "vcs"}],
                 "steps": [{"id": "BUILD", "kind": {"type": "exec", "path": "make"}}]},
                {"id": "General", "build_type": "composite",
                 "dependencies": [{"target": "Build", "kind": "artifact", "artifact_rules": "** => dependencies", "clean_destination": true}]}
            ],
            "parameters": {"dockerDevRepository": "registry.local"}
        }"#;
        let project = Project::from_json(json).unwrap();

        assert_eq!(project.id(), "MicroserviceGradlePlugin");
        assert_eq!(project.builds().count(), 2);
        assert_eq!(project.vcs_root("Vcs").unwrap().branch_spec, "+:refs/heads/*");
        assert_eq!(project.position("General"), Some(1));
    }
}
