//! Sample project: a gradle plugin build published to a dev repository,
//! gated by a composite build that collects its artifacts.

use crate::core::{
    BuildDefinition, BuildTemplate, Condition, Dependency, ExecutionEnvironment, Project, PublishMode,
    StepDefinition, TriggerDefinition, VcsRoot,
};
use crate::params::{MapSecretStore, ParameterResolver};
use std::collections::BTreeMap;
use std::sync::Arc;

/// VCS root id of the sample project.
pub const SAMPLE_VCS_ROOT: &str = "MicroserviceGradlePluginVcs";
/// Regular build id.
pub const BUILD: &str = "Build";
/// Composite build id.
pub const GENERAL: &str = "General";
/// Summary file written by the dev publication step.
pub const ARTIFACT_SUMMARY: &str = "build/distributions/published_artifacts.json";

const ENTRYPOINT: &str = "/usr/local/bin/docker-entrypoint.sh";
const LOADER_IMAGE: &str = "%dockerDevRepository%/teamcity/docker-images-loader:latest";
const JDK_IMAGE: &str = "bellsoft/liberica-openjdk-alpine:11";
const ARTIFACTS_IMAGE: &str = "teamcity/artifacts-management:1.0";

/// Template that derives the build number from the gradle version.
#[must_use]
pub fn build_number_template() -> BuildTemplate {
    BuildTemplate::new("SetBuildNumberBasedOnGradleVersion").with_step(
        StepDefinition::build_tool("RUNNER_20", "gradle", &["printVersion"])
            .named("Set build number")
            .in_environment(ExecutionEnvironment::image(JDK_IMAGE)),
    )
}

/// The `Build` definition.
#[must_use]
pub fn build_definition() -> BuildDefinition {
    let publish_env = |extra: &str| {
        ExecutionEnvironment::image(ARTIFACTS_IMAGE).with_run_parameters(&format!(
            "--env \"PLUGIN_TC_REPOSITORY_URL=%devRepositoryUrl%\"\n\
             --env \"PLUGIN_TC_USERNAME=%devRepositoryUsername%\"\n\
             --env \"PLUGIN_TC_PASSWORD=%devRepositoryPassword%\"\n\
             {extra}\n\
             --env \"PLUGIN_TC_LOG_LEVEL=DEBUG\""
        ))
    };

    BuildDefinition::regular(BUILD, "Build & Publish to Dev Env")
        .with_template("SetBuildNumberBasedOnGradleVersion")
        .with_vcs_root(SAMPLE_VCS_ROOT)
        .with_publish_mode(PublishMode::Successful)
        .with_artifact_rules(ARTIFACT_SUMMARY)
        .with_param("repoUser", "%automationUser%")
        .with_param("repoPass", "%automationPassword%")
        .with_param("dockerRegistry", "%dockerDevRepository%")
        .with_param("gradleArtifactsBasePath", "build/distributions")
        .with_step(
            StepDefinition::exec("PRELOAD_DOCKER_IMAGES", ENTRYPOINT, &["load"])
                .named("Preload Docker Images")
                .in_environment(ExecutionEnvironment::image(LOADER_IMAGE).with_run_parameters(&format!(
                    "--env \"PLUGIN_TC_REGISTRY_URL=%dockerDevRepository%\"\n\
                     --env \"PLUGIN_TC_DOCKER_IMAGES={JDK_IMAGE} {ARTIFACTS_IMAGE}\"\n\
                     -v /var/run/docker.sock:/var/run/docker.sock\n\
                     -v %env.HOME%/.docker/config.json:/root/.docker/config.json"
                ))),
        )
        .with_step(
            StepDefinition::build_tool("BUILD", "gradle", &["clean", "buildArtifactsForAllModule"])
                .named("Build Artifacts")
                .with_tool_parameters("-PrepoUser=%repoUser%\n-PrepoPass=%repoPass%\n-PgitBranch=%build.branch%")
                .in_environment(
                    ExecutionEnvironment::image(JDK_IMAGE)
                        .with_run_parameters("-v \"%build.checkout_dir%/local_m2:/root/.m2\""),
                ),
        )
        .with_step(
            StepDefinition::exec("PUBLISH_ARTIFACT_TO_DEV_BY_BUILD_NUMBER", ENTRYPOINT, &["maven-publish"])
                .named("Publish artifacts to Dev by Build number")
                .in_environment(publish_env(&format!(
                    "--env \"PLUGIN_TC_OUTPUT={ARTIFACT_SUMMARY}\"\n\
                     --env \"PLUGIN_TC_WITH_VERSION=%build.number%-SNAPSHOT\""
                ))),
        )
        .with_step(
            StepDefinition::exec("PUBLISH_ARTIFACT_TO_THIRD_PARTY", ENTRYPOINT, &["maven-publish"])
                .named("Publish artifacts to Third-Party")
                .when(Condition::equals("build.branch.is_default", "true"))
                .in_environment(publish_env("")),
        )
        .with_steps_order(&[
            "PRELOAD_DOCKER_IMAGES",
            "RUNNER_20",
            "BUILD",
            "PUBLISH_ARTIFACT_TO_DEV_BY_BUILD_NUMBER",
            "PUBLISH_ARTIFACT_TO_THIRD_PARTY",
        ])
        .with_trigger(TriggerDefinition::vcs())
}

/// The composite `General` definition.
#[must_use]
pub fn general_definition() -> BuildDefinition {
    BuildDefinition::composite(GENERAL, "General")
        .with_dependency(Dependency::snapshot(BUILD))
        .with_dependency(Dependency::artifacts(BUILD, "** => dependencies").clean_destination())
}

/// The whole sample project.
///
/// # Panics
///
/// Never; the definitions above are valid.
#[must_use]
#[allow(clippy::expect_used)]
pub fn sample_project() -> Project {
    Project::builder("MicroserviceGradlePlugin")
        .vcs_root(
            VcsRoot::new(SAMPLE_VCS_ROOT, "https://github.com/ikuchmin/microservice-gradle-plugin.git")
                .with_branch_spec("+:refs/heads/*"),
        )
        .template(build_number_template())
        .build_type(general_definition())
        .build_type(build_definition())
        .param("dockerDevRepository", "registry.dev.example.com")
        .param("mavenThirdPartyRepository", "https://maven.example.com/third-party")
        .param("devRepositoryUrl", "https://maven.dev.example.com")
        .param("devRepositoryUsername", "%automationUser%")
        .param("automationUser", "automation")
        .build()
        .expect("sample project is valid")
}

/// Secrets the sample project references.
#[must_use]
pub fn sample_secrets() -> MapSecretStore {
    MapSecretStore::new()
        .with("automationPassword", "s3cr3t-automation")
        .with("devRepositoryPassword", "s3cr3t-dev")
}

/// A resolver with the sample secrets and a fixed `env.HOME`.
#[must_use]
pub fn sample_parameters() -> ParameterResolver {
    ParameterResolver::new()
        .with_env(BTreeMap::from([("HOME".to_string(), "/home/agent".to_string())]))
        .with_secrets(Arc::new(sample_secrets()))
}
