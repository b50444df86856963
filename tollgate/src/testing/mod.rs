//! Test support: a scripted sandbox and a sample project.

mod fixtures;
mod mocks;

pub use fixtures::{
    build_definition, build_number_template, general_definition, sample_parameters, sample_project,
    sample_secrets, ARTIFACT_SUMMARY, BUILD, GENERAL, SAMPLE_VCS_ROOT,
};
pub use mocks::{MockSandbox, Script};
