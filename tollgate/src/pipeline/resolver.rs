//! Dependency ordering over a project's builds.

use crate::core::{BuildId, Project};
use crate::errors::{CycleDetectedError, TollgateError};
use std::collections::HashSet;

struct Frame<'a> {
    node: &'a str,
    deps: Vec<&'a str>,
    next: usize,
}

struct Walk<'a> {
    project: &'a Project,
    visited: HashSet<&'a str>,
    on_path: HashSet<&'a str>,
    path: Vec<&'a str>,
    order: Vec<BuildId>,
}

impl<'a> Walk<'a> {
    fn new(project: &'a Project) -> Self {
        Self {
            project,
            visited: HashSet::new(),
            on_path: HashSet::new(),
            path: Vec::new(),
            order: Vec::new(),
        }
    }

    fn enter(&mut self, node: &'a str) -> Frame<'a> {
        self.visited.insert(node);
        self.on_path.insert(node);
        self.path.push(node);
        let deps = self.project.build(node).map(|def| def.dependency_ids()).unwrap_or_default();
        Frame { node, deps, next: 0 }
    }

    /// Depth-first post-order from `root` on an explicit stack, so chain
    /// depth is not bounded by the thread stack.
    fn visit(&mut self, root: &'a str) -> Result<(), CycleDetectedError> {
        let mut stack = vec![self.enter(root)];

        while let Some(frame) = stack.last_mut() {
            let node = frame.node;
            let dep = frame.deps.get(frame.next).copied();
            frame.next += 1;

            match dep {
                Some(dep) if self.on_path.contains(dep) => {
                    let start = self.path.iter().position(|n| *n == dep).unwrap_or(0);
                    let mut cycle: Vec<String> = self.path[start..].iter().map(|n| (*n).to_string()).collect();
                    cycle.push(dep.to_string());
                    return Err(CycleDetectedError::new(cycle));
                }
                Some(dep) if !self.visited.contains(dep) => {
                    let frame = self.enter(dep);
                    stack.push(frame);
                }
                Some(_) => {}
                None => {
                    stack.pop();
                    self.path.pop();
                    self.on_path.remove(node);
                    self.order.push(node.to_string());
                }
            }
        }
        Ok(())
    }
}

/// Orders the transitive dependency closure of `target`.
///
/// For every edge `A -> B` the result lists `B` before `A`; the target
/// comes last. Siblings appear in declaration order.
///
/// # Errors
///
/// [`TollgateError::UnknownBuild`] for an unregistered target and
/// [`TollgateError::CycleDetected`] when the closure contains a cycle.
pub fn resolve(project: &Project, target: &str) -> Result<Vec<BuildId>, TollgateError> {
    let Some(def) = project.build(target) else {
        return Err(TollgateError::UnknownBuild(target.to_string()));
    };
    let mut walk = Walk::new(project);
    walk.visit(&def.id)?;
    Ok(walk.order)
}

/// Orders every build of the project, roots first.
///
/// # Errors
///
/// Returns the first cycle found.
pub fn resolve_all(project: &Project) -> Result<Vec<BuildId>, CycleDetectedError> {
    let mut walk = Walk::new(project);
    for def in project.builds() {
        if !walk.visited.contains(def.id.as_str()) {
            walk.visit(&def.id)?;
        }
    }
    Ok(walk.order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{BuildDefinition, Dependency, StepDefinition};
    use pretty_assertions::assert_eq;

    fn regular(id: &str) -> BuildDefinition {
        BuildDefinition::regular(id, id).with_step(StepDefinition::exec("S", "true", &[]))
    }

    fn diamond() -> Project {
        Project::builder("p")
            .build_type(regular("Lib"))
            .build_type(regular("Api").with_dependency(Dependency::snapshot("Lib")))
            .build_type(regular("Web").with_dependency(Dependency::artifacts("Lib", "*.jar")))
            .build_type(
                BuildDefinition::composite("All", "All")
                    .with_dependency(Dependency::snapshot("Web"))
                    .with_dependency(Dependency::snapshot("Api")),
            )
            .build()
            .unwrap()
    }

    fn position(order: &[BuildId], id: &str) -> usize {
        order.iter().position(|b| b == id).unwrap()
    }

    #[test]
    fn test_dependencies_precede_dependents() {
        let project = diamond();
        let order = resolve(&project, "All").unwrap();

        assert_eq!(order, vec!["Lib", "Web", "Api", "All"]);
        for def in project.builds() {
            for dep in def.dependency_ids() {
                assert!(position(&order, dep) < position(&order, &def.id));
            }
        }
    }

    #[test]
    fn test_resolve_only_closure() {
        let project = diamond();
        assert_eq!(resolve(&project, "Api").unwrap(), vec!["Lib", "Api"]);
        assert_eq!(resolve(&project, "Lib").unwrap(), vec!["Lib"]);
    }

    #[test]
    fn test_resolve_all_declaration_order() {
        let project = diamond();
        assert_eq!(resolve_all(&project).unwrap(), vec!["Lib", "Api", "Web", "All"]);
    }

    #[test]
    fn test_cycle_reports_path() {
        let project = Project::builder("p")
            .build_type(regular("A").with_dependency(Dependency::snapshot("B")))
            .build_type(regular("B").with_dependency(Dependency::artifacts("C", "**")))
            .build_type(regular("C").with_dependency(Dependency::snapshot("A")))
            .build_type(regular("Free"))
            .build()
            .unwrap();

        let err = resolve(&project, "A").unwrap_err();
        match err {
            TollgateError::CycleDetected(cycle) => {
                assert_eq!(cycle.cycle_path, vec!["A", "B", "C", "A"]);
            }
            other => panic!("expected cycle, got {other}"),
        }
        assert!(resolve_all(&project).is_err());
        assert_eq!(resolve(&project, "Free").unwrap(), vec!["Free"]);
    }

    #[test]
    fn test_unknown_target() {
        let project = diamond();
        assert!(matches!(
            resolve(&project, "Nope"),
            Err(TollgateError::UnknownBuild(id)) if id == "Nope"
        ));
    }

    #[test]
    fn test_deep_chain_resolves() {
        let depth = 20_000;
        let mut builder = Project::builder("chain").build_type(regular("B0"));
        for i in 1..depth {
            builder = builder.build_type(regular(&format!("B{i}")).with_dependency(Dependency::snapshot(format!("B{}", i - 1))));
        }
        let project = builder.build().unwrap();

        let order = resolve(&project, &format!("B{}", depth - 1)).unwrap();

        assert_eq!(order.len(), depth);
        assert_eq!(order.first().map(String::as_str), Some("B0"));
    }
}
