use std::collections::{HashMap, VecDeque};

use weave_core::error::{Result, WeaveError};
use weave_core::traits::ToolInvoker;
use weave_core::types::{ExecutionMode, ToolChain, ToolStep, Vars};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// Which steps consume which outputs.
///
/// Step `i` depends on step `j` when one of `i`'s inputs is `j`'s output
/// variable, wherever `j` sits in the chain. A built graph is acyclic.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    dependencies: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
    /// Inputs no step produces, as (step, input).
    unresolved: Vec<(usize, String)>,
}

impl DependencyGraph {
    /// Build the graph, rejecting duplicate outputs, nested fallbacks and cycles.
    ///
    /// A fallback stands in for its primary, so it may only write the
    /// primary's output variable.
    pub fn build(steps: &[ToolStep]) -> Result<Self> {
        let mut producers: HashMap<&str, usize> = HashMap::new();
        for (i, step) in steps.iter().enumerate() {
            if let Some(fb) = step.fallback.as_deref() {
                if fb.fallback.is_some() {
                    return Err(WeaveError::FallbackTooDeep { step: i });
                }
                if let Some(name) = fb.output_var.as_deref() {
                    if step.output_var.as_deref() != Some(name) {
                        return Err(WeaveError::FallbackOutput {
                            step: i,
                            name: name.to_string(),
                        });
                    }
                }
            }
            if let Some(name) = step.output_var.as_deref() {
                if let Some(&first) = producers.get(name) {
                    return Err(WeaveError::DuplicateOutput {
                        name: name.to_string(),
                        first,
                        second: i,
                    });
                }
                producers.insert(name, i);
            }
        }

        let mut dependencies = vec![Vec::new(); steps.len()];
        let mut dependents = vec![Vec::new(); steps.len()];
        let mut unresolved = Vec::new();
        for (i, step) in steps.iter().enumerate() {
            for input in &step.input_vars {
                match producers.get(input.as_str()) {
                    Some(&j) => {
                        if !dependencies[i].contains(&j) {
                            dependencies[i].push(j);
                            dependents[j].push(i);
                        }
                    }
                    None => unresolved.push((i, input.clone())),
                }
            }
        }

        let graph = Self {
            dependencies,
            dependents,
            unresolved,
        };
        if let Some(cycle) = graph.find_cycle() {
            let cycle = cycle
                .iter()
                .map(|i| i.to_string())
                .collect::<Vec<_>>()
                .join(" -> ");
            return Err(WeaveError::DependencyCycle { cycle });
        }
        Ok(graph)
    }

    pub fn len(&self) -> usize {
        self.dependencies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dependencies.is_empty()
    }

    /// Steps that must succeed before `step` may start.
    pub fn dependencies(&self, step: usize) -> &[usize] {
        self.dependencies.get(step).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Steps that consume an output of `step`.
    pub fn dependents(&self, step: usize) -> &[usize] {
        self.dependents.get(step).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn unresolved(&self) -> &[(usize, String)] {
        &self.unresolved
    }

    /// A topological order, ties broken by step index.
    pub fn topological_order(&self) -> Vec<usize> {
        let mut remaining: Vec<usize> = self.dependencies.iter().map(Vec::len).collect();
        let mut ready: VecDeque<usize> = (0..self.len()).filter(|&i| remaining[i] == 0).collect();
        let mut order = Vec::with_capacity(self.len());

        while let Some(step) = ready.pop_front() {
            order.push(step);
            let mut unlocked = Vec::new();
            for &next in self.dependents(step) {
                remaining[next] -= 1;
                if remaining[next] == 0 {
                    unlocked.push(next);
                }
            }
            unlocked.sort_unstable();
            ready.extend(unlocked);
        }
        order
    }

    /// First cycle found by depth-first search, as a closed path of step indices.
    fn find_cycle(&self) -> Option<Vec<usize>> {
        let mut marks = vec![Mark::Unvisited; self.len()];
        let mut path = Vec::new();
        for start in 0..self.len() {
            if marks[start] == Mark::Unvisited {
                if let Some(cycle) = self.visit(start, &mut marks, &mut path) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    fn visit(&self, node: usize, marks: &mut [Mark], path: &mut Vec<usize>) -> Option<Vec<usize>> {
        marks[node] = Mark::InProgress;
        path.push(node);
        for &dep in &self.dependencies[node] {
            match marks[dep] {
                Mark::InProgress => {
                    let from = path.iter().position(|&p| p == dep).unwrap_or(0);
                    let mut cycle = path[from..].to_vec();
                    cycle.push(dep);
                    return Some(cycle);
                }
                Mark::Unvisited => {
                    if let Some(cycle) = self.visit(dep, marks, path) {
                        return Some(cycle);
                    }
                }
                Mark::Done => {}
            }
        }
        path.pop();
        marks[node] = Mark::Done;
        None
    }
}

/// Validate a chain before any tool runs.
///
/// Checks tool names against `invoker`, builds the dependency graph and,
/// outside pipelines, requires every input to come from a step or `seed`.
/// Sequential chains may only consume outputs of earlier steps.
pub fn validate_chain(
    chain: &ToolChain,
    seed: &Vars,
    invoker: &dyn ToolInvoker,
) -> Result<DependencyGraph> {
    for (i, step) in chain.steps.iter().enumerate() {
        if step.tool.trim().is_empty() {
            return Err(WeaveError::ToolValidation(format!("step {} names no tool", i)));
        }
        if !invoker.has_tool(&step.tool) {
            return Err(WeaveError::ToolNotFound(step.tool.clone()));
        }
        if let Some(fb) = &step.fallback {
            if !invoker.has_tool(&fb.tool) {
                return Err(WeaveError::ToolNotFound(fb.tool.clone()));
            }
        }
    }

    let graph = DependencyGraph::build(&chain.steps)?;

    // Pipeline stages also read fields of the unit they process.
    if chain.mode != ExecutionMode::Pipeline {
        if let Some((step, input)) = graph
            .unresolved()
            .iter()
            .find(|(_, input)| !seed.contains_key(input))
        {
            return Err(WeaveError::DependencyUnsatisfied {
                step: *step,
                input: input.clone(),
            });
        }
    }

    if chain.mode == ExecutionMode::Sequential {
        for i in 0..graph.len() {
            if let Some(&later) = graph.dependencies(i).iter().find(|&&j| j > i) {
                return Err(WeaveError::DependencyUnsatisfied {
                    step: i,
                    input: chain.steps[later].output_var.clone().unwrap_or_default(),
                });
            }
        }
    }

    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use weave_core::types::ToolContext;

    struct Known(&'static [&'static str]);

    impl ToolInvoker for Known {
        fn invoke(
            &self,
            tool: &str,
            _args: serde_json::Value,
            _ctx: ToolContext,
        ) -> BoxFuture<'_, Result<serde_json::Value>> {
            let tool = tool.to_string();
            Box::pin(async move { Err(WeaveError::ToolNotFound(tool)) })
        }

        fn has_tool(&self, tool: &str) -> bool {
            self.0.contains(&tool)
        }
    }

    fn step(tool: &str, output: Option<&str>, inputs: &[&str]) -> ToolStep {
        let mut step = ToolStep::new(tool).with_inputs(inputs.iter().copied());
        step.output_var = output.map(String::from);
        step
    }

    #[test]
    fn test_edges_follow_outputs() {
        let steps = vec![
            step("a", Some("x"), &[]),
            step("b", Some("y"), &["x"]),
            step("c", None, &["x", "y"]),
        ];
        let graph = DependencyGraph::build(&steps).unwrap();
        assert!(graph.dependencies(0).is_empty());
        assert_eq!(graph.dependencies(1), &[0]);
        assert_eq!(graph.dependencies(2), &[0, 1]);
        assert_eq!(graph.dependents(0), &[1, 2]);
        assert_eq!(graph.topological_order(), vec![0, 1, 2]);
    }

    #[test]
    fn test_producer_after_consumer() {
        let steps = vec![step("b", None, &["x"]), step("a", Some("x"), &[])];
        let graph = DependencyGraph::build(&steps).unwrap();
        assert_eq!(graph.dependencies(0), &[1]);
        assert_eq!(graph.topological_order(), vec![1, 0]);
    }

    #[test]
    fn test_cycle_rejected() {
        let steps = vec![step("a", Some("x"), &["y"]), step("b", Some("y"), &["x"])];
        match DependencyGraph::build(&steps) {
            Err(WeaveError::DependencyCycle { cycle }) => assert_eq!(cycle, "0 -> 1 -> 0"),
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let steps = vec![step("a", Some("x"), &["x"])];
        assert!(matches!(
            DependencyGraph::build(&steps),
            Err(WeaveError::DependencyCycle { .. })
        ));
    }

    #[test]
    fn test_duplicate_output_rejected() {
        let steps = vec![step("a", Some("x"), &[]), step("b", Some("x"), &[])];
        assert!(matches!(
            DependencyGraph::build(&steps),
            Err(WeaveError::DuplicateOutput { first: 0, second: 1, .. })
        ));
    }

    #[test]
    fn test_nested_fallback_rejected() {
        let steps = vec![ToolStep::new("a")
            .with_fallback(ToolStep::new("b").with_fallback(ToolStep::new("c")))];
        assert!(matches!(
            DependencyGraph::build(&steps),
            Err(WeaveError::FallbackTooDeep { step: 0 })
        ));
    }

    #[test]
    fn test_fallback_output_must_match_primary() {
        let same = vec![step("a", Some("x"), &[])
            .with_fallback(ToolStep::new("b").with_output("x"))];
        assert!(DependencyGraph::build(&same).is_ok());

        // Reusing another step's output through a fallback.
        let clash = vec![
            step("a", Some("x"), &[]),
            step("b", Some("y"), &[]).with_fallback(ToolStep::new("c").with_output("x")),
        ];
        assert!(matches!(
            DependencyGraph::build(&clash),
            Err(WeaveError::FallbackOutput { step: 1, ref name }) if name == "x"
        ));

        let fallback_only = vec![
            step("a", None, &[]).with_fallback(ToolStep::new("b").with_output("z")),
            step("c", None, &["z"]),
        ];
        assert!(matches!(
            DependencyGraph::build(&fallback_only),
            Err(WeaveError::FallbackOutput { step: 0, .. })
        ));
    }

    #[test]
    fn test_validate_unsatisfied_input() {
        let chain = ToolChain::new(ExecutionMode::Parallel).step(step("a", None, &["missing"]));
        let err = validate_chain(&chain, &Vars::new(), &Known(&["a"])).unwrap_err();
        assert!(matches!(err, WeaveError::DependencyUnsatisfied { step: 0, ref input } if input == "missing"));

        let mut seed = Vars::new();
        seed.insert("missing".into(), serde_json::json!(1));
        assert!(validate_chain(&chain, &seed, &Known(&["a"])).is_ok());
    }

    #[test]
    fn test_validate_sequential_forward_reference() {
        let steps = vec![step("b", None, &["x"]), step("a", Some("x"), &[])];
        let sequential = ToolChain::new(ExecutionMode::Sequential).with_steps(steps.clone());
        let parallel = ToolChain::new(ExecutionMode::Parallel).with_steps(steps);
        let invoker = Known(&["a", "b"]);

        assert!(matches!(
            validate_chain(&sequential, &Vars::new(), &invoker),
            Err(WeaveError::DependencyUnsatisfied { step: 0, .. })
        ));
        assert!(validate_chain(&parallel, &Vars::new(), &invoker).is_ok());
    }

    #[test]
    fn test_validate_pipeline_allows_unit_fields() {
        let chain = ToolChain::new(ExecutionMode::Pipeline).step(step("a", None, &["url"]));
        assert!(validate_chain(&chain, &Vars::new(), &Known(&["a"])).is_ok());
    }

    #[test]
    fn test_validate_unknown_tools() {
        let chain = ToolChain::new(ExecutionMode::Sequential)
            .step(ToolStep::new("a").with_fallback(ToolStep::new("ghost")));
        let err = validate_chain(&chain, &Vars::new(), &Known(&["a"])).unwrap_err();
        assert!(matches!(err, WeaveError::ToolNotFound(name) if name == "ghost"));
    }
}
