use crate::profiles::AgentProfile;
use maestro_core::{MaestroError, MaestroResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::warn;

/// Execution status of an agent within the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Not yet scheduled.
    Pending,
    /// Currently executing.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Not attempted because a dependency failed.
    Skipped,
}

/// One agent's position in the dependency graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentNode {
    /// Agent name.
    pub name: String,
    /// Validated dependency names (self and unknown references removed).
    pub dependencies: Vec<String>,
    /// Execution tier. Level 0 agents have no dependencies; every other
    /// agent's level is `1 + max(dependency levels)`.
    pub level: u32,
    /// Scheduling status, owned by the graph.
    pub status: NodeStatus,
}

/// A directed dependency graph over agents, with parallel-execution tiers.
///
/// Rebuilt wholesale on each [`DependencyGraph::build`] call, never
/// incrementally mutated. Every name appearing in the adjacency map or a
/// level list exists in the node map.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: HashMap<String, AgentNode>,
    dependents: HashMap<String, Vec<String>>,
    levels: BTreeMap<u32, Vec<String>>,
    max_level: u32,
}

impl DependencyGraph {
    /// Builds the graph from agent profiles.
    ///
    /// Profiles without a usable name are skipped, duplicate names keep the
    /// last definition, self-dependencies are filtered, and dependencies on
    /// unknown agents are dropped. Each case warns but never fails: sloppy
    /// declarations degrade, cycles are the only hard error (see
    /// [`DependencyGraph::detect_cycles`]).
    pub fn build(profiles: &[AgentProfile]) -> Self {
        let mut nodes: HashMap<String, AgentNode> = HashMap::new();

        for profile in profiles {
            if profile.name.trim().is_empty() {
                warn!("skipping agent profile with no name");
                continue;
            }
            if nodes.contains_key(&profile.name) {
                warn!(agent = %profile.name, "duplicate agent in graph, last definition wins");
            }
            let dependencies: Vec<String> = profile
                .dependencies
                .iter()
                .filter(|dep| {
                    if *dep == &profile.name {
                        warn!(agent = %profile.name, "ignoring self-dependency");
                        false
                    } else {
                        true
                    }
                })
                .cloned()
                .collect();
            nodes.insert(
                profile.name.clone(),
                AgentNode {
                    name: profile.name.clone(),
                    dependencies,
                    level: 0,
                    status: NodeStatus::Pending,
                },
            );
        }

        // Drop references to agents that are not in the node set.
        let known: Vec<String> = nodes.keys().cloned().collect();
        for node in nodes.values_mut() {
            node.dependencies.retain(|dep| {
                if known.contains(dep) {
                    true
                } else {
                    warn!(agent = %node.name, dependency = %dep, "dropping unknown dependency");
                    false
                }
            });
        }

        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        for node in nodes.values() {
            for dep in &node.dependencies {
                dependents.entry(dep.clone()).or_default().push(node.name.clone());
            }
        }
        for list in dependents.values_mut() {
            list.sort();
        }

        let mut graph = Self {
            nodes,
            dependents,
            levels: BTreeMap::new(),
            max_level: 0,
        };
        graph.calculate_levels();
        graph
    }

    /// Iterative relaxation to a fixed point, bounded by the node count.
    ///
    /// A single pass is not enough because a dependency may not be leveled
    /// yet when its dependent is visited. When a cycle exists the fixed
    /// point is never reached and cycle members keep their last computed
    /// level, so callers must run [`DependencyGraph::detect_cycles`] before
    /// trusting levels.
    fn calculate_levels(&mut self) {
        let mut names: Vec<String> = self.nodes.keys().cloned().collect();
        names.sort();

        let mut computed: HashMap<String, u32> = HashMap::new();
        for _ in 0..names.len() {
            let mut changed = false;
            for name in &names {
                let deps = &self.nodes[name].dependencies;
                let level = if deps.is_empty() {
                    Some(0)
                } else {
                    let mut max = 0;
                    let mut ready = true;
                    for dep in deps {
                        match computed.get(dep) {
                            Some(dep_level) => max = max.max(*dep_level),
                            None => {
                                ready = false;
                                break;
                            }
                        }
                    }
                    ready.then_some(max + 1)
                };
                if let Some(level) = level {
                    if computed.get(name) != Some(&level) {
                        computed.insert(name.clone(), level);
                        changed = true;
                    }
                }
            }
            if !changed {
                break;
            }
        }

        self.levels.clear();
        self.max_level = 0;
        // `names` is sorted, so each level list comes out lexicographic.
        for name in &names {
            let level = computed.get(name).copied().unwrap_or(0);
            if let Some(node) = self.nodes.get_mut(name) {
                node.level = level;
            }
            self.levels.entry(level).or_default().push(name.clone());
            self.max_level = self.max_level.max(level);
        }
    }

    /// Depth-first cycle detection with a three-color scheme.
    ///
    /// Fails with the full cycle path (arrow-joined) on the first cycle
    /// found. References to missing nodes are treated as terminal, matching
    /// the permissive handling in graph construction.
    pub fn detect_cycles(&self) -> MaestroResult<()> {
        let mut colors: HashMap<&str, Color> = HashMap::new();
        let mut names: Vec<&String> = self.nodes.keys().collect();
        names.sort();
        for name in names {
            if !colors.contains_key(name.as_str()) {
                let mut stack: Vec<&str> = Vec::new();
                self.visit(name, &mut colors, &mut stack)?;
            }
        }
        Ok(())
    }

    fn visit<'a>(
        &'a self,
        name: &'a str,
        colors: &mut HashMap<&'a str, Color>,
        stack: &mut Vec<&'a str>,
    ) -> MaestroResult<()> {
        colors.insert(name, Color::Visiting);
        stack.push(name);

        if let Some(node) = self.nodes.get(name) {
            for dep in &node.dependencies {
                match colors.get(dep.as_str()) {
                    Some(Color::Visiting) => {
                        let start = stack
                            .iter()
                            .position(|entry| *entry == dep.as_str())
                            .unwrap_or(0);
                        let mut path: Vec<&str> = stack[start..].to_vec();
                        path.push(dep);
                        return Err(MaestroError::Cycle(path.join(" -> ")));
                    }
                    Some(Color::Visited) => {}
                    None => {
                        // Missing nodes are terminal, not cyclical.
                        if self.nodes.contains_key(dep.as_str()) {
                            self.visit(dep, colors, stack)?;
                        }
                    }
                }
            }
        }

        stack.pop();
        colors.insert(name, Color::Visited);
        Ok(())
    }

    /// Looks up a node by agent name.
    pub fn node(&self, name: &str) -> Option<&AgentNode> {
        self.nodes.get(name)
    }

    /// Agents that directly depend on the given agent, sorted.
    pub fn dependents_of(&self, name: &str) -> &[String] {
        self.dependents.get(name).map_or(&[], Vec::as_slice)
    }

    /// Agents at the given level, sorted lexicographically.
    pub fn agents_at_level(&self, level: u32) -> &[String] {
        self.levels.get(&level).map_or(&[], Vec::as_slice)
    }

    /// The level map, ordered by level number.
    pub fn levels(&self) -> &BTreeMap<u32, Vec<String>> {
        &self.levels
    }

    /// The highest level in the graph.
    pub fn max_level(&self) -> u32 {
        self.max_level
    }

    /// Number of agents in the graph.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no agents.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Marks an agent's scheduling status.
    pub fn set_status(&mut self, name: &str, status: NodeStatus) {
        if let Some(node) = self.nodes.get_mut(name) {
            node.status = status;
        }
    }
}

#[derive(PartialEq)]
enum Color {
    Visiting,
    Visited,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn profile(name: &str, deps: &[&str]) -> AgentProfile {
        AgentProfile::new(name)
            .with_dependencies(deps.iter().map(|d| (*d).to_string()).collect())
    }

    #[test]
    fn test_levels_for_diamond() {
        let graph = DependencyGraph::build(&[
            profile("root", &[]),
            profile("left", &["root"]),
            profile("right", &["root"]),
            profile("merge", &["left", "right"]),
        ]);

        assert_eq!(graph.node("root").unwrap().level, 0);
        assert_eq!(graph.node("left").unwrap().level, 1);
        assert_eq!(graph.node("right").unwrap().level, 1);
        assert_eq!(graph.node("merge").unwrap().level, 2);
        assert_eq!(graph.max_level(), 2);
        assert_eq!(graph.agents_at_level(1).to_vec(), vec!["left", "right"]);
        assert!(graph.detect_cycles().is_ok());
    }

    #[test]
    fn test_levels_converge_regardless_of_declaration_order() {
        // Dependencies declared before the agents they reference force a
        // second relaxation pass.
        let graph = DependencyGraph::build(&[
            profile("c", &["b"]),
            profile("b", &["a"]),
            profile("a", &[]),
        ]);
        assert_eq!(graph.node("a").unwrap().level, 0);
        assert_eq!(graph.node("b").unwrap().level, 1);
        assert_eq!(graph.node("c").unwrap().level, 2);
    }

    #[test]
    fn test_level_invariant_holds() {
        let profiles = vec![
            profile("a", &[]),
            profile("b", &["a"]),
            profile("c", &["a", "b"]),
            profile("d", &["c"]),
            profile("e", &[]),
        ];
        let graph = DependencyGraph::build(&profiles);
        for name in ["a", "b", "c", "d", "e"] {
            let node = graph.node(name).unwrap();
            if node.dependencies.is_empty() {
                assert_eq!(node.level, 0, "leaf {name} must be level 0");
            } else {
                let max_dep = node
                    .dependencies
                    .iter()
                    .map(|d| graph.node(d).unwrap().level)
                    .max()
                    .unwrap();
                assert_eq!(node.level, max_dep + 1, "level invariant broken at {name}");
            }
        }
    }

    #[test]
    fn test_self_dependency_filtered() {
        let graph = DependencyGraph::build(&[profile("solo", &["solo"])]);
        let node = graph.node("solo").unwrap();
        assert!(node.dependencies.is_empty());
        assert_eq!(node.level, 0);
        assert!(graph.detect_cycles().is_ok());
    }

    #[test]
    fn test_unknown_dependency_dropped() {
        let graph = DependencyGraph::build(&[profile("worker", &["ghost"])]);
        let node = graph.node("worker").unwrap();
        assert!(node.dependencies.is_empty());
        assert_eq!(node.level, 0);
    }

    #[test]
    fn test_unnamed_profile_skipped_and_duplicates_overwrite() {
        let first = profile("dup", &[]);
        let second = profile("dup", &["base"]);
        let graph =
            DependencyGraph::build(&[profile("base", &[]), profile("  ", &[]), first, second]);
        assert_eq!(graph.len(), 2);
        // Last definition wins.
        assert_eq!(graph.node("dup").unwrap().dependencies.to_vec(), vec!["base"]);
    }

    #[test]
    fn test_cycle_detected_with_path() {
        let graph = DependencyGraph::build(&[
            profile("a", &["c"]),
            profile("b", &["a"]),
            profile("c", &["b"]),
        ]);
        let err = graph.detect_cycles().unwrap_err();
        let MaestroError::Cycle(path) = err else {
            panic!("expected cycle error");
        };
        let parts: Vec<&str> = path.split(" -> ").collect();
        // Every cycle member exactly once, then the start repeats.
        assert_eq!(parts.len(), 4);
        assert_eq!(parts.first(), parts.last());
        for member in ["a", "b", "c"] {
            assert_eq!(parts[..3].iter().filter(|p| **p == member).count(), 1);
        }
    }

    #[test]
    fn test_two_node_cycle() {
        let graph = DependencyGraph::build(&[profile("x", &["y"]), profile("y", &["x"])]);
        assert!(matches!(
            graph.detect_cycles(),
            Err(MaestroError::Cycle(_))
        ));
    }

    #[test]
    fn test_dependents_adjacency() {
        let graph = DependencyGraph::build(&[
            profile("base", &[]),
            profile("b", &["base"]),
            profile("a", &["base"]),
        ]);
        assert_eq!(graph.dependents_of("base").to_vec(), vec!["a", "b"]);
        assert!(graph.dependents_of("a").is_empty());
    }

    #[test]
    fn test_empty_graph() {
        let graph = DependencyGraph::build(&[]);
        assert!(graph.is_empty());
        assert_eq!(graph.max_level(), 0);
        assert!(graph.agents_at_level(0).is_empty());
        assert!(graph.detect_cycles().is_ok());
    }
}
