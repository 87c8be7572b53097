// src/dag/graph.rs

use std::collections::{BTreeMap, HashMap};

use crate::errors::{DagflowError, Result};

/// Internal node structure: stores immediate deps and dependents.
#[derive(Debug, Clone, Default)]
struct DagNode {
    /// Direct dependencies: units that must complete before this one can run.
    deps: Vec<String>,
    /// Direct dependents: units that depend on this one.
    dependents: Vec<String>,
}

/// Dependency index keyed by unit name.
///
/// Construction checks that every dependency names a known unit and that the
/// graph is acyclic, so holders of a `DagGraph` never see a cycle.
#[derive(Debug, Clone)]
pub struct DagGraph {
    nodes: BTreeMap<String, DagNode>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Colour {
    White,
    Grey,
    Black,
}

impl DagGraph {
    /// Build a graph from `(name, dependencies)` pairs.
    pub fn from_dependencies<I, N, D>(units: I) -> Result<Self>
    where
        I: IntoIterator<Item = (N, D)>,
        N: Into<String>,
        D: IntoIterator,
        D::Item: Into<String>,
    {
        let mut nodes: BTreeMap<String, DagNode> = BTreeMap::new();

        // First pass: create nodes with their dependency lists.
        for (name, deps) in units {
            let mut dep_list: Vec<String> = Vec::new();
            for dep in deps {
                let dep = dep.into();
                if !dep_list.contains(&dep) {
                    dep_list.push(dep);
                }
            }
            nodes.insert(
                name.into(),
                DagNode {
                    deps: dep_list,
                    dependents: Vec::new(),
                },
            );
        }

        // Second pass: populate dependents based on deps.
        let names: Vec<String> = nodes.keys().cloned().collect();
        for name in names {
            let deps = nodes
                .get(&name)
                .map(|n| n.deps.clone())
                .unwrap_or_default();

            for dep in deps {
                match nodes.get_mut(&dep) {
                    Some(dep_node) => dep_node.dependents.push(name.clone()),
                    None => {
                        return Err(DagflowError::UnknownDependency {
                            unit: name,
                            dependency: dep,
                        });
                    }
                }
            }
        }

        let graph = Self { nodes };
        if let Some(cycle) = graph.find_cycle() {
            return Err(DagflowError::DagCycle(cycle.join(" -> ")));
        }
        Ok(graph)
    }

    /// Depth-first search with white/grey/black colouring over dependency
    /// edges. Returns the offending path when a back-edge is found.
    fn find_cycle(&self) -> Option<Vec<String>> {
        let mut colour: HashMap<&str, Colour> = self
            .nodes
            .keys()
            .map(|k| (k.as_str(), Colour::White))
            .collect();
        let mut path: Vec<&str> = Vec::new();

        for start in self.nodes.keys() {
            if colour.get(start.as_str()) == Some(&Colour::White) {
                if let Some(cycle) = self.visit(start, &mut colour, &mut path) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    fn visit<'a>(
        &'a self,
        name: &'a str,
        colour: &mut HashMap<&'a str, Colour>,
        path: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        colour.insert(name, Colour::Grey);
        path.push(name);

        for dep in self.dependencies_of(name) {
            match colour.get(dep.as_str()).copied() {
                Some(Colour::Grey) => {
                    let start = path.iter().position(|n| *n == dep.as_str()).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        path[start..].iter().map(|s| s.to_string()).collect();
                    cycle.push(dep.clone());
                    return Some(cycle);
                }
                Some(Colour::White) => {
                    if let Some(cycle) = self.visit(dep, colour, path) {
                        return Some(cycle);
                    }
                }
                _ => {}
            }
        }

        path.pop();
        colour.insert(name, Colour::Black);
        None
    }

    /// Return all unit names, sorted.
    pub fn units(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    /// Immediate dependencies of a unit.
    pub fn dependencies_of(&self, name: &str) -> &[String] {
        self.nodes
            .get(name)
            .map(|n| n.deps.as_slice())
            .unwrap_or(&[])
    }

    /// Immediate dependents of a unit.
    pub fn dependents_of(&self, name: &str) -> &[String] {
        self.nodes
            .get(name)
            .map(|n| n.dependents.as_slice())
            .unwrap_or(&[])
    }

    /// Number of unresolved dependencies per unit before execution starts.
    pub fn in_degrees(&self) -> HashMap<String, usize> {
        self.nodes
            .iter()
            .map(|(name, node)| (name.clone(), node.deps.len()))
            .collect()
    }

    /// Units with no dependencies.
    pub fn roots(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|(_, node)| node.deps.is_empty())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Render roots and their dependents as an indented tree. A unit with
    /// several dependencies shows up under each of them.
    pub fn render_tree(&self) -> String {
        let mut out = String::new();
        for root in self.roots() {
            out.push_str(&root);
            out.push('\n');
            self.render_children(&root, 1, &mut out);
        }
        out
    }

    fn render_children(&self, name: &str, depth: usize, out: &mut String) {
        for child in self.dependents_of(name) {
            out.push_str(&"    ".repeat(depth - 1));
            out.push_str("└── ");
            out.push_str(child);
            out.push('\n');
            self.render_children(child, depth + 1, out);
        }
    }
}
