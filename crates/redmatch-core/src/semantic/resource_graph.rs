//! Graph of `REF(...)` links between declared resources
//!
//! Nodes are resource keys (`Type<id>`), edges point from the referencing
//! resource to the referenced one. The graph decides which resources are
//! static and which are instantiated once per record: a resource whose own
//! data reference is `Resource` becomes per-record as soon as anything it can
//! reach reads study data.

use std::collections::HashMap;

use indexmap::IndexMap;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use serde::Serialize;
use tracing::{debug, trace};

use crate::ast::{DataReference, Document, Value};
use crate::diagnostics::{Diagnostic, DiagnosticCode, Location};

/// How often a resource is instantiated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Instantiation {
    /// Once, with id `resourceId`
    Static,
    /// Once per record, with id `resourceId-recordId`
    PerRecord,
}

#[derive(Debug, Clone)]
struct ResourceNode {
    key: String,
    data_reference: DataReference,
    location: Location,
}

/// Directed graph of resources linked by references
#[derive(Debug)]
pub struct ResourceGraph {
    graph: DiGraph<ResourceNode, Location>,
    node_map: IndexMap<String, NodeIndex>,
    /// References to keys that are never declared
    dangling: Vec<(String, Location)>,
}

impl ResourceGraph {
    /// Build the graph from every resource in the document, nested and
    /// `ELSE` bodies included. A key declared more than once is one node
    /// whose data reference combines all declarations.
    pub fn build(document: &Document) -> Self {
        let mut graph = DiGraph::new();
        let mut node_map: IndexMap<String, NodeIndex> = IndexMap::new();
        let guarded = document.resources();

        for entry in &guarded {
            let key = entry.resource.key();
            let data_reference = entry.data_reference();
            match node_map.get(&key) {
                Some(&idx) => {
                    let node: &mut ResourceNode = &mut graph[idx];
                    node.data_reference = node.data_reference.combine(data_reference);
                }
                None => {
                    let idx = graph.add_node(ResourceNode {
                        key: key.clone(),
                        data_reference,
                        location: entry.resource.id_location.clone(),
                    });
                    node_map.insert(key, idx);
                }
            }
        }

        let mut dangling = Vec::new();
        for entry in &guarded {
            let from = node_map[&entry.resource.key()];
            for attribute in &entry.resource.attributes {
                if let Value::Reference(target) = &attribute.value {
                    match node_map.get(&target.key()) {
                        Some(&to) => {
                            trace!("{} -> {}", graph[from].key, target.key());
                            graph.add_edge(from, to, target.location.clone());
                        }
                        None => dangling.push((target.key(), target.location.clone())),
                    }
                }
            }
        }

        debug!(
            "Resource graph has {} nodes and {} edges",
            graph.node_count(),
            graph.edge_count()
        );

        Self {
            graph,
            node_map,
            dangling,
        }
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        self.node_map.contains_key(key)
    }

    /// Cycles as lists of keys, each closed by repeating its first key
    pub fn find_cycles(&self) -> Vec<Vec<String>> {
        let mut cycles: Vec<Vec<String>> = tarjan_scc(&self.graph)
            .into_iter()
            .filter(|scc| {
                scc.len() > 1 || (scc.len() == 1 && self.graph.contains_edge(scc[0], scc[0]))
            })
            .map(|mut scc| {
                // Stable order regardless of traversal
                scc.sort();
                let mut cycle: Vec<String> =
                    scc.iter().map(|&idx| self.graph[idx].key.clone()).collect();
                cycle.push(cycle[0].clone());
                cycle
            })
            .collect();
        cycles.sort();
        cycles
    }

    /// Unresolved references and cycles
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        let mut diagnostics: Vec<Diagnostic> = self
            .dangling
            .iter()
            .map(|(key, location)| {
                Diagnostic::error(
                    DiagnosticCode::UnresolvedResource,
                    format!("Resource {key} is not defined in the rules"),
                    location.clone(),
                )
            })
            .collect();

        for cycle in self.find_cycles() {
            let location = self.node_map[&cycle[0]];
            diagnostics.push(Diagnostic::error(
                DiagnosticCode::ResourceCycle,
                format!("Resources reference each other in a cycle: {}", cycle.join(" -> ")),
                self.graph[location].location.clone(),
            ));
        }
        diagnostics
    }

    /// Instantiation of every declared resource, in declaration order
    pub fn instantiations(&self) -> IndexMap<String, Instantiation> {
        let mut memo: HashMap<NodeIndex, Instantiation> = HashMap::new();
        self.node_map
            .iter()
            .map(|(key, &idx)| {
                let instantiation = *memo
                    .entry(idx)
                    .or_insert_with(|| self.instantiation_of(idx));
                (key.clone(), instantiation)
            })
            .collect()
    }

    fn instantiation_of(&self, start: NodeIndex) -> Instantiation {
        match self.graph[start].data_reference {
            DataReference::Yes => Instantiation::PerRecord,
            DataReference::No => Instantiation::Static,
            DataReference::Resource => {
                let mut dfs = Dfs::new(&self.graph, start);
                while let Some(idx) = dfs.next(&self.graph) {
                    if self.graph[idx].data_reference == DataReference::Yes {
                        return Instantiation::PerRecord;
                    }
                }
                Instantiation::Static
            }
        }
    }
}
