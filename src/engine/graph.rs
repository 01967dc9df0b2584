//! Declarative processing-graph description.
//!
//! The graph is handed to the engine as data; the typed builder validates
//! node names and link types at construction time instead of deferring to a
//! textual launch string parsed at runtime.

use std::collections::{HashMap, HashSet};

use crate::error::StreamError;

/// Role of a node in the processing graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Data enters the graph here (app-fed or transport-fed)
    Source,
    /// Transforms buffers in place (convert, encode, decode, parse)
    Filter,
    /// Combines elementary streams into one container stream
    Mux,
    /// Splits a container stream into elementary streams
    Demux,
    /// Data leaves the graph here (app sink or transport sink)
    Sink,
}

/// Type carried by a link between two nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkType {
    Video,
    Metadata,
    /// Multiplexed container stream (only valid out of a mux or into a demux)
    Container,
}

#[derive(Debug, Clone)]
pub struct NodeSpec {
    pub name: String,
    pub kind: NodeKind,
    pub props: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct LinkSpec {
    pub from: String,
    pub to: String,
    pub ty: LinkType,
}

/// A validated, immutable graph description.
#[derive(Debug, Clone)]
pub struct GraphSpec {
    pub name: String,
    pub nodes: Vec<NodeSpec>,
    pub links: Vec<LinkSpec>,
}

impl GraphSpec {
    pub fn node(&self, name: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Names of sink nodes reachable from the given node.
    pub fn sinks_reachable_from(&self, name: &str) -> Vec<String> {
        let mut visited = HashSet::new();
        let mut stack = vec![name.to_string()];
        let mut sinks = Vec::new();

        while let Some(current) = stack.pop() {
            if !visited.insert(current.clone()) {
                continue;
            }
            if let Some(node) = self.node(&current)
                && node.kind == NodeKind::Sink
                && current != name
            {
                sinks.push(current.clone());
                continue;
            }
            for link in self.links.iter().filter(|l| l.from == current) {
                stack.push(link.to.clone());
            }
        }

        sinks.sort();
        sinks
    }

    pub fn sources(&self) -> impl Iterator<Item = &NodeSpec> {
        self.nodes.iter().filter(|n| n.kind == NodeKind::Source)
    }

    pub fn sinks(&self) -> impl Iterator<Item = &NodeSpec> {
        self.nodes.iter().filter(|n| n.kind == NodeKind::Sink)
    }
}

/// Builder validating the graph as it is assembled.
pub struct GraphBuilder {
    name: String,
    nodes: Vec<NodeSpec>,
    links: Vec<LinkSpec>,
}

impl GraphBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
            links: Vec::new(),
        }
    }

    pub fn node(mut self, name: impl Into<String>, kind: NodeKind) -> Self {
        self.nodes.push(NodeSpec {
            name: name.into(),
            kind,
            props: Vec::new(),
        });
        self
    }

    /// Attach a property to the most recently added node.
    pub fn prop(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        if let Some(node) = self.nodes.last_mut() {
            node.props.push((key.into(), value.into()));
        }
        self
    }

    pub fn link(mut self, from: impl Into<String>, to: impl Into<String>, ty: LinkType) -> Self {
        self.links.push(LinkSpec {
            from: from.into(),
            to: to.into(),
            ty,
        });
        self
    }

    /// Validate and freeze the description.
    pub fn build(self) -> Result<GraphSpec, StreamError> {
        let mut names = HashMap::new();
        for node in &self.nodes {
            if names.insert(node.name.clone(), node.kind).is_some() {
                return Err(StreamError::Pipeline(format!(
                    "duplicate node name '{}'",
                    node.name
                )));
            }
        }

        for link in &self.links {
            let from_kind = *names.get(&link.from).ok_or_else(|| {
                StreamError::Pipeline(format!("link from unknown node '{}'", link.from))
            })?;
            let to_kind = *names.get(&link.to).ok_or_else(|| {
                StreamError::Pipeline(format!("link to unknown node '{}'", link.to))
            })?;

            if from_kind == NodeKind::Sink {
                return Err(StreamError::Pipeline(format!(
                    "sink '{}' cannot be a link origin",
                    link.from
                )));
            }
            if to_kind == NodeKind::Source {
                return Err(StreamError::Pipeline(format!(
                    "source '{}' cannot be a link target",
                    link.to
                )));
            }
            if link.ty == LinkType::Container
                && from_kind != NodeKind::Mux
                && to_kind != NodeKind::Demux
            {
                return Err(StreamError::Pipeline(format!(
                    "container link '{}' → '{}' must leave a mux or enter a demux",
                    link.from, link.to
                )));
            }
            if from_kind == NodeKind::Mux && link.ty != LinkType::Container {
                return Err(StreamError::Pipeline(format!(
                    "mux '{}' only produces a container stream",
                    link.from
                )));
            }
        }

        // Every non-sink node must feed something.
        for node in &self.nodes {
            if node.kind != NodeKind::Sink && !self.links.iter().any(|l| l.from == node.name) {
                return Err(StreamError::Pipeline(format!(
                    "node '{}' has no downstream link",
                    node.name
                )));
            }
        }

        Ok(GraphSpec {
            name: self.name,
            nodes: self.nodes,
            links: self.links,
        })
    }
}
