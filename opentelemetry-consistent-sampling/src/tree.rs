use std::{
    collections::{HashMap, VecDeque},
    fmt,
};

use opentelemetry::{
    otel_debug,
    trace::{SpanId, TraceId},
};

use crate::{downsample::span_index, SpanRecord};

/// Longest chain of unknown ancestors inserted above a single span.
const MAX_UNKNOWN_ANCESTORS: u64 = 1024;

/// A node of a reconstructed trace tree.
#[derive(Clone, Debug, PartialEq)]
pub struct TreeNode {
    /// The span at this position, `None` for an unknown, dropped ancestor.
    pub span: Option<SpanRecord>,
    /// Positions of the child nodes within the tree.
    pub children: Vec<usize>,
}

/// A rooted tree rebuilt from the sampled spans of a trace.
///
/// Node `0` is the root. Children are ordered as their spans appear in the
/// input collection.
#[derive(Clone, Debug, PartialEq)]
pub struct TraceTree {
    trace_id: TraceId,
    nodes: Vec<TreeNode>,
}

impl TraceTree {
    /// Trace the tree belongs to.
    pub fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    /// The root node.
    pub fn root(&self) -> &TreeNode {
        &self.nodes[0]
    }

    /// The node at `position`, if any.
    pub fn node(&self, position: usize) -> Option<&TreeNode> {
        self.nodes.get(position)
    }

    /// All nodes in insertion order.
    pub fn nodes(&self) -> &[TreeNode] {
        &self.nodes
    }

    /// Renders the tree as ASCII art, one node per line.
    pub fn render<F>(&self, label: F) -> String
    where
        F: Fn(Option<&SpanRecord>) -> String,
    {
        let mut lines = Vec::with_capacity(self.nodes.len());
        lines.push(label(self.root().span.as_ref()));

        // (node, prefix, is last child of its parent)
        let mut stack: Vec<(usize, String, bool)> = Vec::new();
        push_children(&mut stack, &self.root().children, "");

        while let Some((position, prefix, is_last)) = stack.pop() {
            let node = &self.nodes[position];
            let connector = if is_last { "'---" } else { "|---" };
            lines.push(format!("{prefix}{connector}{}", label(node.span.as_ref())));

            let child_prefix = format!("{prefix}{}", if is_last { "    " } else { "|   " });
            push_children(&mut stack, &node.children, &child_prefix);
        }
        lines.join("\n")
    }
}

fn push_children(stack: &mut Vec<(usize, String, bool)>, children: &[usize], prefix: &str) {
    let count = children.len();
    for (i, &child) in children.iter().enumerate().rev() {
        stack.push((child, prefix.to_string(), i + 1 == count));
    }
}

impl fmt::Display for TraceTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render(|span| match span {
            Some(span) => format!("{} {}", span.span_id, span.name),
            None => "?".to_string(),
        }))
    }
}

/// Rebuilds the sampled call trees of all traces in `spans`.
///
/// Spans are attached to their nearest sampled ancestor. A span whose
/// ancestor is not part of the collection becomes a root, so a trace may
/// yield several trees. Each recorded dropped ancestor is represented by an
/// unknown node between a span and its ancestor. Trees are returned grouped by
/// trace in order of first appearance.
pub fn extract_trees(spans: &[SpanRecord]) -> Vec<TraceTree> {
    let mut traces: Vec<(TraceId, Vec<SpanRecord>)> = Vec::new();
    let mut trace_positions: HashMap<TraceId, usize> = HashMap::new();
    for span in spans {
        let position = *trace_positions.entry(span.trace_id).or_insert_with(|| {
            traces.push((span.trace_id, Vec::new()));
            traces.len() - 1
        });
        traces[position].1.push(span.clone());
    }

    traces
        .into_iter()
        .flat_map(|(trace_id, spans)| trace_trees(trace_id, &spans))
        .collect()
}

fn trace_trees(trace_id: TraceId, spans: &[SpanRecord]) -> Vec<TraceTree> {
    let index = span_index(spans);
    let mut children: HashMap<SpanId, Vec<usize>> = HashMap::new();
    for (position, span) in spans.iter().enumerate() {
        children
            .entry(span.ancestor_span_id())
            .or_default()
            .push(position);
    }

    spans
        .iter()
        .enumerate()
        .filter(|(_, span)| !index.contains_key(&span.ancestor_span_id()))
        .map(|(root, _)| build_tree(trace_id, spans, &children, root))
        .collect()
}

fn build_tree(
    trace_id: TraceId,
    spans: &[SpanRecord],
    children: &HashMap<SpanId, Vec<usize>>,
    root: usize,
) -> TraceTree {
    let mut nodes = vec![TreeNode {
        span: Some(spans[root].clone()),
        children: Vec::new(),
    }];
    let mut queue: VecDeque<(usize, usize)> = VecDeque::new();
    enqueue_children(&mut queue, children, &spans[root], 0);

    while let Some((position, parent_node)) = queue.pop_front() {
        let span = &spans[position];

        let mut unknown = span.number_dropped_ancestors();
        if unknown > MAX_UNKNOWN_ANCESTORS {
            otel_debug!(
                name: "ConsistentSampler.Tree.DistanceTruncated",
                span_id = span.span_id.to_string(),
                number_dropped_ancestors = unknown
            );
            unknown = MAX_UNKNOWN_ANCESTORS;
        }

        let mut attach_to = parent_node;
        for _ in 0..unknown {
            attach_to = push_node(&mut nodes, attach_to, None);
        }
        let node = push_node(&mut nodes, attach_to, Some(span.clone()));
        enqueue_children(&mut queue, children, span, node);
    }

    TraceTree { trace_id, nodes }
}

fn enqueue_children(
    queue: &mut VecDeque<(usize, usize)>,
    children: &HashMap<SpanId, Vec<usize>>,
    span: &SpanRecord,
    node: usize,
) {
    if let Some(positions) = children.get(&span.span_id) {
        queue.extend(positions.iter().map(|&position| (position, node)));
    }
}

fn push_node(nodes: &mut Vec<TreeNode>, parent: usize, span: Option<SpanRecord>) -> usize {
    let position = nodes.len();
    nodes.push(TreeNode {
        span,
        children: Vec::new(),
    });
    nodes[parent].children.push(position);
    position
}
