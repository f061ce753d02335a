//! Builds and runs an execution graph from an ordered container list.
//!
//! Two containers are ordered when they share a field and at least one of
//! them writes it; everything else may run concurrently. On more than one
//! device a halo update is inserted before every stencil read of a field
//! whose halos are stale, and with [`Occ::Standard`] the reading device
//! container is split so its internal region overlaps the transfer.
//!
//! The sequence is meant to be run repeatedly, so halo staleness is tracked
//! across the loop back-edge: fields left dirty at the end of the sequence
//! are dirty at its start, and so is every field stencil-read before its
//! first write.

use std::collections::HashMap;
use std::fmt::{self, Write as _};
use std::path::Path;
use std::str::FromStr;

use bitvec::prelude::*;

use crate::domain::{Backend, DataView};
use crate::engine::container::{Container, ExecutionType, OperationType};
use crate::engine::field::{FieldUid, TransferMode};
use crate::engine::token::{AccessType, ComputePattern, Token};
use crate::error::{GridError, Result};

/// Overlap of computation and communication.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Occ {
    /// Run every container over its whole partition.
    None,
    /// Split stencil readers into internal and boundary launches.
    #[default]
    Standard,
}

impl Occ {
    pub const ALL: [Occ; 2] = [Occ::None, Occ::Standard];

    pub fn as_str(self) -> &'static str {
        match self {
            Occ::None => "none",
            Occ::Standard => "standard",
        }
    }
}

impl fmt::Display for Occ {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Occ {
    type Err = GridError;

    fn from_str(s: &str) -> Result<Self> {
        Occ::ALL
            .into_iter()
            .find(|o| o.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| GridError::Configuration(format!("unknown occ `{s}`")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequencerOptions {
    pub occ: Occ,
    pub transfer_mode: TransferMode,
    /// Run the nodes of one graph level concurrently.
    pub parallel_levels: bool,
}

impl Default for SequencerOptions {
    fn default() -> Self {
        Self {
            occ: Occ::Standard,
            transfer_mode: TransferMode::Get,
            parallel_levels: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Begin,
    End,
    Compute,
    HaloUpdate,
}

/// One vertex of the execution graph.
#[derive(Debug, Clone)]
pub struct GraphNode {
    role: NodeRole,
    container: Option<Container>,
    data_view: DataView,
    /// Accesses used for conflict detection.
    tokens: Vec<Token>,
    /// Index of the user container this node stems from.
    origin: Option<usize>,
}

impl GraphNode {
    fn anchor(role: NodeRole) -> Self {
        Self {
            role,
            container: None,
            data_view: DataView::Standard,
            tokens: Vec::new(),
            origin: None,
        }
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    pub fn container(&self) -> Option<&Container> {
        self.container.as_ref()
    }

    pub fn data_view(&self) -> DataView {
        self.data_view
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    pub fn operation_type(&self) -> OperationType {
        match &self.container {
            Some(c) => c.operation_type(),
            None => OperationType::Anchor,
        }
    }

    pub fn label(&self) -> String {
        match (&self.container, self.role) {
            (None, NodeRole::Begin) => "begin".to_string(),
            (None, _) => "end".to_string(),
            (Some(c), _) if self.data_view == DataView::Standard => c.name().to_string(),
            (Some(c), _) => format!("{} ({})", c.name(), self.data_view),
        }
    }

    fn run(&self) -> Result<()> {
        match &self.container {
            Some(c) => c.run(0, self.data_view),
            None => Ok(()),
        }
    }
}

/// DAG over [`GraphNode`]s. Node 0 is the begin anchor, the last node is the
/// end anchor, and every edge goes from a lower to a higher index.
#[derive(Debug, Clone, Default)]
pub struct ExecutionGraph {
    nodes: Vec<GraphNode>,
    succ: Vec<BitVec>,
}

impl ExecutionGraph {
    fn with_nodes(nodes: Vec<GraphNode>) -> Self {
        let n = nodes.len();
        Self {
            nodes,
            succ: vec![bitvec![0; n]; n],
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    pub fn node(&self, idx: usize) -> &GraphNode {
        &self.nodes[idx]
    }

    pub fn has_edge(&self, from: usize, to: usize) -> bool {
        self.succ[from][to]
    }

    pub fn edges(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.succ
            .iter()
            .enumerate()
            .flat_map(|(from, row)| row.iter_ones().map(move |to| (from, to)))
    }

    pub fn predecessors(&self, idx: usize) -> impl Iterator<Item = usize> + '_ {
        (0..idx).filter(move |&p| self.succ[p][idx])
    }

    fn add_edge(&mut self, from: usize, to: usize) {
        debug_assert!(from < to);
        self.succ[from].set(to, true);
    }

    /// Whether `to` is reachable from `from`.
    pub fn reaches(&self, from: usize, to: usize) -> bool {
        self.reachability()[from][to]
    }

    fn reachability(&self) -> Vec<BitVec> {
        let n = self.nodes.len();
        let mut reach = vec![bitvec![0; n]; n];
        for i in (0..n).rev() {
            let mut row = self.succ[i].clone();
            for j in self.succ[i].iter_ones() {
                row |= reach[j].as_bitslice();
            }
            reach[i] = row;
        }
        reach
    }

    /// Drop every edge implied by a longer path.
    fn transitive_reduction(&mut self) -> usize {
        let reach = self.reachability();
        let mut removed = 0;
        for i in 0..self.nodes.len() {
            let direct: Vec<usize> = self.succ[i].iter_ones().collect();
            for &j in &direct {
                if direct.iter().any(|&k| k != j && reach[k][j]) {
                    self.succ[i].set(j, false);
                    removed += 1;
                }
            }
        }
        removed
    }

    /// Nodes grouped by longest distance from the begin anchor.
    pub fn levels(&self) -> Vec<Vec<usize>> {
        let mut depth = vec![0usize; self.nodes.len()];
        for i in 0..self.nodes.len() {
            for j in self.succ[i].iter_ones() {
                depth[j] = depth[j].max(depth[i] + 1);
            }
        }
        let top = depth.iter().copied().max().unwrap_or(0);
        let mut levels = vec![Vec::new(); top + 1];
        for (i, d) in depth.into_iter().enumerate() {
            levels[d].push(i);
        }
        levels
    }
}

fn conflicts(a: &[Token], b: &[Token]) -> bool {
    a.iter().any(|ta| {
        b.iter()
            .any(|tb| ta.uid() == tb.uid() && (ta.access() == AccessType::Write || tb.access() == AccessType::Write))
    })
}

/// Field uid → dense bit index.
#[derive(Default)]
struct FieldIndex(HashMap<FieldUid, usize>);

impl FieldIndex {
    fn of(&mut self, uid: FieldUid) -> usize {
        let next = self.0.len();
        *self.0.entry(uid).or_insert(next)
    }
}

/// An ordered, repeatable sequence of containers.
pub struct Sequencer {
    name: String,
    backend: Backend,
    options: SequencerOptions,
    containers: Vec<Container>,
    graph: ExecutionGraph,
}

impl fmt::Debug for Sequencer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sequencer")
            .field("name", &self.name)
            .field("options", &self.options)
            .field("containers", &self.containers.len())
            .field("nodes", &self.graph.node_count())
            .finish()
    }
}

impl Sequencer {
    pub fn sequence(
        backend: &Backend,
        containers: Vec<Container>,
        name: impl Into<String>,
        options: SequencerOptions,
    ) -> Result<Self> {
        let name = name.into();
        for c in &containers {
            if c.device_count() != backend.device_count() {
                return Err(GridError::Configuration(format!(
                    "container `{}` spans {} devices, sequence `{name}` has {}",
                    c.name(),
                    c.device_count(),
                    backend.device_count()
                )));
            }
        }
        let parsed: Vec<Vec<Token>> = containers.iter().map(|c| c.parse().to_vec()).collect();
        let nodes = Self::expand(backend, &containers, &parsed, &options);
        let mut graph = ExecutionGraph::with_nodes(nodes);
        Self::connect(&mut graph);
        let removed = graph.transitive_reduction();
        tracing::info!(
            sequence = %name,
            containers = containers.len(),
            nodes = graph.node_count(),
            levels = graph.levels().len(),
            redundant_edges = removed,
            occ = %options.occ,
            "execution graph built"
        );
        Ok(Self {
            name,
            backend: backend.clone(),
            options,
            containers,
            graph,
        })
    }

    /// Fields whose halos are stale when the sequence starts: those left
    /// dirty by the previous pass, plus every field stencil-read before its
    /// first write, whose halos have never been filled on the first pass.
    fn initial_dirty(parsed: &[Vec<Token>], fields: &mut FieldIndex) -> BitVec {
        let mut written = BitVec::new();
        let mut stale_on_entry = BitVec::new();
        let mut dirty = BitVec::new();
        let mark = |bits: &mut BitVec, i: usize, v: bool| {
            if bits.len() <= i {
                bits.resize(i + 1, false);
            }
            bits.set(i, v);
        };
        for tokens in parsed {
            for t in tokens.iter().filter(|t| t.is_stencil_read()) {
                let i = fields.of(t.uid());
                if !written.get(i).map_or(false, |b| *b) {
                    mark(&mut stale_on_entry, i, true);
                }
                mark(&mut dirty, i, false);
            }
            for t in tokens.iter().filter(|t| t.access() == AccessType::Write) {
                let i = fields.of(t.uid());
                mark(&mut written, i, true);
                mark(&mut dirty, i, true);
            }
        }
        for i in stale_on_entry.iter_ones() {
            mark(&mut dirty, i, true);
        }
        dirty
    }

    fn expand(
        backend: &Backend,
        containers: &[Container],
        parsed: &[Vec<Token>],
        options: &SequencerOptions,
    ) -> Vec<GraphNode> {
        let multi_device = backend.device_count() > 1;
        let mut fields = FieldIndex::default();
        let mut dirty = Self::initial_dirty(parsed, &mut fields);
        let is_dirty = |dirty: &BitVec, uid: FieldUid| dirty.get(fields.0[&uid]).map_or(false, |b| *b);

        let mut nodes = vec![GraphNode::anchor(NodeRole::Begin)];
        for (ci, (container, tokens)) in containers.iter().zip(parsed).enumerate() {
            let mut halos = Vec::new();
            if multi_device {
                for t in tokens.iter().filter(|t| t.is_stencil_read()) {
                    if !is_dirty(&dirty, t.uid()) {
                        continue;
                    }
                    let transfer = Container::halo_update(backend, t.data().clone(), options.transfer_mode, t.semantic());
                    tracing::debug!(container = %container.name(), field = %t.name(), "halo update inserted");
                    halos.push(GraphNode {
                        role: NodeRole::HaloUpdate,
                        container: Some(transfer),
                        data_view: DataView::Standard,
                        tokens: vec![Token::new(t.data().clone(), AccessType::Write, ComputePattern::Map, t.semantic())],
                        origin: Some(ci),
                    });
                    dirty.set(fields.0[&t.uid()], false);
                }
            }

            let writes_exchanged = halos
                .iter()
                .any(|h| tokens.iter().any(|t| t.uid() == h.tokens[0].uid() && t.access() == AccessType::Write));
            let split = options.occ == Occ::Standard
                && !halos.is_empty()
                && container.supports_data_view_split()
                && !writes_exchanged;

            let compute = |data_view| GraphNode {
                role: NodeRole::Compute,
                container: Some(container.clone()),
                data_view,
                tokens: tokens.clone(),
                origin: Some(ci),
            };
            if split {
                tracing::debug!(container = %container.name(), "split into internal and boundary launches");
                nodes.push(compute(DataView::Internal));
                nodes.extend(halos);
                nodes.push(compute(DataView::Boundary));
            } else {
                nodes.extend(halos);
                nodes.push(compute(DataView::Standard));
            }

            for t in tokens.iter().filter(|t| t.access() == AccessType::Write) {
                dirty.set(fields.0[&t.uid()], true);
            }
        }
        nodes.push(GraphNode::anchor(NodeRole::End));
        nodes
    }

    fn independent(a: &GraphNode, b: &GraphNode) -> bool {
        if a.origin.is_none() || a.origin != b.origin {
            return false;
        }
        // Halves of one split launch touch disjoint blocks, and the internal
        // half never reads the halos refreshed for it.
        matches!(
            (a.data_view, b.data_view, a.role, b.role),
            (DataView::Internal, DataView::Boundary, _, _)
                | (DataView::Internal, _, _, NodeRole::HaloUpdate)
                | (_, DataView::Internal, NodeRole::HaloUpdate, _)
        )
    }

    fn connect(graph: &mut ExecutionGraph) {
        let n = graph.node_count();
        let end = n - 1;
        for j in 1..end {
            for i in 1..j {
                let (a, b) = (&graph.nodes[i], &graph.nodes[j]);
                if !Self::independent(a, b) && conflicts(&a.tokens, &b.tokens) {
                    graph.add_edge(i, j);
                }
            }
        }
        for j in 1..end {
            if graph.predecessors(j).next().is_none() {
                graph.add_edge(0, j);
            }
            if graph.succ[j].not_any() {
                graph.add_edge(j, end);
            }
        }
        if n == 2 {
            graph.add_edge(0, 1);
        }
    }

    /// Execute the graph once, level by level.
    pub fn run(&self) -> Result<()> {
        let _span = tracing::debug_span!("sequence", name = %self.name).entered();
        for level in self.graph.levels() {
            if self.options.parallel_levels && level.len() > 1 {
                self.backend.par_run(&level, |&i| self.graph.nodes[i].run())?;
            } else {
                for i in level {
                    self.graph.nodes[i].run()?;
                }
            }
        }
        Ok(())
    }

    pub fn sync(&self) {
        self.backend.sync();
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &SequencerOptions {
        &self.options
    }

    pub fn containers(&self) -> &[Container] {
        &self.containers
    }

    pub fn graph(&self) -> &ExecutionGraph {
        &self.graph
    }

    /// Graphviz rendering. With `debug`, node labels list their tokens.
    pub fn to_dot(&self, graph_name: &str, debug: bool) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "digraph \"{}\" {{", escape(graph_name));
        let _ = writeln!(out, "  node [shape=box, style=rounded];");
        for (i, node) in self.graph.nodes.iter().enumerate() {
            let mut label = escape(&node.label());
            if debug {
                for t in &node.tokens {
                    let _ = write!(label, "\\n{}", escape(&t.to_string()));
                }
            }
            let attrs = match (node.role, node.container.as_ref().map(Container::execution_type)) {
                (NodeRole::Begin | NodeRole::End, _) => ", shape=oval, style=filled, fillcolor=lightgrey",
                (NodeRole::HaloUpdate, _) => ", style=\"rounded,filled\", fillcolor=lightblue",
                (_, Some(ExecutionType::Host)) => ", style=\"rounded,filled\", fillcolor=lightyellow",
                _ if node.data_view == DataView::Internal => ", style=\"rounded,filled\", fillcolor=palegreen",
                _ if node.data_view == DataView::Boundary => ", style=\"rounded,filled\", fillcolor=orange",
                _ => "",
            };
            let _ = writeln!(out, "  n{i} [label=\"{label}\"{attrs}];");
        }
        for (from, to) in self.graph.edges() {
            let _ = writeln!(out, "  n{from} -> n{to};");
        }
        out.push_str("}\n");
        out
    }

    pub fn io_to_dot(&self, path: impl AsRef<Path>, graph_name: &str, debug: bool) -> Result<()> {
        std::fs::write(path.as_ref(), self.to_dot(graph_name, debug))?;
        tracing::info!(path = %path.as_ref().display(), "execution graph written");
        Ok(())
    }
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BlockGrid, BlockGridConfig, Index3d, Stencil};
    use crate::engine::field::Field;
    use crate::engine::loader::Loader;
    use crate::engine::token::StencilSemantic;

    fn grid(devices: usize) -> BlockGrid {
        let cfg = BlockGridConfig::new(Index3d::new(4, 4, 8), Index3d::splat(2), Stencil::s7_laplace());
        BlockGrid::new(Backend::new(devices).unwrap(), cfg, |_| true, |_| false).unwrap()
    }

    fn map(g: &BlockGrid, name: &str, src: &Field<f64>, dst: &Field<f64>) -> Container {
        let (src, dst) = (src.clone(), dst.clone());
        Container::device(name, g, move |l: &mut Loader| {
            let s = l.read(&src);
            let d = l.write(&dst);
            Box::new(move |idx| d.write(idx, 0, s.read(idx, 0) + 1.0))
        })
    }

    /// `dst = sum of the 6 face neighbours of src`.
    fn laplace(g: &BlockGrid, name: &str, src: &Field<f64>, dst: &Field<f64>) -> Container {
        let (src, dst) = (src.clone(), dst.clone());
        Container::device(name, g, move |l: &mut Loader| {
            let s = l.read_stencil(&src, StencilSemantic::Standard);
            let d = l.write(&dst);
            Box::new(move |idx| {
                let sum: f64 = Stencil::s7_laplace()
                    .points()
                    .iter()
                    .filter_map(|&o| s.neighbor(idx, o, 0))
                    .sum();
                d.write(idx, 0, sum);
            })
        })
    }

    fn compute_nodes(seq: &Sequencer) -> Vec<String> {
        seq.graph().nodes().iter().map(GraphNode::label).collect()
    }

    fn index_of(seq: &Sequencer, label: &str) -> usize {
        compute_nodes(seq).iter().position(|l| l == label).unwrap()
    }

    #[test]
    fn independent_containers_share_a_level() {
        let g = grid(1);
        let f = |n: &str| Field::new(&g, n, 1, 0.0).unwrap();
        let (a, b, c, d) = (f("a"), f("b"), f("c"), f("d"));
        let seq = Sequencer::sequence(
            g.backend(),
            vec![map(&g, "ab", &a, &b), map(&g, "cd", &c, &d)],
            "pair",
            SequencerOptions::default(),
        )
        .unwrap();
        assert_eq!(seq.graph().levels(), vec![vec![0], vec![1, 2], vec![3]]);
    }

    #[test]
    fn write_then_read_is_ordered_and_reduced() {
        let g = grid(1);
        let f = |n: &str| Field::new(&g, n, 1, 0.0).unwrap();
        let (a, b, c) = (f("a"), f("b"), f("c"));
        // ab -> bc, and ab -> ca conflicts on a, bc -> ca conflicts on c.
        let seq = Sequencer::sequence(
            g.backend(),
            vec![map(&g, "ab", &a, &b), map(&g, "bc", &b, &c), map(&g, "ca", &c, &a)],
            "chain",
            SequencerOptions::default(),
        )
        .unwrap();
        let graph = seq.graph();
        assert!(graph.has_edge(1, 2));
        assert!(graph.has_edge(2, 3));
        assert!(!graph.has_edge(1, 3), "implied by 1 -> 2 -> 3");
        assert!(graph.reaches(1, 3));
        assert_eq!(graph.edges().count(), 4);
    }

    #[test]
    fn single_device_needs_no_halo_update() {
        let g = grid(1);
        let (x, y) = (Field::new(&g, "x", 1, 0.0).unwrap(), Field::new(&g, "y", 1, 0.0).unwrap());
        let seq = Sequencer::sequence(
            g.backend(),
            vec![map(&g, "init", &y, &x), laplace(&g, "lap", &x, &y)],
            "one",
            SequencerOptions::default(),
        )
        .unwrap();
        assert!(seq.graph().nodes().iter().all(|n| n.role() != NodeRole::HaloUpdate));
    }

    #[test]
    fn stencil_read_after_write_gets_split_around_a_halo_update() {
        let g = grid(2);
        let (x, y, z) = (
            Field::new(&g, "x", 1, 0.0).unwrap(),
            Field::new(&g, "y", 1, 0.0).unwrap(),
            Field::new(&g, "z", 1, 0.0).unwrap(),
        );
        let seq = Sequencer::sequence(
            g.backend(),
            vec![map(&g, "init", &z, &x), laplace(&g, "lap", &x, &y)],
            "occ",
            SequencerOptions::default(),
        )
        .unwrap();
        assert_eq!(
            compute_nodes(&seq),
            vec!["begin", "init", "lap (internal)", "halo_x", "lap (boundary)", "end"]
        );
        let graph = seq.graph();
        let (init, internal, halo, boundary) = (1, 2, 3, 4);
        assert!(graph.has_edge(init, internal));
        assert!(graph.has_edge(init, halo));
        assert!(graph.has_edge(halo, boundary));
        assert!(!graph.reaches(halo, internal));
        assert!(!graph.reaches(internal, boundary));
        assert_eq!(graph.node(halo).operation_type(), OperationType::Communication);
    }

    #[test]
    fn occ_none_keeps_one_launch() {
        let g = grid(2);
        let (x, y, z) = (
            Field::new(&g, "x", 1, 0.0).unwrap(),
            Field::new(&g, "y", 1, 0.0).unwrap(),
            Field::new(&g, "z", 1, 0.0).unwrap(),
        );
        let options = SequencerOptions {
            occ: Occ::None,
            ..Default::default()
        };
        let seq = Sequencer::sequence(
            g.backend(),
            vec![map(&g, "init", &z, &x), laplace(&g, "lap", &x, &y)],
            "plain",
            options,
        )
        .unwrap();
        assert_eq!(compute_nodes(&seq), vec!["begin", "init", "halo_x", "lap", "end"]);
        assert!(seq.graph().has_edge(2, 3));
    }

    #[test]
    fn loop_carried_writes_trigger_a_halo_at_the_start() {
        let g = grid(2);
        let (x, y) = (Field::new(&g, "x", 1, 0.0).unwrap(), Field::new(&g, "y", 1, 0.0).unwrap());
        // Ping-pong: x is only written by the last container.
        let seq = Sequencer::sequence(
            g.backend(),
            vec![laplace(&g, "x2y", &x, &y), laplace(&g, "y2x", &y, &x)],
            "pingpong",
            SequencerOptions::default(),
        )
        .unwrap();
        let labels = compute_nodes(&seq);
        assert!(index_of(&seq, "halo_x") < index_of(&seq, "x2y (boundary)"));
        assert!(index_of(&seq, "halo_y") < index_of(&seq, "y2x (boundary)"));
        assert_eq!(labels.iter().filter(|l| l.starts_with("halo_")).count(), 2);
    }

    #[test]
    fn field_read_before_its_first_write_is_exchanged_on_the_first_pass() {
        let run_once = |devices: usize| {
            let g = grid(devices);
            let f = |n: &str| Field::new(&g, n, 1, 0.0).unwrap();
            let (x, y, z, w) = (f("x"), f("y"), f("z"), f("w"));
            x.fill_with(|v, _| f64::from(v.z));
            let seq = Sequencer::sequence(
                g.backend(),
                vec![laplace(&g, "x2y", &x, &y), map(&g, "z2x", &z, &x), laplace(&g, "x2w", &x, &w)],
                "refill",
                SequencerOptions::default(),
            )
            .unwrap();
            seq.run().unwrap();
            let halos: Vec<_> = seq
                .graph()
                .nodes()
                .iter()
                .filter(|n| n.role() == NodeRole::HaloUpdate)
                .map(GraphNode::label)
                .collect();
            (y.to_ndarray(), w.to_ndarray(), halos)
        };
        let (y1, w1, halos1) = run_once(1);
        let (y2, w2, halos2) = run_once(2);
        assert!(halos1.is_empty());
        assert_eq!(halos2, vec!["halo_x", "halo_x"]);
        // Four in-plane neighbours at z = 3, then z = 2 and z = 4.
        assert_eq!(y1[[0, 3, 1, 1]], 18.0);
        assert_eq!(y1, y2);
        assert_eq!(w1, w2);
    }

    #[test]
    fn clean_halos_are_not_refreshed_twice() {
        let g = grid(2);
        let (x, y, z) = (
            Field::new(&g, "x", 1, 0.0).unwrap(),
            Field::new(&g, "y", 1, 0.0).unwrap(),
            Field::new(&g, "z", 1, 0.0).unwrap(),
        );
        let seq = Sequencer::sequence(
            g.backend(),
            vec![laplace(&g, "x2y", &x, &y), laplace(&g, "x2z", &x, &z)],
            "twice",
            SequencerOptions::default(),
        )
        .unwrap();
        let halos = seq
            .graph()
            .nodes()
            .iter()
            .filter(|n| n.role() == NodeRole::HaloUpdate)
            .count();
        assert_eq!(halos, 1);
    }

    #[test]
    fn run_matches_sequential_execution() {
        for devices in [1, 2] {
            let g = grid(devices);
            let (x, y, z) = (
                Field::new(&g, "x", 1, 0.0).unwrap(),
                Field::new(&g, "y", 1, 0.0).unwrap(),
                Field::new(&g, "z", 1, 0.0).unwrap(),
            );
            z.fill_with(|v, _| f64::from(v.z));
            let seq = Sequencer::sequence(
                g.backend(),
                vec![map(&g, "init", &z, &x), laplace(&g, "lap", &x, &y)],
                "run",
                SequencerOptions::default(),
            )
            .unwrap();
            seq.run().unwrap();
            seq.sync();
            // Interior voxel (1,1,3): x = z + 1, neighbours in z are 3 and 5.
            let expected = 4.0 * 4.0 + 3.0 + 5.0;
            assert_eq!(y.read(Index3d::new(1, 1, 3), 0), Some(expected), "{devices} devices");
            assert_eq!(y.read(Index3d::new(1, 1, 4), 0), Some(4.0 * 5.0 + 4.0 + 6.0), "{devices} devices");
        }
    }

    #[test]
    fn mismatched_device_count_is_rejected() {
        let g1 = grid(1);
        let g2 = grid(2);
        let (a, b) = (Field::new(&g1, "a", 1, 0.0).unwrap(), Field::new(&g1, "b", 1, 0.0).unwrap());
        let err = Sequencer::sequence(g2.backend(), vec![map(&g1, "ab", &a, &b)], "bad", SequencerOptions::default());
        assert!(matches!(err, Err(GridError::Configuration(_))));
    }

    #[test]
    fn dot_export_lists_nodes_and_edges() {
        let g = grid(2);
        let (x, y, z) = (
            Field::new(&g, "x", 1, 0.0).unwrap(),
            Field::new(&g, "y", 1, 0.0).unwrap(),
            Field::new(&g, "z", 1, 0.0).unwrap(),
        );
        let seq = Sequencer::sequence(
            g.backend(),
            vec![map(&g, "init", &z, &x), laplace(&g, "lap", &x, &y)],
            "dot",
            SequencerOptions::default(),
        )
        .unwrap();
        let dot = seq.to_dot("My \"graph\"", true);
        assert!(dot.starts_with("digraph \"My \\\"graph\\\"\" {"));
        assert!(dot.contains("label=\"halo_x\\nx:WRITE:MAP\""));
        assert!(dot.contains("n3 -> n4;"));

        let path = std::env::temp_dir().join(format!("xgrid-dot-{}.dot", std::process::id()));
        seq.io_to_dot(&path, "dot", false).unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert!(written.contains("lap (boundary)"));
    }

    #[test]
    fn occ_names_round_trip() {
        for o in Occ::ALL {
            assert_eq!(o.to_string().parse::<Occ>().unwrap(), o);
        }
        assert!("aggressive".parse::<Occ>().is_err());
    }
}
