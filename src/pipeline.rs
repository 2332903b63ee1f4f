//! The declarative pipeline graph.
//!
//! A [`Pipeline`] is an immutable specification: a list of nodes wrapping
//! external tool invocations (plus source, rendered-file and sink nodes)
//! and a list of edges declaring that an output field of one node feeds an
//! input field of another. Assemblers build pipelines through
//! [`PipelineBuilder`]; nothing runs and nothing touches the filesystem
//! until the spec is handed to [`crate::exec`].

use camino::{Utf8Path, Utf8PathBuf};
use petgraph::Direction;
use petgraph::graph::{Graph, NodeIndex};
use petgraph::visit::EdgeRef;

use crate::error::PipelineError;

/// Name of a node's input or output slot. Slot names are fixed by the
/// assemblers, so static strings are sufficient.
pub type Field = &'static str;

/// One external command, with arguments bound either literally or to the
/// node's input/output fields at execution time.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub program: &'static str,
    pub args: Vec<Arg>,
}

#[derive(Debug, Clone)]
pub enum Arg {
    /// Fixed argument, known at assembly time.
    Lit(String),
    /// Resolves to the value bound to this input field: a path, several
    /// paths (one argument each), or captured text.
    Input(Field),
    /// Resolves to the staged input file with its extension stripped, the
    /// way `feat_model` wants its design prefix.
    InputStem(Field),
    /// `prefix` glued to a single input path, e.g. `--cope=<path>`.
    KeyInput(&'static str, Field),
    /// Resolves to the path declared for this output field.
    Output(Field),
    /// `prefix` glued to an output path.
    KeyOutput(&'static str, Field),
}

impl Invocation {
    pub fn new(program: &'static str) -> Self {
        Self {
            program,
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(Arg::Lit(arg.into()));
        self
    }

    pub fn input(mut self, field: Field) -> Self {
        self.args.push(Arg::Input(field));
        self
    }

    pub fn input_stem(mut self, field: Field) -> Self {
        self.args.push(Arg::InputStem(field));
        self
    }

    pub fn key_input(mut self, prefix: &'static str, field: Field) -> Self {
        self.args.push(Arg::KeyInput(prefix, field));
        self
    }

    pub fn output(mut self, field: Field) -> Self {
        self.args.push(Arg::Output(field));
        self
    }

    pub fn key_output(mut self, prefix: &'static str, field: Field) -> Self {
        self.args.push(Arg::KeyOutput(prefix, field));
        self
    }

    /// Input fields referenced anywhere in the argument list.
    pub fn input_fields(&self) -> impl Iterator<Item = Field> + '_ {
        self.args.iter().filter_map(|arg| match arg {
            Arg::Input(field) | Arg::InputStem(field) | Arg::KeyInput(_, field) => Some(*field),
            _ => None,
        })
    }

    /// Fields that must be staged (symlinked) into the node's working
    /// directory before the program runs.
    pub fn staged_fields(&self) -> impl Iterator<Item = Field> + '_ {
        self.args.iter().filter_map(|arg| match arg {
            Arg::InputStem(field) => Some(*field),
            _ => None,
        })
    }
}

/// A file (or file family) a tool node declares it will produce, relative
/// to the node's working directory. Patterns may contain glob
/// metacharacters when the tool emits a numbered family (`cope*.nii.gz`).
#[derive(Debug, Clone)]
pub struct OutputSpec {
    pub field: Field,
    pub pattern: String,
    pub required: bool,
}

impl OutputSpec {
    pub fn new(field: Field, pattern: impl Into<String>) -> Self {
        Self {
            field,
            pattern: pattern.into(),
            required: true,
        }
    }

    /// An output the tool emits only in some configurations; resolves to
    /// an empty file set instead of failing when nothing matches.
    pub fn optional(field: Field, pattern: impl Into<String>) -> Self {
        Self {
            field,
            pattern: pattern.into(),
            required: false,
        }
    }
}

/// Capture of a tool's stdout into a numeric output field, scaled by a
/// constant factor.
#[derive(Debug, Clone)]
pub struct StdoutCapture {
    pub field: Field,
    pub scale: f64,
}

/// Routing of one sink input field into a subdirectory of the pipeline's
/// output directory.
#[derive(Debug, Clone)]
pub struct Route {
    pub input: Field,
    pub subdir: &'static str,
}

/// File binding declared by a source node.
#[derive(Debug, Clone)]
pub enum SourceValue {
    File(Utf8PathBuf),
    Files(Vec<Utf8PathBuf>),
}

impl From<Utf8PathBuf> for SourceValue {
    fn from(path: Utf8PathBuf) -> Self {
        SourceValue::File(path)
    }
}

impl From<&Utf8Path> for SourceValue {
    fn from(path: &Utf8Path) -> Self {
        SourceValue::File(path.to_path_buf())
    }
}

impl From<Vec<Utf8PathBuf>> for SourceValue {
    fn from(paths: Vec<Utf8PathBuf>) -> Self {
        SourceValue::Files(paths)
    }
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    /// Binds pre-existing files to output fields.
    Source { fields: Vec<(Field, SourceValue)> },
    /// Runs an external program.
    Tool {
        invocation: Invocation,
        outputs: Vec<OutputSpec>,
        /// Inputs symlinked into the working directory even when they do
        /// not appear in the argument list (companion files referenced by
        /// relative name, like the EV text files next to a design.fsf).
        stages: Vec<Field>,
        stdout: Option<StdoutCapture>,
    },
    /// Writes configuration text rendered at assembly time. The first
    /// file is bound to `field`; companions land alongside it.
    Render {
        field: Field,
        files: Vec<(String, String)>,
        /// Output field exposing every companion file after the first.
        companions: Option<Field>,
    },
    /// Copies wired inputs into the output directory.
    Sink {
        base: Utf8PathBuf,
        routes: Vec<Route>,
    },
}

#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    pub kind: NodeKind,
}

impl Node {
    /// Output fields this node can feed into an edge.
    fn output_fields(&self) -> Vec<Field> {
        match &self.kind {
            NodeKind::Source { fields } => fields.iter().map(|(field, _)| *field).collect(),
            NodeKind::Tool {
                outputs, stdout, ..
            } => {
                let mut fields: Vec<Field> = outputs.iter().map(|out| out.field).collect();
                if let Some(capture) = stdout {
                    fields.push(capture.field);
                }
                fields
            }
            NodeKind::Render {
                field, companions, ..
            } => {
                let mut fields = vec![*field];
                fields.extend(companions);
                fields
            }
            NodeKind::Sink { .. } => vec![],
        }
    }

    /// Input fields this node requires to be wired exactly once.
    fn input_fields(&self) -> Vec<Field> {
        match &self.kind {
            NodeKind::Source { .. } | NodeKind::Render { .. } => vec![],
            NodeKind::Tool {
                invocation, stages, ..
            } => {
                let mut fields: Vec<Field> = invocation.input_fields().collect();
                fields.extend(stages);
                fields
            }
            NodeKind::Sink { routes, .. } => routes.iter().map(|route| route.input).collect(),
        }
    }
}

/// An edge: `from_field` of the source node feeds `to_field` of the target.
#[derive(Debug, Clone)]
pub struct Wire {
    pub from_field: Field,
    pub to_field: Field,
}

/// Lightweight token for a node added to a builder, used to wire edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeHandle(pub(crate) NodeIndex);

/// A validated, immutable pipeline specification.
#[derive(Debug, Clone)]
pub struct Pipeline {
    name: String,
    graph: Graph<Node, Wire>,
}

impl Pipeline {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub(crate) fn graph(&self) -> &Graph<Node, Wire> {
        &self.graph
    }

    pub fn node_names(&self) -> impl Iterator<Item = &str> {
        self.graph.node_weights().map(|node| node.name.as_str())
    }

    /// Whether any tool node invokes the given program.
    pub fn invokes(&self, program: &str) -> bool {
        self.graph.node_weights().any(|node| {
            matches!(&node.kind, NodeKind::Tool { invocation, .. } if invocation.program == program)
        })
    }

    pub(crate) fn incoming(&self, index: NodeIndex) -> impl Iterator<Item = (NodeIndex, &Wire)> {
        self.graph
            .edges_directed(index, Direction::Incoming)
            .map(|edge| (edge.source(), edge.weight()))
    }

    /// Nodes in dependency order; every producer precedes its consumers.
    pub(crate) fn topo_order(&self) -> Vec<NodeIndex> {
        petgraph::algo::toposort(&self.graph, None)
            .unwrap_or_else(|_| unreachable!("pipeline validated acyclic at build time"))
    }
}

/// Renders the graph as a Mermaid sketch, handy for debugging topologies.
impl std::fmt::Display for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "graph LR")?;

        for index in self.graph.node_indices() {
            writeln!(f, "    {}[\"{}\"]", index.index(), self.graph[index].name)?;
        }

        for edge in self.graph.edge_indices() {
            let (source, target) = self
                .graph
                .edge_endpoints(edge)
                .unwrap_or_else(|| unreachable!("edge endpoints exist by construction"));
            let wire = &self.graph[edge];
            writeln!(
                f,
                "    {} -- \"{} -> {}\" --> {}",
                source.index(),
                wire.from_field,
                wire.to_field,
                target.index()
            )?;
        }

        Ok(())
    }
}

/// Builder for a [`Pipeline`]. Nodes are added, wired, and validated once
/// at [`finish`](Self::finish); the result never changes afterwards.
pub struct PipelineBuilder {
    name: String,
    graph: Graph<Node, Wire>,
}

impl PipelineBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            graph: Graph::new(),
        }
    }

    pub fn source(
        &mut self,
        name: &str,
        fields: Vec<(Field, SourceValue)>,
    ) -> NodeHandle {
        self.add(name, NodeKind::Source { fields })
    }

    pub fn tool(
        &mut self,
        name: &str,
        invocation: Invocation,
        outputs: Vec<OutputSpec>,
    ) -> NodeHandle {
        self.add(
            name,
            NodeKind::Tool {
                invocation,
                outputs,
                stages: Vec::new(),
                stdout: None,
            },
        )
    }

    /// Tool with extra inputs staged into its working directory.
    pub fn tool_with_stages(
        &mut self,
        name: &str,
        invocation: Invocation,
        outputs: Vec<OutputSpec>,
        stages: Vec<Field>,
    ) -> NodeHandle {
        self.add(
            name,
            NodeKind::Tool {
                invocation,
                outputs,
                stages,
                stdout: None,
            },
        )
    }

    /// Tool whose stdout is captured into `field`, scaled by `scale`.
    pub fn tool_capture(
        &mut self,
        name: &str,
        invocation: Invocation,
        field: Field,
        scale: f64,
    ) -> NodeHandle {
        self.add(
            name,
            NodeKind::Tool {
                invocation,
                outputs: vec![],
                stages: Vec::new(),
                stdout: Some(StdoutCapture { field, scale }),
            },
        )
    }

    /// Single rendered file bound to `field`.
    pub fn render(
        &mut self,
        name: &str,
        field: Field,
        file_name: impl Into<String>,
        contents: String,
    ) -> NodeHandle {
        self.add(
            name,
            NodeKind::Render {
                field,
                files: vec![(file_name.into(), contents)],
                companions: None,
            },
        )
    }

    /// Rendered file plus companion files exposed under a second field.
    pub fn render_with_companions(
        &mut self,
        name: &str,
        field: Field,
        companions: Field,
        files: Vec<(String, String)>,
    ) -> NodeHandle {
        self.add(
            name,
            NodeKind::Render {
                field,
                files,
                companions: Some(companions),
            },
        )
    }

    pub fn sink(
        &mut self,
        name: &str,
        base: impl AsRef<Utf8Path>,
        routes: Vec<Route>,
    ) -> NodeHandle {
        self.add(
            name,
            NodeKind::Sink {
                base: base.as_ref().to_path_buf(),
                routes,
            },
        )
    }

    fn add(&mut self, name: &str, kind: NodeKind) -> NodeHandle {
        NodeHandle(self.graph.add_node(Node {
            name: name.to_string(),
            kind,
        }))
    }

    /// Declare that `from_field` of `from` feeds `to_field` of `to`.
    pub fn wire(&mut self, from: NodeHandle, from_field: Field, to: NodeHandle, to_field: Field) {
        self.graph.add_edge(
            from.0,
            to.0,
            Wire {
                from_field,
                to_field,
            },
        );
    }

    /// Validate and freeze the specification.
    ///
    /// Rejects cycles, edges leaving a field the producer never declares,
    /// and input fields left unwired or wired more than once.
    pub fn finish(self) -> Result<Pipeline, PipelineError> {
        if petgraph::algo::toposort(&self.graph, None).is_err() {
            return Err(PipelineError::Cycle);
        }

        for edge in self.graph.edge_indices() {
            let (source, _) = self
                .graph
                .edge_endpoints(edge)
                .unwrap_or_else(|| unreachable!("edge endpoints exist by construction"));
            let wire = &self.graph[edge];
            let producer = &self.graph[source];
            if !producer.output_fields().contains(&wire.from_field) {
                return Err(PipelineError::UnknownOutput {
                    node: producer.name.clone(),
                    field: wire.from_field,
                });
            }
        }

        for index in self.graph.node_indices() {
            let node = &self.graph[index];
            for field in node.input_fields() {
                let wired = self
                    .graph
                    .edges_directed(index, Direction::Incoming)
                    .filter(|edge| edge.weight().to_field == field)
                    .count();
                match wired {
                    0 => {
                        return Err(PipelineError::UnwiredInput {
                            node: node.name.clone(),
                            field,
                        });
                    }
                    1 => {}
                    _ => {
                        return Err(PipelineError::DuplicateInput {
                            node: node.name.clone(),
                            field,
                        });
                    }
                }
            }
        }

        Ok(Pipeline {
            name: self.name,
            graph: self.graph,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cat(field_in: Field, field_out: Field) -> Invocation {
        Invocation::new("cat").input(field_in).output(field_out)
    }

    fn file(path: &str) -> SourceValue {
        SourceValue::File(Utf8PathBuf::from(path))
    }

    #[test]
    fn valid_chain_finishes() {
        let mut builder = PipelineBuilder::new("chain");
        let source = builder.source("in", vec![("file", file("/data/a.txt"))]);
        let step = builder.tool(
            "copy",
            cat("in_file", "out_file"),
            vec![OutputSpec::new("out_file", "out.txt")],
        );
        builder.wire(source, "file", step, "in_file");

        let pipeline = builder.finish().unwrap();
        assert_eq!(pipeline.node_count(), 2);
        assert!(pipeline.invokes("cat"));
        assert!(!pipeline.invokes("susan"));
    }

    #[test]
    fn unwired_input_is_rejected() {
        let mut builder = PipelineBuilder::new("bad");
        builder.tool(
            "copy",
            cat("in_file", "out_file"),
            vec![OutputSpec::new("out_file", "out.txt")],
        );

        let err = builder.finish().unwrap_err();
        assert!(matches!(err, PipelineError::UnwiredInput { field: "in_file", .. }));
    }

    #[test]
    fn unknown_output_field_is_rejected() {
        let mut builder = PipelineBuilder::new("bad");
        let source = builder.source("in", vec![("file", file("/data/a.txt"))]);
        let step = builder.tool(
            "copy",
            cat("in_file", "out_file"),
            vec![OutputSpec::new("out_file", "out.txt")],
        );
        builder.wire(source, "nope", step, "in_file");

        let err = builder.finish().unwrap_err();
        assert!(matches!(err, PipelineError::UnknownOutput { field: "nope", .. }));
    }

    #[test]
    fn duplicate_input_wiring_is_rejected() {
        let mut builder = PipelineBuilder::new("bad");
        let source = builder.source(
            "in",
            vec![("a", file("/data/a.txt")), ("b", file("/data/b.txt"))],
        );
        let step = builder.tool(
            "copy",
            cat("in_file", "out_file"),
            vec![OutputSpec::new("out_file", "out.txt")],
        );
        builder.wire(source, "a", step, "in_file");
        builder.wire(source, "b", step, "in_file");

        let err = builder.finish().unwrap_err();
        assert!(matches!(err, PipelineError::DuplicateInput { field: "in_file", .. }));
    }

    #[test]
    fn staged_fields_must_be_wired() {
        let mut builder = PipelineBuilder::new("bad");
        builder.tool_with_stages(
            "design",
            Invocation::new("feat_model").input_stem("fsf_file"),
            vec![OutputSpec::new("design_file", "design.mat")],
            vec!["ev_files"],
        );

        let err = builder.finish().unwrap_err();
        assert!(matches!(err, PipelineError::UnwiredInput { .. }));
    }

    #[test]
    fn cycle_is_rejected() {
        let mut builder = PipelineBuilder::new("bad");
        let a = builder.tool("a", cat("x", "y"), vec![OutputSpec::new("y", "y")]);
        let b = builder.tool("b", cat("y", "x"), vec![OutputSpec::new("x", "x")]);
        builder.wire(a, "y", b, "y");
        builder.wire(b, "x", a, "x");

        let err = builder.finish().unwrap_err();
        assert!(matches!(err, PipelineError::Cycle));
    }

    #[test]
    fn display_renders_mermaid() {
        let mut builder = PipelineBuilder::new("chain");
        let source = builder.source("in", vec![("file", file("/a"))]);
        let step = builder.tool(
            "copy",
            cat("in_file", "out_file"),
            vec![OutputSpec::new("out_file", "out")],
        );
        builder.wire(source, "file", step, "in_file");

        let rendered = builder.finish().unwrap().to_string();
        assert!(rendered.starts_with("graph LR"));
        assert!(rendered.contains("file -> in_file"));
    }
}
