//! Pipeline execution.
//!
//! Each pipeline runs its nodes inline, in topological order, on the
//! thread that picked it up; parallelism lives between pipelines, where a
//! worker pool takes one pipeline each and runs it to completion. A run's
//! graph is nearly a chain, so there is nothing to gain from scheduling
//! inside it, and a worker must never block waiting on tasks queued
//! behind it on the same pool. Each tool node runs one external process in
//! its own working directory; a nonzero exit aborts that pipeline but
//! never its siblings in a batch.

use std::collections::HashMap;
use std::process::Command;
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use indicatif::ProgressBar;
use petgraph::graph::NodeIndex;
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::error::ExecError;
use crate::pipeline::{Arg, Field, Node, NodeKind, OutputSpec, Pipeline, SourceValue};
use crate::utils::{as_overhead, progress_style};

/// How much of the batch may run at once.
#[derive(Debug, Clone, Copy)]
pub enum ExecPolicy {
    Serial,
    Workers(usize),
}

/// A value flowing along a wire: a single file, a file family, or text
/// captured from a tool's stdout.
#[derive(Debug, Clone)]
enum Value {
    Path(Utf8PathBuf),
    Paths(Vec<Utf8PathBuf>),
    Text(String),
}

impl Value {
    fn files(&self) -> Vec<Utf8PathBuf> {
        match self {
            Value::Path(path) => vec![path.clone()],
            Value::Paths(paths) => paths.clone(),
            Value::Text(_) => Vec::new(),
        }
    }
}

type Outputs = HashMap<Field, Value>;

/// Run every pipeline in the batch under the given policy. Each pipeline's
/// outcome is reported individually; one failure never stops the rest.
pub fn run_batch(
    pipelines: &[Pipeline],
    work_dir: &Utf8Path,
    policy: ExecPolicy,
) -> Result<Vec<(String, Result<(), ExecError>)>, ExecError> {
    let s = Instant::now();

    let bar = ProgressBar::new(pipelines.len() as u64);
    bar.set_style(progress_style());
    bar.set_message("Running pipelines...");

    let run_all = |pipelines: &[Pipeline]| -> Vec<(String, Result<(), ExecError>)> {
        use rayon::prelude::*;
        pipelines
            .par_iter()
            .map(|pipeline| {
                let result = run_pipeline(pipeline, work_dir);
                if let Err(err) = &result {
                    tracing::warn!("Pipeline {} failed: {err}", pipeline.name());
                }
                bar.inc(1);
                (pipeline.name().to_string(), result)
            })
            .collect()
    };

    let results = match policy {
        ExecPolicy::Serial => pipelines
            .iter()
            .map(|pipeline| {
                let result = run_pipeline(pipeline, work_dir);
                if let Err(err) = &result {
                    tracing::warn!("Pipeline {} failed: {err}", pipeline.name());
                }
                bar.inc(1);
                (pipeline.name().to_string(), result)
            })
            .collect(),
        ExecPolicy::Workers(n) => {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(n.max(1))
                .build()?;
            pool.install(|| run_all(pipelines))
        }
    };

    bar.finish_with_message(format!("Finished pipelines {}", as_overhead(s)));
    Ok(results)
}

/// Execute one pipeline: nodes run inline, in topological order, on the
/// calling thread. The first failing node aborts the rest of its pipeline.
pub fn run_pipeline(pipeline: &Pipeline, work_dir: &Utf8Path) -> Result<(), ExecError> {
    let graph = pipeline.graph();
    let pipeline_dir = work_dir.join(pipeline.name());
    if pipeline_dir.exists() {
        std::fs::remove_dir_all(&pipeline_dir)?;
    }
    std::fs::create_dir_all(&pipeline_dir)?;

    let span = tracing::span!(Level::INFO, "pipeline", name = pipeline.name());
    let _enter = span.enter();

    let mut cache: HashMap<NodeIndex, Outputs> = HashMap::new();
    for index in pipeline.topo_order() {
        let node = &graph[index];

        // Gather the wired inputs from upstream outputs.
        let mut inputs: Outputs = HashMap::new();
        for (source, wire) in pipeline.incoming(index) {
            if let Some(value) = cache.get(&source).and_then(|o| o.get(wire.from_field)) {
                inputs.insert(wire.to_field, value.clone());
            }
        }

        let span = tracing::span!(Level::INFO, "node", name = node.name.as_str());
        span.pb_set_message(&format!("Running {}", node.name));
        let _enter = span.enter();

        let node_dir = pipeline_dir.join(&node.name);
        let outputs = execute_node(node, &node_dir, &inputs)?;
        cache.insert(index, outputs);
    }

    tracing::info!("Pipeline {} complete", pipeline.name());
    Ok(())
}

fn execute_node(node: &Node, node_dir: &Utf8Path, inputs: &Outputs) -> Result<Outputs, ExecError> {
    match &node.kind {
        NodeKind::Source { fields } => run_source(node, fields),
        NodeKind::Render {
            field,
            files,
            companions,
        } => run_render(node_dir, *field, files, *companions),
        NodeKind::Tool {
            invocation,
            outputs,
            stages,
            stdout,
        } => run_tool(node, node_dir, inputs, invocation, outputs, stages, stdout.as_ref()),
        NodeKind::Sink { base, routes } => {
            for route in routes {
                let value = require(node, inputs, &route.input)?;
                let files = value.files();
                if files.is_empty() {
                    continue;
                }
                let dir = base.join(route.subdir);
                std::fs::create_dir_all(&dir)?;
                for file in files {
                    let name = file
                        .file_name()
                        .ok_or_else(|| ExecError::MissingInput {
                            node: node.name.clone(),
                            path: file.clone(),
                        })?;
                    std::fs::copy(&file, dir.join(name))?;
                }
            }
            Ok(HashMap::new())
        }
    }
}

fn run_source(node: &Node, fields: &[(Field, SourceValue)]) -> Result<Outputs, ExecError> {
    let mut outputs = HashMap::new();
    for (field, value) in fields {
        let value = match value {
            SourceValue::File(path) => Value::Path(path.clone()),
            SourceValue::Files(paths) => Value::Paths(paths.clone()),
        };
        for path in value.files() {
            if !path.exists() {
                return Err(ExecError::MissingInput {
                    node: node.name.clone(),
                    path,
                });
            }
        }
        outputs.insert(*field, value);
    }
    Ok(outputs)
}

fn run_render(
    node_dir: &Utf8Path,
    field: Field,
    files: &[(String, String)],
    companions: Option<Field>,
) -> Result<Outputs, ExecError> {
    std::fs::create_dir_all(node_dir)?;

    let mut written = Vec::with_capacity(files.len());
    for (name, contents) in files {
        let path = node_dir.join(name);
        std::fs::write(&path, contents)?;
        written.push(path);
    }

    let mut outputs = HashMap::new();
    let mut written = written.into_iter();
    if let Some(primary) = written.next() {
        outputs.insert(field, Value::Path(primary));
    }
    if let Some(companions) = companions {
        outputs.insert(companions, Value::Paths(written.collect()));
    }
    Ok(outputs)
}

fn run_tool(
    node: &Node,
    node_dir: &Utf8Path,
    inputs: &Outputs,
    invocation: &crate::pipeline::Invocation,
    outputs: &[OutputSpec],
    stages: &[Field],
    stdout: Option<&crate::pipeline::StdoutCapture>,
) -> Result<Outputs, ExecError> {
    std::fs::create_dir_all(node_dir)?;

    // Stage companion inputs into the working directory so the tool can
    // reach them by relative name.
    let staged: Vec<Field> = invocation.staged_fields().chain(stages.iter().copied()).collect();
    for field in &staged {
        for file in require(node, inputs, field)?.files() {
            stage_file(node, &file, node_dir)?;
        }
    }

    let mut argv: Vec<String> = Vec::new();
    for arg in &invocation.args {
        match arg {
            Arg::Lit(text) => argv.push(text.clone()),
            Arg::Input(field) => match require(node, inputs, field)? {
                Value::Path(path) => argv.push(path.to_string()),
                Value::Paths(paths) => argv.extend(paths.iter().map(|p| p.to_string())),
                Value::Text(text) => argv.push(text.clone()),
            },
            Arg::InputStem(field) => {
                let path = single_path(node, require(node, inputs, field)?, field)?;
                let name = path.file_name().unwrap_or_default();
                let stem = name.split('.').next().unwrap_or(name);
                argv.push(node_dir.join(stem).to_string());
            }
            Arg::KeyInput(prefix, field) => {
                let value = require(node, inputs, field)?;
                let text = match value {
                    Value::Text(text) => text.clone(),
                    other => single_path(node, other, field)?.to_string(),
                };
                argv.push(format!("{prefix}{text}"));
            }
            Arg::Output(field) => {
                argv.push(node_dir.join(output_pattern(outputs, field)).to_string());
            }
            Arg::KeyOutput(prefix, field) => {
                argv.push(format!("{prefix}{}", node_dir.join(output_pattern(outputs, field))));
            }
        }
    }

    tracing::debug!("{}: {} {}", node.name, invocation.program, argv.join(" "));
    let output = Command::new(invocation.program)
        .args(&argv)
        .current_dir(node_dir)
        .output()
        .map_err(|e| ExecError::Spawn {
            node: node.name.clone(),
            program: invocation.program,
            source: e,
        })?;

    if !output.status.success() {
        return Err(ExecError::Tool {
            node: node.name.clone(),
            program: invocation.program,
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    let mut resolved: Outputs = HashMap::new();
    if let Some(capture) = stdout {
        let text = String::from_utf8_lossy(&output.stdout);
        let token = text.split_whitespace().next().unwrap_or("");
        let value: f64 = token.parse().map_err(|_| ExecError::StdoutParse {
            node: node.name.clone(),
            value: token.to_string(),
        })?;
        resolved.insert(capture.field, Value::Text(format!("{:.6}", value * capture.scale)));
    }

    for spec in outputs {
        let pattern = node_dir.join(&spec.pattern);
        let mut matches: Vec<Utf8PathBuf> = Vec::new();
        for entry in glob::glob(pattern.as_str())? {
            if let Ok(path) = Utf8PathBuf::from_path_buf(entry?) {
                matches.push(path);
            }
        }
        matches.sort_unstable();

        let is_family = spec.pattern.contains(['*', '?', '[']);
        let value = match (matches.len(), is_family) {
            (0, _) if spec.required => {
                return Err(ExecError::NoOutput {
                    node: node.name.clone(),
                    pattern: spec.pattern.clone(),
                });
            }
            (1, false) => Value::Path(matches.remove(0)),
            _ => Value::Paths(matches),
        };
        resolved.insert(spec.field, value);
    }

    Ok(resolved)
}

fn require<'a>(node: &Node, inputs: &'a Outputs, field: &Field) -> Result<&'a Value, ExecError> {
    inputs.get(field).ok_or_else(|| ExecError::MissingField {
        node: node.name.clone(),
        field: *field,
    })
}

fn single_path<'a>(
    node: &Node,
    value: &'a Value,
    field: &Field,
) -> Result<&'a Utf8Path, ExecError> {
    match value {
        Value::Path(path) => Ok(path),
        Value::Paths(paths) if paths.len() == 1 => Ok(&paths[0]),
        _ => Err(ExecError::MissingField {
            node: node.name.clone(),
            field: *field,
        }),
    }
}

fn output_pattern<'a>(outputs: &'a [OutputSpec], field: &Field) -> &'a str {
    outputs
        .iter()
        .find(|spec| spec.field == *field)
        .map(|spec| spec.pattern.as_str())
        .unwrap_or(*field)
}

fn stage_file(node: &Node, file: &Utf8Path, node_dir: &Utf8Path) -> Result<(), ExecError> {
    let name = file.file_name().ok_or_else(|| ExecError::MissingInput {
        node: node.name.clone(),
        path: file.to_path_buf(),
    })?;
    let link = node_dir.join(name);
    if link.exists() {
        std::fs::remove_file(&link)?;
    }

    #[cfg(unix)]
    std::os::unix::fs::symlink(file, &link)?;
    #[cfg(not(unix))]
    std::fs::copy(file, &link)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{Invocation, PipelineBuilder, Route};

    fn utf8(path: &std::path::Path) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(path.to_path_buf()).unwrap()
    }

    fn copy_chain(input: &Utf8Path, out_dir: &Utf8Path) -> Pipeline {
        let mut builder = PipelineBuilder::new("chain");
        let source = builder.source("inputs", vec![("file", input.into())]);
        let copy = builder.tool(
            "copy",
            Invocation::new("cp").input("in_file").output("out_file"),
            vec![OutputSpec::new("out_file", "copied.txt")],
        );
        let sink = builder.sink(
            "datasink",
            out_dir,
            vec![Route { input: "result", subdir: "text" }],
        );
        builder.wire(source, "file", copy, "in_file");
        builder.wire(copy, "out_file", sink, "result");
        builder.finish().unwrap()
    }

    #[test]
    fn chain_runs_and_sinks_output() {
        let dir = tempfile::tempdir().unwrap();
        let root = utf8(dir.path());
        let input = root.join("input.txt");
        std::fs::write(&input, "hello").unwrap();
        let out_dir = root.join("out");

        run_pipeline(&copy_chain(&input, &out_dir), &root.join("work")).unwrap();

        let sunk = out_dir.join("text/copied.txt");
        assert_eq!(std::fs::read_to_string(sunk).unwrap(), "hello");
    }

    #[test]
    fn missing_source_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let root = utf8(dir.path());
        let pipeline = copy_chain(&root.join("nope.txt"), &root.join("out"));

        let err = run_pipeline(&pipeline, &root.join("work")).unwrap_err();
        assert!(matches!(err, ExecError::MissingInput { .. }));
    }

    #[test]
    fn failing_tool_aborts_only_its_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let root = utf8(dir.path());
        let input = root.join("input.txt");
        std::fs::write(&input, "hello").unwrap();

        let mut builder = PipelineBuilder::new("broken");
        builder.tool("fail", Invocation::new("false"), vec![]);
        let broken = builder.finish().unwrap();
        let good = copy_chain(&input, &root.join("out"));

        let results =
            run_batch(&[broken, good], &root.join("work"), ExecPolicy::Workers(2)).unwrap();
        let by_name: HashMap<_, _> = results.into_iter().collect();
        assert!(matches!(by_name["broken"], Err(ExecError::Tool { .. })));
        assert!(by_name["chain"].is_ok());
    }

    #[test]
    fn single_worker_pool_makes_progress() {
        let dir = tempfile::tempdir().unwrap();
        let root = utf8(dir.path());
        let input = root.join("input.txt");
        std::fs::write(&input, "hello").unwrap();

        // One worker must be able to run a whole pipeline to completion;
        // nothing inside a pipeline may wait on the pool it runs on.
        let results = run_batch(
            &[copy_chain(&input, &root.join("out"))],
            &root.join("work"),
            ExecPolicy::Workers(1),
        )
        .unwrap();
        assert!(results[0].1.is_ok());

        // Same constraint when the global pool itself has one thread.
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(1)
            .build()
            .unwrap();
        pool.install(|| {
            run_pipeline(&copy_chain(&input, &root.join("out2")), &root.join("work2"))
        })
        .unwrap();
        assert!(root.join("out2/text/copied.txt").exists());
    }

    #[test]
    fn stdout_capture_scales_and_feeds_downstream() {
        let dir = tempfile::tempdir().unwrap();
        let root = utf8(dir.path());
        let out_dir = root.join("out");

        let mut builder = PipelineBuilder::new("capture");
        let median = builder.tool_capture(
            "median",
            Invocation::new("echo").arg("4.0"),
            "threshold",
            0.75,
        );
        let write = builder.tool(
            "write",
            Invocation::new("sh")
                .arg("-c")
                .arg("echo \"$0\" > value.txt")
                .input("threshold"),
            vec![OutputSpec::new("value_file", "value.txt")],
        );
        let sink = builder.sink(
            "datasink",
            &out_dir,
            vec![Route { input: "value_file", subdir: "text" }],
        );
        builder.wire(median, "threshold", write, "threshold");
        builder.wire(write, "value_file", sink, "value_file");

        run_pipeline(&builder.finish().unwrap(), &root.join("work")).unwrap();

        let text = std::fs::read_to_string(out_dir.join("text/value.txt")).unwrap();
        assert_eq!(text.trim(), "3.000000");
    }

    #[test]
    fn rendered_files_are_staged_for_tools() {
        let dir = tempfile::tempdir().unwrap();
        let root = utf8(dir.path());
        let out_dir = root.join("out");

        let mut builder = PipelineBuilder::new("staging");
        let model = builder.render_with_companions(
            "model",
            "fsf_file",
            "ev_files",
            vec![
                ("design.fsf".to_string(), "head ".to_string()),
                ("ev_1.txt".to_string(), "tail".to_string()),
            ],
        );
        // The design prefix arrives without its extension; the companion
        // is reachable by relative name from the working directory.
        let design = builder.tool_with_stages(
            "design",
            Invocation::new("sh")
                .arg("-c")
                .arg("cat \"$0.fsf\" ev_1.txt > out.txt")
                .input_stem("fsf_file"),
            vec![OutputSpec::new("out_file", "out.txt")],
            vec!["ev_files"],
        );
        let sink = builder.sink(
            "datasink",
            &out_dir,
            vec![Route { input: "out_file", subdir: "text" }],
        );
        builder.wire(model, "fsf_file", design, "fsf_file");
        builder.wire(model, "ev_files", design, "ev_files");
        builder.wire(design, "out_file", sink, "out_file");

        run_pipeline(&builder.finish().unwrap(), &root.join("work")).unwrap();

        let text = std::fs::read_to_string(out_dir.join("text/out.txt")).unwrap();
        assert_eq!(text, "head tail");
    }

    #[test]
    fn optional_outputs_may_match_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let root = utf8(dir.path());
        let out_dir = root.join("out");

        let mut builder = PipelineBuilder::new("optional");
        let touch = builder.tool(
            "touch",
            Invocation::new("touch").output("present"),
            vec![
                OutputSpec::new("present", "present.txt"),
                OutputSpec::optional("absent", "absent*.txt"),
            ],
        );
        let sink = builder.sink(
            "datasink",
            &out_dir,
            vec![
                Route { input: "present", subdir: "files" },
                Route { input: "absent", subdir: "files" },
            ],
        );
        builder.wire(touch, "present", sink, "present");
        builder.wire(touch, "absent", sink, "absent");

        run_pipeline(&builder.finish().unwrap(), &root.join("work")).unwrap();
        assert!(out_dir.join("files/present.txt").exists());
    }

    #[test]
    fn serial_policy_runs_every_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let root = utf8(dir.path());
        let input = root.join("input.txt");
        std::fs::write(&input, "x").unwrap();

        let pipelines: Vec<Pipeline> = (0..3)
            .map(|i| {
                let mut builder = PipelineBuilder::new(format!("p{i}"));
                let source = builder.source("inputs", vec![("file", input.as_path().into())]);
                let sink = builder.sink(
                    "datasink",
                    root.join(format!("out{i}")),
                    vec![Route { input: "file", subdir: "text" }],
                );
                builder.wire(source, "file", sink, "file");
                builder.finish().unwrap()
            })
            .collect();

        let results = run_batch(&pipelines, &root.join("work"), ExecPolicy::Serial).unwrap();
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|(_, r)| r.is_ok()));
        assert!(root.join("out2/text/input.txt").exists());
    }
}
