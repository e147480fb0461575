use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use tokio::process::Command;
use tracing::{debug, info};

use super::{SolveRequest, SolverGateway, VisualizationService};
use crate::core::artifacts::{TargetSpace, write_json_atomic};
use crate::core::config::ToolConfig;
use crate::core::envelope::FieldSampleSet;
use crate::core::error::{TiError, TiResult};
use crate::core::montage::{CatalogView, MontageModel, Point3};

const EXCERPT_LINES: usize = 20;

static ERROR_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(ERROR\b|Traceback \(most recent call last\)|Segmentation fault)")
        .expect("error marker pattern is valid")
});

#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub status: i32,
    pub lines: Vec<String>,
}

/// Runs `argv` to completion, echoing its output into the current span.
///
/// The child is killed if this future is dropped, which is how a montage
/// timeout stops an in-flight solve.
pub async fn run_tool(tool: &str, argv: &[String], cwd: Option<&Path>) -> TiResult<ToolOutput> {
    let (program, args) = argv.split_first().ok_or_else(|| TiError::ExternalTool {
        tool: tool.to_string(),
        status: "not started".to_string(),
        excerpt: "empty command".to_string(),
    })?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    info!("Running {}: {}", tool, argv.join(" "));
    let output = cmd.output().await.map_err(|e| TiError::ExternalTool {
        tool: tool.to_string(),
        status: "not started".to_string(),
        excerpt: e.to_string(),
    })?;

    let mut lines = Vec::new();
    for stream in [&output.stdout, &output.stderr] {
        for line in String::from_utf8_lossy(stream).lines() {
            debug!(target: "tiflow::tool", "[{}] {}", tool, line);
            lines.push(line.to_string());
        }
    }

    let status = output.status.code().unwrap_or(-1);
    let marker = lines.iter().any(|l| ERROR_MARKER.is_match(l));
    if !output.status.success() || marker {
        let start = lines.len().saturating_sub(EXCERPT_LINES);
        return Err(TiError::ExternalTool {
            tool: tool.to_string(),
            status: if output.status.success() {
                "exit 0 with error marker".to_string()
            } else {
                format!("exit {}", status)
            },
            excerpt: lines[start..].join("\n"),
        });
    }

    Ok(ToolOutput { status, lines })
}

/// Finds `program` on `PATH`, or checks it directly when it contains a path
/// separator.
pub fn resolve_program(program: &str) -> Option<PathBuf> {
    let direct = Path::new(program);
    if direct.components().count() > 1 {
        return direct.is_file().then(|| direct.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

fn request_path(output: &Path) -> PathBuf {
    let mut name = output.as_os_str().to_owned();
    name.push(".request.json");
    PathBuf::from(name)
}

/// Solver and transform backed by external commands from [`ToolConfig`].
#[derive(Debug, Clone)]
pub struct CommandSolverGateway {
    solver: Vec<String>,
    transform: Vec<String>,
}

impl CommandSolverGateway {
    pub fn new(tools: &ToolConfig) -> Self {
        Self {
            solver: tools.solver.clone(),
            transform: tools.transform.clone(),
        }
    }
}

#[async_trait]
impl SolverGateway for CommandSolverGateway {
    async fn solve(&self, request: &SolveRequest) -> TiResult<FieldSampleSet> {
        let request_file = request_path(&request.output);
        write_json_atomic(&request_file, request).await?;

        let mut argv = self.solver.clone();
        argv.push("--request".to_string());
        argv.push(request_file.to_string_lossy().to_string());
        let result = run_tool("solver", &argv, None).await;
        let _ = tokio::fs::remove_file(&request_file).await;
        result?;

        let content = tokio::fs::read_to_string(&request.output)
            .await
            .map_err(|e| TiError::io(&request.output, e))?;
        let field: FieldSampleSet =
            serde_json::from_str(&content).map_err(|e| TiError::parse(&request.output, e))?;
        field.check_shape()?;
        info!(
            "Pair {} solved: {} samples",
            request.pair_index,
            field.len()
        );
        Ok(field)
    }

    async fn transform(
        &self,
        input: &Path,
        space: TargetSpace,
        output: &Path,
    ) -> TiResult<PathBuf> {
        let mut argv = self.transform.clone();
        argv.extend([
            "--input".to_string(),
            input.to_string_lossy().to_string(),
            "--space".to_string(),
            space.as_str().to_string(),
            "--output".to_string(),
            output.to_string_lossy().to_string(),
        ]);
        run_tool("transform", &argv, None).await?;
        if !output.is_file() {
            return Err(TiError::ExternalTool {
                tool: "transform".to_string(),
                status: "exit 0".to_string(),
                excerpt: format!("no output written to {}", output.display()),
            });
        }
        Ok(output.to_path_buf())
    }
}

#[derive(Debug, Serialize)]
struct RenderElectrode<'a> {
    label: &'a str,
    position: Option<Point3>,
}

#[derive(Debug, Serialize)]
struct RenderRequest<'a> {
    montage: &'a str,
    eeg_net: &'a str,
    pairs: Vec<[RenderElectrode<'a>; 2]>,
}

#[derive(Debug, Clone)]
pub struct CommandVisualizer {
    command: Vec<String>,
}

impl CommandVisualizer {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

#[async_trait]
impl VisualizationService for CommandVisualizer {
    async fn render(
        &self,
        montage: &MontageModel,
        view: &CatalogView,
        output: &Path,
    ) -> TiResult<Option<PathBuf>> {
        let Some(net) = montage.eeg_net() else {
            debug!("No net template for coordinate montage {}", montage.name());
            return Ok(None);
        };

        let pairs = view
            .resolve(montage.name(), Some(net))
            .unwrap_or_else(|| montage.pairs().to_vec());
        let labels: Vec<[String; 2]> = pairs
            .iter()
            .map(|p| [p.0.to_string(), p.1.to_string()])
            .collect();
        let request = RenderRequest {
            montage: montage.name(),
            eeg_net: net,
            pairs: labels
                .iter()
                .map(|[a, b]| {
                    [
                        RenderElectrode {
                            label: a,
                            position: view.electrode_position(net, a),
                        },
                        RenderElectrode {
                            label: b,
                            position: view.electrode_position(net, b),
                        },
                    ]
                })
                .collect(),
        };

        let request_file = request_path(output);
        write_json_atomic(&request_file, &request).await?;
        let mut argv = self.command.clone();
        argv.extend([
            "--request".to_string(),
            request_file.to_string_lossy().to_string(),
            "--output".to_string(),
            output.to_string_lossy().to_string(),
        ]);
        let result = run_tool("visualizer", &argv, None).await;
        let _ = tokio::fs::remove_file(&request_file).await;
        result?;
        Ok(Some(output.to_path_buf()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[test]
    fn error_marker_matches_line_starts_only() {
        assert!(ERROR_MARKER.is_match("ERROR: mesh not found"));
        assert!(ERROR_MARKER.is_match("  Traceback (most recent call last):"));
        assert!(!ERROR_MARKER.is_match("no ERRORS reported"));
        assert!(!ERROR_MARKER.is_match("solver finished"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_tool_captures_output_lines() {
        let out = run_tool("echo", &sh("echo one; echo two 1>&2"), None)
            .await
            .unwrap();
        assert_eq!(out.status, 0);
        assert_eq!(out.lines, vec!["one".to_string(), "two".to_string()]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_surfaces_status_and_excerpt() {
        let err = run_tool("solver", &sh("echo meshing; echo boom 1>&2; exit 3"), None)
            .await
            .unwrap_err();
        match err {
            TiError::ExternalTool {
                tool,
                status,
                excerpt,
            } => {
                assert_eq!(tool, "solver");
                assert_eq!(status, "exit 3");
                assert!(excerpt.contains("boom"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn error_marker_fails_a_zero_exit() {
        let err = run_tool("solver", &sh("echo 'ERROR: singular matrix'"), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "external_tool");
    }

    #[tokio::test]
    async fn missing_program_is_an_external_tool_error() {
        let argv = vec!["/nonexistent/ti-solve-binary".to_string()];
        let err = run_tool("solver", &argv, None).await.unwrap_err();
        assert_eq!(err.kind(), "external_tool");
    }

    #[test]
    fn resolve_program_checks_explicit_paths() {
        assert!(resolve_program("/nonexistent/ti-solve-binary").is_none());
    }

    #[cfg(unix)]
    #[test]
    fn resolve_program_searches_path() {
        assert!(resolve_program("sh").is_some());
    }
}
