use std::path::PathBuf;
use thiserror::Error;

/// Number of trailing stderr lines kept for diagnostics
pub const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("{tool} not found or not executable at {}", .path.display())]
    NotFound { tool: &'static str, path: PathBuf },

    #[error("{tool} failed (exit code {})\n{stderr}", describe_exit(.exit_code))]
    Failed {
        tool: &'static str,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("encoder {encoder} is not available in this ffmpeg build")]
    MissingEncoder { encoder: String },

    #[error("unexpected {tool} output: {detail}")]
    Malformed { tool: &'static str, detail: String },
}

impl ToolError {
    pub fn failed(tool: &'static str, exit_code: Option<i32>, stderr: &str) -> Self {
        ToolError::Failed {
            tool,
            exit_code,
            stderr: stderr_tail(stderr),
        }
    }
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(c) => c.to_string(),
        None => "signal".to_string(),
    }
}

/// Keep only the last few lines of a tool's stderr
pub fn stderr_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}
