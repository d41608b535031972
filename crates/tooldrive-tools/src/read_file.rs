//! File reading tool.

use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use crate::{Tool, ToolContext, ToolError};

const MAX_READ_BYTES: usize = 20_000_000;

pub struct ReadFileTool;

fn filename_arg(params: &Map<String, Value>) -> Option<&str> {
    ["filename", "path"]
        .iter()
        .filter_map(|k| params.get(*k).and_then(Value::as_str))
        .find(|s| !s.trim().is_empty())
}

fn line_arg(params: &Map<String, Value>, key: &str) -> Result<Option<usize>, ToolError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .map(|n| Some(n as usize))
            .ok_or_else(|| ToolError::InvalidArguments(format!("'{key}' must be a non-negative integer"))),
    }
}

/// Which lines to return, as a 1-based start and an optional count.
fn line_window(params: &Map<String, Value>, total: usize) -> Result<(usize, Option<usize>), ToolError> {
    let head = line_arg(params, "head_lines")?;
    let tail = line_arg(params, "tail_lines")?;
    match (head, tail) {
        (Some(_), Some(_)) => Err(ToolError::InvalidArguments(
            "head_lines and tail_lines cannot be specified together".into(),
        )),
        (Some(head), None) => Ok((1, Some(head))),
        (None, Some(tail)) => Ok((total.saturating_sub(tail) + 1, Some(tail.min(total)))),
        (None, None) => {
            let start = line_arg(params, "start_line")?.unwrap_or(1).max(1);
            Ok((start, line_arg(params, "max_lines")?))
        }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a text file (up to 20000000 bytes). Use start_line/max_lines, head_lines or tail_lines to read part of a large file."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "filename": {"type": "string", "description": "Path of the file to read"},
                "path": {"type": "string", "description": "Alias of filename"},
                "start_line": {"type": "integer", "description": "First line to read (1-based)", "default": 1},
                "max_lines": {"type": ["integer", "null"], "description": "Maximum number of lines; null reads to the end"},
                "head_lines": {"type": ["integer", "null"], "description": "Read this many lines from the top"},
                "tail_lines": {"type": ["integer", "null"], "description": "Read this many lines from the bottom"}
            },
            "required": ["filename"],
            "additionalProperties": false
        })
    }

    fn accessed_path(&self, params: &Map<String, Value>, context: &ToolContext) -> Option<PathBuf> {
        filename_arg(params).map(|f| context.resolve_path(f))
    }

    async fn execute(&self, params: Map<String, Value>, context: &ToolContext) -> Result<String, ToolError> {
        let raw = filename_arg(&params)
            .ok_or_else(|| ToolError::InvalidArguments("filename/path is required".into()))?;
        let path = context.resolve_path(raw);

        if !path.is_file() {
            return Err(ToolError::Failed(format!("File not found: {}", path.display())));
        }

        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| ToolError::Failed(format!("Read error: {e}")))?;
        let content = String::from_utf8_lossy(&bytes).replace("\r\n", "\n");
        let lines: Vec<&str> = content.split_inclusive('\n').collect();

        let (start, count) = line_window(&params, lines.len())?;
        if start > lines.len() && start > 1 {
            return Ok(format!(
                "(file has only {} lines, start_line {start} is out of range)",
                lines.len()
            ));
        }

        let mut out = String::new();
        for line in lines.iter().skip(start - 1).take(count.unwrap_or(usize::MAX)) {
            out.push_str(line);
            if out.len() > MAX_READ_BYTES {
                out.push_str(&format!("\n[read_file truncated: byte limit {MAX_READ_BYTES} reached]"));
                break;
            }
        }

        Ok(context.runtime.limiter.truncate("read_file", &out))
    }
}

#[cfg(test)]
mod tests {
    use tooldrive_core::context::RuntimeContext;

    use super::*;

    fn params(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    fn setup() -> (tempfile::TempDir, ToolContext) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("data.txt"), "a\r\nb\nc\nd\ne").unwrap();
        let ctx = ToolContext::new(RuntimeContext::default(), dir.path());
        (dir, ctx)
    }

    #[tokio::test]
    async fn test_read_whole_file() {
        let (_dir, ctx) = setup();
        let out = ReadFileTool
            .execute(params(json!({"filename": "data.txt"})), &ctx)
            .await
            .unwrap();
        assert_eq!(out, "a\nb\nc\nd\ne");
    }

    #[tokio::test]
    async fn test_line_windows() {
        let (_dir, ctx) = setup();
        let read = |v: Value| {
            let ctx = ctx.clone();
            async move { ReadFileTool.execute(params(v), &ctx).await }
        };

        assert_eq!(read(json!({"path": "data.txt", "start_line": 2, "max_lines": 2})).await.unwrap(), "b\nc\n");
        assert_eq!(read(json!({"filename": "data.txt", "head_lines": 1})).await.unwrap(), "a\n");
        assert_eq!(read(json!({"filename": "data.txt", "tail_lines": 2})).await.unwrap(), "d\ne");
        assert_eq!(read(json!({"filename": "data.txt", "tail_lines": 50})).await.unwrap(), "a\nb\nc\nd\ne");
        assert!(
            read(json!({"filename": "data.txt", "start_line": 9}))
                .await
                .unwrap()
                .contains("out of range")
        );
        assert!(matches!(
            read(json!({"filename": "data.txt", "head_lines": 1, "tail_lines": 1})).await,
            Err(ToolError::InvalidArguments(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_file() {
        let (_dir, ctx) = setup();
        let err = ReadFileTool
            .execute(params(json!({"filename": "nope.txt"})), &ctx)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("File not found"));
    }

    #[test]
    fn test_accessed_path_resolves_against_workspace() {
        let (dir, ctx) = setup();
        let path = ReadFileTool.accessed_path(&params(json!({"filename": "data.txt"})), &ctx);
        assert_eq!(path, Some(dir.path().join("data.txt")));
    }
}
