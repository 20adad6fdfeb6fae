//! File tools: read, and propose writes as reviewable patches
//!
//! Neither write tool touches disk. Both diff their result against the
//! current file and hand the hunks to the session's patch engine.

use std::path::Path;

use async_trait::async_trait;
use tokio::fs;

use super::registry::{ParamSpec, Tool, ToolContext, ToolResult};
use super::{ToolName, ToolParams};
use crate::patch::{self, search_replace};

const BINARY_CHECK_BYTES: usize = 8192;

pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> ToolName {
        ToolName::ReadFile
    }

    fn description(&self) -> &str {
        "Read the contents of a file in the project. The file is added to the conversation context."
    }

    fn params(&self) -> &'static [ParamSpec] {
        const PARAMS: &[ParamSpec] = &[ParamSpec::required(
            "path",
            "Path of the file to read, relative to the project root",
        )];
        PARAMS
    }

    async fn execute(&self, params: &ToolParams, ctx: &ToolContext) -> ToolResult {
        let raw = params.get("path").map(String::as_str).unwrap_or_default();
        let path = match ctx.resolve(raw) {
            Ok(p) => p,
            Err(e) => return ToolResult::error(e),
        };
        if !path.is_file() {
            return ToolResult::error(format!("File not found: {}", raw));
        }

        let bytes = match fs::read(&path).await {
            Ok(b) => b,
            Err(e) => return ToolResult::error(format!("Failed to read file: {}", e)),
        };
        if bytes[..bytes.len().min(BINARY_CHECK_BYTES)].contains(&0) {
            return ToolResult::error(format!("Cannot read binary file: {}", raw));
        }
        let content = match String::from_utf8(bytes) {
            Ok(s) => s,
            Err(e) => return ToolResult::error(format!("File is not valid UTF-8: {}", e)),
        };

        if let Err(e) = ctx.session.add_context_file(&path) {
            tracing::debug!("Not adding {} to context: {}", raw, e);
        }
        ToolResult::success(content)
    }
}

pub struct WriteToFileTool;

#[async_trait]
impl Tool for WriteToFileTool {
    fn name(&self) -> ToolName {
        ToolName::WriteToFile
    }

    fn description(&self) -> &str {
        "Write the complete content of a file, creating it if needed. The change is proposed for review and applied once the user accepts it."
    }

    fn params(&self) -> &'static [ParamSpec] {
        const PARAMS: &[ParamSpec] = &[
            ParamSpec::required("path", "Path of the file to write, relative to the project root"),
            ParamSpec::required("content", "The complete new content of the file"),
        ];
        PARAMS
    }

    fn sensitive(&self) -> bool {
        true
    }

    async fn execute(&self, params: &ToolParams, ctx: &ToolContext) -> ToolResult {
        let raw = params.get("path").map(String::as_str).unwrap_or_default();
        let content = params.get("content").map(String::as_str).unwrap_or_default();
        let path = match ctx.resolve(raw) {
            Ok(p) => p,
            Err(e) => return ToolResult::error(e),
        };
        if path.is_dir() {
            return ToolResult::error(format!("Path is a directory: {}", raw));
        }

        let snapshot = match patch::read_snapshot(&path).await {
            Ok(s) => s,
            Err(e) => return ToolResult::error(format!("Failed to read file: {}", e)),
        };
        propose(ctx, &path, snapshot, content).await
    }
}

pub struct ReplaceInFileTool;

#[async_trait]
impl Tool for ReplaceInFileTool {
    fn name(&self) -> ToolName {
        ToolName::ReplaceInFile
    }

    fn description(&self) -> &str {
        "Replace sections of an existing file using SEARCH/REPLACE blocks. Each block is:\n<<<<<<< SEARCH\n[exact existing text]\n=======\n[replacement text]\n>>>>>>> REPLACE\nBlocks apply in order; each SEARCH text must match the file exactly."
    }

    fn params(&self) -> &'static [ParamSpec] {
        const PARAMS: &[ParamSpec] = &[
            ParamSpec::required("path", "Path of the file to modify, relative to the project root"),
            ParamSpec::required("diff", "One or more SEARCH/REPLACE blocks"),
        ];
        PARAMS
    }

    fn sensitive(&self) -> bool {
        true
    }

    async fn execute(&self, params: &ToolParams, ctx: &ToolContext) -> ToolResult {
        let raw = params.get("path").map(String::as_str).unwrap_or_default();
        let diff = params.get("diff").map(String::as_str).unwrap_or_default();
        let path = match ctx.resolve(raw) {
            Ok(p) => p,
            Err(e) => return ToolResult::error(e),
        };

        let current = match patch::read_snapshot(&path).await {
            Ok(Some(content)) => content,
            Ok(None) => return ToolResult::error(format!("File not found: {}", raw)),
            Err(e) => return ToolResult::error(format!("Failed to read file: {}", e)),
        };

        let blocks = match search_replace::parse_blocks(diff) {
            Ok(b) => b,
            Err(e) => return ToolResult::error(e),
        };
        let updated = match search_replace::apply_blocks(&current, &blocks) {
            Ok(u) => u,
            Err(e) => return ToolResult::error(e),
        };
        propose(ctx, &path, Some(current), &updated).await
    }
}

/// Diff `updated` against `snapshot` and queue the hunks for review
async fn propose(
    ctx: &ToolContext,
    path: &Path,
    snapshot: Option<String>,
    updated: &str,
) -> ToolResult {
    let display = ctx.display_path(path);
    let old = snapshot.as_deref().unwrap_or_default();
    if snapshot.is_some() && old == updated {
        return ToolResult::success(format!("No changes to {}", display));
    }

    let hunks = patch::compute_hunks(old, updated);
    let created = match ctx.session.patches().propose(path, snapshot.clone(), hunks).await {
        Ok(c) => c,
        Err(e) => return ToolResult::error(e),
    };

    let diff = patch::unified_diff(old, updated, Path::new(&display));
    let verb = if snapshot.is_some() { "Proposed" } else { "Proposed new file with" };
    ToolResult::success(format!(
        "{} {} pending hunk(s) for {}. The change is awaiting user review.\n{}",
        verb,
        created.len(),
        display,
        diff
    ))
}
