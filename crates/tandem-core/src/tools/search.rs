//! list_files and search_files
//!
//! Both run against the filesystem by default, or through the host when the
//! run config routes them there.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use regex::RegexBuilder;

use super::registry::{Locality, ParamSpec, Tool, ToolContext, ToolResult};
use super::{ToolName, ToolParams};
use crate::config::RunConfig;
use crate::context::walker;
use crate::paths;

const MAX_LISTED: usize = 1000;
const DEFAULT_MAX_MATCHES: usize = 50;
const MAX_MATCHES_CAP: usize = 200;
const MAX_LINE_CHARS: usize = 300;

fn host_routed(config: &RunConfig) -> Locality {
    if config.tools_via_host {
        Locality::Host
    } else {
        Locality::Local
    }
}

fn flag(params: &ToolParams, name: &str) -> bool {
    params
        .get(name)
        .is_some_and(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "true" | "yes" | "1"))
}

pub struct ListFilesTool;

#[async_trait]
impl Tool for ListFilesTool {
    fn name(&self) -> ToolName {
        ToolName::ListFiles
    }

    fn description(&self) -> &str {
        "List files and directories. Set recursive to true to walk subdirectories; ignored and dependency directories are skipped."
    }

    fn params(&self) -> &'static [ParamSpec] {
        const PARAMS: &[ParamSpec] = &[
            ParamSpec::required("path", "Directory to list, relative to the project root"),
            ParamSpec::optional("recursive", "true to list recursively (default false)"),
        ];
        PARAMS
    }

    fn locality(&self, config: &RunConfig) -> Locality {
        host_routed(config)
    }

    async fn execute(&self, params: &ToolParams, ctx: &ToolContext) -> ToolResult {
        let raw = params.get("path").map(String::as_str).unwrap_or_default();
        let recursive = flag(params, "recursive");
        let dir = match ctx.resolve(raw) {
            Ok(p) => p,
            Err(e) => return ToolResult::error(e),
        };

        if self.locality(&ctx.config) == Locality::Host {
            return match ctx.host.list_files(&dir, recursive).await {
                Ok(listing) => ToolResult::success(listing),
                Err(e) => ToolResult::error(format!("Host list_files failed: {}", e)),
            };
        }

        if !dir.is_dir() {
            return ToolResult::error(format!("Not a directory: {}", raw));
        }
        let root = ctx.root().to_path_buf();
        match tokio::task::spawn_blocking(move || list_local(&root, &dir, recursive)).await {
            Ok(listing) if listing.is_empty() => ToolResult::success("(empty directory)"),
            Ok(listing) => ToolResult::success(listing),
            Err(e) => ToolResult::error(format!("Listing failed: {}", e)),
        }
    }
}

fn list_local(root: &Path, dir: &Path, recursive: bool) -> String {
    let depth = if recursive { None } else { Some(1) };
    let mut lines = Vec::new();
    let mut more = 0;
    for entry in walker(dir, depth).flatten() {
        if entry.depth() == 0 {
            continue;
        }
        if lines.len() >= MAX_LISTED {
            more += 1;
            continue;
        }
        let rel = paths::relative_to(root, entry.path());
        let slash = if entry.file_type().is_some_and(|t| t.is_dir()) {
            "/"
        } else {
            ""
        };
        lines.push(format!("{}{}", rel.display(), slash));
    }
    if more > 0 {
        lines.push(format!("... ({} more entries)", more));
    }
    lines.join("\n")
}

pub struct SearchFilesTool;

#[async_trait]
impl Tool for SearchFilesTool {
    fn name(&self) -> ToolName {
        ToolName::SearchFiles
    }

    fn description(&self) -> &str {
        "Search file contents under a directory with a regular expression. Results are grep-style path:line:text lines."
    }

    fn params(&self) -> &'static [ParamSpec] {
        const PARAMS: &[ParamSpec] = &[
            ParamSpec::required("path", "Directory to search, relative to the project root"),
            ParamSpec::required("regex", "Regular expression to search for"),
            ParamSpec::optional("case_sensitive", "true for a case-sensitive search (default false)"),
            ParamSpec::optional("max_matches", "Maximum number of matches to return (default 50, at most 200)"),
        ];
        PARAMS
    }

    fn locality(&self, config: &RunConfig) -> Locality {
        host_routed(config)
    }

    async fn execute(&self, params: &ToolParams, ctx: &ToolContext) -> ToolResult {
        let raw = params.get("path").map(String::as_str).unwrap_or_default();
        let pattern = params.get("regex").map(String::as_str).unwrap_or_default();
        let case_sensitive = flag(params, "case_sensitive");
        let max_matches = match params.get("max_matches").map(|v| v.trim()) {
            None | Some("") => DEFAULT_MAX_MATCHES,
            Some(v) => match v.parse::<usize>() {
                Ok(n) => n.clamp(1, MAX_MATCHES_CAP),
                Err(_) => return ToolResult::error(format!("max_matches must be a number, got '{}'", v)),
            },
        };
        let dir = match ctx.resolve(raw) {
            Ok(p) => p,
            Err(e) => return ToolResult::error(e),
        };

        if self.locality(&ctx.config) == Locality::Host {
            return match ctx
                .host
                .search_files(&dir, pattern, case_sensitive, max_matches)
                .await
            {
                Ok(found) => ToolResult::success(found),
                Err(e) => ToolResult::error(format!("Host search_files failed: {}", e)),
            };
        }

        let regex = match RegexBuilder::new(pattern)
            .case_insensitive(!case_sensitive)
            .build()
        {
            Ok(r) => r,
            Err(e) => return ToolResult::error(format!("Invalid regex: {}", e)),
        };
        if !dir.exists() {
            return ToolResult::error(format!("Path not found: {}", raw));
        }

        let root = ctx.root().to_path_buf();
        let found = tokio::task::spawn_blocking(move || search_local(&root, &dir, &regex, max_matches)).await;
        match found {
            Ok(lines) if lines.is_empty() => {
                ToolResult::success(format!("No matches found for pattern '{}'", pattern))
            }
            Ok(lines) => ToolResult::success(lines.join("\n")),
            Err(e) => ToolResult::error(format!("Search failed: {}", e)),
        }
    }
}

fn search_local(root: &Path, dir: &Path, regex: &regex::Regex, max_matches: usize) -> Vec<String> {
    let mut matches = Vec::new();
    let files: Vec<PathBuf> = walker(dir, None)
        .flatten()
        .filter(|e| e.file_type().is_some_and(|t| t.is_file()))
        .map(|e| e.into_path())
        .collect();

    for file in files {
        // Unreadable and non-UTF-8 files are skipped
        let Ok(content) = std::fs::read_to_string(&file) else {
            continue;
        };
        let rel = paths::relative_to(root, &file);
        for (idx, line) in content.lines().enumerate() {
            if !regex.is_match(line) {
                continue;
            }
            let text: String = line.chars().take(MAX_LINE_CHARS).collect();
            matches.push(format!("{}:{}:{}", rel.display(), idx + 1, text));
            if matches.len() >= max_matches {
                return matches;
            }
        }
    }
    matches
}
