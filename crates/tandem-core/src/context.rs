//! Repository context: overview providers and per-turn environment details

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use ignore::{Walk, WalkBuilder};

use crate::config::{RepomapSource, RunConfig};
use crate::rpc::HostApi;
use crate::session::Session;

/// Directories never worth showing to the model
pub const IGNORED_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    "venv",
    ".venv",
    "env",
    "build",
    "dist",
    "__pycache__",
    "vendor",
    "target",
];

const DEFAULT_MAX_ENTRIES: usize = 500;

/// Ignore-aware walk of `dir`, sorted by name
pub fn walker(dir: &Path, max_depth: Option<usize>) -> Walk {
    WalkBuilder::new(dir)
        .max_depth(max_depth)
        .sort_by_file_name(|a, b| a.cmp(b))
        .filter_entry(|entry| {
            let is_dir = entry.file_type().is_some_and(|t| t.is_dir());
            !(is_dir
                && entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| IGNORED_DIRS.contains(&name)))
        })
        .build()
}

/// Supplies the repository overview shown to the model
#[async_trait]
pub trait ContextProvider: Send + Sync {
    async fn overview(&self, root: &Path) -> Result<String>;
}

/// Indented file tree of the project
pub struct FileTreeProvider {
    max_entries: usize,
}

impl Default for FileTreeProvider {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }
}

impl FileTreeProvider {
    pub fn new(max_entries: usize) -> Self {
        Self { max_entries }
    }
}

fn render_tree(root: &Path, max_entries: usize) -> String {
    let mut out = String::new();
    let mut shown = 0;
    let mut skipped = 0;
    for entry in walker(root, None).flatten() {
        if entry.depth() == 0 {
            continue;
        }
        if shown >= max_entries {
            skipped += 1;
            continue;
        }
        let indent = "  ".repeat(entry.depth() - 1);
        let name = entry.file_name().to_string_lossy();
        let slash = if entry.file_type().is_some_and(|t| t.is_dir()) {
            "/"
        } else {
            ""
        };
        out.push_str(&format!("{}{}{}\n", indent, name, slash));
        shown += 1;
    }
    if skipped > 0 {
        out.push_str(&format!("... ({} more entries)\n", skipped));
    }
    if out.is_empty() {
        out.push_str("(empty project)\n");
    }
    out
}

#[async_trait]
impl ContextProvider for FileTreeProvider {
    async fn overview(&self, root: &Path) -> Result<String> {
        let root = root.to_path_buf();
        let max = self.max_entries;
        tokio::task::spawn_blocking(move || render_tree(&root, max))
            .await
            .context("file tree walk panicked")
    }
}

/// Asks the host for its own repository map
pub struct HostRepomapProvider {
    host: Arc<dyn HostApi>,
}

impl HostRepomapProvider {
    pub fn new(host: Arc<dyn HostApi>) -> Self {
        Self { host }
    }
}

#[async_trait]
impl ContextProvider for HostRepomapProvider {
    async fn overview(&self, root: &Path) -> Result<String> {
        self.host
            .execute_in_host(root, "list_repomap")
            .await
            .context("host repomap request failed")
    }
}

/// The provider a run should use
pub fn provider_for(config: &RunConfig, host: Arc<dyn HostApi>) -> Arc<dyn ContextProvider> {
    match config.repomap {
        RepomapSource::Local => Arc::new(FileTreeProvider::default()),
        RepomapSource::Host => Arc::new(HostRepomapProvider::new(host)),
    }
}

/// `<environment_details>` block appended to the newest user message
///
/// Rebuilt every turn so the model sees files as they are now. Once the
/// model has asked for `list_repomap`, that result stands in for the
/// provider's overview.
pub async fn environment_details(session: &Session, provider: &dyn ContextProvider) -> String {
    let root = session.root();
    let mut out = String::from("<environment_details>\n");
    out.push_str(&format!("# Current Working Directory\n{}\n\n", root.display()));

    let overview = match session.last_overview() {
        Some(text) => text,
        None => match provider.overview(root).await {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(session = %root.display(), "Repository overview unavailable: {:#}", e);
                format!("(unavailable: {:#})\n", e)
            }
        },
    };
    out.push_str(&format!("# Repository Overview\n{}\n", overview.trim_end()));

    let files = session.context_files();
    if !files.is_empty() {
        out.push_str("\n# Context Files\n");
        for rel in files {
            let body = match session.context_file_content(&rel).await {
                Ok(content) => format!("```\n{}\n```", content.trim_end()),
                Err(e) => format!("(unreadable: {})", e),
            };
            out.push_str(&format!("## {}\n{}\n", rel.display(), body));
        }
    }
    out.push_str("</environment_details>");
    out
}
