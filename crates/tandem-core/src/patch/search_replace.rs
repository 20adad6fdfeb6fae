//! SEARCH/REPLACE block parsing for `replace_in_file`
//!
//! ```text
//! <<<<<<< SEARCH
//! exact lines to find
//! =======
//! lines to put instead
//! >>>>>>> REPLACE
//! ```

use once_cell::sync::Lazy;
use regex::Regex;

const SEARCH_MARKER: &str = "<<<<<<< SEARCH";
const DIVIDER: &str = "=======";
const REPLACE_MARKER: &str = ">>>>>>> REPLACE";

static BLOCK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<<<<<<< SEARCH\r?\n(.*?)\r?\n?=======\r?\n(.*?)\r?\n?>>>>>>> REPLACE")
        .expect("valid block regex")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchReplaceBlock {
    pub search: String,
    pub replace: String,
}

/// Parse every block in `diff`
///
/// Rejects input where a block's SEARCH or REPLACE text itself contains a
/// marker, which is how unbalanced or nested blocks show up.
pub fn parse_blocks(diff: &str) -> Result<Vec<SearchReplaceBlock>, String> {
    let mut blocks = Vec::new();
    for (idx, caps) in BLOCK_RE.captures_iter(diff).enumerate() {
        let search = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        let replace = caps.get(2).map(|m| m.as_str()).unwrap_or_default();

        for part in [search, replace] {
            if part.contains(SEARCH_MARKER)
                || part.contains(REPLACE_MARKER)
                || part.lines().any(|l| l == DIVIDER)
            {
                return Err(format!(
                    "Block {} contains nested or unbalanced markers",
                    idx + 1
                ));
            }
        }

        blocks.push(SearchReplaceBlock {
            search: search.to_string(),
            replace: replace.to_string(),
        });
    }

    if blocks.is_empty() {
        return Err(format!(
            "No SEARCH/REPLACE blocks found. Use '{}' / '{}' / '{}' markers.",
            SEARCH_MARKER, DIVIDER, REPLACE_MARKER
        ));
    }
    Ok(blocks)
}

/// Apply blocks in order to an in-memory copy of `content`
///
/// Each SEARCH text must occur in the content as left by the previous
/// blocks; the first occurrence is replaced.
pub fn apply_blocks(content: &str, blocks: &[SearchReplaceBlock]) -> Result<String, String> {
    let mut current = content.to_string();
    for (idx, block) in blocks.iter().enumerate() {
        if block.search.is_empty() {
            if !current.is_empty() {
                return Err(format!(
                    "Block {} has an empty SEARCH section but the file is not empty",
                    idx + 1
                ));
            }
            current = block.replace.clone();
            continue;
        }

        let Some(pos) = current.find(&block.search) else {
            return Err(format!(
                "SEARCH text of block {} not found in file:\n{}",
                idx + 1,
                block.search
            ));
        };
        current.replace_range(pos..pos + block.search.len(), &block.replace);
    }
    Ok(current)
}
