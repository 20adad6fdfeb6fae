//! Incremental tool-call parsing over streamed model text
//!
//! Tool calls are XML-like blocks, `<read_file><path>a.py</path></read_file>`.
//! Only names from the closed tool set open a block; anything else stays
//! plain text. The first complete block ends parsing for the turn.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::tools::{ToolCall, ToolName, ToolParams};

static PARAM_OPEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<([a-z_][a-z0-9_]*)>").expect("valid param regex"));

/// Params whose values may themselves contain markup
const GREEDY_PARAMS: &[&str] = &["content", "diff"];

#[derive(Debug, Clone, PartialEq)]
pub enum ParseEvent {
    Text(String),
    ToolStart(ToolName),
    /// Raw block body, forwarded as it arrives
    ToolArgs(String),
    ToolEnd(ToolCall),
    /// Stream ended inside a block; carries the raw block text
    ToolAbandoned(String),
}

enum Mode {
    Text,
    Tool {
        name: ToolName,
        body: String,
        /// Bytes of `body` already forwarded
        forwarded: usize,
    },
    Done,
}

pub struct ToolCallParser {
    mode: Mode,
    /// Text held back because it may start an opening tag
    pending: String,
    /// Everything the model said up to and including the first block
    consumed: String,
}

impl Default for ToolCallParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolCallParser {
    pub fn new() -> Self {
        Self {
            mode: Mode::Text,
            pending: String::new(),
            consumed: String::new(),
        }
    }

    /// Assistant text as it should be recorded in history
    pub fn consumed(&self) -> &str {
        &self.consumed
    }

    pub fn feed(&mut self, chunk: &str) -> Vec<ParseEvent> {
        let mut events = Vec::new();
        match self.mode {
            Mode::Done => return events,
            Mode::Text => self.pending.push_str(chunk),
            Mode::Tool { ref mut body, .. } => body.push_str(chunk),
        }

        loop {
            match self.mode {
                Mode::Done => break,
                Mode::Text => {
                    if !self.scan_text(&mut events) {
                        break;
                    }
                }
                Mode::Tool { .. } => {
                    self.scan_tool(&mut events);
                    break;
                }
            }
        }
        events
    }

    /// Returns true when a block opened and scanning should continue
    fn scan_text(&mut self, events: &mut Vec<ParseEvent>) -> bool {
        let mut out = String::new();
        loop {
            let Some(lt) = self.pending.find('<') else {
                out.push_str(&self.pending);
                self.pending.clear();
                break;
            };
            out.push_str(&self.pending[..lt]);
            self.pending.replace_range(..lt, "");

            if let Some(name) = opening_tag(&self.pending) {
                self.emit_text(out, events);
                let tag_len = name.as_str().len() + 2;
                let body = self.pending[tag_len..].to_string();
                self.consumed.push_str(&self.pending[..tag_len]);
                self.pending.clear();
                events.push(ParseEvent::ToolStart(name));
                self.mode = Mode::Tool {
                    name,
                    body,
                    forwarded: 0,
                };
                return true;
            }
            if could_open(&self.pending) {
                break;
            }
            out.push('<');
            self.pending.replace_range(..1, "");
        }
        self.emit_text(out, events);
        false
    }

    fn scan_tool(&mut self, events: &mut Vec<ParseEvent>) {
        let Mode::Tool {
            name,
            body,
            forwarded,
        } = &mut self.mode
        else {
            return;
        };
        let close = format!("</{}>", name.as_str());

        if let Some(end) = body.find(&close) {
            if end > *forwarded {
                events.push(ParseEvent::ToolArgs(body[*forwarded..end].to_string()));
            }
            let call = ToolCall {
                name: *name,
                params: parse_params(&body[..end]),
            };
            self.consumed.push_str(&body[..end]);
            self.consumed.push_str(&close);
            events.push(ParseEvent::ToolEnd(call));
            self.mode = Mode::Done;
            return;
        }

        // Hold back anything that could be the start of the closing tag
        let mut safe = body.len().saturating_sub(close.len() - 1);
        while !body.is_char_boundary(safe) {
            safe -= 1;
        }
        if safe > *forwarded {
            events.push(ParseEvent::ToolArgs(body[*forwarded..safe].to_string()));
            *forwarded = safe;
        }
    }

    fn emit_text(&mut self, text: String, events: &mut Vec<ParseEvent>) {
        if !text.is_empty() {
            self.consumed.push_str(&text);
            events.push(ParseEvent::Text(text));
        }
    }

    /// Flush whatever is left when the stream ends
    pub fn finish(&mut self) -> Vec<ParseEvent> {
        let mut events = Vec::new();
        match std::mem::replace(&mut self.mode, Mode::Done) {
            Mode::Text => {
                let rest = std::mem::take(&mut self.pending);
                self.emit_text(rest, &mut events);
            }
            Mode::Tool {
                name,
                body,
                forwarded,
            } => {
                if body.len() > forwarded {
                    events.push(ParseEvent::ToolArgs(body[forwarded..].to_string()));
                }
                self.consumed.push_str(&body);
                events.push(ParseEvent::ToolAbandoned(format!("<{}>{}", name, body)));
            }
            Mode::Done => {}
        }
        events
    }
}

fn opening_tag(text: &str) -> Option<ToolName> {
    ToolName::ALL
        .into_iter()
        .find(|name| text.starts_with(&format!("<{}>", name.as_str())))
}

fn could_open(text: &str) -> bool {
    ToolName::ALL.into_iter().any(|name| {
        let tag = format!("<{}>", name.as_str());
        tag.len() > text.len() && tag.starts_with(text)
    })
}

fn parse_params(body: &str) -> ToolParams {
    let mut params = ToolParams::new();
    let mut rest = body;
    while let Some(caps) = PARAM_OPEN.captures(rest) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            break;
        };
        let name = name.as_str();
        let after = &rest[whole.end()..];
        let close = format!("</{}>", name);
        let end = if GREEDY_PARAMS.contains(&name) {
            after.rfind(&close)
        } else {
            after.find(&close)
        };
        let Some(end) = end else {
            // Unclosed parameter: skip the tag and keep looking
            rest = after;
            continue;
        };
        params.insert(name.to_string(), clean_value(name, &after[..end]));
        rest = &after[end + close.len()..];
    }
    params
}

fn clean_value(name: &str, raw: &str) -> String {
    if GREEDY_PARAMS.contains(&name) {
        let value = raw.strip_prefix('\n').unwrap_or(raw);
        value.to_string()
    } else {
        raw.trim().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(chunks: &[&str]) -> (Vec<ParseEvent>, ToolCallParser) {
        let mut parser = ToolCallParser::new();
        let mut events = Vec::new();
        for chunk in chunks {
            events.extend(parser.feed(chunk));
        }
        events.extend(parser.finish());
        (events, parser)
    }

    fn text_of(events: &[ParseEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                ParseEvent::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect()
    }

    fn call_of(events: &[ParseEvent]) -> Option<ToolCall> {
        events.iter().find_map(|e| match e {
            ParseEvent::ToolEnd(c) => Some(c.clone()),
            _ => None,
        })
    }

    #[test]
    fn test_plain_text() {
        let (events, parser) = run(&["Hello ", "a < b and <b>bold</b>"]);
        assert_eq!(text_of(&events), "Hello a < b and <b>bold</b>");
        assert!(call_of(&events).is_none());
        assert_eq!(parser.consumed(), "Hello a < b and <b>bold</b>");
    }

    #[test]
    fn test_call_split_across_chunks() {
        let (events, parser) = run(&[
            "Let me look.\n<rea",
            "d_file>\n<path>src/",
            "a.py</path>\n</read_",
            "file> trailing text ignored",
        ]);
        assert_eq!(text_of(&events), "Let me look.\n");
        assert_eq!(events[1], ParseEvent::ToolStart(ToolName::ReadFile));
        let call = call_of(&events).unwrap();
        assert_eq!(call.name, ToolName::ReadFile);
        assert_eq!(call.params.get("path").unwrap(), "src/a.py");
        assert!(parser.consumed().ends_with("</read_file>"));
        assert!(!parser.consumed().contains("trailing"));
    }

    #[test]
    fn test_args_are_forwarded_without_closing_tag() {
        let (events, _) = run(&[
            "<execute_command><command>ls -la</command></exec",
            "ute_command>",
        ]);
        let args: String = events
            .iter()
            .filter_map(|e| match e {
                ParseEvent::ToolArgs(a) => Some(a.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(args, "<command>ls -la</command>");
    }

    #[test]
    fn test_content_keeps_markup_and_indentation() {
        let body = "<write_to_file>\n<path>index.html</path>\n<content>\n<p>hi</p>\n  </content> here\n</content>\n</write_to_file>";
        let (events, _) = run(&[body]);
        let call = call_of(&events).unwrap();
        assert_eq!(call.params.get("path").unwrap(), "index.html");
        assert_eq!(
            call.params.get("content").unwrap(),
            "<p>hi</p>\n  </content> here\n"
        );
    }

    #[test]
    fn test_unknown_tag_is_text() {
        let (events, _) = run(&["<delete_all><path>/</path></delete_all>"]);
        assert!(call_of(&events).is_none());
        assert_eq!(text_of(&events), "<delete_all><path>/</path></delete_all>");
    }

    #[test]
    fn test_unterminated_block_is_abandoned() {
        let (events, parser) = run(&["ok <list_files><path>.</path>"]);
        assert!(call_of(&events).is_none());
        assert_eq!(
            events.last(),
            Some(&ParseEvent::ToolAbandoned("<list_files><path>.</path>".into()))
        );
        assert_eq!(parser.consumed(), "ok <list_files><path>.</path>");
    }

    #[test]
    fn test_held_prefix_flushed_at_end() {
        let (events, _) = run(&["value <att"]);
        assert_eq!(text_of(&events), "value <att");
    }

    #[test]
    fn test_multibyte_body() {
        let (events, _) = run(&["<attempt_completion><result>héllo wörld ✓</res", "ult></attempt_completion>"]);
        let call = call_of(&events).unwrap();
        assert_eq!(call.params.get("result").unwrap(), "héllo wörld ✓");
    }
}
