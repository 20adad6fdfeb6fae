//! System prompt describing the tools and how to call them

use std::path::Path;

use crate::tools::ToolRegistry;

pub fn system_prompt(registry: &ToolRegistry, root: &Path) -> String {
    let mut out = String::new();
    out.push_str(
        "You are a software engineering assistant working inside the user's editor. \
         You complete tasks step by step using tools.\n\n",
    );

    out.push_str("# Tool Use\n\n");
    out.push_str(
        "Call a tool by writing an XML-style block. The tool name is the outer tag and each \
         parameter is an inner tag:\n\n\
         <tool_name>\n<param1>value1</param1>\n<param2>value2</param2>\n</tool_name>\n\n\
         Use exactly one tool per message and wait for its result before continuing.\n\n",
    );

    out.push_str("# Tools\n");
    for tool in registry.tools() {
        let name = tool.name();
        out.push_str(&format!("\n## {}\nDescription: {}\n", name, tool.description()));
        if !tool.params().is_empty() {
            out.push_str("Parameters:\n");
            for param in tool.params() {
                let need = if param.required { "required" } else { "optional" };
                out.push_str(&format!("- {} ({}): {}\n", param.name, need, param.description));
            }
        }
        out.push_str(&format!("Usage:\n<{}>\n", name));
        for param in tool.params() {
            out.push_str(&format!("<{0}>...</{0}>\n", param.name));
        }
        out.push_str(&format!("</{}>\n", name));
    }

    out.push_str(&format!(
        "\n# Rules\n\n\
         - The project root is {}. Paths are relative to it.\n\
         - File edits are proposed to the user for review; they are not written immediately.\n\
         - Prefer replace_in_file for small changes and write_to_file for new files or rewrites.\n\
         - Each user message ends with environment details describing the project. Use them instead of asking.\n\
         - When the task is done, call attempt_completion. Do not end with a question.\n",
        root.display()
    ));
    out
}
