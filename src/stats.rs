use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub const TOP_TOOLS_LIMIT: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCount {
    pub tool: String,
    pub count: i64,
}

/// Most frequent names first; ties broken alphabetically so output is stable.
pub fn top_tools<'a, I>(names: I, limit: usize) -> Vec<ToolCount>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut counts: HashMap<&str, i64> = HashMap::new();
    for name in names {
        *counts.entry(name).or_insert(0) += 1;
    }

    let mut tools: Vec<ToolCount> = counts
        .into_iter()
        .map(|(tool, count)| ToolCount {
            tool: tool.to_string(),
            count,
        })
        .collect();
    tools.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.tool.cmp(&b.tool)));
    tools.truncate(limit);
    tools
}
