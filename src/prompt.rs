//! prompt.rs — assembles the judge prompt from layered template parts.

use serde::{Deserialize, Serialize};

use crate::store::Item;

/// Prompt parts resolved per source (base config overridden by the source's
/// own config). Any part may be absent; absent parts are simply skipped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromptTemplate {
    pub header: Option<String>,
    pub introduction: Option<String>,
    pub container_pre: Option<String>,
    pub container_post: Option<String>,
    pub criteria: Option<String>,
    pub instructions: Option<String>,
}

/// Full prompt for one item: template parts in fixed order with the item's
/// title and serialized input payload inside the container section, joined
/// by blank lines. The part order is part of the contract — changing it
/// changes every prompt and therefore every future evaluation.
pub fn assemble(template: &PromptTemplate, item: &Item) -> String {
    let input_json = serde_json::to_string(&item.input).unwrap_or_else(|_| "null".to_string());

    let mut parts: Vec<&str> = Vec::with_capacity(8);
    if let Some(s) = template.header.as_deref() {
        parts.push(s);
    }
    if let Some(s) = template.introduction.as_deref() {
        parts.push(s);
    }
    if let Some(s) = template.container_pre.as_deref() {
        parts.push(s);
    }
    parts.push(&item.title);
    parts.push(&input_json);
    if let Some(s) = template.container_post.as_deref() {
        parts.push(s);
    }
    if let Some(s) = template.criteria.as_deref() {
        parts.push(s);
    }
    if let Some(s) = template.instructions.as_deref() {
        parts.push(s);
    }

    parts.join("\n\n")
}
