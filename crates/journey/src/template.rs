//! Message template rendering using `{{variable}}` placeholders.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use donorflow_core::types::Channel;

use crate::types::MessageNode;

/// A message ready to hand to a channel sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderedMessage {
    pub channel: Channel,
    pub subject: Option<String>,
    pub body: String,
}

/// Renders a message node's subject and body. Unknown placeholders render
/// as empty strings; an unterminated `{{` is kept verbatim.
pub fn render(node: &MessageNode, variables: &HashMap<String, String>) -> RenderedMessage {
    RenderedMessage {
        channel: node.channel,
        subject: node.subject.as_deref().map(|s| substitute(s, variables)),
        body: substitute(&node.body, variables),
    }
}

fn substitute(template: &str, variables: &HashMap<String, String>) -> String {
    let mut result = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        result.push_str(&rest[..open]);
        let after_open = &rest[open + 2..];
        match after_open.find("}}") {
            Some(close) => {
                let key = after_open[..close].trim();
                if let Some(value) = variables.get(key) {
                    result.push_str(value);
                }
                rest = &after_open[close + 2..];
            }
            None => {
                result.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    result.push_str(rest);
    result
}
