//! Turns backend notes into the annotated strings the chat view renders.
//!
//! A note's message may carry one or more `<markdown>...</markdown>` payloads. Those are
//! lifted out and emitted as-is; whatever text remains is attributed to the agent by
//! wrapping it in a pseudo-tag named after the agent, e.g.
//! `<sqlagent data-model="gpt-x">done</sqlagent>`.

use crate::types::Note;

const MARKDOWN_OPEN: &str = "<markdown>";
const MARKDOWN_CLOSE: &str = "</markdown>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment<'a> {
    Text(&'a str),
    /// Inner content of a closed `<markdown>` span.
    Markdown(&'a str),
}

/// Lazy tokenizer over a message. Spans are matched non-greedily: an opening tag pairs with
/// the first closing tag after it. An opening tag that never closes is plain text.
pub struct Segments<'a> {
    text: &'a str,
    pos: usize,
}

pub fn segments(text: &str) -> Segments<'_> {
    Segments { text, pos: 0 }
}

impl<'a> Iterator for Segments<'a> {
    type Item = Segment<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.text.len() {
            return None;
        }
        let rest = &self.text[self.pos..];

        match rest.find(MARKDOWN_OPEN) {
            Some(0) => {
                let after_open = &rest[MARKDOWN_OPEN.len()..];
                match after_open.find(MARKDOWN_CLOSE) {
                    Some(end) => {
                        self.pos += MARKDOWN_OPEN.len() + end + MARKDOWN_CLOSE.len();
                        Some(Segment::Markdown(&after_open[..end]))
                    }
                    None => {
                        self.pos = self.text.len();
                        Some(Segment::Text(rest))
                    }
                }
            }
            Some(start) => {
                self.pos += start;
                Some(Segment::Text(&rest[..start]))
            }
            None => {
                self.pos = self.text.len();
                Some(Segment::Text(rest))
            }
        }
    }
}

/// Formats a note for display. Pure and deterministic.
pub fn format_note(note: &Note) -> String {
    let agent = note.agent_name.as_deref().filter(|a| !a.is_empty());
    let model = note.model_name.as_deref().filter(|m| !m.is_empty());

    let mut blocks: Vec<&str> = Vec::new();
    let mut residual = String::new();
    for segment in segments(&note.message) {
        match segment {
            Segment::Markdown(content) => blocks.push(content),
            Segment::Text(text) => residual.push_str(text),
        }
    }

    if blocks.is_empty() {
        return match agent {
            Some(agent) => wrap_in_agent(agent, model, &note.message),
            None => note.message.clone(),
        };
    }

    let markdown = blocks.join("\n\n");
    let residual = residual.trim();
    if residual.is_empty() {
        return markdown;
    }

    match agent {
        Some(agent) => format!("{}\n\n{}", markdown, wrap_in_agent(agent, model, residual)),
        None => format!("{}\n\n{}", markdown, residual),
    }
}

fn wrap_in_agent(agent: &str, model: Option<&str>, body: &str) -> String {
    match model {
        Some(model) => format!("<{agent} data-model=\"{model}\">{body}</{agent}>"),
        None => format!("<{agent}>{body}</{agent}>"),
    }
}

/// Display escaping applied to every relayed chunk so it stays on one line.
pub fn escape_display(text: &str) -> String {
    text.replace('\n', "<br/>")
        .replace('"', "&quot;")
        .replace('\t', "&nbsp;&nbsp;&nbsp;&nbsp;")
}
