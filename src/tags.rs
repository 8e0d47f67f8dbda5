use crate::constants::{COMPLETED_TAG, PAUSED_TAG};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

lazy_static! {
    static ref ARTEFACT_REGEX: Regex =
        Regex::new(r#"<artefact type=['"]([^'"]+)['"]>([^<]+)</artefact>"#)
            .expect("Invalid artefact regex");
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Sentinel {
    Completed,
    Paused,
}

impl Sentinel {
    /// Paused wins when a text carries both markers, since it still expects a reply.
    pub fn detect(text: &str) -> Option<Self> {
        if text.contains(PAUSED_TAG) {
            Some(Sentinel::Paused)
        } else if text.contains(COMPLETED_TAG) {
            Some(Sentinel::Completed)
        } else {
            None
        }
    }
}

pub fn is_paused(text: &str) -> bool {
    text.contains(PAUSED_TAG)
}

pub fn is_completed(text: &str) -> bool {
    text.contains(COMPLETED_TAG)
}

pub fn is_terminal(text: &str) -> bool {
    Sentinel::detect(text).is_some()
}

/// A piece of assistant content, split for rich display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessagePart<'a> {
    Text(&'a str),
    Thinking { artefact_id: &'a str },
    Artefact { kind: &'a str, artefact_id: &'a str },
}

/// Lazily splits content on `<artefact type='..'>id</artefact>` references.
/// Text between references is trimmed; blank stretches are skipped.
pub struct Parts<'a> {
    content: &'a str,
    matches: regex::CaptureMatches<'static, 'a>,
    last: usize,
    pending: Option<MessagePart<'a>>,
}

pub fn split_parts(content: &str) -> Parts<'_> {
    let regex: &'static Regex = &ARTEFACT_REGEX;
    Parts {
        content,
        matches: regex.captures_iter(content),
        last: 0,
        pending: None,
    }
}

impl<'a> Iterator for Parts<'a> {
    type Item = MessagePart<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(part) = self.pending.take() {
            return Some(part);
        }

        for caps in self.matches.by_ref() {
            let (Some(whole), Some(kind), Some(id)) = (caps.get(0), caps.get(1), caps.get(2))
            else {
                continue;
            };
            let part = if kind.as_str() == "thinking" {
                MessagePart::Thinking {
                    artefact_id: id.as_str(),
                }
            } else {
                MessagePart::Artefact {
                    kind: kind.as_str(),
                    artefact_id: id.as_str(),
                }
            };

            let before = self.content[self.last..whole.start()].trim();
            self.last = whole.end();
            if before.is_empty() {
                return Some(part);
            }
            self.pending = Some(part);
            return Some(MessagePart::Text(before));
        }

        if self.last < self.content.len() {
            let rest = self.content[self.last..].trim();
            self.last = self.content.len();
            if !rest.is_empty() {
                return Some(MessagePart::Text(rest));
            }
        }
        None
    }
}

/// Inverse of [`crate::format::escape_display`].
pub fn unescape_display(html: &str) -> String {
    html.replace("<br/>", "\n")
        .replace("&quot;", "\"")
        .replace("&nbsp;&nbsp;&nbsp;&nbsp;", "\t")
}
