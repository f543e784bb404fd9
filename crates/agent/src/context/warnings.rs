//! User-facing warnings collected while walking a chain.

use std::collections::BTreeSet;
use std::fmt;

/// One warning condition. Each is reported at most once per reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Warning {
    /// Some message text was cut to `max_text` characters
    MaxText { max_text: usize },
    /// Some message carried more than `max_images` images
    MaxImages { max_images: usize },
    /// Images were attached but the model cannot take any
    CantSeeImages,
    /// Attachments other than text or images were skipped
    UnsupportedAttachments,
    /// History stopped early; `count` turns made it in
    OnlyUsingLast { count: usize },
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MaxText { max_text } => {
                write!(f, "⚠️ Max {} characters per message", group_thousands(*max_text))
            }
            Self::MaxImages { max_images } => write!(
                f,
                "⚠️ Max {max_images} image{} per message",
                plural(*max_images)
            ),
            Self::CantSeeImages => f.write_str("⚠️ Can't see images"),
            Self::UnsupportedAttachments => f.write_str("⚠️ Unsupported attachments"),
            Self::OnlyUsingLast { count } => {
                write!(f, "⚠️ Only using last {count} message{}", plural(*count))
            }
        }
    }
}

/// Deduplicated warning set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserWarnings(BTreeSet<Warning>);

impl UserWarnings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, warning: Warning) -> bool {
        self.0.insert(warning)
    }

    pub fn contains(&self, warning: &Warning) -> bool {
        self.0.contains(warning)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Warning> {
        self.0.iter()
    }

    /// Rendered warnings, sorted by their text.
    pub fn messages(&self) -> Vec<String> {
        let mut rendered: Vec<String> = self.0.iter().map(Warning::to_string).collect();
        rendered.sort();
        rendered
    }
}

impl FromIterator<Warning> for UserWarnings {
    fn from_iter<I: IntoIterator<Item = Warning>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

fn plural(n: usize) -> &'static str {
    if n == 1 { "" } else { "s" }
}

/// `100000` -> `100,000`
fn group_thousands(n: usize) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}
