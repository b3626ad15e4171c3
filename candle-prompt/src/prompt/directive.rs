//! Extraction of weighted `<kind:name:weight>` directives from prompts.
//!
//! Three directive families share the same scanner:
//!
//! ```text
//! <clip:NAME:INTEGER>              layer skip, NAME = [-\w]+
//! <inversion:NAME:SIGNED_DECIMAL>  textual inversion, NAME excludes ':' and '>'
//! <lora:NAME:SIGNED_DECIMAL>       LoRA adapter, same grammar as inversion
//! ```
//!
//! Text that resembles a directive but does not fit the grammar is left in the
//! prompt as ordinary text.

use serde::Serialize;
use tracing::debug;

/// A named, weighted sub-token pulled out of a prompt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Directive {
    pub name: String,
    pub weight: f64,
}

impl Directive {
    pub fn new(name: impl Into<String>, weight: f64) -> Self {
        Self {
            name: name.into(),
            weight,
        }
    }
}

/// The directive family a scanner looks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DirectiveKind {
    /// `<clip:NAME:INTEGER>`, the number of CLIP layers to skip.
    Clip,
    /// `<inversion:NAME:WEIGHT>`, a textual inversion embedding.
    Inversion,
    /// `<lora:NAME:WEIGHT>`, a LoRA adapter.
    Lora,
}

impl DirectiveKind {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Clip => "clip",
            Self::Inversion => "inversion",
            Self::Lora => "lora",
        }
    }

    fn is_name_char(&self, c: char) -> bool {
        match self {
            Self::Clip => c.is_alphanumeric() || c == '_' || c == '-',
            Self::Inversion | Self::Lora => c != ':' && c != '>',
        }
    }

    /// Byte length of the weight literal at the start of `text`, 0 if there is none.
    fn weight_len(&self, text: &str) -> usize {
        match self {
            Self::Clip => text.bytes().take_while(u8::is_ascii_digit).count(),
            Self::Inversion | Self::Lora => {
                let sign = usize::from(text.starts_with('-'));
                let body = text.as_bytes()[sign..]
                    .iter()
                    .take_while(|&&b| b.is_ascii_digit() || b == b'.' || b == b'|')
                    .count();
                if body == 0 {
                    0
                } else {
                    sign + body
                }
            }
        }
    }

    /// Try to match a directive starting at the first byte of `text`.
    ///
    /// Returns the byte length of the match and the parsed directive.
    fn match_at(&self, text: &str) -> Option<(usize, Directive)> {
        let rest = text
            .strip_prefix('<')?
            .strip_prefix(self.tag())?
            .strip_prefix(':')?;

        let name_len = rest
            .find(|c: char| !self.is_name_char(c))
            .unwrap_or(rest.len());
        if name_len == 0 {
            return None;
        }
        let (name, rest) = rest.split_at(name_len);
        let rest = rest.strip_prefix(':')?;

        let weight_len = self.weight_len(rest);
        if weight_len == 0 {
            return None;
        }
        let (weight, rest) = rest.split_at(weight_len);
        let rest = rest.strip_prefix('>')?;

        // `1.2.3` or `1|2` fit the character class but are not numbers.
        let weight = weight.parse::<f64>().ok()?;
        Some((text.len() - rest.len(), Directive::new(name, weight)))
    }

    /// Leftmost match at or after byte offset `from`, as `(start, len, directive)`.
    fn find(&self, text: &str, from: usize) -> Option<(usize, usize, Directive)> {
        text[from..].match_indices('<').find_map(|(offset, _)| {
            let start = from + offset;
            self.match_at(&text[start..])
                .map(|(len, directive)| (start, len, directive))
        })
    }
}

/// Remove every directive of `kind` from `prompt`.
///
/// Each match is cut out of the string (not replaced with whitespace) and the
/// scan resumes on the shortened text, so a directive formed by the splice is
/// found as well. Returns the cleaned prompt and the directives in the order
/// they were found.
pub fn extract_directives(prompt: &str, kind: DirectiveKind) -> (String, Vec<Directive>) {
    let mut remaining = prompt.to_string();
    let mut directives = Vec::new();
    let mut cursor = 0;

    while let Some((start, len, directive)) = kind.find(&remaining, cursor) {
        debug!(
            "found {} directive in prompt: {} ({})",
            kind.tag(),
            directive.name,
            directive.weight
        );
        remaining.replace_range(start..start + len, "");
        // A match never contains '>' before its end, so nothing left of the
        // last '>' preceding the cut can have changed.
        cursor = remaining[..start].rfind('>').map_or(0, |i| i + 1);
        directives.push(directive);
    }

    (remaining, directives)
}

/// Extract `<lora:name:weight>` directives.
pub fn get_loras_from_prompt(prompt: &str) -> (String, Vec<Directive>) {
    extract_directives(prompt, DirectiveKind::Lora)
}

/// Extract `<inversion:name:weight>` directives.
pub fn get_inversions_from_prompt(prompt: &str) -> (String, Vec<Directive>) {
    extract_directives(prompt, DirectiveKind::Inversion)
}

/// Extract `<clip:name:layers>` directives and return the first skip count, if any.
pub fn get_clip_skip_from_prompt(prompt: &str) -> (String, Option<usize>) {
    let (prompt, directives) = extract_directives(prompt, DirectiveKind::Clip);
    let skip = directives.first().map(|d| d.weight as usize);
    (prompt, skip)
}
