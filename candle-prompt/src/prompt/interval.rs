//! Expansion of numbered token ranges.
//!
//! `tag-{0,3}` becomes `tag-0 tag-1 tag-2` and `tag-{0,6,2}` becomes
//! `tag-0 tag-2 tag-4`. Ranges are half-open and the step defaults to 1.

use tracing::trace;

/// A parsed `{start,end[,step]}` range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Interval {
    start: usize,
    end: usize,
    step: usize,
}

impl Interval {
    fn expand(&self, base: &str) -> String {
        (self.start..self.end)
            .step_by(self.step)
            .map(|i| format!("{base}-{i}"))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn take_number(text: &str) -> Option<(usize, &str)> {
    let len = text.bytes().take_while(u8::is_ascii_digit).count();
    if len == 0 {
        return None;
    }
    let value = text[..len].parse().ok()?;
    Some((value, &text[len..]))
}

/// Parse `start,end[,step]}` at the beginning of `text`, returning the range and
/// the number of bytes consumed including the closing brace.
fn parse_interval(text: &str) -> Option<(Interval, usize)> {
    let (start, rest) = take_number(text)?;
    let rest = rest.strip_prefix(',')?;
    let (end, rest) = take_number(rest)?;
    let (step, rest) = match rest.strip_prefix(',') {
        Some(rest) => take_number(rest)?,
        None => (1, rest),
    };
    let rest = rest.strip_prefix('}')?;
    // A zero step would never reach the end of the range.
    if step == 0 {
        return None;
    }
    Some((Interval { start, end, step }, text.len() - rest.len()))
}

/// Replace every `base-{start,end[,step]}` in `prompt` with the tokens it names.
///
/// Each range is expanded once, in place of its own span; the expanded text is
/// not scanned again.
pub fn expand_interval_ranges(prompt: &str) -> String {
    let mut output = String::with_capacity(prompt.len());
    let mut last_end = 0;
    let mut search = 0;

    while let Some(offset) = prompt[search..].find("-{") {
        let dash = search + offset;
        let base_start = prompt[..dash].trim_end_matches(is_word_char).len();
        let base = &prompt[base_start..dash];

        match parse_interval(&prompt[dash + 2..]) {
            Some((interval, consumed)) if !base.is_empty() => {
                let expanded = interval.expand(base);
                trace!("expanding interval {:?} for {}: {}", interval, base, expanded);
                output.push_str(&prompt[last_end..base_start]);
                output.push_str(&expanded);
                last_end = dash + 2 + consumed;
                search = last_end;
            }
            _ => search = dash + 1,
        }
    }

    output.push_str(&prompt[last_end..]);
    output
}
