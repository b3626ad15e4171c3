//! Expansion of `(a|b|c)` alternative groups into prompt variants.

use tracing::{debug, trace};

/// Find the next `(options)` group at or after byte offset `from`.
///
/// Returns the byte range of the whole group including parentheses. A group
/// holds at least one character, so `()` is literal text.
fn find_group(prompt: &str, from: usize) -> Option<(usize, usize)> {
    let mut search = from;
    while let Some(offset) = prompt[search..].find('(') {
        let open = search + offset;
        let close = open + 1 + prompt[open + 1..].find(')')?;
        if close > open + 1 {
            return Some((open, close + 1));
        }
        search = open + 1;
    }
    None
}

/// Split `prompt` into literal spans and alternative groups, left to right.
///
/// Literal spans become single-option segments.
fn prompt_segments(prompt: &str) -> Vec<Vec<&str>> {
    let mut segments = Vec::new();
    let mut last_end = 0;

    while let Some((start, end)) = find_group(prompt, last_end) {
        debug!("found alternative group in prompt: {}", &prompt[start..end]);
        if start > last_end {
            let skipped = &prompt[last_end..start];
            trace!("appending skipped section of prompt: {:?}", skipped);
            segments.push(vec![skipped]);
        }

        let options: Vec<&str> = prompt[start + 1..end - 1].split('|').collect();
        trace!("split up alternative options: {:?}", options);
        segments.push(options);
        last_end = end;
    }

    if last_end < prompt.len() {
        let remaining = &prompt[last_end..];
        trace!("appending remainder of prompt: {:?}", remaining);
        segments.push(vec![remaining]);
    }

    segments
}

/// Expand every `(a|b|c)` group in `prompt` into a list of concrete prompts.
///
/// The number of variants is the size of the largest group. Variant `i` takes
/// option `i % len` from every segment, so smaller groups cycle. Segments are
/// joined without separators. A prompt without groups yields itself.
pub fn expand_alternative_ranges(prompt: &str) -> Vec<String> {
    let segments = prompt_segments(prompt);
    let count = match segments.iter().map(Vec::len).max() {
        Some(count) => count,
        None => return vec![prompt.to_string()],
    };

    (0..count)
        .map(|i| {
            segments
                .iter()
                .map(|options| options[i % options.len()])
                .collect::<String>()
        })
        .collect()
}
