//! A mixed-language word-count heuristic, resolved per contiguous script
//! run: whitespace-delimited token count for a Latin-script run, character
//! count
//! for a CJK-script run, using the same Unicode-script sniffing
//! `quill_llm::is_cjk` already uses for its token-count heuristic.

use quill_llm::is_cjk;

/// Splits `text` into contiguous runs of a single script (CJK or not,
/// whitespace attaches to whichever run it's adjacent to) and sums each
/// run's own counting rule.
pub fn word_count(text: &str) -> usize {
    let mut total = 0usize;
    let mut run = String::new();
    let mut run_is_cjk: Option<bool> = None;

    let mut flush = |run: &mut String, run_is_cjk: Option<bool>, total: &mut usize| {
        if run.is_empty() {
            return;
        }
        *total += if run_is_cjk.unwrap_or(false) {
            run.chars().filter(|c| !c.is_whitespace()).count()
        } else {
            run.split_whitespace().count()
        };
        run.clear();
    };

    for ch in text.chars() {
        if ch.is_whitespace() {
            run.push(ch);
            continue;
        }
        let ch_is_cjk = is_cjk(ch);
        match run_is_cjk {
            Some(prev) if prev == ch_is_cjk => run.push(ch),
            _ => {
                flush(&mut run, run_is_cjk, &mut total);
                run_is_cjk = Some(ch_is_cjk);
                run.push(ch);
            }
        }
    }
    flush(&mut run, run_is_cjk, &mut total);

    total
}
