fn is_cjk(c: char) -> bool {
    ('\u{4E00}'..='\u{9FFF}').contains(&c)
}

/// Rough token count: one per word, 0.75 per CJK ideograph.
///
/// A whitespace segment made only of ideographs is not a word; its
/// characters are counted by the ideograph rule alone.
pub fn estimate_tokens(text: &str) -> usize {
    let words = text
        .split_whitespace()
        .filter(|w| w.chars().any(|c| !is_cjk(c)))
        .count();
    let cjk = text.chars().filter(|c| is_cjk(*c)).count();
    words + (cjk as f64 * 0.75).round() as usize
}
