//! Text heuristics over code cells and chat messages.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;

// ── Code detection ────────────────────────────────────────────────────────────

fn code_patterns() -> &'static [Regex] {
    static RES: OnceLock<Vec<Regex>> = OnceLock::new();
    RES.get_or_init(|| {
        [
            r"\b(print|input|float|int|str|len)\(",
            r"\b\w+\s*=\s*[^=\n]+",
            r"\bif\s+.*\s*:\s*",
            r"\bdef\s+\w+\s*\(.*\):",
            r"\bclass\s+\w+\s*\(.*\):",
            r"\bimport\s+\w+",
            r"\bfrom\s+\w+\s+import\s+\w+",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("regex is valid"))
        .collect()
    })
}

fn snippet_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)(```python|`)(.+?)`{1,3}").expect("regex is valid"))
}

/// Whether a chat message contains Python-looking code.
pub fn contains_code(body: &str) -> bool {
    code_patterns().iter().any(|re| re.is_match(body))
}

/// Code fragments quoted with backticks or a ```` ```python ```` fence.
pub fn code_snippets(body: &str) -> Vec<String> {
    snippet_regex()
        .captures_iter(body)
        .filter_map(|cap| cap.get(2))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

// ── Line diff ─────────────────────────────────────────────────────────────────

/// LCS table over two line sequences; `table[i][j]` is the LCS length of
/// `a[i..]` and `b[j..]`.
fn lcs_table(a: &[&str], b: &[&str]) -> Vec<Vec<usize>> {
    let mut table = vec![vec![0usize; b.len() + 1]; a.len() + 1];
    for i in (0..a.len()).rev() {
        for j in (0..b.len()).rev() {
            table[i][j] = if a[i] == b[j] {
                table[i + 1][j + 1] + 1
            } else {
                table[i + 1][j].max(table[i][j + 1])
            };
        }
    }
    table
}

/// 1-based line numbers of `new_code` that are not present in `old_code`.
pub fn added_line_numbers(old_code: &str, new_code: &str) -> Vec<usize> {
    let old: Vec<&str> = old_code.lines().collect();
    let new: Vec<&str> = new_code.lines().collect();
    let table = lcs_table(&old, &new);

    let (mut i, mut j) = (0, 0);
    let mut added = Vec::new();
    while j < new.len() {
        if i < old.len() && old[i] == new[j] {
            i += 1;
            j += 1;
        } else if i < old.len() && table[i + 1][j] >= table[i][j + 1] {
            i += 1;
        } else {
            added.push(j + 1);
            j += 1;
        }
    }
    added
}

/// Line-based dissimilarity in `[0, 1]`: `1 - 2·LCS / (|a| + |b|)`.
pub fn line_distance(a: &str, b: &str) -> f64 {
    let left: Vec<&str> = a.lines().map(str::trim_end).collect();
    let right: Vec<&str> = b.lines().map(str::trim_end).collect();
    let total = left.len() + right.len();
    if total == 0 {
        return 0.0;
    }
    let common = lcs_table(&left, &right)[0][0];
    1.0 - (2 * common) as f64 / total as f64
}

fn tokens(text: &str) -> HashSet<&str> {
    text.split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| !t.is_empty())
        .collect()
}

/// Jaccard distance between identifier-like tokens of two texts.
pub fn token_distance(a: &str, b: &str) -> f64 {
    let left = tokens(a);
    let right = tokens(b);
    let union = left.union(&right).count();
    if union == 0 {
        return 0.0;
    }
    let shared = left.intersection(&right).count();
    1.0 - shared as f64 / union as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains_code_detects_calls_and_assignments() {
        assert!(contains_code("why does print(x) fail"));
        assert!(contains_code("I wrote total = total + 1"));
        assert!(contains_code("from math import sqrt"));
        assert!(!contains_code("what is a variable?"));
    }

    #[test]
    fn test_code_snippets_fenced_and_inline() {
        let body = "try `len(xs)` or\n```python\nfor x in xs:\n    print(x)\n```";
        let snippets = code_snippets(body);
        assert_eq!(snippets[0], "len(xs)");
        assert!(snippets[1].contains("for x in xs:"));
    }

    #[test]
    fn test_added_line_numbers() {
        let old = "a = 1\nprint(a)";
        let new = "a = 1\nb = 2\nprint(a)\nprint(b)";
        assert_eq!(added_line_numbers(old, new), vec![2, 4]);
    }

    #[test]
    fn test_added_line_numbers_from_empty() {
        assert_eq!(added_line_numbers("", "x = 1\ny = 2"), vec![1, 2]);
        assert!(added_line_numbers("x = 1", "x = 1").is_empty());
    }

    #[test]
    fn test_line_distance_bounds() {
        assert_eq!(line_distance("x = 1\ny = 2", "x = 1\ny = 2"), 0.0);
        assert_eq!(line_distance("x = 1", "z = 3"), 1.0);
        let partial = line_distance("x = 1\ny = 2", "x = 1\ny = 3");
        assert!(partial > 0.0 && partial < 1.0);
    }

    #[test]
    fn test_token_distance() {
        assert_eq!(token_distance("total += x", "total += x"), 0.0);
        assert_eq!(token_distance("alpha", "beta"), 1.0);
        assert_eq!(token_distance("", ""), 0.0);
    }
}
