//! Learning goals recognised in notebook code.
//!
//! Each goal is detected line by line with a regex over the line's code, its
//! trailing comment stripped. Detection is heuristic: a line that only looks
//! like a construct counts as applying it.

use std::sync::OnceLock;

use regex::Regex;

pub const FUNCTION_CALL: &str = "Function call";

/// Goal reported for syntax errors caused by mistyped quotes or brackets.
/// Never detected in code that ran.
pub const TYPO: &str = "Typo";

/// Goals with a code pattern, in reporting order.
const CODE_RULES: &[(&str, &str)] = &[
    ("Print statement", r"\bprint\s*\("),
    (
        "Variable assignment",
        r"^[A-Za-z_][\w.]*(\s*,\s*[A-Za-z_][\w.]*)*\s*(\+|-|\*\*?|//?|%)?=[^=]",
    ),
    ("Conditionals", r"^(if|elif)\b|^else\s*:"),
    ("For loop", r"^for\s+.+\s+in\s+.+:"),
    ("While loop", r"^while\b.*:"),
    ("Break statement", r"^break\b"),
    (FUNCTION_CALL, r"\b([A-Za-z_]\w*)\s*\("),
    ("Function definition", r"^def\s+[A-Za-z_]\w*\s*\("),
    ("Import statement", r"^(import\s+\w|from\s+[\w.]+\s+import\b)"),
    ("List access", r"[\w)\]]\["),
    ("List assignment", r"^[A-Za-z_][\w.]*\[[^\]]*\]\s*=[^=]"),
    ("List declaration", r"(^|[=(,:\[]\s*)\["),
    ("Type casting", r"\b(int|float|str|bool|list|dict|set|tuple)\s*\("),
];

/// Words followed by `(` that do not call anything.
const NOT_CALLABLE: &[&str] = &[
    "and", "assert", "class", "def", "del", "elif", "except", "for", "if", "in", "is", "lambda",
    "not", "or", "return", "while", "with", "yield",
];

fn code_rules() -> &'static [(&'static str, Regex)] {
    static RULES: OnceLock<Vec<(&'static str, Regex)>> = OnceLock::new();
    RULES.get_or_init(|| {
        CODE_RULES
            .iter()
            .map(|(goal, pattern)| (*goal, Regex::new(pattern).expect("regex is valid")))
            .collect()
    })
}

/// Every goal name, code goals first, then [`TYPO`].
pub fn all_goals() -> impl Iterator<Item = &'static str> {
    CODE_RULES.iter().map(|(goal, _)| *goal).chain([TYPO])
}

/// Column-friendly form of a goal name: `"For loop"` → `"for_loop"`.
pub fn goal_slug(goal: &str) -> String {
    goal.to_lowercase().replace(' ', "_")
}

/// Whether `re` finds a real call in `line`, skipping keywords and the name
/// introduced by `def` or `class`.
fn has_call(re: &Regex, line: &str) -> bool {
    re.captures_iter(line).any(|caps| {
        let Some(name) = caps.get(1) else {
            return false;
        };
        let previous_word = line[..name.start()]
            .trim_end()
            .rsplit(|c: char| !c.is_alphanumeric() && c != '_')
            .next()
            .unwrap_or_default();
        !NOT_CALLABLE.contains(&name.as_str()) && previous_word != "def" && previous_word != "class"
    })
}

/// Goals applied in one line of code.
pub fn goals_in_line(line: &str) -> impl Iterator<Item = &'static str> + '_ {
    let code = line.split('#').next().unwrap_or_default().trim();
    code_rules()
        .iter()
        .filter(move |(goal, re)| {
            !code.is_empty()
                && match *goal {
                    FUNCTION_CALL => has_call(re, code),
                    _ => re.is_match(code),
                }
        })
        .map(|(goal, _)| *goal)
}

/// Goals applied in the 1-based `lines` of `code`, once each, in reporting
/// order. Line numbers past the end are ignored.
pub fn goals_in_lines(code: &str, lines: &[usize]) -> Vec<&'static str> {
    let source: Vec<&str> = code.lines().collect();
    let mut found: Vec<&'static str> = lines
        .iter()
        .filter_map(|&n| n.checked_sub(1).and_then(|i| source.get(i)))
        .flat_map(|line| goals_in_line(line))
        .collect();
    found.sort_by_key(|goal| all_goals().position(|g| g == *goal));
    found.dedup();
    found
}

// ── Tests ─────────────────────────────────────────────────────────────────────
