//! Heuristic block-balance check for Lua text
//!
//! Splits the text into code, strings, and comments, then counts block
//! openers against `end` and `repeat` against `until` in the code segments.
//! It does not parse; it only catches gross structural damage.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SegmentKind {
    Code,
    ShortString,
    LongString,
    Comment,
}

#[derive(Debug)]
struct Segment<'a> {
    kind: SegmentKind,
    text: &'a str,
}

/// Counts gathered by [`check_balance`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BalanceReport {
    /// `function`, `if`, `for`, `while`, and standalone `do`
    pub opens_end: usize,
    pub closes_end: usize,
    pub opens_repeat: usize,
    pub closes_until: usize,
    pub balanced_end: bool,
    pub balanced_repeat: bool,
}

impl BalanceReport {
    pub fn is_balanced(&self) -> bool {
        self.balanced_end && self.balanced_repeat
    }
}

impl fmt::Display for BalanceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "end-open={}, end-close={}, repeat-open={}, until-close={}",
            self.opens_end, self.closes_end, self.opens_repeat, self.closes_until
        )
    }
}

/// Count block keywords outside strings and comments
pub fn check_balance(text: &str) -> BalanceReport {
    let mut report = BalanceReport::default();
    // `for`/`while` headers whose `do` has not been seen yet
    let mut pending_loops = 0usize;

    for segment in segment(text) {
        if segment.kind != SegmentKind::Code {
            continue;
        }
        let words = segment
            .text
            .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .filter(|w| !w.is_empty());
        for word in words {
            match word {
                "function" | "if" => report.opens_end += 1,
                "for" | "while" => {
                    report.opens_end += 1;
                    pending_loops += 1;
                }
                "do" => {
                    if pending_loops > 0 {
                        pending_loops -= 1;
                    } else {
                        report.opens_end += 1;
                    }
                }
                "end" => report.closes_end += 1,
                "repeat" => report.opens_repeat += 1,
                "until" => report.closes_until += 1,
                _ => {}
            }
        }
    }

    report.balanced_end = report.opens_end == report.closes_end;
    report.balanced_repeat = report.opens_repeat == report.closes_until;
    report
}

/// Level of a long bracket opening at `i` (`[[` is 0, `[==[` is 2)
fn long_bracket_level(bytes: &[u8], i: usize) -> Option<usize> {
    if bytes.get(i) != Some(&b'[') {
        return None;
    }
    let mut j = i + 1;
    while bytes.get(j) == Some(&b'=') {
        j += 1;
    }
    (bytes.get(j) == Some(&b'[')).then_some(j - i - 1)
}

/// Index just past the `]=*]` closing a long bracket of `level`, or the end
fn long_bracket_end(text: &str, from: usize, level: usize) -> usize {
    let close = format!("]{}]", "=".repeat(level));
    text[from..]
        .find(&close)
        .map_or(text.len(), |pos| from + pos + close.len())
}

fn push_code<'a>(segments: &mut Vec<Segment<'a>>, text: &'a str, start: usize, end: usize) {
    if end > start {
        segments.push(Segment {
            kind: SegmentKind::Code,
            text: &text[start..end],
        });
    }
}

fn segment(text: &str) -> Vec<Segment<'_>> {
    let bytes = text.as_bytes();
    let mut segments = Vec::new();
    let mut code_start = 0;
    let mut i = 0;

    while i < bytes.len() {
        let start = i;
        let (kind, end) = if bytes[i] == b'-' && bytes.get(i + 1) == Some(&b'-') {
            let end = match long_bracket_level(bytes, i + 2) {
                Some(level) => long_bracket_end(text, i + 4 + level, level),
                None => text[i..].find('\n').map_or(text.len(), |pos| i + pos + 1),
            };
            (SegmentKind::Comment, end)
        } else if bytes[i] == b'"' || bytes[i] == b'\'' {
            let quote = bytes[i];
            let mut j = i + 1;
            while j < bytes.len() && bytes[j] != quote && bytes[j] != b'\n' {
                j += if bytes[j] == b'\\' { 2 } else { 1 };
            }
            (SegmentKind::ShortString, (j + 1).min(bytes.len()))
        } else if let Some(level) = long_bracket_level(bytes, i) {
            (
                SegmentKind::LongString,
                long_bracket_end(text, i + 2 + level, level),
            )
        } else {
            i += 1;
            continue;
        };

        push_code(&mut segments, text, code_start, start);
        segments.push(Segment {
            kind,
            text: &text[start..end],
        });
        i = end;
        code_start = end;
    }
    push_code(&mut segments, text, code_start, bytes.len());
    segments
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_balanced_program() {
        let report = check_balance(
            "local function f(x)\n  if x then return 1 end\n  for i=1,2 do end\n  while false do end\n  do end\n  repeat until true\nend",
        );
        assert_eq!(report.opens_end, 5);
        assert_eq!(report.closes_end, 5);
        assert_eq!(report.opens_repeat, 1);
        assert!(report.is_balanced(), "{report}");
    }

    #[test]
    fn test_missing_end() {
        let report = check_balance("if a then\n  print(1)\n");
        assert!(!report.balanced_end);
        assert!(!report.is_balanced());
    }

    #[test]
    fn test_keywords_in_strings_and_comments_ignored() {
        let text = r#"
            local s = "function if end"
            local t = 'repeat \' end'
            local u = [==[ while do ]] end ]==]
            -- if then end
            --[[ for
               function ]]
            print(s, t, u)
        "#;
        let report = check_balance(text);
        assert_eq!(report.opens_end, 0);
        assert_eq!(report.closes_end, 0);
        assert_eq!(report.opens_repeat, 0);
        assert!(report.is_balanced());
    }

    #[test]
    fn test_unterminated_repeat() {
        let report = check_balance("repeat x = x + 1");
        assert!(report.balanced_end);
        assert!(!report.balanced_repeat);
        assert_eq!(
            report.to_string(),
            "end-open=0, end-close=0, repeat-open=1, until-close=0"
        );
    }

    #[test]
    fn test_segments() {
        let kinds: Vec<SegmentKind> = segment("a='x' -- c\nb=[[y]]")
            .iter()
            .map(|s| s.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                SegmentKind::Code,
                SegmentKind::ShortString,
                SegmentKind::Code,
                SegmentKind::Comment,
                SegmentKind::Code,
                SegmentKind::LongString,
            ]
        );
    }
}
