//! Regular expressions simple enough to run as LIKE/GLOB patterns

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternPart {
    Literal(char),
    /// `.`
    AnyChar,
    /// `.*`
    AnyRun,
}

/// A regex made only of literals, `.`, `.*` and optional `^`/`$` anchors
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimplePattern {
    pub anchored_start: bool,
    pub anchored_end: bool,
    pub parts: Vec<PatternPart>,
}

impl SimplePattern {
    /// `None` when the pattern needs a real regex engine
    pub fn parse(pattern: &str) -> Option<Self> {
        let mut chars: Vec<char> = pattern.chars().collect();

        let anchored_start = chars.first() == Some(&'^');
        if anchored_start {
            chars.remove(0);
        }

        let anchored_end = chars.last() == Some(&'$') && !ends_escaped(&chars);
        if anchored_end {
            chars.pop();
        }

        let mut parts = Vec::new();
        let mut i = 0;
        while i < chars.len() {
            match chars[i] {
                '\\' => {
                    let next = *chars.get(i + 1)?;
                    if next.is_alphanumeric() {
                        // character classes like \d, \w, \b
                        return None;
                    }
                    parts.push(PatternPart::Literal(next));
                    i += 2;
                }
                '.' => match chars.get(i + 1) {
                    Some('*') => {
                        parts.push(PatternPart::AnyRun);
                        i += 2;
                    }
                    Some('+') => {
                        parts.push(PatternPart::AnyChar);
                        parts.push(PatternPart::AnyRun);
                        i += 2;
                    }
                    _ => {
                        parts.push(PatternPart::AnyChar);
                        i += 1;
                    }
                },
                '*' | '+' | '?' | '(' | ')' | '[' | ']' | '{' | '}' | '|' | '^' | '$' => {
                    return None
                }
                c => {
                    parts.push(PatternPart::Literal(c));
                    i += 1;
                }
            }
        }

        Some(Self {
            anchored_start,
            anchored_end,
            parts,
        })
    }

    /// LIKE pattern using `\` as the escape character
    pub fn to_like(&self) -> String {
        let mut out = String::new();
        if !self.anchored_start {
            out.push('%');
        }
        for part in &self.parts {
            match part {
                PatternPart::Literal(c @ ('%' | '_' | '\\')) => {
                    out.push('\\');
                    out.push(*c);
                }
                PatternPart::Literal(c) => out.push(*c),
                PatternPart::AnyChar => out.push('_'),
                PatternPart::AnyRun => out.push('%'),
            }
        }
        if !self.anchored_end {
            out.push('%');
        }
        out
    }

    /// Case-sensitive GLOB pattern (sqlite)
    pub fn to_glob(&self) -> String {
        let mut out = String::new();
        if !self.anchored_start {
            out.push('*');
        }
        for part in &self.parts {
            match part {
                PatternPart::Literal(c @ ('*' | '?' | '[')) => {
                    out.push('[');
                    out.push(*c);
                    out.push(']');
                }
                PatternPart::Literal(c) => out.push(*c),
                PatternPart::AnyChar => out.push('?'),
                PatternPart::AnyRun => out.push('*'),
            }
        }
        if !self.anchored_end {
            out.push('*');
        }
        out
    }
}

/// True if the final character is escaped by an odd run of backslashes
fn ends_escaped(chars: &[char]) -> bool {
    let backslashes = chars[..chars.len() - 1]
        .iter()
        .rev()
        .take_while(|c| **c == '\\')
        .count();
    backslashes % 2 == 1
}
