use regex::{Regex, RegexBuilder};

/// Shell-style file name pattern (`*`, `?`, `[...]`, `[!...]`), matched
/// case-insensitively against a whole name
#[derive(Debug, Clone)]
pub struct GlobPattern {
    source: String,
    regex: Regex,
}

impl GlobPattern {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        let regex = RegexBuilder::new(&translate(pattern))
            .case_insensitive(true)
            .build()?;
        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, file_name: &str) -> bool {
        self.regex.is_match(file_name)
    }
}

/// Include and exclude lists of one glob
#[derive(Debug, Clone)]
pub struct FileFilter {
    include: Vec<GlobPattern>,
    exclude: Vec<GlobPattern>,
}

impl FileFilter {
    /// Blank patterns are ignored
    pub fn new(include: &[String], exclude: &[String]) -> Result<Self, regex::Error> {
        let compile = |patterns: &[String]| {
            patterns
                .iter()
                .map(|p| p.trim())
                .filter(|p| !p.is_empty())
                .map(GlobPattern::new)
                .collect::<Result<Vec<_>, _>>()
        };
        Ok(Self {
            include: compile(include)?,
            exclude: compile(exclude)?,
        })
    }

    /// Matches an include pattern and no exclude pattern
    pub fn accepts(&self, file_name: &str) -> bool {
        self.include.iter().any(|p| p.matches(file_name))
            && !self.exclude.iter().any(|p| p.matches(file_name))
    }
}

fn translate(pattern: &str) -> String {
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::from("^");
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '[' => match class_end(&chars, i) {
                Some(end) => {
                    let mut body = &chars[i + 1..end];
                    out.push('[');
                    if body.first() == Some(&'!') {
                        out.push('^');
                        body = &body[1..];
                    }
                    for &c in body {
                        if matches!(c, '\\' | '[' | ']' | '&' | '~' | '^') {
                            out.push('\\');
                        }
                        out.push(c);
                    }
                    out.push(']');
                    i = end;
                }
                // Unclosed bracket is a literal
                None => out.push_str(r"\["),
            },
            c => out.push_str(&regex::escape(c.encode_utf8(&mut [0; 4]))),
        }
        i += 1;
    }

    out.push('$');
    out
}

/// Index of the `]` closing the class opened at `start`. A `]` directly
/// after `[` or `[!` belongs to the class.
fn class_end(chars: &[char], start: usize) -> Option<usize> {
    let mut j = start + 1;
    if chars.get(j) == Some(&'!') {
        j += 1;
    }
    if chars.get(j) == Some(&']') {
        j += 1;
    }
    (j..chars.len()).find(|&k| chars[k] == ']')
}
