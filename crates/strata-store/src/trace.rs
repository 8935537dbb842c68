use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

/// Records the observable operations of a store stack, one line per call.
///
/// Lines have the form `"{store}: {operation} {detail}"`. A disabled tracer
/// records nothing and costs a branch.
#[derive(Clone, Default)]
pub struct Tracer {
    lines: Option<Arc<Mutex<Vec<String>>>>,
}

impl Tracer {
    pub fn disabled() -> Self {
        Self { lines: None }
    }

    pub fn recording() -> Self {
        Self {
            lines: Some(Arc::new(Mutex::new(Vec::new()))),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.lines.is_some()
    }

    pub fn record(&self, store: &str, operation: &str, detail: impl fmt::Display) {
        if let Some(lines) = &self.lines {
            lines.lock().push(format!("{store}: {operation} {detail}"));
        }
    }

    /// Snapshot of everything recorded so far.
    pub fn lines(&self) -> Vec<String> {
        self.lines
            .as_ref()
            .map(|l| l.lock().clone())
            .unwrap_or_default()
    }

    /// Return and forget everything recorded so far.
    pub fn take(&self) -> Vec<String> {
        self.lines
            .as_ref()
            .map(|l| std::mem::take(&mut *l.lock()))
            .unwrap_or_default()
    }
}

impl fmt::Debug for Tracer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracer")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

/// A golden trace line did not match the recorded one.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TraceMismatch {
    #[error("line {line}: expected {expected:?}, got {actual:?}")]
    Line {
        line: usize,
        expected: String,
        actual: String,
    },
    #[error("expected {expected} lines, got {actual}")]
    Length { expected: usize, actual: usize },
}

#[derive(Debug, PartialEq, Eq)]
enum Segment<'a> {
    Literal(&'a str),
    Var(&'a str),
}

fn parse_pattern(pattern: &str) -> Vec<Segment<'_>> {
    let mut segments = Vec::new();
    let mut rest = pattern;
    while let Some(start) = rest.find("${") {
        let Some(len) = rest[start + 2..].find('}') else {
            break;
        };
        if start > 0 {
            segments.push(Segment::Literal(&rest[..start]));
        }
        segments.push(Segment::Var(&rest[start + 2..start + 2 + len]));
        rest = &rest[start + 3 + len..];
    }
    if !rest.is_empty() {
        segments.push(Segment::Literal(rest));
    }
    segments
}

/// Matches recorded traces against golden lines with `${NAME}` placeholders.
///
/// The first occurrence of a placeholder captures whatever text sits in its
/// position; every later occurrence must match the captured text exactly.
/// This lets a golden file talk about "the key of the first write" without
/// hard-coding random or content-derived values.
#[derive(Debug, Default)]
pub struct TraceMatcher {
    vars: HashMap<String, String>,
}

impl TraceMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value captured for `name`, if any.
    pub fn var(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    /// Match one line, capturing new placeholders on success.
    pub fn matches(&mut self, expected: &str, actual: &str) -> bool {
        let segments = parse_pattern(expected);
        let mut captured = Vec::new();
        if self.match_segments(&segments, actual, &mut captured) {
            for (name, value) in captured {
                self.vars.insert(name, value);
            }
            true
        } else {
            false
        }
    }

    fn match_segments(
        &self,
        segments: &[Segment<'_>],
        actual: &str,
        captured: &mut Vec<(String, String)>,
    ) -> bool {
        let Some((first, rest)) = segments.split_first() else {
            return actual.is_empty();
        };
        match first {
            Segment::Literal(lit) => actual
                .strip_prefix(lit)
                .map_or(false, |tail| self.match_segments(rest, tail, captured)),
            Segment::Var(name) => {
                let bound = self
                    .vars
                    .get(*name)
                    .cloned()
                    .or_else(|| {
                        captured
                            .iter()
                            .find(|(n, _)| n.as_str() == *name)
                            .map(|(_, v)| v.clone())
                    });
                if let Some(value) = bound {
                    return actual
                        .strip_prefix(value.as_str())
                        .map_or(false, |tail| self.match_segments(rest, tail, captured));
                }
                // Unbound: try the shortest capture first.
                for (end, _) in actual.char_indices().skip(1).chain([(actual.len(), ' ')]) {
                    captured.push((name.to_string(), actual[..end].to_string()));
                    if self.match_segments(rest, &actual[end..], captured) {
                        return true;
                    }
                    captured.pop();
                }
                false
            }
        }
    }

    /// Match a whole trace line by line.
    pub fn match_all<S: AsRef<str>>(
        &mut self,
        expected: &[S],
        actual: &[String],
    ) -> Result<(), TraceMismatch> {
        for (i, (exp, act)) in expected.iter().zip(actual).enumerate() {
            if !self.matches(exp.as_ref(), act) {
                return Err(TraceMismatch::Line {
                    line: i + 1,
                    expected: exp.as_ref().to_string(),
                    actual: act.clone(),
                });
            }
        }
        if expected.len() != actual.len() {
            return Err(TraceMismatch::Length {
                expected: expected.len(),
                actual: actual.len(),
            });
        }
        Ok(())
    }

    /// Golden lines from a trace file: blank lines and `#` comments skipped.
    pub fn golden_lines(text: &str) -> Vec<&str> {
        text.lines()
            .map(str::trim_end)
            .filter(|l| !l.is_empty() && !l.trim_start().starts_with('#'))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracer_records_when_enabled() {
        let tracer = Tracer::recording();
        tracer.record("local", "write", "abc");
        let clone = tracer.clone();
        clone.record("local", "delete", "abc");
        assert_eq!(tracer.lines(), vec!["local: write abc", "local: delete abc"]);
        assert_eq!(tracer.take().len(), 2);
        assert!(tracer.lines().is_empty());
    }

    #[test]
    fn disabled_tracer_is_silent() {
        let tracer = Tracer::disabled();
        tracer.record("local", "write", "abc");
        assert!(tracer.lines().is_empty());
        assert!(!tracer.is_enabled());
    }

    #[test]
    fn parse_pattern_segments() {
        assert_eq!(
            parse_pattern("s: write ${KEY} done"),
            vec![
                Segment::Literal("s: write "),
                Segment::Var("KEY"),
                Segment::Literal(" done")
            ]
        );
        assert_eq!(parse_pattern("${A}"), vec![Segment::Var("A")]);
        assert_eq!(parse_pattern("no vars"), vec![Segment::Literal("no vars")]);
    }

    #[test]
    fn placeholder_captures_then_binds() {
        let mut matcher = TraceMatcher::new();
        assert!(matcher.matches("s: write ${KEY}", "s: write abc123"));
        assert_eq!(matcher.var("KEY"), Some("abc123"));
        assert!(matcher.matches("s: read ${KEY}", "s: read abc123"));
        assert!(!matcher.matches("s: read ${KEY}", "s: read other"));
    }

    #[test]
    fn placeholder_between_literals() {
        let mut matcher = TraceMatcher::new();
        assert!(matcher.matches("copy ${SRC} -> ${DST}", "copy a-b -> c"));
        assert_eq!(matcher.var("SRC"), Some("a-b"));
        assert_eq!(matcher.var("DST"), Some("c"));
    }

    #[test]
    fn repeated_placeholder_in_one_line() {
        let mut matcher = TraceMatcher::new();
        assert!(matcher.matches("${K} then ${K}", "x1 then x1"));
        assert!(!TraceMatcher::new().matches("${K} then ${K}", "x1 then x2"));
    }

    #[test]
    fn failed_match_does_not_bind() {
        let mut matcher = TraceMatcher::new();
        assert!(!matcher.matches("write ${KEY} end", "write abc"));
        assert_eq!(matcher.var("KEY"), None);
    }

    #[test]
    fn match_all_reports_line_and_length() {
        let actual = vec!["a: write k1".to_string(), "a: write k1".to_string()];
        let mut matcher = TraceMatcher::new();
        assert!(matcher
            .match_all(&["a: write ${K}", "a: write ${K}"], &actual)
            .is_ok());

        let err = TraceMatcher::new()
            .match_all(&["a: write ${K}", "a: delete ${K}"], &actual)
            .unwrap_err();
        assert!(matches!(err, TraceMismatch::Line { line: 2, .. }));

        let err = TraceMatcher::new()
            .match_all(&["a: write ${K}"], &actual)
            .unwrap_err();
        assert_eq!(err, TraceMismatch::Length { expected: 1, actual: 2 });
    }

    #[test]
    fn golden_lines_skip_comments() {
        let text = "# header\n\na: write ${K}\n  # indented comment\na: read ${K}\n";
        assert_eq!(
            TraceMatcher::golden_lines(text),
            vec!["a: write ${K}", "a: read ${K}"]
        );
    }
}
