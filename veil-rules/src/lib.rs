//! Match/replace rewrite engine.
//!
//! Applies an ordered, typed list of [`MatchReplaceRule`]s to one of six
//! slices of a request or response: the virtual first line, the header
//! set, or the body. Slices are always rewritten in the fixed sequence
//! first line, then headers, then body; that ordering is part of the
//! contract even when a first-line rewrite makes an earlier header match
//! stale.
//!
//! Error policy: a disabled rule is a no-op, a regex that fails to
//! compile is skipped silently, and a rewritten line that no longer
//! parses falls back to the original. Nothing in here aborts a pipeline.

use regex::Regex;
use tracing::debug;
use veil_common::{Headers, ItemSlice, MatchReplaceRule};

/// Borrowed view over a rule snapshot, offering one rewrite entry point
/// per slice kind.
pub struct RuleEngine<'a> {
    rules: &'a [MatchReplaceRule],
}

impl<'a> RuleEngine<'a> {
    pub fn new(rules: &'a [MatchReplaceRule]) -> Self {
        Self { rules }
    }

    fn enabled(&self, slice: ItemSlice) -> impl Iterator<Item = &'a MatchReplaceRule> {
        self.rules
            .iter()
            .filter(move |r| r.enabled && r.item == slice)
    }

    /// Rewrite the request first line.
    ///
    /// The engine synthesises `"METHOD URL HTTP/1.1"`, runs every enabled
    /// first-line rule against it in order, and parses the result back.
    /// If fewer than two tokens survive, the original pair is retained.
    pub fn request_line(&self, method: &str, url: &str) -> (String, String) {
        let mut line = format!("{method} {url} HTTP/1.1");
        let mut touched = false;
        for rule in self.enabled(ItemSlice::RequestFirstLine) {
            line = apply_rule(rule, &line);
            touched = true;
        }
        if !touched {
            return (method.to_string(), url.to_string());
        }
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some(m), Some(u)) => (m.to_string(), u.to_string()),
            _ => (method.to_string(), url.to_string()),
        }
    }

    /// Rewrite the response status via the virtual line `"HTTP/1.1 STATUS"`.
    ///
    /// A result that does not coerce back to an integer retains the
    /// original status.
    pub fn status_line(&self, status: u16) -> u16 {
        let mut line = format!("HTTP/1.1 {status}");
        for rule in self.enabled(ItemSlice::ResponseFirstLine) {
            line = apply_rule(rule, &line);
        }
        line.split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .unwrap_or(status)
    }

    /// Rewrite a header set.
    ///
    /// One rule at a time, the map is linearised to `"Name: Value"`
    /// lines, the rule runs against each line, and the result is
    /// re-parsed. A line that becomes empty deletes its header; a line
    /// left as `Name:` (no space) is still accepted; duplicate names
    /// after rewrite collapse under last-writer-wins.
    pub fn headers(&self, slice: ItemSlice, headers: &Headers) -> Headers {
        let mut current = headers.clone();
        for rule in self.enabled(slice) {
            let mut next = Headers::new();
            for (name, value) in &current {
                let line = apply_rule(rule, &format!("{name}: {value}"));
                if line.is_empty() {
                    continue;
                }
                if let Some((k, v)) = line.split_once(": ") {
                    next.insert(k.to_string(), v.to_string());
                } else if let Some((k, v)) = line.split_once(':') {
                    next.insert(k.to_string(), v.to_string());
                }
            }
            current = next;
        }
        current
    }

    /// Rewrite a body in rule order. An absent body is returned unchanged;
    /// a match deleted to the empty string yields an empty body, not an
    /// absent one.
    pub fn body(&self, slice: ItemSlice, body: Option<String>) -> Option<String> {
        let mut body = body?;
        for rule in self.enabled(slice) {
            body = apply_rule(rule, &body);
        }
        Some(body)
    }
}

/// Run a single rule against one input string.
///
/// Literal rules replace every occurrence; regex rules replace every
/// match with capture groups available as `$1`, `$2`, … in the
/// replacement. An invalid pattern leaves the input untouched.
fn apply_rule(rule: &MatchReplaceRule, input: &str) -> String {
    if rule.is_regex {
        match Regex::new(&rule.pattern) {
            Ok(re) => re.replace_all(input, rule.replace.as_str()).into_owned(),
            Err(err) => {
                debug!(target: "rules.engine", pattern = %rule.pattern, %err, "skipping invalid regex rule");
                input.to_string()
            }
        }
    } else {
        input.replace(&rule.pattern, &rule.replace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veil_common::ItemSlice::*;

    fn rule(item: ItemSlice, pattern: &str, replace: &str, is_regex: bool) -> MatchReplaceRule {
        MatchReplaceRule {
            enabled: true,
            item,
            pattern: pattern.to_string(),
            replace: replace.to_string(),
            is_regex,
            comment: String::new(),
        }
    }

    fn headers(pairs: &[(&str, &str)]) -> Headers {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn header_value_rewrite() {
        let rules = vec![rule(RequestHeader, "User-Agent: .*", "User-Agent: X", true)];
        let engine = RuleEngine::new(&rules);
        let out = engine.headers(
            RequestHeader,
            &headers(&[("User-Agent", "Mozilla/5.0"), ("Accept", "*/*")]),
        );
        assert_eq!(out["User-Agent"], "X");
        assert_eq!(out["Accept"], "*/*");
    }

    #[test]
    fn header_line_deleted_when_empty() {
        let rules = vec![rule(RequestHeader, "X-Tracking: .*", "", true)];
        let engine = RuleEngine::new(&rules);
        let out = engine.headers(
            RequestHeader,
            &headers(&[("X-Tracking", "abc"), ("Host", "a.example")]),
        );
        assert!(!out.contains_key("X-Tracking"));
        assert_eq!(out["Host"], "a.example");
    }

    #[test]
    fn header_without_space_still_parses() {
        let rules = vec![rule(RequestHeader, "Accept: text", "Accept:text", false)];
        let engine = RuleEngine::new(&rules);
        let out = engine.headers(RequestHeader, &headers(&[("Accept", "text")]));
        assert_eq!(out["Accept"], "text");
    }

    #[test]
    fn linearise_reparse_round_trips_awkward_values() {
        // A rule that matches nothing still drives the full
        // linearise/rewrite/reparse cycle for its slice.
        let rules = vec![rule(RequestHeader, "no-such-match", "x", false)];
        let engine = RuleEngine::new(&rules);
        let input = headers(&[
            ("X-Note", "a: b: c"),
            ("Empty", ""),
            ("Accept", "text/html"),
        ]);
        let out = engine.headers(RequestHeader, &input);
        assert_eq!(out, input);
    }

    #[test]
    fn duplicate_names_collapse_last_writer_wins() {
        let rules = vec![rule(RequestHeader, "X-B: 2", "X-A: 3", false)];
        let engine = RuleEngine::new(&rules);
        let out = engine.headers(RequestHeader, &headers(&[("X-A", "1"), ("X-B", "2")]));
        assert_eq!(out.len(), 1);
        assert_eq!(out["X-A"], "3");
    }

    #[test]
    fn request_line_rewrites_method_and_url() {
        let rules = vec![rule(RequestFirstLine, "GET", "POST", false)];
        let engine = RuleEngine::new(&rules);
        let (method, url) = engine.request_line("GET", "https://example.com/a");
        assert_eq!(method, "POST");
        assert_eq!(url, "https://example.com/a");
    }

    #[test]
    fn request_line_falls_back_when_unparseable() {
        let rules = vec![rule(RequestFirstLine, ".*", "", true)];
        let engine = RuleEngine::new(&rules);
        let (method, url) = engine.request_line("GET", "https://example.com/");
        assert_eq!(method, "GET");
        assert_eq!(url, "https://example.com/");
    }

    #[test]
    fn status_rewrite_literal() {
        let rules = vec![rule(ResponseFirstLine, "200", "418", false)];
        let engine = RuleEngine::new(&rules);
        assert_eq!(engine.status_line(200), 418);
        assert_eq!(engine.status_line(404), 404);
    }

    #[test]
    fn status_retained_when_not_numeric() {
        let rules = vec![rule(ResponseFirstLine, "200", "teapot", false)];
        let engine = RuleEngine::new(&rules);
        assert_eq!(engine.status_line(200), 200);
    }

    #[test]
    fn body_rules_run_in_order() {
        let rules = vec![
            rule(RequestBody, "hello", "goodbye", false),
            rule(RequestBody, "goodbye", "farewell", false),
        ];
        let engine = RuleEngine::new(&rules);
        assert_eq!(
            engine.body(RequestBody, Some("hello world".into())),
            Some("farewell world".into())
        );
    }

    #[test]
    fn body_deleted_to_empty_is_empty_not_absent() {
        let rules = vec![rule(RequestBody, ".*", "", true)];
        let engine = RuleEngine::new(&rules);
        assert_eq!(engine.body(RequestBody, Some("payload".into())), Some(String::new()));
        assert_eq!(engine.body(RequestBody, None), None);
    }

    #[test]
    fn invalid_regex_skipped_neighbours_still_run() {
        let rules = vec![
            rule(ResponseBody, "[unclosed", "x", true),
            rule(ResponseBody, "foo", "bar", false),
        ];
        let engine = RuleEngine::new(&rules);
        assert_eq!(
            engine.body(ResponseBody, Some("foo".into())),
            Some("bar".into())
        );
    }

    #[test]
    fn disabled_rules_are_noops() {
        let mut off = rule(RequestBody, "a", "b", false);
        off.enabled = false;
        let rules = vec![off];
        let engine = RuleEngine::new(&rules);
        assert_eq!(engine.body(RequestBody, Some("a".into())), Some("a".into()));
    }

    #[test]
    fn regex_capture_groups_in_replacement() {
        let rules = vec![rule(
            RequestFirstLine,
            r"GET (\S+)/old",
            "GET $1/new",
            true,
        )];
        let engine = RuleEngine::new(&rules);
        let (_, url) = engine.request_line("GET", "https://example.com/old");
        assert_eq!(url, "https://example.com/new");
    }

    #[test]
    fn deterministic_for_fixed_rule_list() {
        let rules = vec![
            rule(ResponseBody, "a", "b", false),
            rule(ResponseBody, "b+", "c", true),
        ];
        let engine = RuleEngine::new(&rules);
        let first = engine.body(ResponseBody, Some("aab".into()));
        let second = engine.body(ResponseBody, Some("aab".into()));
        assert_eq!(first, second);
    }

    #[test]
    fn rules_only_touch_their_slice() {
        let rules = vec![rule(ResponseHeader, "Server: .*", "Server: hidden", true)];
        let engine = RuleEngine::new(&rules);
        let out = engine.headers(RequestHeader, &headers(&[("Server", "nginx")]));
        assert_eq!(out["Server"], "nginx");
    }
}
