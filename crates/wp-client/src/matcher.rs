//! URL matchers for route handlers.
//!
//! A handler is registered with one of four matcher kinds: the empty string
//! (match anything), a glob pattern compiled to a regular expression, a
//! prebuilt regular expression, or an arbitrary predicate over the parsed
//! URL. Globs follow the URL-pattern dialect: `**` crosses path segments,
//! `*` stays within one, `?` is a single character, `{a,b}` alternates, and
//! `\` escapes the next character.

use std::sync::Arc;

use regex_lite::Regex;
use url::Url;

use crate::error::{Error, Result};

/// Predicate form of a matcher.
pub type UrlPredicate = Arc<dyn Fn(&Url) -> bool + Send + Sync>;

/// What a route handler matches against.
#[derive(Clone)]
pub enum RouteMatcher {
    /// Matches every URL.
    Any,
    /// Glob pattern, compiled at registration.
    Glob { source: String, regex: Regex },
    /// Regular expression over the full URL.
    Regex(Arc<Regex>),
    /// Arbitrary predicate.
    Predicate(UrlPredicate),
}

impl RouteMatcher {
    /// Compiles a glob (or the match-anything empty string).
    pub fn glob(pattern: &str) -> Result<Self> {
        if pattern.is_empty() {
            return Ok(RouteMatcher::Any);
        }
        let regex_source = glob_to_regex(pattern)?;
        let regex = Regex::new(&regex_source).map_err(|err| Error::Pattern {
            pattern: pattern.to_owned(),
            reason: err.to_string(),
        })?;
        Ok(RouteMatcher::Glob {
            source: pattern.to_owned(),
            regex,
        })
    }

    pub fn regex(regex: Regex) -> Self {
        RouteMatcher::Regex(Arc::new(regex))
    }

    pub fn predicate<F>(predicate: F) -> Self
    where
        F: Fn(&Url) -> bool + Send + Sync + 'static,
    {
        RouteMatcher::Predicate(Arc::new(predicate))
    }

    /// Whether an incoming request URL matches.
    ///
    /// Globs without a scheme are matched against the URL's path (plus
    /// query), so `/route` style patterns work against same-origin
    /// requests.
    pub fn matches(&self, url: &Url) -> bool {
        match self {
            RouteMatcher::Any => true,
            RouteMatcher::Glob { regex, source } => {
                if source.contains("://") {
                    regex.is_match(url.as_str())
                } else {
                    let mut target = url.path().to_owned();
                    if let Some(query) = url.query() {
                        target.push('?');
                        target.push_str(query);
                    }
                    regex.is_match(&target)
                }
            }
            RouteMatcher::Regex(regex) => regex.is_match(url.as_str()),
            RouteMatcher::Predicate(predicate) => predicate(url),
        }
    }

    /// Identity used by deregistration: structural for any/glob/regex,
    /// pointer identity for predicates.
    pub fn same(&self, other: &RouteMatcher) -> bool {
        match (self, other) {
            (RouteMatcher::Any, RouteMatcher::Any) => true,
            (
                RouteMatcher::Glob { source: a, .. },
                RouteMatcher::Glob { source: b, .. },
            ) => a == b,
            (RouteMatcher::Regex(a), RouteMatcher::Regex(b)) => a.as_str() == b.as_str(),
            (RouteMatcher::Predicate(a), RouteMatcher::Predicate(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl std::fmt::Debug for RouteMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouteMatcher::Any => f.write_str("Any"),
            RouteMatcher::Glob { source, .. } => f.debug_tuple("Glob").field(source).finish(),
            RouteMatcher::Regex(regex) => f.debug_tuple("Regex").field(&regex.as_str()).finish(),
            RouteMatcher::Predicate(_) => f.write_str("Predicate"),
        }
    }
}

impl std::str::FromStr for RouteMatcher {
    type Err = Error;

    fn from_str(pattern: &str) -> Result<Self> {
        RouteMatcher::glob(pattern)
    }
}

/// Translates a glob into an anchored regular expression.
fn glob_to_regex(glob: &str) -> Result<String> {
    let mut out = String::with_capacity(glob.len() * 2);
    out.push('^');
    let mut chars = glob.chars().peekable();
    let mut brace_depth = 0usize;
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    // Path-crossing wildcard.
                    out.push_str(".*");
                } else {
                    // Segment-local wildcard.
                    out.push_str("[^/]*");
                }
            }
            '?' => out.push('.'),
            '{' => {
                brace_depth += 1;
                out.push_str("(?:");
            }
            '}' => {
                if brace_depth == 0 {
                    return Err(Error::Pattern {
                        pattern: glob.to_owned(),
                        reason: "unmatched '}'".into(),
                    });
                }
                brace_depth -= 1;
                out.push(')');
            }
            ',' if brace_depth > 0 => out.push('|'),
            '\\' => match chars.next() {
                Some(escaped) => push_literal(&mut out, escaped),
                None => {
                    return Err(Error::Pattern {
                        pattern: glob.to_owned(),
                        reason: "trailing escape".into(),
                    });
                }
            },
            other => push_literal(&mut out, other),
        }
    }
    if brace_depth != 0 {
        return Err(Error::Pattern {
            pattern: glob.to_owned(),
            reason: "unmatched '{'".into(),
        });
    }
    out.push('$');
    Ok(out)
}

fn push_literal(out: &mut String, c: char) {
    if "^$.|?*+()[]{}\\".contains(c) {
        out.push('\\');
    }
    out.push(c);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn empty_pattern_matches_anything() {
        let m = RouteMatcher::glob("").unwrap();
        assert!(m.matches(&url("https://example.com/whatever?x=1")));
    }

    #[test]
    fn path_glob_matches_same_origin_path() {
        let m = RouteMatcher::glob("/route").unwrap();
        assert!(m.matches(&url("http://127.0.0.1:8000/route")));
        assert!(!m.matches(&url("http://127.0.0.1:8000/route/nested")));
    }

    #[test]
    fn single_star_stays_in_segment() {
        let m = RouteMatcher::glob("/static/*.png").unwrap();
        assert!(m.matches(&url("http://h/static/logo.png")));
        assert!(!m.matches(&url("http://h/static/deep/logo.png")));
    }

    #[test]
    fn double_star_crosses_segments() {
        let m = RouteMatcher::glob("**/*.png").unwrap();
        assert!(m.matches(&url("https://example.com/a/b/c/logo.png")));
        assert!(!m.matches(&url("https://example.com/a/b/logo.jpg")));
    }

    #[test]
    fn question_mark_is_one_character() {
        let m = RouteMatcher::glob("/v?/ping").unwrap();
        assert!(m.matches(&url("http://h/v1/ping")));
        assert!(!m.matches(&url("http://h/v12/ping")));
    }

    #[test]
    fn braces_alternate() {
        let m = RouteMatcher::glob("/api/{users,posts}/list").unwrap();
        assert!(m.matches(&url("http://h/api/users/list")));
        assert!(m.matches(&url("http://h/api/posts/list")));
        assert!(!m.matches(&url("http://h/api/tags/list")));
    }

    #[test]
    fn escapes_are_literal() {
        let m = RouteMatcher::glob(r"/file\*name").unwrap();
        assert!(m.matches(&url("http://h/file*name")));
        assert!(!m.matches(&url("http://h/fileXname")));
    }

    #[test]
    fn metacharacters_are_quoted() {
        let m = RouteMatcher::glob("/a.b+c").unwrap();
        assert!(m.matches(&url("http://h/a.b+c")));
        assert!(!m.matches(&url("http://h/aXb+c")));
    }

    #[test]
    fn full_url_globs_match_the_whole_url() {
        let m = RouteMatcher::glob("https://example.com/**").unwrap();
        assert!(m.matches(&url("https://example.com/any/path")));
        assert!(!m.matches(&url("https://other.com/any/path")));
    }

    #[test]
    fn unbalanced_braces_fail_to_compile() {
        assert!(RouteMatcher::glob("/api/{users").is_err());
        assert!(RouteMatcher::glob("/api/users}").is_err());
    }

    #[test]
    fn matcher_identity() {
        let a = RouteMatcher::glob("/x").unwrap();
        let b = RouteMatcher::glob("/x").unwrap();
        let c = RouteMatcher::glob("/y").unwrap();
        assert!(a.same(&b));
        assert!(!a.same(&c));

        let p1 = RouteMatcher::predicate(|_| true);
        let p2 = p1.clone();
        let p3 = RouteMatcher::predicate(|_| true);
        assert!(p1.same(&p2));
        assert!(!p1.same(&p3));
    }
}
