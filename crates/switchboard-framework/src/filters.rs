//! Composable update filters.
//!
//! A [`Filter`] decides whether a message handler accepts an update. Filters
//! combine with the usual operators:
//!
//! ```rust,ignore
//! use switchboard_framework::filters;
//!
//! // Plain text that isn't a command, in one of two chats.
//! let f = filters::text() & !filters::command() & filters::chat([1, 2]);
//!
//! // Regex captures end up in `ctx.matches()`.
//! let f = filters::regex(r"^age (\d+)$")?;
//! ```

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::ops::{BitAnd, BitOr, BitXor, Not};
use std::sync::Arc;

use regex::Regex;

use switchboard_core::Update;

use crate::error::DispatchResult;

// ============================================================================
// RegexMatch
// ============================================================================

/// Captures of one successful regex match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegexMatch {
    /// Group 0 first, then every numbered group. Unmatched groups are `None`.
    pub groups: Vec<Option<String>>,
    /// Named groups that matched.
    pub named: BTreeMap<String, String>,
}

impl RegexMatch {
    /// Builds a match from `regex` captures.
    pub fn from_captures(regex: &Regex, captures: &regex::Captures<'_>) -> Self {
        let groups = captures
            .iter()
            .map(|group| group.map(|m| m.as_str().to_string()))
            .collect();
        let named = regex
            .capture_names()
            .flatten()
            .filter_map(|name| {
                captures
                    .name(name)
                    .map(|m| (name.to_string(), m.as_str().to_string()))
            })
            .collect();
        Self { groups, named }
    }

    /// The whole matched text.
    pub fn full(&self) -> &str {
        self.group(0).unwrap_or_default()
    }

    /// A numbered group.
    pub fn group(&self, index: usize) -> Option<&str> {
        self.groups.get(index).and_then(|g| g.as_deref())
    }

    /// A named group.
    pub fn name(&self, name: &str) -> Option<&str> {
        self.named.get(name).map(String::as_str)
    }
}

// ============================================================================
// Filter
// ============================================================================

type FilterFn = dyn Fn(&dyn Update) -> Option<Vec<RegexMatch>> + Send + Sync;

/// A named predicate over updates.
///
/// Passing yields the regex matches collected along the way (empty for
/// filters that don't capture). Cheap to clone.
#[derive(Clone)]
pub struct Filter {
    name: Arc<str>,
    check: Arc<FilterFn>,
}

impl Filter {
    /// Wraps a function that returns `Some(matches)` when the update passes.
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&dyn Update) -> Option<Vec<RegexMatch>> + Send + Sync + 'static,
    {
        Self {
            name: Arc::from(name.into()),
            check: Arc::new(f),
        }
    }

    /// Runs the filter.
    pub fn check(&self, update: &dyn Update) -> Option<Vec<RegexMatch>> {
        (self.check)(update)
    }

    /// Runs the filter, discarding captures.
    pub fn matches(&self, update: &dyn Update) -> bool {
        self.check(update).is_some()
    }

    /// A readable description, e.g. `(text & !command)`.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Filter").field(&self.name).finish()
    }
}

impl BitAnd for Filter {
    type Output = Filter;

    fn bitand(self, rhs: Filter) -> Filter {
        let name = format!("({} & {})", self.name, rhs.name);
        Filter::new(name, move |update| {
            let mut matches = self.check(update)?;
            matches.extend(rhs.check(update)?);
            Some(matches)
        })
    }
}

impl BitOr for Filter {
    type Output = Filter;

    fn bitor(self, rhs: Filter) -> Filter {
        let name = format!("({} | {})", self.name, rhs.name);
        Filter::new(name, move |update| self.check(update).or_else(|| rhs.check(update)))
    }
}

impl BitXor for Filter {
    type Output = Filter;

    fn bitxor(self, rhs: Filter) -> Filter {
        let name = format!("({} ^ {})", self.name, rhs.name);
        Filter::new(name, move |update| match (self.check(update), rhs.check(update)) {
            (Some(matches), None) | (None, Some(matches)) => Some(matches),
            _ => None,
        })
    }
}

impl Not for Filter {
    type Output = Filter;

    fn not(self) -> Filter {
        let name = format!("!{}", self.name);
        Filter::new(name, move |update| match self.check(update) {
            Some(_) => None,
            None => Some(Vec::new()),
        })
    }
}

// ============================================================================
// Built-in filters
// ============================================================================

/// Passes every update.
pub fn all() -> Filter {
    Filter::new("all", |_| Some(Vec::new()))
}

/// Updates carrying text, commands included.
pub fn text() -> Filter {
    Filter::new("text", |update| update.text().map(|_| Vec::new()))
}

/// Text starting with a `/command`.
pub fn command() -> Filter {
    Filter::new("command", |update| {
        let text = update.text()?;
        let rest = text.strip_prefix('/')?;
        rest.chars()
            .next()
            .is_some_and(|c| !c.is_whitespace())
            .then(Vec::new)
    })
}

/// Text equal to `expected`.
pub fn text_eq(expected: impl Into<String>) -> Filter {
    let expected = expected.into();
    Filter::new(format!("text_eq({expected:?})"), move |update| {
        (update.text()? == expected).then(Vec::new)
    })
}

/// Text equal to any of `options`.
pub fn text_in<I, S>(options: I) -> Filter
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let options: HashSet<String> = options.into_iter().map(Into::into).collect();
    Filter::new("text_in", move |update| {
        options.contains(update.text()?).then(Vec::new)
    })
}

/// Text matched by `pattern` anywhere. Captures are kept.
pub fn regex(pattern: &str) -> DispatchResult<Filter> {
    let regex = Regex::new(pattern)?;
    Ok(Filter::new(format!("regex({pattern:?})"), move |update| {
        let captures = regex.captures(update.text()?)?;
        Some(vec![RegexMatch::from_captures(&regex, &captures)])
    }))
}

/// Updates from one of the given chats.
pub fn chat(ids: impl IntoIterator<Item = i64>) -> Filter {
    let ids: HashSet<i64> = ids.into_iter().collect();
    Filter::new("chat", move |update| ids.contains(&update.chat_id()?).then(Vec::new))
}

/// Updates from one of the given users.
pub fn user(ids: impl IntoIterator<Item = i64>) -> Filter {
    let ids: HashSet<i64> = ids.into_iter().collect();
    Filter::new("user", move |update| ids.contains(&update.user_id()?).then(Vec::new))
}

/// A filter from a plain boolean predicate.
pub fn predicate<F>(name: impl Into<String>, f: F) -> Filter
where
    F: Fn(&dyn Update) -> bool + Send + Sync + 'static,
{
    Filter::new(name, move |update| f(update).then(Vec::new))
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchboard_core::BasicUpdate;

    fn msg(text: &str) -> BasicUpdate {
        BasicUpdate::message(1, 10, 20, text)
    }

    #[test]
    fn test_text_and_not_command() {
        let filter = text() & !command();
        assert!(filter.matches(&msg("hello")));
        assert!(!filter.matches(&msg("/start")));
        assert!(!filter.matches(&BasicUpdate::callback_query(1, 10, 20, 5, "x")));
        assert_eq!(filter.name(), "(text & !command)");
    }

    #[test]
    fn test_command_needs_a_name() {
        assert!(command().matches(&msg("/start now")));
        assert!(!command().matches(&msg("/")));
        assert!(!command().matches(&msg("/ start")));
    }

    #[test]
    fn test_regex_captures_survive_combination() {
        let filter = regex(r"^age (?P<years>\d+)$").unwrap() | text_eq("skip");
        let matches = filter.check(&msg("age 36")).unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].group(1), Some("36"));
        assert_eq!(matches[0].name("years"), Some("36"));
        assert_eq!(matches[0].full(), "age 36");

        assert_eq!(filter.check(&msg("skip")).unwrap(), Vec::new());
        assert!(filter.check(&msg("age x")).is_none());
    }

    #[test]
    fn test_invalid_regex_is_an_error() {
        assert!(regex("(unclosed").is_err());
    }

    #[test]
    fn test_xor_and_identity_filters() {
        let filter = chat([10]) ^ user([20]);
        assert!(!filter.matches(&msg("both match")));
        assert!(filter.matches(&BasicUpdate::message(1, 10, 99, "chat only")));
        assert!(!filter.matches(&BasicUpdate::message(1, 11, 99, "neither")));
        assert!(text_in(["yes", "no"]).matches(&msg("no")));
        assert!(all().matches(&BasicUpdate::channel_post(1, 5, "x")));
    }
}
