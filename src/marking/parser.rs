//! The `{group, subject}` extractor (spec §4.H.2) applied to a self-approve response's
//! decoded text segments. Deliberately token-based rather than schema-based: Upstream's
//! protobuf layout is out of scope (spec §1), so this only ever reasons about the plain
//! text [`crate::upstream::grpc_web::decode_text_response`] already recovered.

// std
use std::sync::LazyLock;
// crates.io
use regex::Regex;
// self
use crate::_prelude::*;

static GROUP_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[А-ЯЁ]{4}-\d{2}-\d{2}$").expect("valid regex"));
static GROUP_ANY_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[А-ЯЁ]{4}-\d{2}-\d{2}").expect("valid regex"));

const SEASONS: &[&str] = &["Осень", "Весна"];
const SHORT_TOKEN_MAX_CHARS: usize = 5;

/// A parsed self-approve result: either field may be absent if nothing matched.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParsedApproval {
	/// The group token, if one matching `[А-ЯЁ]{4}-\d{2}-\d{2}` was found.
	pub group: Option<String>,
	/// The longest remaining non-group, non-short, non-season, non-person-name token.
	pub subject: Option<String>,
}
impl ParsedApproval {
	/// True when neither field was populated — Upstream's one-shot token is exhausted
	/// (spec §4.H.2, §8 scenario S4).
	pub fn is_empty(&self) -> bool {
		self.group.is_none() && self.subject.is_none()
	}
}

/// Parses a decoded self-approve response body into a `{group, subject}` pair.
///
/// Tokens are split on `" | "` (the separator [`crate::upstream::grpc_web::decode_text_response`]
/// joins distinct text runs with). The first token matching the group pattern is taken as
/// the group; among the rest, the longest token that is not short, not a season name, and
/// not shaped like a person's name is taken as the subject.
pub fn parse_self_approve_text(text: &str) -> ParsedApproval {
	if text.trim().is_empty() {
		return ParsedApproval::default();
	}

	let tokens: Vec<&str> = text.split(" | ").map(str::trim).filter(|t| !t.is_empty()).collect();
	let group = tokens.iter().find(|t| GROUP_RE.is_match(t)).map(|t| (*t).to_owned());

	let subject = tokens
		.iter()
		.filter(|t| !GROUP_RE.is_match(t))
		.filter(|t| t.chars().count() > SHORT_TOKEN_MAX_CHARS)
		.filter(|t| !SEASONS.contains(t))
		.filter(|t| !looks_like_a_person_name(t))
		.max_by_key(|t| t.chars().count())
		.map(|t| (*t).to_owned());

	ParsedApproval { group, subject }
}

/// Extracts every distinct group token appearing anywhere in `text`, in first-seen order
/// (used by the Session Broker to infer a student's group from the groups-list response,
/// spec §4.G.1).
pub fn extract_groups(text: &str) -> Vec<String> {
	let mut seen = HashSet::new();
	let mut groups = Vec::new();

	for found in GROUP_ANY_RE.find_iter(text) {
		let group = found.as_str().to_owned();

		if seen.insert(group.clone()) {
			groups.push(group);
		}
	}

	groups
}

/// Heuristic matching a 1-3 word token where every word starts with an uppercase letter
/// and is shorter than a typical discipline name — catches student full names that slip
/// through alongside the group and subject in the decoded text (spec §4.H.2).
fn looks_like_a_person_name(token: &str) -> bool {
	let words: Vec<&str> = token.split_whitespace().collect();

	(1..=3).contains(&words.len())
		&& words.iter().all(|w| w.chars().next().is_some_and(char::is_uppercase) && w.chars().count() < 15)
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn extracts_group_and_longest_subject() {
		let parsed = parse_self_approve_text("ИКБО-01-21 | Иванов Иван | Осень | Математический анализ");

		assert_eq!(parsed.group.as_deref(), Some("ИКБО-01-21"));
		assert_eq!(parsed.subject.as_deref(), Some("Математический анализ"));
	}

	#[test]
	fn empty_text_yields_empty_result() {
		let parsed = parse_self_approve_text("");

		assert!(parsed.is_empty());
	}

	#[test]
	fn ignores_short_and_season_tokens_when_picking_subject() {
		let parsed = parse_self_approve_text("ИКБО-01-21 | Весна | ок | Физика");

		assert_eq!(parsed.subject.as_deref(), Some("Физика"));
	}

	#[test]
	fn no_group_token_leaves_group_absent() {
		let parsed = parse_self_approve_text("Иванов Иван | Физика");

		assert_eq!(parsed.group, None);
		assert_eq!(parsed.subject.as_deref(), Some("Физика"));
	}

	#[test]
	fn extract_groups_dedupes_preserving_first_seen_order() {
		let groups = extract_groups("ИКБО-01-21, ИКБО-02-21, ИКБО-01-21");

		assert_eq!(groups, vec!["ИКБО-01-21".to_owned(), "ИКБО-02-21".to_owned()]);
	}

	#[test]
	fn extract_groups_returns_empty_for_no_matches() {
		assert!(extract_groups("no groups here").is_empty());
	}
}
