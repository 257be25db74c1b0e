// src/changelog.rs

//! Release-notes parsing into categorized change items, and rendering back to Markdown.

use std::fmt::Write as _;
use std::path::Path;
use std::sync::OnceLock;

use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Importance {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangelogItem {
    pub description: String,
    pub issue_reference: Option<String>,
    pub importance: Importance,
}

/// Structured view of one version's release notes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangelogInfo {
    pub version: String,
    pub release_date: Option<NaiveDate>,
    pub new_features: Vec<ChangelogItem>,
    pub improvements: Vec<ChangelogItem>,
    pub bug_fixes: Vec<ChangelogItem>,
    pub security_updates: Vec<ChangelogItem>,
    pub raw_text: String,
}

impl ChangelogInfo {
    /// An info with no entries, carrying only the requested version.
    pub fn empty(version: Option<&str>) -> Self {
        Self {
            version: version.map(normalize_version).unwrap_or_default(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.new_features.is_empty()
            && self.improvements.is_empty()
            && self.bug_fixes.is_empty()
            && self.security_updates.is_empty()
    }

    pub fn item_count(&self) -> usize {
        self.new_features.len()
            + self.improvements.len()
            + self.bug_fixes.len()
            + self.security_updates.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Category {
    New,
    Improvement,
    BugFix,
    Security,
}

fn version_header_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(
            r"(?im)^#+[ \t]*(?:v|version)?[ \t]*(\d+\.\d+\.\d+(?:[.\-+][0-9a-zA-Z\-.]+)?)[ \t]*(?:\((.*?)\))?",
        )
        .expect("valid version header regex")
    })
}

fn date_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"(\d{4}-\d{2}-\d{2})|(\d{1,2}[ \t]+[A-Za-z]+[ \t]+\d{4})").expect("valid date regex")
    })
}

fn section_header_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(
            r"(?im)^#+[ \t]*(added|new|features?|improve\w*|enhance\w*|fix(?:ed|es)?|bug[ \t]*fix(?:es)?|security|removed|deprecated|breaking|changed?)",
        )
        .expect("valid section header regex")
    })
}

fn list_item_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"(?m)^[ \t-]*[*+-][ \t]+(.+?)[ \t]*\r?$").expect("valid list item regex"))
}

fn issue_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"(?i)(?:issue|pr|pull request|#)\s*#?(\d+)").expect("valid issue regex")
    })
}

/// Strips a leading `v` and keeps the first three dot components.
pub fn normalize_version(version: &str) -> String {
    let version = version.trim();
    let version = version
        .strip_prefix('v')
        .or_else(|| version.strip_prefix('V'))
        .unwrap_or(version);
    let parts: Vec<&str> = version.split('.').collect();
    if parts.len() >= 3 {
        parts[..3].join(".")
    } else {
        version.to_string()
    }
}

/// Parse changelog text and return the section for `target`, or the topmost one.
///
/// A requested version that is not present yields an empty info.
pub fn parse(text: &str, target: Option<&str>) -> ChangelogInfo {
    if text.trim().is_empty() {
        return ChangelogInfo::empty(target);
    }

    let headers: Vec<(usize, String)> = version_header_regex()
        .captures_iter(text)
        .filter_map(|caps| {
            let start = caps.get(0)?.start();
            Some((start, caps.get(1)?.as_str().to_string()))
        })
        .collect();

    if headers.is_empty() {
        debug!("no version headers in changelog");
        return ChangelogInfo { raw_text: text.to_string(), ..Default::default() };
    }

    let index = match target {
        Some(target) => {
            let wanted = normalize_version(target);
            match headers.iter().position(|(_, v)| normalize_version(v) == wanted) {
                Some(index) => index,
                None => {
                    debug!(target, "version not found in changelog");
                    return ChangelogInfo::empty(Some(target));
                }
            }
        }
        None => 0,
    };

    let (start, version) = &headers[index];
    let end = headers.get(index + 1).map(|(pos, _)| *pos).unwrap_or(text.len());
    parse_section(version, &text[*start..end])
}

/// Parse a release body published by the hosting API.
pub fn parse_release_notes(
    body: &str,
    version: &str,
    published_at: Option<DateTime<Utc>>,
) -> ChangelogInfo {
    // release bodies usually have no version header of their own
    let mut info = if version_header_regex().is_match(body) {
        parse(body, None)
    } else {
        parse_section("", body)
    };
    info.version = normalize_version(version);
    info.release_date = Some(published_at.unwrap_or_else(Utc::now).date_naive());
    info.raw_text = body.to_string();
    info
}

/// Parse a changelog file. An unreadable file yields an empty info.
pub async fn parse_file(path: &Path, target: Option<&str>) -> ChangelogInfo {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => parse(&text, target),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "could not read changelog");
            ChangelogInfo::empty(target)
        }
    }
}

fn parse_section(version: &str, content: &str) -> ChangelogInfo {
    let mut info = ChangelogInfo {
        version: version.to_string(),
        raw_text: content.to_string(),
        release_date: date_regex().find(content).and_then(|m| parse_date(m.as_str())),
        ..Default::default()
    };

    let sections: Vec<(usize, usize, String)> = section_header_regex()
        .captures_iter(content)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            Some((whole.start(), whole.end(), caps.get(1)?.as_str().to_lowercase()))
        })
        .collect();

    if sections.is_empty() {
        for caps in list_item_regex().captures_iter(content) {
            if let Some(m) = caps.get(1) {
                classify_by_keyword(&mut info, make_item(m.as_str()));
            }
        }
        return info;
    }

    for (i, (_, body_start, kind)) in sections.iter().enumerate() {
        let body_end = sections.get(i + 1).map(|(start, _, _)| *start).unwrap_or(content.len());
        let category = category_for_header(kind);
        for caps in list_item_regex().captures_iter(&content[*body_start..body_end]) {
            let Some(m) = caps.get(1) else { continue };
            let item = make_item(m.as_str());
            match category {
                Some(category) => push(&mut info, category, item),
                None => classify_by_keyword(&mut info, item),
            }
        }
    }
    info
}

fn category_for_header(kind: &str) -> Option<Category> {
    if kind.contains("add") || kind.contains("new") || kind.contains("feature") {
        Some(Category::New)
    } else if kind.contains("improv") || kind.contains("enhanc") || kind.contains("change") {
        Some(Category::Improvement)
    } else if kind.contains("fix") || kind.contains("bug") {
        Some(Category::BugFix)
    } else if kind.contains("secur") {
        Some(Category::Security)
    } else {
        None
    }
}

fn classify_by_keyword(info: &mut ChangelogInfo, item: ChangelogItem) {
    let lower = item.description.to_lowercase();
    let has = |words: &[&str]| words.iter().any(|w| lower.contains(w));
    let category = if has(&["fix", "bugfix", "resolv", "solve"]) {
        Category::BugFix
    } else if has(&["add", "new", "feature", "implement"]) {
        Category::New
    } else if has(&["improv", "enhanc", "updat", "optimiz"]) {
        Category::Improvement
    } else if has(&["secur", "vulnerab", "protect", "attack"]) {
        Category::Security
    } else {
        Category::Improvement
    };
    push(info, category, item);
}

fn push(info: &mut ChangelogInfo, category: Category, mut item: ChangelogItem) {
    match category {
        Category::New => info.new_features.push(item),
        Category::Improvement => info.improvements.push(item),
        Category::BugFix => info.bug_fixes.push(item),
        Category::Security => {
            item.importance = Importance::High;
            info.security_updates.push(item);
        }
    }
}

fn make_item(description: &str) -> ChangelogItem {
    let description = description.trim().to_string();
    let issue_reference = issue_regex()
        .captures(&description)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string());
    let lower = description.to_lowercase();
    let has = |words: &[&str]| words.iter().any(|w| lower.contains(w));
    let importance = if has(&["critical", "severe", "urgent", "major"]) {
        Importance::Critical
    } else if has(&["important", "significant"]) {
        Importance::High
    } else if has(&["minor", "small", "trivial"]) {
        Importance::Low
    } else {
        Importance::Normal
    };
    ChangelogItem { description, issue_reference, importance }
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    ["%Y-%m-%d", "%d %B %Y", "%d %b %Y"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(&raw, fmt).ok())
}

/// Render the structured subset back to Markdown.
///
/// Free text outside recognized bullets is not reproduced.
pub fn to_markdown(info: &ChangelogInfo) -> String {
    if info.version.is_empty() {
        return String::new();
    }

    let mut out = format!("## v{}", info.version);
    if let Some(date) = info.release_date {
        let _ = write!(out, " ({})", date.format("%Y-%m-%d"));
    }
    out.push_str("\n\n");

    let sections = [
        ("Added", &info.new_features),
        ("Improved", &info.improvements),
        ("Fixed", &info.bug_fixes),
        ("Security", &info.security_updates),
    ];
    for (title, items) in sections {
        if items.is_empty() {
            continue;
        }
        let _ = writeln!(out, "### {title}");
        for item in items {
            match &item.issue_reference {
                Some(issue) => {
                    let _ = writeln!(out, "- {} (#{issue})", item.description);
                }
                None => {
                    let _ = writeln!(out, "- {}", item.description);
                }
            }
        }
        out.push('\n');
    }
    out
}
