//! Text scanning helpers shared by the recent-action tracker and triggers

use regex::Regex;
use std::sync::LazyLock;

static LINK_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:(https?)://)?((?:[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?\.)+[a-z]{2,63})(?::\d{1,5})?(/[^\s<>]*)?",
    )
    .expect("link regex is valid")
});

static INVITE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:https?://)?(?:www\.)?(?:discord(?:app)?\.com/invite|discord\.gg|discord\.me|discord\.io)/([a-z0-9-]+)",
    )
    .expect("invite regex is valid")
});

static CUSTOM_EMOJI_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<a?:\w+:\d+>").expect("custom emoji regex is valid"));

/// A link found in a piece of text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundLink {
    /// Lowercased host name
    pub host: String,
    /// Whether the link carried an explicit http(s) scheme
    pub has_scheme: bool,
    pub raw: String,
}

/// Find every link-looking substring
#[must_use]
pub fn find_links(text: &str) -> Vec<FoundLink> {
    LINK_REGEX
        .captures_iter(text)
        .filter_map(|caps| {
            let host = caps.get(2)?.as_str().to_lowercase();
            Some(FoundLink {
                host,
                has_scheme: caps.get(1).is_some(),
                raw: caps.get(0)?.as_str().to_string(),
            })
        })
        .collect()
}

/// Find every invite code
#[must_use]
pub fn find_invite_codes(text: &str) -> Vec<String> {
    INVITE_REGEX
        .captures_iter(text)
        .filter_map(|caps| caps.get(1).map(|code| code.as_str().to_string()))
        .collect()
}

fn is_unicode_emoji(c: char) -> bool {
    matches!(
        u32::from(c),
        0x1F000..=0x1FAFF | 0x2600..=0x27BF | 0x2B05..=0x2B55
    )
}

/// Count custom and unicode emojis
#[must_use]
pub fn count_emojis(text: &str) -> usize {
    let custom = CUSTOM_EMOJI_REGEX.find_iter(text).count();
    let stripped = CUSTOM_EMOJI_REGEX.replace_all(text, "");
    custom + stripped.chars().filter(|c| is_unicode_emoji(*c)).count()
}

/// Count lines the way the client renders them
#[must_use]
pub fn count_lines(text: &str) -> usize {
    if text.is_empty() {
        0
    } else {
        text.split('\n').count()
    }
}

/// Whether `host` is `domain` or (optionally) one of its subdomains
#[must_use]
pub fn host_matches_domain(host: &str, domain: &str, include_subdomains: bool) -> bool {
    let domain = domain.trim().trim_start_matches("*.").to_lowercase();
    host == domain || (include_subdomains && host.ends_with(&format!(".{domain}")))
}
