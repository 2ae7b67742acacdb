//! Triggers inspecting message content and user names

use super::{
    MatchDetail, MatchSource, SummaryArgs, Trigger, TriggerArgs, TriggerConfig, TriggerMatch,
    parse_empty, parse_typed, user_mention,
};
use crate::automod::context::EvaluationContext;
use crate::automod::error::{AutomodError, AutomodResult};
use crate::automod::regex_runner::{Pattern, RegexMatcher, RegexRunner};
use crate::automod::text;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

/// Run one pattern; a timeout or busy pool counts as no match for this
/// pattern only
async fn find_pattern(
    runner: &RegexRunner,
    pattern: &Pattern,
    text: &str,
) -> AutomodResult<Option<Vec<String>>> {
    match runner.exec(pattern, text).await {
        Err(e) if e.is_transient() => {
            debug!(pattern = %pattern.source, error = %e, "Pattern skipped");
            Ok(None)
        }
        result => result,
    }
}

/// Texts of the context selected by a trigger's `match_*` options
fn text_sources(
    context: &EvaluationContext,
    messages: bool,
    usernames: bool,
    nicknames: bool,
) -> Vec<(MatchSource, &str)> {
    let mut sources = Vec::new();
    if messages {
        if let Some(message) = &context.message {
            sources.push((MatchSource::Message, message.content.as_str()));
        }
    }
    if usernames {
        if let Some(user) = &context.user {
            sources.push((MatchSource::Username, user.name.as_str()));
        }
    }
    if nicknames {
        if let Some(nickname) = context.member.as_ref().and_then(|m| m.nickname.as_deref()) {
            sources.push((MatchSource::Nickname, nickname));
        }
    }
    sources
}

fn found_summary(args: &SummaryArgs<'_>, what_kind: &str) -> String {
    match &args.matched.detail {
        MatchDetail::Found { what, source } => format!(
            "{} matched {what_kind} `{what}` in {source}",
            user_mention(args.context)
        ),
        _ => format!("{} matched {what_kind}", user_mention(args.context)),
    }
}

fn mutually_exclusive(a: &[String], b: &[String], a_name: &str, b_name: &str) -> AutomodResult<()> {
    if !a.is_empty() && !b.is_empty() {
        return Err(AutomodError::Other(format!(
            "{a_name} and {b_name} are mutually exclusive"
        )));
    }
    Ok(())
}

/// Matches every message
pub struct AnyMessageTrigger;

#[async_trait]
impl Trigger for AnyMessageTrigger {
    fn name(&self) -> &'static str {
        "any_message"
    }

    fn parse_config(&self, raw: serde_yaml::Value) -> AutomodResult<TriggerConfig> {
        parse_empty(self.name(), &raw)
    }

    async fn matches(&self, args: TriggerArgs<'_>) -> AutomodResult<Option<TriggerMatch>> {
        Ok(args.context.message.as_ref().map(|message| {
            TriggerMatch::with_detail(MatchDetail::Channel(message.channel_id))
        }))
    }

    fn render_summary(&self, args: SummaryArgs<'_>) -> String {
        match &args.matched.detail {
            MatchDetail::Channel(channel_id) => {
                format!("{} posted in <#{channel_id}>", user_mention(args.context))
            }
            _ => format!("{} posted a message", user_mention(args.context)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MatchWordsConfig {
    pub words: Vec<String>,
    pub case_sensitive: bool,
    pub only_full_words: bool,
    /// Tolerate separators between the letters of a word
    pub loose_matching: bool,
    /// Separator characters tolerated between letters when loose
    pub loose_matching_threshold: usize,
    pub match_messages: bool,
    pub match_usernames: bool,
    pub match_nicknames: bool,
}

impl Default for MatchWordsConfig {
    fn default() -> Self {
        Self {
            words: Vec::new(),
            case_sensitive: false,
            only_full_words: true,
            loose_matching: false,
            loose_matching_threshold: 4,
            match_messages: true,
            match_usernames: false,
            match_nicknames: false,
        }
    }
}

impl MatchWordsConfig {
    /// Combine the word list into one pattern
    fn pattern_source(&self) -> String {
        let separator = format!(r"[^\p{{L}}\p{{N}}]{{0,{}}}", self.loose_matching_threshold);
        let alternatives = self
            .words
            .iter()
            .map(|word| {
                if self.loose_matching {
                    word.chars()
                        .map(|c| regex::escape(c.encode_utf8(&mut [0; 4])))
                        .collect::<Vec<_>>()
                        .join(&separator)
                } else {
                    regex::escape(word)
                }
            })
            .collect::<Vec<_>>()
            .join("|");

        if self.only_full_words {
            format!(r"\b(?:{alternatives})\b")
        } else {
            format!("(?:{alternatives})")
        }
    }
}

/// Matches any of a list of words
pub struct MatchWordsTrigger;

#[async_trait]
impl Trigger for MatchWordsTrigger {
    fn name(&self) -> &'static str {
        "match_words"
    }

    fn parse_config(&self, raw: serde_yaml::Value) -> AutomodResult<TriggerConfig> {
        let mut config: MatchWordsConfig = parse_typed(raw)?;
        config.words.retain(|word| !word.trim().is_empty());
        if config.words.is_empty() {
            return Err(AutomodError::Other("words must not be empty".to_string()));
        }

        let source = config.pattern_source();
        RegexMatcher::compile(&source, !config.case_sensitive)?;
        let pattern = Pattern::new(source).case_insensitive(!config.case_sensitive);
        Ok(TriggerConfig::MatchWords { config, pattern })
    }

    async fn matches(&self, args: TriggerArgs<'_>) -> AutomodResult<Option<TriggerMatch>> {
        let TriggerConfig::MatchWords { config, pattern } = args.config else {
            return Err(AutomodError::ConfigMismatch(self.name()));
        };

        let sources = text_sources(
            args.context,
            config.match_messages,
            config.match_usernames,
            config.match_nicknames,
        );
        for (source, text) in sources {
            if let Some(found) = find_pattern(&args.state.regex, pattern, text).await? {
                if let Some(what) = found.into_iter().next() {
                    return Ok(Some(TriggerMatch::with_detail(MatchDetail::Found {
                        what,
                        source,
                    })));
                }
            }
        }
        Ok(None)
    }

    fn render_summary(&self, args: SummaryArgs<'_>) -> String {
        found_summary(&args, "word")
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MatchRegexConfig {
    pub patterns: Vec<String>,
    pub case_sensitive: bool,
    pub match_messages: bool,
    pub match_usernames: bool,
    pub match_nicknames: bool,
}

impl Default for MatchRegexConfig {
    fn default() -> Self {
        Self {
            patterns: Vec::new(),
            case_sensitive: false,
            match_messages: true,
            match_usernames: false,
            match_nicknames: false,
        }
    }
}

/// Matches any of a list of regular expressions
pub struct MatchRegexTrigger;

#[async_trait]
impl Trigger for MatchRegexTrigger {
    fn name(&self) -> &'static str {
        "match_regex"
    }

    fn parse_config(&self, raw: serde_yaml::Value) -> AutomodResult<TriggerConfig> {
        let config: MatchRegexConfig = parse_typed(raw)?;
        if config.patterns.is_empty() {
            return Err(AutomodError::Other("patterns must not be empty".to_string()));
        }

        let patterns = config
            .patterns
            .iter()
            .map(|source| {
                RegexMatcher::compile(source, !config.case_sensitive)?;
                Ok(Pattern::new(source.clone()).case_insensitive(!config.case_sensitive))
            })
            .collect::<AutomodResult<Vec<_>>>()?;
        Ok(TriggerConfig::MatchRegex { config, patterns })
    }

    async fn matches(&self, args: TriggerArgs<'_>) -> AutomodResult<Option<TriggerMatch>> {
        let TriggerConfig::MatchRegex { config, patterns } = args.config else {
            return Err(AutomodError::ConfigMismatch(self.name()));
        };

        let sources = text_sources(
            args.context,
            config.match_messages,
            config.match_usernames,
            config.match_nicknames,
        );
        for (source, text) in sources {
            for pattern in patterns {
                if let Some(found) = find_pattern(&args.state.regex, pattern, text).await? {
                    if let Some(what) = found.into_iter().next() {
                        return Ok(Some(TriggerMatch::with_detail(MatchDetail::Found {
                            what,
                            source,
                        })));
                    }
                }
            }
        }
        Ok(None)
    }

    fn render_summary(&self, args: SummaryArgs<'_>) -> String {
        found_summary(&args, "pattern")
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MatchInvitesConfig {
    pub include_invite_codes: Vec<String>,
    pub exclude_invite_codes: Vec<String>,
    pub match_messages: bool,
    pub match_usernames: bool,
    pub match_nicknames: bool,
}

impl Default for MatchInvitesConfig {
    fn default() -> Self {
        Self {
            include_invite_codes: Vec::new(),
            exclude_invite_codes: Vec::new(),
            match_messages: true,
            match_usernames: false,
            match_nicknames: false,
        }
    }
}

impl MatchInvitesConfig {
    fn is_filtered(&self, code: &str) -> bool {
        if !self.include_invite_codes.is_empty() {
            self.include_invite_codes.iter().any(|c| c == code)
        } else {
            !self.exclude_invite_codes.iter().any(|c| c == code)
        }
    }
}

/// Matches server invites
pub struct MatchInvitesTrigger;

#[async_trait]
impl Trigger for MatchInvitesTrigger {
    fn name(&self) -> &'static str {
        "match_invites"
    }

    fn parse_config(&self, raw: serde_yaml::Value) -> AutomodResult<TriggerConfig> {
        let config: MatchInvitesConfig = parse_typed(raw)?;
        mutually_exclusive(
            &config.include_invite_codes,
            &config.exclude_invite_codes,
            "include_invite_codes",
            "exclude_invite_codes",
        )?;
        Ok(TriggerConfig::MatchInvites(config))
    }

    async fn matches(&self, args: TriggerArgs<'_>) -> AutomodResult<Option<TriggerMatch>> {
        let TriggerConfig::MatchInvites(config) = args.config else {
            return Err(AutomodError::ConfigMismatch(self.name()));
        };

        let sources = text_sources(
            args.context,
            config.match_messages,
            config.match_usernames,
            config.match_nicknames,
        );
        let found = sources.into_iter().find_map(|(source, text)| {
            text::find_invite_codes(text)
                .into_iter()
                .find(|code| config.is_filtered(code))
                .map(|what| MatchDetail::Found { what, source })
        });
        Ok(found.map(TriggerMatch::with_detail))
    }

    fn render_summary(&self, args: SummaryArgs<'_>) -> String {
        found_summary(&args, "invite")
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MatchLinksConfig {
    pub include_domains: Vec<String>,
    pub exclude_domains: Vec<String>,
    pub include_subdomains: bool,
    /// Only links with an explicit scheme, the ones clients render as links
    pub only_real_links: bool,
    pub match_messages: bool,
    pub match_usernames: bool,
    pub match_nicknames: bool,
}

impl Default for MatchLinksConfig {
    fn default() -> Self {
        Self {
            include_domains: Vec::new(),
            exclude_domains: Vec::new(),
            include_subdomains: true,
            only_real_links: true,
            match_messages: true,
            match_usernames: false,
            match_nicknames: false,
        }
    }
}

impl MatchLinksConfig {
    fn is_filtered(&self, link: &text::FoundLink) -> bool {
        if self.only_real_links && !link.has_scheme {
            return false;
        }
        let listed = |domains: &[String]| {
            domains
                .iter()
                .any(|domain| text::host_matches_domain(&link.host, domain, self.include_subdomains))
        };
        if !self.include_domains.is_empty() {
            listed(&self.include_domains)
        } else {
            !listed(&self.exclude_domains)
        }
    }
}

/// Matches links, optionally filtered by domain
pub struct MatchLinksTrigger;

#[async_trait]
impl Trigger for MatchLinksTrigger {
    fn name(&self) -> &'static str {
        "match_links"
    }

    fn parse_config(&self, raw: serde_yaml::Value) -> AutomodResult<TriggerConfig> {
        let config: MatchLinksConfig = parse_typed(raw)?;
        mutually_exclusive(
            &config.include_domains,
            &config.exclude_domains,
            "include_domains",
            "exclude_domains",
        )?;
        Ok(TriggerConfig::MatchLinks(config))
    }

    async fn matches(&self, args: TriggerArgs<'_>) -> AutomodResult<Option<TriggerMatch>> {
        let TriggerConfig::MatchLinks(config) = args.config else {
            return Err(AutomodError::ConfigMismatch(self.name()));
        };

        let sources = text_sources(
            args.context,
            config.match_messages,
            config.match_usernames,
            config.match_nicknames,
        );
        let found = sources.into_iter().find_map(|(source, text)| {
            text::find_links(text)
                .into_iter()
                .find(|link| config.is_filtered(link))
                .map(|link| MatchDetail::Found {
                    what: link.raw,
                    source,
                })
        });
        Ok(found.map(TriggerMatch::with_detail))
    }

    fn render_summary(&self, args: SummaryArgs<'_>) -> String {
        found_summary(&args, "link")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MatchAttachmentTypeConfig {
    pub whitelist_enabled: bool,
    pub filetype_whitelist: Vec<String>,
    pub blacklist_enabled: bool,
    pub filetype_blacklist: Vec<String>,
}

fn normalize_extensions(extensions: &mut [String]) {
    for extension in extensions.iter_mut() {
        *extension = extension.trim().trim_start_matches('.').to_lowercase();
    }
}

/// Matches attachments by file extension
pub struct MatchAttachmentTypeTrigger;

#[async_trait]
impl Trigger for MatchAttachmentTypeTrigger {
    fn name(&self) -> &'static str {
        "match_attachment_type"
    }

    fn parse_config(&self, raw: serde_yaml::Value) -> AutomodResult<TriggerConfig> {
        let mut config: MatchAttachmentTypeConfig = parse_typed(raw)?;
        if config.whitelist_enabled == config.blacklist_enabled {
            return Err(AutomodError::Other(
                "exactly one of whitelist_enabled and blacklist_enabled must be set".to_string(),
            ));
        }
        normalize_extensions(&mut config.filetype_whitelist);
        normalize_extensions(&mut config.filetype_blacklist);
        Ok(TriggerConfig::MatchAttachmentType(config))
    }

    async fn matches(&self, args: TriggerArgs<'_>) -> AutomodResult<Option<TriggerMatch>> {
        let TriggerConfig::MatchAttachmentType(config) = args.config else {
            return Err(AutomodError::ConfigMismatch(self.name()));
        };
        let Some(message) = &args.context.message else {
            return Ok(None);
        };

        let offending = message.attachments.iter().find(|attachment| {
            let extension = attachment.extension();
            let listed = |list: &[String]| {
                extension
                    .as_ref()
                    .is_some_and(|ext| list.iter().any(|listed| listed == ext))
            };
            if config.whitelist_enabled {
                !listed(&config.filetype_whitelist)
            } else {
                listed(&config.filetype_blacklist)
            }
        });

        Ok(offending.map(|attachment| {
            TriggerMatch::with_detail(MatchDetail::Found {
                what: attachment.filename.clone(),
                source: MatchSource::Message,
            })
        }))
    }

    fn render_summary(&self, args: SummaryArgs<'_>) -> String {
        found_summary(&args, "attachment")
    }
}
