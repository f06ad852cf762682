//! Bot profiles: contact identity, command templates and reply detection rules
//!
//! The remote bots are human-oriented and their phrasing changes without
//! notice, so every recognition heuristic is configuration data compiled here
//! once at startup.

use crate::errors::{LookupError, Result};
use intelforge_common::config::{BotProfileConfig, DetectionConfig};
use intelforge_common::db::models::QueryType;
use regex_lite::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

const VALUE_PLACEHOLDER: &str = "{value}";

/// How a single text reply should be treated by the collector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextVerdict {
    /// Terminal: the bot reports an empty result
    NotFound,
    /// Terminal: a text block shaped like a result
    Result,
    /// Interim progress; ignored
    Progress,
    /// Substantive but matches no rule
    Unrecognized,
}

/// Compiled detection rules for one bot
#[derive(Debug, Clone)]
pub struct DetectionRules {
    not_found_markers: Vec<String>,
    progress_markers: Vec<String>,
    result_pattern: Option<Regex>,
    entry_pattern: Option<Regex>,
    follow_buttons: Vec<String>,
}

fn compile(bot_id: &str, field: &str, pattern: Option<&str>) -> Result<Option<Regex>> {
    pattern
        .filter(|p| !p.trim().is_empty())
        .map(|p| {
            Regex::new(p).map_err(|e| {
                LookupError::Configuration(format!("bot '{}' {}: {}", bot_id, field, e))
            })
        })
        .transpose()
}

fn lowercase_all(markers: &[String]) -> Vec<String> {
    markers
        .iter()
        .map(|m| m.trim().to_lowercase())
        .filter(|m| !m.is_empty())
        .collect()
}

impl DetectionRules {
    pub fn compile(bot_id: &str, config: &DetectionConfig) -> Result<Self> {
        Ok(Self {
            not_found_markers: lowercase_all(&config.not_found_markers),
            progress_markers: lowercase_all(&config.progress_markers),
            result_pattern: compile(bot_id, "result_pattern", config.result_pattern.as_deref())?,
            entry_pattern: compile(bot_id, "entry_pattern", config.entry_pattern.as_deref())?,
            follow_buttons: lowercase_all(&config.follow_buttons),
        })
    }

    /// Result shape wins over markers, so a result listing that mentions
    /// "not found" for one field is still a result.
    pub fn judge_text(&self, text: &str) -> TextVerdict {
        if text.trim().is_empty() {
            return TextVerdict::Progress;
        }
        if self.result_pattern.as_ref().is_some_and(|re| re.is_match(text)) {
            return TextVerdict::Result;
        }

        let lower = text.to_lowercase();
        if self.not_found_markers.iter().any(|m| lower.contains(m)) {
            TextVerdict::NotFound
        } else if self.progress_markers.iter().any(|m| lower.contains(m)) {
            TextVerdict::Progress
        } else {
            TextVerdict::Unrecognized
        }
    }

    pub fn is_not_found(&self, text: &str) -> bool {
        let lower = text.to_lowercase();
        self.not_found_markers.iter().any(|m| lower.contains(m))
    }

    /// Number of delimited result entries in plain text
    pub fn count_entries(&self, text: &str) -> usize {
        self.entry_pattern
            .as_ref()
            .map(|re| re.find_iter(text).count())
            .unwrap_or(0)
    }

    /// First offered button whose label contains a configured follow label
    pub fn button_to_follow<'a>(&self, offered: &'a [String]) -> Option<&'a str> {
        offered
            .iter()
            .find(|label| {
                let label = label.to_lowercase();
                self.follow_buttons.iter().any(|f| label.contains(f))
            })
            .map(String::as_str)
    }
}

/// A target bot ready for use by the engine
#[derive(Debug, Clone)]
pub struct BotProfile {
    pub id: String,
    pub name: String,
    pub contact: String,
    pub default: bool,
    commands: HashMap<QueryType, String>,
    pub rules: DetectionRules,
}

impl BotProfile {
    pub fn from_config(config: &BotProfileConfig) -> Result<Self> {
        if config.id.trim().is_empty() || config.contact.trim().is_empty() {
            return Err(LookupError::Configuration(
                "bot profiles need an id and a contact".to_string(),
            ));
        }
        if let Some((query_type, _)) = config
            .commands
            .iter()
            .find(|(_, template)| !template.contains(VALUE_PLACEHOLDER))
        {
            return Err(LookupError::Configuration(format!(
                "bot '{}' command for {} lacks {}",
                config.id, query_type, VALUE_PLACEHOLDER
            )));
        }

        Ok(Self {
            id: config.id.clone(),
            name: config.name.clone(),
            contact: config.contact.clone(),
            default: config.default,
            commands: config.commands.clone(),
            rules: DetectionRules::compile(&config.id, &config.detection)?,
        })
    }

    /// Outbound command text; types without a template send the bare value
    pub fn command_for(&self, query_type: QueryType, value: &str) -> String {
        self.commands
            .get(&query_type)
            .map(String::as_str)
            .unwrap_or(VALUE_PLACEHOLDER)
            .replace(VALUE_PLACEHOLDER, value)
    }

    pub fn summary(&self) -> BotSummary {
        let mut query_types: Vec<QueryType> = self.commands.keys().copied().collect();
        query_types.sort();
        BotSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            contact: self.contact.clone(),
            default: self.default,
            query_types,
        }
    }
}

/// Public view of a profile
#[derive(Debug, Clone, Serialize)]
pub struct BotSummary {
    pub id: String,
    pub name: String,
    pub contact: String,
    pub default: bool,
    pub query_types: Vec<QueryType>,
}

/// All configured profiles, resolved by id or default
#[derive(Debug, Clone)]
pub struct BotRegistry {
    bots: Vec<Arc<BotProfile>>,
}

impl BotRegistry {
    pub fn from_config(configs: &[BotProfileConfig]) -> Result<Self> {
        let bots = configs
            .iter()
            .map(|c| BotProfile::from_config(c).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;

        if bots.is_empty() {
            return Err(LookupError::Configuration("no bot profiles configured".to_string()));
        }
        for (i, bot) in bots.iter().enumerate() {
            if bots[..i].iter().any(|b| b.id == bot.id) {
                return Err(LookupError::Configuration(format!(
                    "duplicate bot id '{}'",
                    bot.id
                )));
            }
        }

        Ok(Self { bots })
    }

    /// The requested profile, or the default (first profile when none is marked)
    pub fn resolve(&self, bot_id: Option<&str>) -> Result<Arc<BotProfile>> {
        let found = match bot_id {
            Some(id) => self.bots.iter().find(|b| b.id == id),
            None => self
                .bots
                .iter()
                .find(|b| b.default)
                .or_else(|| self.bots.first()),
        };
        found
            .cloned()
            .ok_or_else(|| LookupError::UnknownBot(bot_id.unwrap_or_default().to_string()))
    }

    pub fn summaries(&self) -> Vec<BotSummary> {
        self.bots.iter().map(|b| b.summary()).collect()
    }
}
