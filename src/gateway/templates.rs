// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Named prompt templates
//!
//! Template text uses `{identifier}` placeholders. Rendering fails when any
//! placeholder has no value. Each successful render bumps the template's
//! usage counter atomically. The store is one JSON document keyed by name.
//! Templates carry a free-form category (`development`, `research`, ...)
//! used for browsing and for the usage report.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::errors::{EngineError, EngineResult};

pub const DEFAULT_TEMPLATE: &str = "assistant";

/// Category of templates created without one
pub const DEFAULT_CATEGORY: &str = "custom";

/// Entries in [`TemplateStats::most_used`]
const MOST_USED: usize = 5;

const BUILTIN_TEMPLATES: &[(&str, &str, &str)] = &[
    (
        "assistant",
        "research",
        "You are a knowledgeable assistant. Today is {date}. Answer accurately and concisely. \
         When the provided context does not contain the answer, say so instead of guessing.",
    ),
    (
        "code_reviewer",
        "development",
        "You are an experienced code reviewer. Today is {date}. Point out bugs and security \
         problems in the code the user shares and suggest concrete fixes.",
    ),
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PromptTemplate {
    pub name: String,
    #[serde(default = "default_category")]
    pub category: String,
    pub text: String,
    pub usage_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_category() -> String {
    DEFAULT_CATEGORY.to_string()
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct TemplateUsage {
    pub name: String,
    pub usage_count: u64,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct TemplateStats {
    pub total_templates: usize,
    pub total_usage: u64,
    /// Template count per category
    pub categories: BTreeMap<String, usize>,
    /// Highest usage first, ties by name
    pub most_used: Vec<TemplateUsage>,
}

struct TemplateEntry {
    name: String,
    category: String,
    text: String,
    usage: AtomicU64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TemplateEntry {
    fn new(name: &str, category: &str, text: &str) -> Self {
        let now = Utc::now();
        Self {
            name: name.to_string(),
            category: category.to_string(),
            text: text.to_string(),
            usage: AtomicU64::new(0),
            created_at: now,
            updated_at: now,
        }
    }

    fn snapshot(&self) -> PromptTemplate {
        PromptTemplate {
            name: self.name.clone(),
            category: self.category.clone(),
            text: self.text.clone(),
            usage_count: self.usage.load(Ordering::Relaxed),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

impl From<PromptTemplate> for TemplateEntry {
    fn from(t: PromptTemplate) -> Self {
        Self {
            name: t.name,
            category: t.category,
            text: t.text,
            usage: AtomicU64::new(t.usage_count),
            created_at: t.created_at,
            updated_at: t.updated_at,
        }
    }
}

pub struct TemplateStore {
    templates: RwLock<HashMap<String, TemplateEntry>>,
    path: Option<PathBuf>,
    placeholder: Regex,
    name_pattern: Regex,
}

impl TemplateStore {
    /// In-memory store seeded with the built-in templates
    pub fn new() -> EngineResult<Self> {
        let placeholder = Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}")
            .map_err(|e| EngineError::Config(e.to_string()))?;
        let name_pattern =
            Regex::new(r"^[A-Za-z0-9_-]{1,64}$").map_err(|e| EngineError::Config(e.to_string()))?;

        let templates = BUILTIN_TEMPLATES
            .iter()
            .map(|(name, category, text)| (name.to_string(), TemplateEntry::new(name, category, text)))
            .collect();

        Ok(Self {
            templates: RwLock::new(templates),
            path: None,
            placeholder,
            name_pattern,
        })
    }

    /// Store persisted at `path`; built-ins are added when missing
    pub async fn open(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut store = Self::new()?;

        if fs::try_exists(&path).await.unwrap_or(false) {
            let content = fs::read_to_string(&path).await?;
            let saved: BTreeMap<String, PromptTemplate> = serde_json::from_str(&content)?;
            let mut templates = store.templates.write().await;
            for (name, template) in saved {
                templates.insert(name, template.into());
            }
            info!("Loaded {} prompt templates", templates.len());
        }

        store.path = Some(path);
        store.flush().await?;
        Ok(store)
    }

    /// Placeholder names in order of first appearance
    pub fn placeholders(&self, text: &str) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for cap in self.placeholder.captures_iter(text) {
            let name = cap[1].to_string();
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }

    fn check_name(&self, name: &str) -> EngineResult<()> {
        if self.name_pattern.is_match(name) {
            Ok(())
        } else {
            Err(EngineError::InvalidInput(format!(
                "invalid template name {:?}: use letters, digits, '-' or '_'",
                name
            )))
        }
    }

    /// New template; an empty category files it under [`DEFAULT_CATEGORY`]
    pub async fn create(&self, name: &str, category: &str, text: &str) -> EngineResult<PromptTemplate> {
        self.check_name(name)?;
        let category = match category.trim() {
            "" => DEFAULT_CATEGORY,
            c => c,
        };
        let snapshot = {
            let mut templates = self.templates.write().await;
            if templates.contains_key(name) {
                return Err(EngineError::TemplateExists(name.to_string()));
            }
            let entry = TemplateEntry::new(name, category, text);
            let snapshot = entry.snapshot();
            templates.insert(name.to_string(), entry);
            snapshot
        };
        self.flush().await?;
        info!("Created prompt template {}", name);
        Ok(snapshot)
    }

    pub async fn update(&self, name: &str, text: &str) -> EngineResult<PromptTemplate> {
        let snapshot = {
            let mut templates = self.templates.write().await;
            let entry = templates
                .get_mut(name)
                .ok_or_else(|| EngineError::TemplateNotFound(name.to_string()))?;
            entry.text = text.to_string();
            entry.updated_at = Utc::now();
            entry.snapshot()
        };
        self.flush().await?;
        debug!("Updated prompt template {}", name);
        Ok(snapshot)
    }

    pub async fn get(&self, name: &str) -> Option<PromptTemplate> {
        self.templates.read().await.get(name).map(TemplateEntry::snapshot)
    }

    pub async fn delete(&self, name: &str) -> EngineResult<bool> {
        let removed = self.templates.write().await.remove(name).is_some();
        if removed {
            self.flush().await?;
            info!("Deleted prompt template {}", name);
        }
        Ok(removed)
    }

    pub async fn list(&self) -> Vec<PromptTemplate> {
        let mut all: Vec<PromptTemplate> = self
            .templates
            .read()
            .await
            .values()
            .map(TemplateEntry::snapshot)
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub async fn by_category(&self, category: &str) -> Vec<PromptTemplate> {
        let mut found: Vec<PromptTemplate> = self
            .templates
            .read()
            .await
            .values()
            .filter(|entry| entry.category == category)
            .map(TemplateEntry::snapshot)
            .collect();
        found.sort_by(|a, b| a.name.cmp(&b.name));
        found
    }

    /// Usage report across every template
    pub async fn stats(&self) -> TemplateStats {
        let all = self.list().await;
        let mut stats = TemplateStats {
            total_templates: all.len(),
            ..Default::default()
        };
        for template in &all {
            stats.total_usage += template.usage_count;
            *stats.categories.entry(template.category.clone()).or_default() += 1;
        }

        let mut ranked: Vec<TemplateUsage> = all
            .into_iter()
            .filter(|t| t.usage_count > 0)
            .map(|t| TemplateUsage {
                name: t.name,
                usage_count: t.usage_count,
            })
            .collect();
        ranked.sort_by(|a, b| b.usage_count.cmp(&a.usage_count).then_with(|| a.name.cmp(&b.name)));
        ranked.truncate(MOST_USED);
        stats.most_used = ranked;
        stats
    }

    /// Fill every placeholder of `name` from `variables`
    pub async fn render(&self, name: &str, variables: &HashMap<String, String>) -> EngineResult<String> {
        let templates = self.templates.read().await;
        let entry = templates
            .get(name)
            .ok_or_else(|| EngineError::TemplateNotFound(name.to_string()))?;

        if let Some(missing) = self
            .placeholders(&entry.text)
            .into_iter()
            .find(|p| !variables.contains_key(p))
        {
            return Err(EngineError::TemplateVariableMissing {
                template: name.to_string(),
                variable: missing,
            });
        }

        let rendered = self
            .placeholder
            .replace_all(&entry.text, |caps: &regex::Captures| {
                variables.get(&caps[1]).cloned().unwrap_or_default()
            })
            .into_owned();
        entry.usage.fetch_add(1, Ordering::Relaxed);
        Ok(rendered)
    }

    pub async fn flush(&self) -> EngineResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let snapshot: BTreeMap<String, PromptTemplate> = self
            .templates
            .read()
            .await
            .iter()
            .map(|(name, entry)| (name.clone(), entry.snapshot()))
            .collect();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(&snapshot)?;
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, json).await?;
        fs::rename(&temp_path, path).await?;
        Ok(())
    }
}
