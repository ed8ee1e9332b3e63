//! Rubric and knowledge-base lookup.
//!
//! The orchestrator only needs "the rubric text and knowledge excerpts for
//! this dimension at this version"; [`RubricStore`] is that seam. The bundled
//! [`ConfigRubricStore`] serves the `[rubrics.*]` tables of the config file.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;

use crate::config::Config;

/// Scoring criteria for one dimension at one version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rubric {
    pub dimension: String,
    pub version: String,
    pub text: String,
    /// Knowledge-base excerpts, in prompt order.
    pub knowledge: Vec<String>,
}

#[async_trait]
pub trait RubricStore: Send + Sync {
    /// The rubric for `dimension` at `version`, if known.
    async fn rubric(&self, dimension: &str, version: &str) -> Result<Option<Rubric>>;

    /// Currently configured version for `dimension`.
    async fn current_version(&self, dimension: &str) -> Result<Option<String>>;
}

/// Rubrics held in memory, one version per dimension.
pub struct ConfigRubricStore {
    rubrics: BTreeMap<String, Rubric>,
}

impl ConfigRubricStore {
    /// Load every configured rubric, reading `text_path` and
    /// `knowledge_paths` files.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut rubrics = BTreeMap::new();
        for (dimension, rc) in &config.rubrics {
            let text = match (&rc.text, &rc.text_path) {
                (Some(text), _) => text.clone(),
                (None, Some(path)) => std::fs::read_to_string(path).with_context(|| {
                    format!("Failed to read rubric for {}: {}", dimension, path.display())
                })?,
                (None, None) => anyhow::bail!("rubrics.{} has no text", dimension),
            };
            let knowledge = rc
                .knowledge_paths
                .iter()
                .map(|p| {
                    std::fs::read_to_string(p)
                        .with_context(|| format!("Failed to read knowledge file: {}", p.display()))
                })
                .collect::<Result<Vec<_>>>()?;

            rubrics.insert(
                dimension.clone(),
                Rubric {
                    dimension: dimension.clone(),
                    version: rc.version.clone(),
                    text,
                    knowledge,
                },
            );
        }
        Ok(Self { rubrics })
    }

    pub fn from_rubrics(rubrics: impl IntoIterator<Item = Rubric>) -> Self {
        Self {
            rubrics: rubrics
                .into_iter()
                .map(|r| (r.dimension.clone(), r))
                .collect(),
        }
    }

    pub fn dimensions(&self) -> Vec<String> {
        self.rubrics.keys().cloned().collect()
    }
}

#[async_trait]
impl RubricStore for ConfigRubricStore {
    async fn rubric(&self, dimension: &str, version: &str) -> Result<Option<Rubric>> {
        Ok(self
            .rubrics
            .get(dimension)
            .filter(|r| r.version == version)
            .cloned())
    }

    async fn current_version(&self, dimension: &str) -> Result<Option<String>> {
        Ok(self.rubrics.get(dimension).map(|r| r.version.clone()))
    }
}
