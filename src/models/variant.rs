use garde::Validate;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::models::remote::{AdContent, RemoteAd};

/// Platform caps on responsive search ad assets.
pub const MAX_HEADLINES: usize = 15;
pub const MAX_DESCRIPTIONS: usize = 4;
const BASELINE_HEADLINES: usize = 3;

/// Themed copy appended to the baseline ad when a variant is created.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate, PartialEq)]
pub struct ContentTemplate {
    #[garde(length(max = 12), inner(length(max = 30)))]
    pub headlines: Vec<String>,

    #[garde(length(max = 3), inner(length(max = 90)))]
    pub descriptions: Vec<String>,

    #[garde(length(max = 15))]
    pub path1: String,
}

/// Static definition of a themed variant.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
pub struct VariantDefinition {
    #[garde(length(min = 1, max = 100))]
    pub name: String,

    #[garde(length(min = 1, max = 80))]
    pub marker_label: String,

    #[garde(length(min = 1, max = 80))]
    pub done_label: String,

    #[garde(dive)]
    #[serde(default)]
    pub content_template: ContentTemplate,
}

impl VariantDefinition {
    pub fn new(name: &str, marker_label: &str, done_label: &str) -> Self {
        Self {
            name: name.to_string(),
            marker_label: marker_label.to_string(),
            done_label: done_label.to_string(),
            content_template: ContentTemplate::default(),
        }
    }

    /// Build the new variant ad from a baseline ad. Returns `None` when the
    /// baseline has no final url to point the variant at.
    pub fn build_content(&self, baseline: &RemoteAd) -> Option<AdContent> {
        let base = &baseline.content;
        let final_url = base.final_urls.first()?.clone();

        let headlines: Vec<String> = base
            .headlines
            .iter()
            .take(BASELINE_HEADLINES)
            .chain(self.content_template.headlines.iter())
            .filter(|h| !h.is_empty())
            .take(MAX_HEADLINES)
            .cloned()
            .collect();

        let descriptions: Vec<String> = base
            .descriptions
            .iter()
            .take(1)
            .chain(self.content_template.descriptions.iter())
            .filter(|d| !d.is_empty())
            .take(MAX_DESCRIPTIONS)
            .cloned()
            .collect();

        let path2 = if base.path2.is_empty() {
            base.path1.clone()
        } else {
            base.path2.clone()
        };

        Some(AdContent {
            headlines,
            descriptions,
            final_urls: vec![final_url],
            path1: self.content_template.path1.clone(),
            path2,
        })
    }
}

/// The full set of variants known to the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VariantCatalog {
    variants: Vec<VariantDefinition>,
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("invalid variant definition: {0}")]
    Invalid(#[from] garde::Report),

    #[error("duplicate variant name or label: {0}")]
    Duplicate(String),
}

impl VariantCatalog {
    pub fn new(variants: Vec<VariantDefinition>) -> Result<Self, CatalogError> {
        let mut seen = HashSet::new();
        for variant in &variants {
            variant.validate()?;
            for key in [&variant.name, &variant.marker_label, &variant.done_label] {
                if !seen.insert(key.clone()) {
                    return Err(CatalogError::Duplicate(key.clone()));
                }
            }
        }
        Ok(Self { variants })
    }

    /// Built-in seasonal catalogue used when no variants file is configured.
    pub fn builtin() -> Self {
        let seasonal = |name: &str, code: &str, display: &str, path: &str| VariantDefinition {
            name: name.to_string(),
            marker_label: format!("THEME_{code}"),
            done_label: format!("THEME_{code}_DONE"),
            content_template: ContentTemplate {
                headlines: vec![
                    format!("{display} Deals"),
                    format!("Shop {display} Now"),
                    format!("{display} Sale"),
                ],
                descriptions: vec![format!("Real {display} offers. Order today.")],
                path1: path.to_string(),
            },
        };

        Self {
            variants: vec![
                seasonal("black_friday", "BF", "Black Friday", "blackfriday"),
                seasonal("cyber_monday", "CM", "Cyber Monday", "cybermonday"),
                seasonal("sinterklaas", "SK", "Sinterklaas", "sinterklaas"),
                seasonal("kerstmis", "KM", "Kerstmis", "kerst"),
                seasonal("singles_day", "SD", "Singles Day", "singlesday"),
            ],
        }
    }

    pub fn get(&self, name: &str) -> Option<&VariantDefinition> {
        self.variants.iter().find(|v| v.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &VariantDefinition> {
        self.variants.iter()
    }

    pub fn names(&self) -> Vec<String> {
        self.variants.iter().map(|v| v.name.clone()).collect()
    }

    /// The variant whose marker label this ad carries, if any.
    pub fn variant_of(&self, ad: &RemoteAd) -> Option<&VariantDefinition> {
        self.variants.iter().find(|v| ad.has_label(&v.marker_label))
    }

    /// Number of distinct variant markers on an ad.
    pub fn marker_count(&self, ad: &RemoteAd) -> usize {
        self.variants
            .iter()
            .filter(|v| ad.has_label(&v.marker_label))
            .count()
    }
}
