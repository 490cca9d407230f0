//! Read-only fund catalog
//!
//! Maps fund name to NAV, minimum investment and a performance blurb.
//! Loaded once at startup and shared by every turn.

use crate::error::AssistantError;
use crate::models::Fund;
use crate::Result;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FundEntry {
    nav: Decimal,
    min_investment: Decimal,
    #[serde(default)]
    performance: String,
}

#[derive(Debug, Clone, Default)]
pub struct FundCatalog {
    funds: BTreeMap<String, Fund>,
}

impl FundCatalog {
    pub fn new(funds: impl IntoIterator<Item = Fund>) -> Result<Self> {
        let mut catalog = Self::default();
        for fund in funds {
            validate_fund(&fund)?;
            catalog.funds.insert(fund.name.clone(), fund);
        }
        Ok(catalog)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let entries: BTreeMap<String, FundEntry> = serde_json::from_str(raw)?;

        Self::new(entries.into_iter().map(|(name, entry)| Fund {
            name,
            nav: entry.nav,
            min_investment: entry.min_investment,
            performance: entry.performance,
        }))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AssistantError::Config(format!(
                "Failed to read fund catalog {}: {}",
                path.display(),
                e
            ))
        })?;

        let catalog = Self::from_json_str(&raw)?;
        info!(funds = catalog.len(), path = %path.display(), "Fund catalog loaded");
        Ok(catalog)
    }

    /// Exact match first, then a case-insensitive match
    pub fn get(&self, name: &str) -> Option<&Fund> {
        let name = name.trim();
        self.funds.get(name).or_else(|| {
            self.funds
                .values()
                .find(|fund| fund.name.eq_ignore_ascii_case(name))
        })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.funds.keys().map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.funds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.funds.is_empty()
    }
}

fn validate_fund(fund: &Fund) -> Result<()> {
    if fund.name.trim().is_empty() {
        return Err(AssistantError::Config("Fund with empty name".to_string()));
    }
    if fund.nav <= Decimal::ZERO {
        return Err(AssistantError::Config(format!(
            "Fund {} has non-positive NAV {}",
            fund.name, fund.nav
        )));
    }
    if fund.min_investment < Decimal::ZERO {
        return Err(AssistantError::Config(format!(
            "Fund {} has negative minimum investment {}",
            fund.name, fund.min_investment
        )));
    }
    Ok(())
}
