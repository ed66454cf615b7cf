use std::borrow::Borrow;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, bail, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// key: billing-tier -> closed set of entitlement levels, ordered by rank
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Tier {
    #[serde(rename = "free")]
    Free,
    #[serde(rename = "tier-1")]
    Tier1,
    #[serde(rename = "tier-2")]
    Tier2,
    #[serde(rename = "tier-3")]
    Tier3,
    #[serde(rename = "unrestricted")]
    Unrestricted,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown tier `{0}`")]
pub struct UnknownTier(pub String);

impl Tier {
    pub const ALL: [Tier; 5] = [
        Tier::Free,
        Tier::Tier1,
        Tier::Tier2,
        Tier::Tier3,
        Tier::Unrestricted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Tier1 => "tier-1",
            Tier::Tier2 => "tier-2",
            Tier::Tier3 => "tier-3",
            Tier::Unrestricted => "unrestricted",
        }
    }

    pub fn rank(&self) -> u8 {
        match self {
            Tier::Free => 0,
            Tier::Tier1 => 1,
            Tier::Tier2 => 2,
            Tier::Tier3 => 3,
            Tier::Unrestricted => 4,
        }
    }

    /// Decode a tier persisted by an earlier process. Values this build does
    /// not know degrade to [`Tier::Free`].
    pub fn from_stored(value: &str) -> Tier {
        value.parse().unwrap_or_else(|err: UnknownTier| {
            warn!(%err, "stored tier not recognised; treating as free");
            Tier::Free
        })
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = UnknownTier;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Tier::ALL
            .into_iter()
            .find(|tier| tier.as_str() == value.trim())
            .ok_or_else(|| UnknownTier(value.to_string()))
    }
}

/// Metered tool key such as `articles`. Always lowercase.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct ToolKey(String);

impl ToolKey {
    pub fn new(value: impl AsRef<str>) -> Self {
        Self(value.as_ref().trim().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ToolKey {
    fn from(value: String) -> Self {
        ToolKey::new(value)
    }
}

impl From<ToolKey> for String {
    fn from(value: ToolKey) -> Self {
        value.0
    }
}

impl Borrow<str> for ToolKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ToolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Uses permitted per window. Serialized as a number or `"unlimited"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "QuotaRepr", into = "QuotaRepr")]
pub enum Quota {
    Limited(u32),
    Unlimited,
}

impl Quota {
    pub fn limit(&self) -> Option<u32> {
        match self {
            Quota::Limited(limit) => Some(*limit),
            Quota::Unlimited => None,
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum QuotaRepr {
    Limited(u32),
    Keyword(String),
}

impl From<Quota> for QuotaRepr {
    fn from(value: Quota) -> Self {
        match value {
            Quota::Limited(limit) => QuotaRepr::Limited(limit),
            Quota::Unlimited => QuotaRepr::Keyword("unlimited".to_string()),
        }
    }
}

impl TryFrom<QuotaRepr> for Quota {
    type Error = String;

    fn try_from(value: QuotaRepr) -> Result<Self, Self::Error> {
        match value {
            QuotaRepr::Limited(limit) => Ok(Quota::Limited(limit)),
            QuotaRepr::Keyword(word) if word == "unlimited" => Ok(Quota::Unlimited),
            QuotaRepr::Keyword(word) => {
                Err(format!("expected a number or `unlimited`, got `{word}`"))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodLength {
    Days(u32),
    Months(u32),
}

impl PeriodLength {
    pub fn is_empty(&self) -> bool {
        matches!(self, PeriodLength::Days(0) | PeriodLength::Months(0))
    }
}

/// key: billing-reset-policy -> rolling cooldown or calendar period
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResetPolicy {
    /// Allowance renews `window_secs` after the last successful use.
    Rolling { window_secs: u64 },
    /// Allowance renews at fixed boundaries counted from the counter's window start.
    Calendar { period: PeriodLength },
}

impl ResetPolicy {
    pub fn rolling_hours(hours: u64) -> Self {
        ResetPolicy::Rolling {
            window_secs: hours * 3600,
        }
    }

    pub fn monthly() -> Self {
        ResetPolicy::Calendar {
            period: PeriodLength::Months(1),
        }
    }

    pub fn rolling_window(&self) -> Option<Duration> {
        match self {
            ResetPolicy::Rolling { window_secs } => {
                let secs = i64::try_from(*window_secs).unwrap_or(i64::MAX);
                Some(Duration::seconds(secs.min(i64::MAX / 1000)))
            }
            ResetPolicy::Calendar { .. } => None,
        }
    }

    fn is_degenerate(&self) -> bool {
        match self {
            ResetPolicy::Rolling { window_secs } => *window_secs == 0,
            ResetPolicy::Calendar { period } => period.is_empty(),
        }
    }
}

fn default_reset() -> ResetPolicy {
    ResetPolicy::monthly()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolLimits {
    pub quota: Quota,
    #[serde(default = "default_reset")]
    pub reset: ResetPolicy,
}

/// key: billing-tier-definition -> per-tool limits for one tier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierDefinition {
    pub tier: Tier,
    pub name: String,
    pub tools: BTreeMap<ToolKey, ToolLimits>,
}

#[derive(Debug, Deserialize)]
struct CatalogDocument {
    tiers: Vec<TierDefinition>,
    #[serde(default)]
    prices: HashMap<String, Tier>,
}

/// key: billing-catalog -> immutable tier table + price mapping
#[derive(Debug, Clone)]
pub struct TierCatalog {
    tiers: BTreeMap<Tier, TierDefinition>,
    prices: HashMap<String, Tier>,
}

impl TierCatalog {
    /// Parse a catalog document. Every tier must be defined exactly once.
    pub fn from_json(raw: &str) -> Result<Self> {
        let document: CatalogDocument = serde_json::from_str(raw)?;
        let mut tiers = BTreeMap::new();
        for definition in document.tiers {
            for (tool, limits) in &definition.tools {
                if limits.reset.is_degenerate() {
                    bail!(
                        "tier `{}` tool `{tool}` declares a zero-length reset window",
                        definition.tier
                    );
                }
            }
            let tier = definition.tier;
            if tiers.insert(tier, definition).is_some() {
                bail!("tier `{tier}` defined more than once");
            }
        }
        if let Some(missing) = Tier::ALL.iter().find(|tier| !tiers.contains_key(*tier)) {
            return Err(anyhow!("tier catalog is missing tier `{missing}`"));
        }
        Ok(Self {
            tiers,
            prices: document.prices,
        })
    }

    pub fn with_price(mut self, price_id: impl Into<String>, tier: Tier) -> Self {
        self.prices.insert(price_id.into(), tier);
        self
    }

    pub fn limits_for(&self, tier: Tier, tool: &str) -> Option<ToolLimits> {
        self.tiers
            .get(&tier)
            .and_then(|definition| definition.tools.get(tool))
            .copied()
    }

    pub fn resolve_price(&self, price_id: &str) -> Option<Tier> {
        self.prices.get(price_id).copied()
    }

    /// Unmapped prices fall back to [`Tier::Free`].
    pub fn tier_for_price(&self, price_id: &str) -> Tier {
        self.resolve_price(price_id).unwrap_or(Tier::Free)
    }

    pub fn rank_of(&self, tier: Tier) -> u8 {
        tier.rank()
    }

    pub fn next_tier_above(&self, tier: Tier) -> Option<Tier> {
        Tier::ALL
            .into_iter()
            .find(|candidate| candidate.rank() == tier.rank() + 1)
    }

    pub fn tiers(&self) -> impl Iterator<Item = &TierDefinition> {
        self.tiers.values()
    }
}

impl Default for TierCatalog {
    fn default() -> Self {
        let articles = ToolKey::new("articles");
        let definition = |tier: Tier, name: &str, limits: ToolLimits| TierDefinition {
            tier,
            name: name.to_string(),
            tools: BTreeMap::from([(articles.clone(), limits)]),
        };
        let monthly = |limit| ToolLimits {
            quota: Quota::Limited(limit),
            reset: ResetPolicy::monthly(),
        };

        let tiers = [
            definition(
                Tier::Free,
                "Free",
                ToolLimits {
                    quota: Quota::Limited(1),
                    reset: ResetPolicy::rolling_hours(24),
                },
            ),
            definition(Tier::Tier1, "Starter", monthly(15)),
            definition(Tier::Tier2, "Growth", monthly(40)),
            definition(Tier::Tier3, "Scale", monthly(100)),
            definition(
                Tier::Unrestricted,
                "Unrestricted",
                ToolLimits {
                    quota: Quota::Unlimited,
                    reset: ResetPolicy::monthly(),
                },
            ),
        ];

        Self {
            tiers: tiers.into_iter().map(|def| (def.tier, def)).collect(),
            prices: HashMap::new(),
        }
    }
}
