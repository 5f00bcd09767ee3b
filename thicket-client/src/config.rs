use std::str::FromStr;

use anyhow::{anyhow, Context};

use crate::api::DEFAULT_PAGE_SIZE;

/// Deepest level (0 being top-level comments) that still offers reply and
/// expand affordances is `DEFAULT_MAX_DEPTH - 1`
pub const DEFAULT_MAX_DEPTH: usize = 10;

pub const DEFAULT_BASE_URL: &str = "https://localhost:7066";

/// What collapsing an expanded node does with its loaded children
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CollapsePolicy {
    /// Keep them, re-expanding does not refetch
    #[default]
    Retain,

    /// Forget them and evict their scope, re-expanding refetches
    Discard,
}

impl FromStr for CollapsePolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<CollapsePolicy> {
        match s.to_ascii_lowercase().as_str() {
            "retain" => Ok(CollapsePolicy::Retain),
            "discard" => Ok(CollapsePolicy::Discard),
            _ => Err(anyhow!("unknown collapse policy {s:?}, expected retain or discard")),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct ClientConfig {
    pub base_url: String,
    pub page_size: u32,
    pub max_depth: usize,
    pub collapse: CollapsePolicy,
}

impl Default for ClientConfig {
    fn default() -> ClientConfig {
        ClientConfig {
            base_url: String::from(DEFAULT_BASE_URL),
            page_size: DEFAULT_PAGE_SIZE,
            max_depth: DEFAULT_MAX_DEPTH,
            collapse: CollapsePolicy::Retain,
        }
    }
}

impl ClientConfig {
    /// Reads `THICKET_HOST`, `THICKET_PAGE_SIZE`, `THICKET_MAX_DEPTH` and
    /// `THICKET_COLLAPSE`, keeping defaults for unset variables
    pub fn from_env() -> anyhow::Result<ClientConfig> {
        ClientConfig::from_vars(|name| std::env::var(name).ok())
    }

    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> anyhow::Result<ClientConfig> {
        let mut config = ClientConfig::default();
        if let Some(host) = var("THICKET_HOST") {
            config.base_url = host;
        }
        if let Some(size) = var("THICKET_PAGE_SIZE") {
            config.page_size = size
                .parse()
                .with_context(|| format!("parsing THICKET_PAGE_SIZE {size:?}"))?;
        }
        if let Some(depth) = var("THICKET_MAX_DEPTH") {
            config.max_depth = depth
                .parse()
                .with_context(|| format!("parsing THICKET_MAX_DEPTH {depth:?}"))?;
        }
        if let Some(policy) = var("THICKET_COLLAPSE") {
            config.collapse = policy.parse().context("parsing THICKET_COLLAPSE")?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.page_size == 0 {
            return Err(anyhow!("page size must be positive"));
        }
        if self.max_depth == 0 {
            return Err(anyhow!("max depth must be positive"));
        }
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(anyhow!("base url {:?} is not an http(s) url", self.base_url));
        }
        Ok(())
    }
}
