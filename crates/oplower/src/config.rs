//! User-configurable overrides applied on top of the built-in operator table.
//!
//! Overrides re-register fusion patterns after the built-ins, relying on last-registration-wins.
//! They are typically used to fence off an operator while debugging a fusion issue.

use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::fusion::OpPattern;

/// Per-operator fusion pattern overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoweringOverrides {
    #[serde(flatten)]
    patterns: BTreeMap<String, OpPattern>,
}

impl LoweringOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pattern(mut self, op: impl Into<String>, pattern: OpPattern) -> Self {
        self.patterns.insert(op.into(), pattern);
        self
    }

    /// Pattern configured for `op`, if any.
    pub fn pattern(&self, op: &str) -> Option<OpPattern> {
        self.patterns.get(op).copied()
    }

    pub fn patterns(&self) -> impl Iterator<Item = (&str, OpPattern)> {
        self.patterns
            .iter()
            .map(|(name, pattern)| (name.as_str(), *pattern))
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Parses a JSON object such as `{"softmax": "INJECTIVE"}`.
    pub fn from_json_str(src: &str) -> Result<Self> {
        serde_json::from_str(src).context("invalid lowering overrides JSON")
    }

    /// Parses the compact form `softmax=injective,dense=opaque`.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut overrides = Self::default();
        for part in raw.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (op, pattern) = part
                .split_once('=')
                .ok_or_else(|| anyhow!("expected `op=pattern`, got `{}`", part))?;
            let op = op.trim();
            if op.is_empty() {
                return Err(anyhow!("missing operator name in `{}`", part));
            }
            overrides.patterns.insert(op.to_string(), pattern.parse()?);
        }
        Ok(overrides)
    }

    /// Reads `OPLOWER_PATTERN_OVERRIDES`; an unset or blank variable yields no overrides.
    pub fn from_env() -> Result<Self> {
        match crate::env::pattern_overrides() {
            Some(raw) => Self::parse(&raw)
                .with_context(|| format!("invalid {}", crate::env::PATTERN_OVERRIDES_VAR)),
            None => Ok(Self::default()),
        }
    }
}
