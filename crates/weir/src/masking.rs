use crate::config::{MaskingConfig, PartialRule};
use lazy_static::lazy_static;
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// Replacement literal for fully-masked values.
pub const MASKED: &str = "****";

lazy_static! {
    // First and last local-part characters are kept, everything between is
    // starred out, and the domain passes through untouched.
    static ref EMAIL_RE: regex::Regex =
        regex::Regex::new(r"^([^@])([^@]*)([^@])(@.*)$").unwrap();
}

/// A compiled masking policy: the case-insensitive key set to mask, and the
/// partial-replacement rule per key (keys without a rule are fully masked).
#[derive(Debug, Clone)]
pub struct Policy {
    keys: HashSet<String>,
    partial: HashMap<String, PartialRule>,
}

impl Policy {
    /// The baseline policy. Infallible: ingestion must always be able to
    /// mask, whatever the per-token override state.
    pub fn baseline(cfg: &MaskingConfig) -> Self {
        let mut keys: HashSet<String> = cfg
            .baseline_keys
            .iter()
            .map(|k| k.to_ascii_lowercase())
            .collect();
        let partial: HashMap<String, PartialRule> = cfg
            .partial_rules
            .iter()
            .map(|(k, rule)| (k.to_ascii_lowercase(), *rule))
            .collect();
        // A partial rule implies the key is masked.
        keys.extend(partial.keys().cloned());
        Self { keys, partial }
    }

    /// Baseline extended with the named token's overrides. Overrides are
    /// validated here; callers fall back to `baseline` on error.
    pub fn for_token(cfg: &MaskingConfig, token_name: &str) -> anyhow::Result<Self> {
        let mut policy = Self::baseline(cfg);
        let Some(overrides) = cfg.per_token_overrides.get(token_name) else {
            return Ok(policy);
        };

        for key in &overrides.extra_keys {
            if key.is_empty() {
                anyhow::bail!("override for {token_name:?} contains an empty extra key");
            }
            policy.keys.insert(key.to_ascii_lowercase());
        }
        for (key, rule) in &overrides.partial_rules {
            match rule {
                PartialRule::KeepPrefix { keep_prefix: 0 } => {
                    anyhow::bail!("override for {token_name:?}: keep_prefix must be positive");
                }
                PartialRule::Email { mask_email: false } => {
                    anyhow::bail!("override for {token_name:?}: mask_email must be true");
                }
                _ => (),
            }
            let key = key.to_ascii_lowercase();
            policy.keys.insert(key.clone());
            policy.partial.insert(key, *rule);
        }
        Ok(policy)
    }

    fn rule_for(&self, key: &str) -> Option<Option<PartialRule>> {
        let key = key.to_ascii_lowercase();
        if !self.keys.contains(&key) {
            return None;
        }
        Some(self.partial.get(&key).copied())
    }
}

/// Walk a JSON tree and replace the value of every object key the policy
/// matches. Matched subtrees are replaced wholesale and not descended into.
pub fn mask_tree(value: &mut Value, policy: &Policy) {
    match value {
        Value::Object(map) => {
            for (key, child) in map.iter_mut() {
                match policy.rule_for(key) {
                    Some(rule) => *child = replacement(child, rule),
                    None => mask_tree(child, policy),
                }
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                mask_tree(item, policy);
            }
        }
        _ => (),
    }
}

fn replacement(value: &Value, rule: Option<PartialRule>) -> Value {
    let Some(rule) = rule else {
        return Value::String(MASKED.to_string());
    };
    // Partial rules only apply to strings; everything else falls back to Full.
    let Value::String(s) = value else {
        return Value::String(MASKED.to_string());
    };
    match rule {
        PartialRule::KeepPrefix { keep_prefix } => Value::String(keep_prefix_mask(s, keep_prefix)),
        PartialRule::Email { mask_email: _ } => Value::String(
            email_mask(s).unwrap_or_else(|| MASKED.to_string()),
        ),
    }
}

fn keep_prefix_mask(s: &str, keep: usize) -> String {
    // A value shorter than the kept prefix has no prefix worth keeping and
    // collapses to the full mask, which is its own fixed point. At or above
    // the prefix length the formula re-applies to itself unchanged, so the
    // whole function is idempotent without ever passing a value through.
    if s == MASKED || s.chars().count() < keep {
        return MASKED.to_string();
    }
    let prefix: String = s.chars().take(keep).collect();
    format!("{prefix}{MASKED}")
}

fn email_mask(s: &str) -> Option<String> {
    let captures = EMAIL_RE.captures(s)?;
    Some(format!(
        "{}*****{}{}",
        &captures[1], &captures[3], &captures[4]
    ))
}
