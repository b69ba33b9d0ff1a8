use once_cell::sync::Lazy;
use regex::Regex;
use thrall_config::TrustTiers;

static PREFIX_RE: Lazy<Regex> = Lazy::new(|| Regex::new("^[0-9a-f]{16}$").expect("prefix regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustTier {
    Team,
    Known,
    Unknown,
}

impl TrustTier {
    pub fn as_str(self) -> &'static str {
        match self {
            TrustTier::Team => "team",
            TrustTier::Known => "known",
            TrustTier::Unknown => "unknown",
        }
    }
}

/// Extract the validated 16-char hex prefix of a node id. Everything that
/// touches a path, SQL key, or log tag goes through this; a sender that
/// fails here never reaches the pipeline.
pub fn sanitize_prefix(from_node: &str) -> Option<String> {
    let prefix: String = from_node.chars().take(16).collect::<String>().to_lowercase();
    if PREFIX_RE.is_match(&prefix) {
        Some(prefix)
    } else {
        None
    }
}

/// True for strings usable as a breaker target: `global` or a validated
/// 16-hex prefix.
pub fn is_valid_target(target: &str) -> bool {
    target == "global" || PREFIX_RE.is_match(target)
}

/// Longest-prefix match over the configured tiers; equal-length ties resolve
/// in tier order `team > known`.
pub fn resolve_tier(from_node: &str, tiers: &TrustTiers) -> TrustTier {
    let mut best: Option<(usize, TrustTier)> = None;
    for (tier, prefixes) in [
        (TrustTier::Team, &tiers.team),
        (TrustTier::Known, &tiers.known),
    ] {
        for prefix in prefixes {
            if from_node.starts_with(prefix.as_str()) {
                let better = match best {
                    None => true,
                    // strictly longer wins; ties keep the earlier (team) entry
                    Some((len, _)) => prefix.len() > len,
                };
                if better {
                    best = Some((prefix.len(), tier));
                }
            }
        }
    }
    best.map(|(_, t)| t).unwrap_or(TrustTier::Unknown)
}
