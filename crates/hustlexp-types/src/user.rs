//! User roles, trust tiers, levels, and badges.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Poster,
    Hustler,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Poster => "poster",
            Role::Hustler => "hustler",
            Role::Admin => "admin",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "poster" => Some(Role::Poster),
            "hustler" => Some(Role::Hustler),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }
}

/// Trust tier in `[0..5]`, derived from the trust ledger and cached on the
/// user row; the ledger is the source of truth.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrustTier(u8);

impl TrustTier {
    pub const MIN: TrustTier = TrustTier(0);
    pub const MAX: TrustTier = TrustTier(5);

    pub fn new(tier: u8) -> Self {
        Self(tier.min(5))
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl std::fmt::Display for TrustTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Level derived from total XP: `floor(sqrt(xp / 100)) + 1`, minimum 1.
///
/// Integer square root so the derivation never touches floats.
pub fn level_for_xp(xp_total: i64) -> u32 {
    if xp_total <= 0 {
        return 1;
    }
    let scaled = (xp_total / 100) as u64;
    let mut root = 0u64;
    while (root + 1) * (root + 1) <= scaled {
        root += 1;
    }
    root as u32 + 1
}

/// Badges granted through the append-only badge ledger.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Badge {
    FirstCompletion,
    TenCompletions,
    StreakWeek,
}

impl Badge {
    pub fn as_str(&self) -> &'static str {
        match self {
            Badge::FirstCompletion => "first_completion",
            Badge::TenCompletions => "ten_completions",
            Badge::StreakWeek => "streak_week",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "first_completion" => Some(Badge::FirstCompletion),
            "ten_completions" => Some(Badge::TenCompletions),
            "streak_week" => Some(Badge::StreakWeek),
            _ => None,
        }
    }
}

impl std::fmt::Display for Badge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
