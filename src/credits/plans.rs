use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanKey {
    #[default]
    Free,
    Pulse,
    Nebula,
    Supernova,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlanConfig {
    pub key: PlanKey,
    pub display_name: &'static str,
    pub limit: u64,
}

pub static PLANS: [PlanConfig; 4] = [
    PlanConfig {
        key: PlanKey::Free,
        display_name: "Free",
        limit: 50,
    },
    PlanConfig {
        key: PlanKey::Pulse,
        display_name: "Pulse",
        limit: 500,
    },
    PlanConfig {
        key: PlanKey::Nebula,
        display_name: "Nebula",
        limit: 1_500,
    },
    PlanConfig {
        key: PlanKey::Supernova,
        display_name: "Supernova",
        limit: 5_000,
    },
];

impl PlanKey {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Pulse => "pulse",
            Self::Nebula => "nebula",
            Self::Supernova => "supernova",
        }
    }

    pub fn config(self) -> &'static PlanConfig {
        match self {
            Self::Free => &PLANS[0],
            Self::Pulse => &PLANS[1],
            Self::Nebula => &PLANS[2],
            Self::Supernova => &PLANS[3],
        }
    }

    pub fn limit(self) -> u64 {
        self.config().limit
    }

    pub fn display_name(self) -> &'static str {
        self.config().display_name
    }
}

impl std::fmt::Display for PlanKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn limit_for(plan: PlanKey) -> u64 {
    plan.limit()
}

/// Maps stored or user-supplied tier names onto a canonical plan.
///
/// Legacy names from older billing tiers are folded in (`starter`, `pro`,
/// `enterprise`); anything else, including blanks, resolves to [`PlanKey::Free`].
pub fn resolve_plan_key(raw: Option<&str>) -> PlanKey {
    let Some(raw) = raw else {
        return PlanKey::Free;
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "free" | "starter" => PlanKey::Free,
        "pulse" => PlanKey::Pulse,
        "nebula" | "pro" => PlanKey::Nebula,
        "supernova" | "enterprise" => PlanKey::Supernova,
        _ => PlanKey::Free,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_aliases_map_to_canonical_plans() {
        assert_eq!(resolve_plan_key(Some("starter")), PlanKey::Free);
        assert_eq!(resolve_plan_key(Some("pro")), PlanKey::Nebula);
        assert_eq!(resolve_plan_key(Some("enterprise")), PlanKey::Supernova);
    }

    #[test]
    fn unknown_and_missing_inputs_fall_back_to_free() {
        assert_eq!(resolve_plan_key(None), PlanKey::Free);
        assert_eq!(resolve_plan_key(Some("")), PlanKey::Free);
        assert_eq!(resolve_plan_key(Some("   ")), PlanKey::Free);
        assert_eq!(resolve_plan_key(Some("galaxy-brain")), PlanKey::Free);
    }

    #[test]
    fn resolution_is_case_insensitive_and_idempotent() {
        for raw in [
            "Free", "PULSE", " nebula ", "SuperNova", "Pro", "x", "", "starter",
        ] {
            let once = resolve_plan_key(Some(raw));
            let twice = resolve_plan_key(Some(once.as_str()));
            assert_eq!(once, twice, "input {raw:?}");
        }
        assert_eq!(resolve_plan_key(Some(" nebula ")), PlanKey::Nebula);
    }

    #[test]
    fn registry_limits_line_up_with_keys() {
        for plan in PLANS.iter() {
            assert_eq!(plan.key.config(), plan);
            assert_eq!(limit_for(plan.key), plan.limit);
        }
        assert!(limit_for(PlanKey::Free) < limit_for(PlanKey::Pulse));
        assert!(limit_for(PlanKey::Nebula) < limit_for(PlanKey::Supernova));
    }
}
