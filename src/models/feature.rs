use serde::{Deserialize, Serialize};

use crate::models::plan::PlanTier;

/// Sentinel limit meaning "no cap"; short-circuits every comparison.
pub const UNLIMITED: i64 = -1;

/// Every gated feature in the app. Adding a variant forces the spec table
/// below to be extended, so an unknown feature key cannot reach runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    AiMealPlan,
    AiRecipe,
    PdfExport,
    BarcodeScan,
    StreakRestore,
}

pub const ALL_FEATURES: [Feature; 5] = [
    Feature::AiMealPlan,
    Feature::AiRecipe,
    Feature::PdfExport,
    Feature::BarcodeScan,
    Feature::StreakRestore,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumableKind {
    AiTokens,
    ExportTokens,
    StreakShields,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetCadence {
    Daily,
    Monthly,
}

/// Per-feature gating spec: period limits by tier, reset cadence, and which
/// purchasable consumable (if any) substitutes once the quota is spent.
#[derive(Debug, Clone, Copy)]
pub struct FeatureSpec {
    pub free_limit: i64,
    pub pro_limit: i64,
    pub cadence: ResetCadence,
    pub substitute: Option<ConsumableKind>,
}

impl Feature {
    pub fn spec(self) -> &'static FeatureSpec {
        match self {
            Feature::AiMealPlan => &FeatureSpec {
                free_limit: 2,
                pro_limit: 50,
                cadence: ResetCadence::Monthly,
                substitute: Some(ConsumableKind::AiTokens),
            },
            Feature::AiRecipe => &FeatureSpec {
                free_limit: 3,
                pro_limit: 100,
                cadence: ResetCadence::Monthly,
                substitute: Some(ConsumableKind::AiTokens),
            },
            Feature::PdfExport => &FeatureSpec {
                free_limit: 1,
                pro_limit: 10,
                cadence: ResetCadence::Monthly,
                substitute: Some(ConsumableKind::ExportTokens),
            },
            Feature::BarcodeScan => &FeatureSpec {
                free_limit: 10,
                pro_limit: UNLIMITED,
                cadence: ResetCadence::Daily,
                substitute: None,
            },
            // Streak restores have no period quota on any tier; they are
            // paid for exclusively with streak shields.
            Feature::StreakRestore => &FeatureSpec {
                free_limit: 0,
                pro_limit: 0,
                cadence: ResetCadence::Monthly,
                substitute: Some(ConsumableKind::StreakShields),
            },
        }
    }

    pub fn limit_for(self, tier: PlanTier) -> i64 {
        let spec = self.spec();
        match tier {
            PlanTier::Free => spec.free_limit,
            PlanTier::Pro => spec.pro_limit,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Feature::AiMealPlan => "ai_meal_plan",
            Feature::AiRecipe => "ai_recipe",
            Feature::PdfExport => "pdf_export",
            Feature::BarcodeScan => "barcode_scan",
            Feature::StreakRestore => "streak_restore",
        }
    }

    pub fn from_str(raw: &str) -> Option<Self> {
        ALL_FEATURES.into_iter().find(|f| f.as_str() == raw)
    }
}

/// A purchasable consumable pack. The price each product bills at lives in
/// deployment config; the credited amount is fixed here.
#[derive(Debug, Clone, Copy)]
pub struct TokenProduct {
    pub id: &'static str,
    pub kind: ConsumableKind,
    pub amount: i64,
}

pub const TOKEN_PRODUCTS: [TokenProduct; 4] = [
    TokenProduct {
        id: "ai_tokens_20",
        kind: ConsumableKind::AiTokens,
        amount: 20,
    },
    TokenProduct {
        id: "ai_tokens_50",
        kind: ConsumableKind::AiTokens,
        amount: 50,
    },
    TokenProduct {
        id: "export_tokens_10",
        kind: ConsumableKind::ExportTokens,
        amount: 10,
    },
    TokenProduct {
        id: "streak_shields_3",
        kind: ConsumableKind::StreakShields,
        amount: 3,
    },
];

pub fn find_token_product(id: &str) -> Option<&'static TokenProduct> {
    TOKEN_PRODUCTS.iter().find(|p| p.id == id)
}
