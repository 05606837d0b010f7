use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    Free,
    Pro,
}

impl PlanTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanTier::Free => "free",
            PlanTier::Pro => "pro",
        }
    }

    /// Normalize a stored plan value. Billing rows written by older app
    /// versions carry values like "premium" or "pro:annual".
    pub fn from_option(raw: Option<&str>) -> Self {
        let normalized = raw.unwrap_or_default().trim().to_lowercase();
        if normalized.is_empty() {
            return Self::Free;
        }

        let key = normalized
            .split([':', '-', '_', ' ', '/', '.'])
            .next()
            .unwrap_or(normalized.as_str());

        match key {
            "pro" | "premium" | "plus" | "paid" => Self::Pro,
            "free" | "basic" | "starter" => Self::Free,
            _ => {
                if normalized.contains("pro") || normalized.contains("premium") {
                    Self::Pro
                } else {
                    Self::Free
                }
            }
        }
    }

    pub fn is_free(self) -> bool {
        matches!(self, Self::Free)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Cancelled,
    PastDue,
    Trialing,
    None,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Cancelled => "cancelled",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::None => "none",
        }
    }

    /// Maps processor status strings onto the closed set. Anything the
    /// processor reports that we do not model (incomplete, paused, unpaid)
    /// grants no benefits.
    pub fn from_option(raw: Option<&str>) -> Self {
        match raw.unwrap_or_default().trim().to_lowercase().as_str() {
            "active" => Self::Active,
            "trialing" => Self::Trialing,
            "past_due" => Self::PastDue,
            "canceled" | "cancelled" => Self::Cancelled,
            _ => Self::None,
        }
    }

    pub fn grants_benefits(self) -> bool {
        matches!(self, Self::Active | Self::Trialing)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingPeriod {
    Monthly,
    Annual,
    None,
}

impl BillingPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingPeriod::Monthly => "monthly",
            BillingPeriod::Annual => "annual",
            BillingPeriod::None => "none",
        }
    }

    /// Processor recurring intervals are "month"/"year".
    pub fn from_interval(raw: Option<&str>) -> Self {
        match raw.unwrap_or_default().trim().to_lowercase().as_str() {
            "month" | "monthly" => Self::Monthly,
            "year" | "annual" | "yearly" => Self::Annual,
            _ => Self::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_plan_values() {
        assert!(PlanTier::from_option(None).is_free());
        assert!(PlanTier::from_option(Some("Free")).is_free());
        assert!(PlanTier::from_option(Some("basic")).is_free());
        assert_eq!(PlanTier::from_option(Some("pro")), PlanTier::Pro);
        assert_eq!(PlanTier::from_option(Some("Pro:annual")), PlanTier::Pro);
        assert_eq!(PlanTier::from_option(Some("premium_plus")), PlanTier::Pro);
        assert_eq!(PlanTier::from_option(Some("paid")), PlanTier::Pro);
        assert!(PlanTier::from_option(Some("unrecognized")).is_free());
    }

    #[test]
    fn unmodeled_statuses_grant_nothing() {
        assert!(SubscriptionStatus::from_option(Some("active")).grants_benefits());
        assert!(SubscriptionStatus::from_option(Some("trialing")).grants_benefits());
        assert!(!SubscriptionStatus::from_option(Some("past_due")).grants_benefits());
        assert!(!SubscriptionStatus::from_option(Some("incomplete_expired")).grants_benefits());
        assert_eq!(
            SubscriptionStatus::from_option(Some("canceled")),
            SubscriptionStatus::Cancelled
        );
    }

    #[test]
    fn billing_period_from_processor_interval() {
        assert_eq!(BillingPeriod::from_interval(Some("month")), BillingPeriod::Monthly);
        assert_eq!(BillingPeriod::from_interval(Some("year")), BillingPeriod::Annual);
        assert_eq!(BillingPeriod::from_interval(None), BillingPeriod::None);
    }
}
