//! The closed set of subscription plans and their quota limits.
//!
//! Plans are keyed by the provider price id stored on the merchant row.
//! Unknown or missing ids resolve to the free plan, which is also what new
//! merchants are provisioned with.

/// Plan key new merchants are provisioned with.
pub const FREE_PLAN_ID: &str = "price_free";

/// Quota limits for one subscription plan.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Plan {
    pub name: &'static str,
    /// Max `dunning_email_sent` usage per calendar month.
    pub monthly_limit: i64,
    /// Max pending tasks a merchant may have queued at once.
    pub queue_limit: i64,
}

const FREE: Plan = Plan {
    name: "Free",
    monthly_limit: 20,
    queue_limit: 10,
};
const STARTER: Plan = Plan {
    name: "Starter",
    monthly_limit: 200,
    queue_limit: 50,
};
const GROWTH: Plan = Plan {
    name: "Growth",
    monthly_limit: 1_000,
    queue_limit: 200,
};
const SCALE: Plan = Plan {
    name: "Scale",
    monthly_limit: 10_000,
    queue_limit: 1_000,
};

/// Resolve a plan from its provider price id. Unknown ids fall back to the
/// free plan rather than erroring: a merchant whose subscription row points
/// at a retired price must not gain unlimited quota.
pub fn plan_for(plan_id: &str) -> &'static Plan {
    match plan_id {
        "price_starter" => &STARTER,
        "price_growth" => &GROWTH,
        "price_scale" => &SCALE,
        _ => &FREE,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn known_plans_resolve() {
        assert_eq!(plan_for(FREE_PLAN_ID).name, "Free");
        assert_eq!(plan_for("price_starter").monthly_limit, 200);
        assert_eq!(plan_for("price_growth").queue_limit, 200);
        assert_eq!(plan_for("price_scale").monthly_limit, 10_000);
    }

    #[test]
    fn unknown_plan_falls_back_to_free() {
        assert_eq!(plan_for("price_retired_2019"), plan_for(FREE_PLAN_ID));
        assert_eq!(plan_for(""), plan_for(FREE_PLAN_ID));
    }
}
