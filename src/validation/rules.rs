//! Per-kind structural rules for extending a campaign.
//!
//! Each pattern kind registers one rule implementation; dispatch is a map
//! lookup, so new kinds plug in without touching the validator. Rules see
//! the campaign as extension context and judge placement within its
//! trading range; the opening pattern of a campaign anchors the range and
//! is not rule-checked.

use std::collections::HashMap;

use crate::domain::{Campaign, PatternEvent, PatternKind};

/// Outcome of a structural rule check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleVerdict {
    pub valid: bool,
    /// Short audit note when invalid
    pub note: Option<&'static str>,
}

impl RuleVerdict {
    pub fn pass() -> Self {
        Self {
            valid: true,
            note: None,
        }
    }

    pub fn fail(note: &'static str) -> Self {
        Self {
            valid: false,
            note: Some(note),
        }
    }
}

/// Structural placement check for one pattern kind.
pub trait PatternRule: Send + Sync {
    fn kind(&self) -> PatternKind;
    fn evaluate(&self, campaign: &Campaign, event: &PatternEvent) -> RuleVerdict;
}

macro_rules! pattern_rule {
    ($name:ident, $kind:expr, |$campaign:ident, $event:ident| $body:expr) => {
        struct $name;

        impl PatternRule for $name {
            fn kind(&self) -> PatternKind {
                $kind
            }

            fn evaluate(&self, $campaign: &Campaign, $event: &PatternEvent) -> RuleVerdict {
                $body
            }
        }
    };
}

pattern_rule!(SellingClimaxRule, PatternKind::SellingClimax, |c, e| {
    if e.price < c.range.midpoint() {
        RuleVerdict::pass()
    } else {
        RuleVerdict::fail("selling climax must print in the lower half of the range")
    }
});

pattern_rule!(AutomaticRallyRule, PatternKind::AutomaticRally, |c, e| {
    if e.price > c.range.support && e.price <= c.range.resistance {
        RuleVerdict::pass()
    } else {
        RuleVerdict::fail("automatic rally must lift off support inside the range")
    }
});

pattern_rule!(SecondaryTestRule, PatternKind::SecondaryTest, |c, e| {
    if e.price < c.range.midpoint() {
        RuleVerdict::pass()
    } else {
        RuleVerdict::fail("secondary test must revisit the lower half of the range")
    }
});

pattern_rule!(SpringRule, PatternKind::Spring, |c, e| {
    if e.price < c.range.support {
        RuleVerdict::pass()
    } else {
        RuleVerdict::fail("spring must dip below range support")
    }
});

pattern_rule!(TestRule, PatternKind::Test, |c, e| {
    if e.price < c.range.midpoint() {
        RuleVerdict::pass()
    } else {
        RuleVerdict::fail("test must hold the lower half of the range")
    }
});

pattern_rule!(SignOfStrengthRule, PatternKind::SignOfStrength, |c, e| {
    if e.price > c.range.midpoint() {
        RuleVerdict::pass()
    } else {
        RuleVerdict::fail("sign of strength must clear the range midpoint")
    }
});

pattern_rule!(LastPointOfSupportRule, PatternKind::LastPointOfSupport, |c, e| {
    if e.price <= c.range.support {
        return RuleVerdict::fail("last point of support must hold above support");
    }
    match c.highest_accepted() {
        Some(high) if e.price >= high => {
            RuleVerdict::fail("last point of support must be a pullback below the prior high")
        }
        _ => RuleVerdict::pass(),
    }
});

pattern_rule!(UpthrustRule, PatternKind::Upthrust, |c, e| {
    if e.price > c.range.resistance {
        RuleVerdict::pass()
    } else {
        RuleVerdict::fail("upthrust must poke above range resistance")
    }
});

pattern_rule!(
    UpthrustAfterDistributionRule,
    PatternKind::UpthrustAfterDistribution,
    |c, e| {
        if e.price > c.range.resistance {
            RuleVerdict::pass()
        } else {
            RuleVerdict::fail("UTAD must print above range resistance")
        }
    }
);

pattern_rule!(SignOfWeaknessRule, PatternKind::SignOfWeakness, |c, e| {
    if e.price < c.range.midpoint() {
        RuleVerdict::pass()
    } else {
        RuleVerdict::fail("sign of weakness must break down through the range midpoint")
    }
});

/// Registry mapping pattern kind to its structural rule.
pub struct RuleRegistry {
    rules: HashMap<PatternKind, Box<dyn PatternRule>>,
}

impl RuleRegistry {
    /// Empty registry; patterns without a rule pass structurally.
    pub fn new() -> Self {
        Self {
            rules: HashMap::new(),
        }
    }

    /// Registry with the built-in rule set for every known kind.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(SellingClimaxRule));
        registry.register(Box::new(AutomaticRallyRule));
        registry.register(Box::new(SecondaryTestRule));
        registry.register(Box::new(SpringRule));
        registry.register(Box::new(TestRule));
        registry.register(Box::new(SignOfStrengthRule));
        registry.register(Box::new(LastPointOfSupportRule));
        registry.register(Box::new(UpthrustRule));
        registry.register(Box::new(UpthrustAfterDistributionRule));
        registry.register(Box::new(SignOfWeaknessRule));
        registry
    }

    /// Register (or replace) the rule for a kind.
    pub fn register(&mut self, rule: Box<dyn PatternRule>) {
        self.rules.insert(rule.kind(), rule);
    }

    /// Evaluate the rule for the event's kind, passing when none exists.
    pub fn evaluate(&self, campaign: &Campaign, event: &PatternEvent) -> RuleVerdict {
        match self.rules.get(&event.kind) {
            Some(rule) => rule.evaluate(campaign, event),
            None => RuleVerdict::pass(),
        }
    }
}

impl Default for RuleRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}
