//! Tier policy: monthly quotas and the unlimited sentinel
//!
//! Quotas are configuration, not constants baked into the engine. The default
//! table matches the starter plan as sold today:
//!
//! | credit type       | starter quota | refill mode |
//! |-------------------|---------------|-------------|
//! | `resume_ai`       | 10            | reset       |
//! | `cover_letter_ai` | 5             | reset       |
//! | `deep_dive`       | 1             | reset       |
//! | `legacy`          | 10            | top-up      |
//!
//! Pro users bypass balances entirely; their rows are seeded to
//! [`PRO_UNLIMITED_CREDITS`]. Free users have no quota.

use revisume_shared::{CreditType, SubscriptionTier, PRO_UNLIMITED_CREDITS};

/// How a refill treats the balance already present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefillMode {
    /// Balance becomes exactly the quota; unused credits do not roll over.
    Reset,
    /// Balance is raised to the quota if below it. Used for types that also
    /// receive one-time pack grants, so a refill never destroys purchased credits.
    TopUp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaEntry {
    pub credit_type: CreditType,
    pub starter_quota: i32,
    pub mode: RefillMode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierPolicy {
    quotas: Vec<QuotaEntry>,
    unlimited: i32,
    downgrade_preserves_credits: bool,
}

impl Default for TierPolicy {
    fn default() -> Self {
        Self {
            quotas: vec![
                QuotaEntry {
                    credit_type: CreditType::ResumeAi,
                    starter_quota: 10,
                    mode: RefillMode::Reset,
                },
                QuotaEntry {
                    credit_type: CreditType::CoverLetterAi,
                    starter_quota: 5,
                    mode: RefillMode::Reset,
                },
                QuotaEntry {
                    credit_type: CreditType::DeepDive,
                    starter_quota: 1,
                    mode: RefillMode::Reset,
                },
                QuotaEntry {
                    credit_type: CreditType::Legacy,
                    starter_quota: 10,
                    mode: RefillMode::TopUp,
                },
            ],
            unlimited: PRO_UNLIMITED_CREDITS,
            downgrade_preserves_credits: true,
        }
    }
}

impl TierPolicy {
    /// Build the policy from environment variables, falling back to defaults.
    ///
    /// - `STARTER_RESUME_AI_CREDITS`
    /// - `STARTER_COVER_LETTER_AI_CREDITS`
    /// - `STARTER_DEEP_DIVE_CREDITS`
    /// - `STARTER_LEGACY_CREDITS`
    /// - `DOWNGRADE_PRESERVES_CREDITS`
    pub fn from_env() -> Self {
        let mut policy = Self::default();
        for (var, credit_type) in [
            ("STARTER_RESUME_AI_CREDITS", CreditType::ResumeAi),
            ("STARTER_COVER_LETTER_AI_CREDITS", CreditType::CoverLetterAi),
            ("STARTER_DEEP_DIVE_CREDITS", CreditType::DeepDive),
            ("STARTER_LEGACY_CREDITS", CreditType::Legacy),
        ] {
            if let Some(quota) = env_parse::<i32>(var) {
                policy = policy.with_starter_quota(credit_type, quota);
            }
        }
        if let Some(preserve) = env_parse::<bool>("DOWNGRADE_PRESERVES_CREDITS") {
            policy.downgrade_preserves_credits = preserve;
        }
        policy
    }

    /// Override (or add) the starter quota for a credit type.
    ///
    /// Quotas are clamped into `0..=unlimited`. New types default to
    /// [`RefillMode::Reset`].
    pub fn with_starter_quota(mut self, credit_type: CreditType, quota: i32) -> Self {
        let quota = quota.clamp(0, self.unlimited);
        match self
            .quotas
            .iter_mut()
            .find(|entry| entry.credit_type == credit_type)
        {
            Some(entry) => entry.starter_quota = quota,
            None => self.quotas.push(QuotaEntry {
                credit_type,
                starter_quota: quota,
                mode: RefillMode::Reset,
            }),
        }
        self
    }

    pub fn with_downgrade_preserves_credits(mut self, preserve: bool) -> Self {
        self.downgrade_preserves_credits = preserve;
        self
    }

    /// Monthly allocation for `(tier, credit_type)`.
    pub fn monthly_quota(&self, tier: SubscriptionTier, credit_type: &CreditType) -> i32 {
        match tier {
            SubscriptionTier::Free => 0,
            SubscriptionTier::Starter => self
                .entry(credit_type)
                .map(|entry| entry.starter_quota)
                .unwrap_or(0),
            SubscriptionTier::Pro => self.unlimited,
        }
    }

    pub fn is_unlimited(&self, tier: SubscriptionTier) -> bool {
        tier == SubscriptionTier::Pro
    }

    /// The unlimited sentinel, which is also the ceiling on any balance.
    pub fn unlimited(&self) -> i32 {
        self.unlimited
    }

    /// Whether `credit_type` carries a monthly quota at all. Pack credits never do.
    pub fn is_refillable(&self, credit_type: &CreditType) -> bool {
        self.entry(credit_type).is_some()
    }

    /// Balance after a starter refill of a row currently holding `current`.
    ///
    /// Returns `None` for types without a quota.
    pub fn refilled_amount(&self, credit_type: &CreditType, current: i32) -> Option<i32> {
        let entry = self.entry(credit_type)?;
        Some(match entry.mode {
            RefillMode::Reset => entry.starter_quota,
            RefillMode::TopUp => current.max(entry.starter_quota),
        })
    }

    /// Balance a freshly created row starts with for a user on `tier`.
    pub fn initial_amount(&self, tier: SubscriptionTier, credit_type: &CreditType) -> i32 {
        match tier {
            SubscriptionTier::Starter => self.monthly_quota(tier, credit_type),
            // Pro rows are only materialized by seeding; lazily created rows
            // (e.g. a pack grant) start empty.
            SubscriptionTier::Free | SubscriptionTier::Pro => 0,
        }
    }

    /// Quota table in declaration order.
    pub fn quotas(&self) -> &[QuotaEntry] {
        &self.quotas
    }

    /// Credit types overwritten when a paid tier is activated. Top-up types
    /// share their balance with packs and are excluded.
    pub fn seeded_types(&self) -> impl Iterator<Item = &CreditType> {
        self.quotas
            .iter()
            .filter(|entry| entry.mode == RefillMode::Reset)
            .map(|entry| &entry.credit_type)
    }

    pub fn downgrade_preserves_credits(&self) -> bool {
        self.downgrade_preserves_credits
    }

    fn entry(&self, credit_type: &CreditType) -> Option<&QuotaEntry> {
        self.quotas
            .iter()
            .find(|entry| &entry.credit_type == credit_type)
    }
}

fn env_parse<T: std::str::FromStr>(var: &str) -> Option<T> {
    let raw = std::env::var(var).ok()?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(var = %var, value = %raw, "Ignoring unparseable policy override");
            None
        }
    }
}
