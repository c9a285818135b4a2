//! Common types used across Revisume

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Sentinel balance standing in for "unlimited" on the pro tier.
pub const PRO_UNLIMITED_CREDITS: i32 = 99_999;

// =============================================================================
// ID Wrappers
// =============================================================================

/// User ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl From<i64> for UserId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for UserId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<i64>()
            .map(Self)
            .map_err(|_| format!("Invalid user id: {}", s))
    }
}

// =============================================================================
// Enums
// =============================================================================

/// Subscription tier for billing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionTier {
    #[default]
    Free,
    Starter,
    Pro,
}

impl SubscriptionTier {
    pub const ALL: [SubscriptionTier; 3] = [Self::Free, Self::Starter, Self::Pro];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Starter => "starter",
            Self::Pro => "pro",
        }
    }

    /// Whether this tier is backed by a paid subscription
    pub fn is_paid(&self) -> bool {
        !matches!(self, Self::Free)
    }
}

impl std::fmt::Display for SubscriptionTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SubscriptionTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "free" => Ok(Self::Free),
            "starter" => Ok(Self::Starter),
            "pro" => Ok(Self::Pro),
            _ => Err(format!("Invalid subscription tier: {}", s)),
        }
    }
}

/// Label partitioning credits by feature family.
///
/// The set is open: rows written by older flows may carry labels this
/// build does not know about, which round-trip through [`CreditType::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CreditType {
    ResumeAi,
    CoverLetterAi,
    DeepDive,
    Legacy,
    Pack,
    Other(String),
}

impl CreditType {
    /// Every credit type this build knows about
    pub fn known_types() -> [CreditType; 5] {
        [
            Self::ResumeAi,
            Self::CoverLetterAi,
            Self::DeepDive,
            Self::Legacy,
            Self::Pack,
        ]
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::ResumeAi => "resume_ai",
            Self::CoverLetterAi => "cover_letter_ai",
            Self::DeepDive => "deep_dive",
            Self::Legacy => "legacy",
            Self::Pack => "pack",
            Self::Other(label) => label,
        }
    }
}

impl From<String> for CreditType {
    fn from(label: String) -> Self {
        match label.as_str() {
            "resume_ai" => Self::ResumeAi,
            "cover_letter_ai" => Self::CoverLetterAi,
            "deep_dive" => Self::DeepDive,
            "legacy" => Self::Legacy,
            "pack" => Self::Pack,
            _ => Self::Other(label),
        }
    }
}

impl From<&str> for CreditType {
    fn from(label: &str) -> Self {
        Self::from(label.to_string())
    }
}

impl From<CreditType> for String {
    fn from(credit_type: CreditType) -> Self {
        match credit_type {
            CreditType::Other(label) => label,
            known => known.as_str().to_string(),
        }
    }
}

impl std::fmt::Display for CreditType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Models
// =============================================================================

/// User model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub email: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub tier: SubscriptionTier,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Fields required to register a user
#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub username: String,
    pub password_hash: String,
}

/// Credit balance for one (user, credit type) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credit {
    pub id: i64,
    pub user_id: UserId,
    pub credit_type: CreditType,
    pub amount: i32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_reset: Option<OffsetDateTime>,
}

/// One metered feature invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureUsageLog {
    pub id: i64,
    pub user_id: UserId,
    pub feature_name: String,
    pub credits_used: i32,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_parse_is_case_insensitive() {
        assert_eq!("Starter".parse::<SubscriptionTier>(), Ok(SubscriptionTier::Starter));
        assert_eq!("PRO".parse::<SubscriptionTier>(), Ok(SubscriptionTier::Pro));
        assert!("enterprise".parse::<SubscriptionTier>().is_err());
    }

    #[test]
    fn test_unknown_credit_type_round_trips_label() {
        let credit_type = CreditType::from("interview_prep");
        assert_eq!(credit_type, CreditType::Other("interview_prep".to_string()));
        assert_eq!(String::from(credit_type), "interview_prep");
    }

    #[test]
    fn test_credit_type_serializes_as_label() {
        let json = serde_json::to_string(&CreditType::CoverLetterAi).unwrap();
        assert_eq!(json, "\"cover_letter_ai\"");
        let parsed: CreditType = serde_json::from_str("\"legacy\"").unwrap();
        assert_eq!(parsed, CreditType::Legacy);
    }

    #[test]
    fn test_password_hash_not_serialized() {
        let user = User {
            id: UserId(1),
            email: "a@example.com".to_string(),
            username: "a".to_string(),
            password_hash: "secret".to_string(),
            tier: SubscriptionTier::Free,
            stripe_customer_id: None,
            stripe_subscription_id: None,
            created_at: OffsetDateTime::UNIX_EPOCH,
        };
        let json = serde_json::to_value(&user).unwrap();
        assert!(json.get("password_hash").is_none());
        assert_eq!(json["tier"], "free");
    }
}
