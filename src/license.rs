//! License keys, plans and the features each plan unlocks.
//!
//! Keys look like `ROOMY-M123-ABCD-EF01`; the first character of the second
//! group selects the plan (`M` monthly, `B` biannual, `A` annual). Users
//! without a current license are on the free plan.

use crate::db::models::{FeatureSet, License, LicenseStatus, Plan};
use crate::db::{Database, DbError};
use chrono::{DateTime, Months, Utc};
use serde::Serialize;
use std::sync::Arc;

pub const KEY_PREFIX: &str = "ROOMY";

/// Limit value meaning "no limit".
pub const UNLIMITED: i64 = -1;

#[derive(Debug, thiserror::Error)]
pub enum LicenseError {
    #[error("invalid license key format")]
    InvalidKeyFormat,
    #[error("unrecognized plan code {0:?}")]
    InvalidPlanCode(char),
    #[error("plan {0} has no expiration")]
    InvalidPlan(Plan),
    #[error("expiration date out of range")]
    ExpirationOutOfRange,
    #[error("license key already in use")]
    KeyAlreadyUsed,
    #[error(transparent)]
    Db(#[from] DbError),
}

/// Callers normalise before validating: surrounding whitespace removed,
/// letters uppercased.
pub fn normalize_key(raw: &str) -> String {
    raw.trim().to_uppercase()
}

/// Exact, case-sensitive match of `ROOMY-XXXX-XXXX-XXXX` with `X` in `[A-Z0-9]`.
pub fn is_valid_key_format(key: &str) -> bool {
    let mut parts = key.split('-');
    if parts.next() != Some(KEY_PREFIX) {
        return false;
    }
    let groups: Vec<&str> = parts.collect();
    groups.len() == 3
        && groups.iter().all(|g| {
            g.len() == 4
                && g.bytes()
                    .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit())
        })
}

pub fn extract_plan(key: &str) -> Result<Plan, LicenseError> {
    if !is_valid_key_format(key) {
        return Err(LicenseError::InvalidKeyFormat);
    }
    let code = key
        .split('-')
        .nth(1)
        .and_then(|group| group.chars().next())
        .ok_or(LicenseError::InvalidKeyFormat)?;
    match code {
        'M' => Ok(Plan::Monthly),
        'B' => Ok(Plan::Biannual),
        'A' => Ok(Plan::Annual),
        other => Err(LicenseError::InvalidPlanCode(other)),
    }
}

/// Calendar-month arithmetic; a day past the end of the target month
/// clamps to its last day (Jan 31 + 1 month = Feb 28/29).
pub fn calculate_expiration(plan: Plan, now: DateTime<Utc>) -> Result<DateTime<Utc>, LicenseError> {
    let months = match plan {
        Plan::Monthly => 1,
        Plan::Biannual => 6,
        Plan::Annual => 12,
        Plan::Free => return Err(LicenseError::InvalidPlan(plan)),
    };
    now.checked_add_months(Months::new(months))
        .ok_or(LicenseError::ExpirationOutOfRange)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct KeyVerification {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<Plan>,
}

/// Non-persisting pre-check; never errors.
pub fn verify_key_format(key: &str) -> KeyVerification {
    match extract_plan(key) {
        Ok(plan) => KeyVerification {
            valid: true,
            plan: Some(plan),
        },
        Err(_) => KeyVerification {
            valid: false,
            plan: None,
        },
    }
}

pub fn features_for(plan: Plan) -> FeatureSet {
    match plan {
        Plan::Free => FeatureSet {
            max_guides: 1,
            max_blocks_per_guide: 10,
            ai_concierge: false,
            custom_theme: false,
            no_watermark: false,
            analytics: false,
        },
        Plan::Monthly => FeatureSet {
            max_guides: 3,
            max_blocks_per_guide: UNLIMITED,
            ai_concierge: true,
            custom_theme: true,
            no_watermark: true,
            analytics: false,
        },
        Plan::Biannual => FeatureSet {
            max_guides: 10,
            max_blocks_per_guide: UNLIMITED,
            ai_concierge: true,
            custom_theme: true,
            no_watermark: true,
            analytics: true,
        },
        Plan::Annual => FeatureSet {
            max_guides: UNLIMITED,
            max_blocks_per_guide: UNLIMITED,
            ai_concierge: true,
            custom_theme: true,
            no_watermark: true,
            analytics: true,
        },
    }
}

/// Lookup for untyped plan names. An unknown name falls back to the free
/// plan and is logged as an error, since it points at corrupt data.
pub fn features_for_plan_name(name: &str) -> FeatureSet {
    match name.parse::<Plan>() {
        Ok(plan) => features_for(plan),
        Err(e) => {
            tracing::error!(plan = name, error = %e, "unknown plan, using free features");
            features_for(Plan::Free)
        }
    }
}

fn within(limit: i64, count: usize) -> bool {
    limit == UNLIMITED || (count as i64) <= limit
}

impl FeatureSet {
    /// Whether an owner may hold `count` guides in total.
    pub fn allows_guides(&self, count: usize) -> bool {
        within(self.max_guides, count)
    }

    pub fn allows_blocks(&self, count: usize) -> bool {
        within(self.max_blocks_per_guide, count)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Entitlement {
    pub license: Option<License>,
    pub plan: Plan,
    pub features: FeatureSet,
}

#[derive(Clone)]
pub struct LicenseService {
    db: Arc<Database>,
}

impl LicenseService {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn activate(&self, user_id: &str, key: &str) -> Result<License, LicenseError> {
        self.activate_at(user_id, key, Utc::now())
    }

    /// Not idempotent: a key can be activated exactly once across all users.
    pub fn activate_at(
        &self,
        user_id: &str,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<License, LicenseError> {
        if !is_valid_key_format(key) {
            return Err(LicenseError::InvalidKeyFormat);
        }
        if self.db.license_key_exists(key)? {
            return Err(LicenseError::KeyAlreadyUsed);
        }

        let plan = extract_plan(key)?;
        let license = License {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            license_key: key.to_string(),
            plan,
            status: LicenseStatus::Active,
            features: features_for(plan),
            started_at: now,
            expires_at: Some(calculate_expiration(plan, now)?),
            created_at: now,
        };

        self.store(&license)?;
        tracing::info!(user_id, plan = %plan, license_id = %license.id, "license activated");
        Ok(license)
    }

    /// The UNIQUE constraint on `license_key` settles two activations of one
    /// key that both pass the existence check.
    fn store(&self, license: &License) -> Result<(), LicenseError> {
        self.db.insert_license(license).map_err(|e| {
            if e.is_unique_violation() {
                LicenseError::KeyAlreadyUsed
            } else {
                LicenseError::Db(e)
            }
        })
    }

    pub fn current_license(&self, user_id: &str) -> Result<Option<License>, LicenseError> {
        self.current_license_at(user_id, Utc::now())
    }

    /// Latest active, unexpired license, or `None` for the free plan.
    /// Writes: every active license found past its expiration is marked
    /// expired on the way to an older one that is still valid.
    pub fn current_license_at(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<License>, LicenseError> {
        while let Some(license) = self.db.latest_active_license(user_id)? {
            match license.expires_at {
                Some(expires_at) if expires_at < now => {
                    self.db
                        .set_license_status(&license.id, LicenseStatus::Expired)?;
                    tracing::info!(user_id, license_id = %license.id, %expires_at, "license expired");
                }
                _ => return Ok(Some(license)),
            }
        }
        Ok(None)
    }

    pub fn entitlement(&self, user_id: &str) -> Result<Entitlement, LicenseError> {
        let license = self.current_license(user_id)?;
        let plan = license.as_ref().map_or(Plan::Free, |l| l.plan);
        Ok(Entitlement {
            features: features_for(plan),
            plan,
            license,
        })
    }
}
