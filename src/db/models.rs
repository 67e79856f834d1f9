use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Guide {
    pub id: String,
    pub user_id: String,
    pub slug: String,
    pub title: String,
    pub accommodation_name: Option<String>,
    pub is_published: bool,
    pub theme_id: Option<String>,
    pub theme_settings: serde_json::Value,
    pub ai_enabled: bool,
    pub ai_instructions: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BlockType {
    Hero,
    QuickInfo,
    Amenities,
    Map,
    HostPick,
    Notice,
    Gallery,
}

impl BlockType {
    pub const ALL: [BlockType; 7] = [
        BlockType::Hero,
        BlockType::QuickInfo,
        BlockType::Amenities,
        BlockType::Map,
        BlockType::HostPick,
        BlockType::Notice,
        BlockType::Gallery,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BlockType::Hero => "hero",
            BlockType::QuickInfo => "quick_info",
            BlockType::Amenities => "amenities",
            BlockType::Map => "map",
            BlockType::HostPick => "host_pick",
            BlockType::Notice => "notice",
            BlockType::Gallery => "gallery",
        }
    }
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BlockType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BlockType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownVariant {
                kind: "block type",
                value: s.to_string(),
            })
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub id: String,
    pub guide_id: String,
    #[serde(rename = "type")]
    pub block_type: BlockType,
    pub order_index: i64,
    pub content: serde_json::Value,
    pub is_visible: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Retrieval unit stored in `guide_embeddings`. The vector itself stays in
/// the database layer.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GuideChunk {
    pub id: String,
    pub guide_id: String,
    pub block_id: Option<String>,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl FromStr for Role {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(UnknownVariant {
                kind: "role",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationTurn {
    pub id: String,
    pub guide_id: String,
    pub session_id: String,
    pub role: Role,
    pub content: String,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Free,
    Monthly,
    Biannual,
    Annual,
}

impl Plan {
    pub fn as_str(&self) -> &'static str {
        match self {
            Plan::Free => "free",
            Plan::Monthly => "monthly",
            Plan::Biannual => "biannual",
            Plan::Annual => "annual",
        }
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Plan {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free" => Ok(Plan::Free),
            "monthly" => Ok(Plan::Monthly),
            "biannual" => Ok(Plan::Biannual),
            "annual" => Ok(Plan::Annual),
            other => Err(UnknownVariant {
                kind: "plan",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LicenseStatus {
    Active,
    Expired,
}

impl LicenseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LicenseStatus::Active => "active",
            LicenseStatus::Expired => "expired",
        }
    }
}

impl FromStr for LicenseStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(LicenseStatus::Active),
            "expired" => Ok(LicenseStatus::Expired),
            other => Err(UnknownVariant {
                kind: "license status",
                value: other.to_string(),
            }),
        }
    }
}

/// Plan entitlements. A `-1` limit means unlimited.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FeatureSet {
    pub max_guides: i64,
    pub max_blocks_per_guide: i64,
    pub ai_concierge: bool,
    pub custom_theme: bool,
    pub no_watermark: bool,
    pub analytics: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct License {
    pub id: String,
    pub user_id: String,
    pub license_key: String,
    pub plan: Plan,
    pub status: LicenseStatus,
    pub features: FeatureSet,
    pub started_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value:?}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

// Text-backed enums share one SQL mapping.
macro_rules! text_enum_sql {
    ($($ty:ty),+ $(,)?) => {$(
        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e: UnknownVariant| FromSqlError::Other(Box::new(e)))
            }
        }
    )+};
}

text_enum_sql!(BlockType, Role, Plan, LicenseStatus);
