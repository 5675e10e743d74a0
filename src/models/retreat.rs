use std::fmt;

use chrono::{DateTime, Utc};
use mongodb::bson::{self, oid::ObjectId};
use serde::{Deserialize, Serialize};

use crate::errors::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RetreatId(ObjectId);

impl RetreatId {
    pub fn new() -> Self {
        RetreatId(ObjectId::new())
    }

    pub fn parse(raw: &str) -> Result<Self> {
        Ok(RetreatId(ObjectId::parse_str(raw.trim())?))
    }

    pub fn as_object_id(&self) -> ObjectId {
        self.0
    }

    pub fn to_hex(&self) -> String {
        self.0.to_hex()
    }
}

impl Default for RetreatId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RetreatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_hex())
    }
}

/// One scheduled occurrence of a retreat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetreatSession {
    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub start: DateTime<Utc>,
    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub end: DateTime<Utc>,
    pub capacity: u32,
    /// Unit price per seat, minor currency units.
    pub price: i64,
}

impl RetreatSession {
    pub fn is_well_formed(&self) -> bool {
        self.start < self.end
    }
}

/// Catalogue entry, read-only from the booking side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Retreat {
    #[serde(rename = "_id")]
    pub id: RetreatId,
    pub title: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub sessions: Vec<RetreatSession>,
}

impl Retreat {
    /// Exact match on the session start; no fuzzy matching.
    pub fn session_starting_at(&self, start: DateTime<Utc>) -> Option<&RetreatSession> {
        self.sessions.iter().find(|s| s.start == start)
    }
}
