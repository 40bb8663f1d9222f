use crate::domain::types::{Percentage, ServiceId, SurchargePlanId, VersionId};
use crate::domain::versions::{resolve_version, VersionKey, Versioned};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// How a service is priced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceNature {
    /// Unit price per hour of care.
    Hourly,
    /// Flat unit price per event, whatever its duration.
    Fixed,
}

impl fmt::Display for ServiceNature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceNature::Hourly => write!(f, "hourly"),
            ServiceNature::Fixed => write!(f, "fixed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceVersion {
    pub version_id: VersionId,
    pub name: String,
    pub vat: Percentage,
    pub nature: ServiceNature,
    #[serde(default)]
    pub surcharge: Option<SurchargePlanId>,
    #[serde(default)]
    pub exempt_from_charges: bool,
    pub start_date: NaiveDateTime,
    pub created_at: DateTime<Utc>,
}

impl Versioned for ServiceVersion {
    fn version_id(&self) -> &VersionId {
        &self.version_id
    }

    fn start_date(&self) -> NaiveDateTime {
        self.start_date
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub id: ServiceId,
    pub versions: Vec<ServiceVersion>,
}

/// Catalogue terms of a service in force on a given date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectiveService {
    pub service_id: ServiceId,
    pub version_id: VersionId,
    pub name: String,
    pub vat: Percentage,
    pub nature: ServiceNature,
    pub surcharge: Option<SurchargePlanId>,
    pub exempt_from_charges: bool,
}

impl Service {
    /// Service versions are ranked by their start date.
    pub fn effective_at(&self, at: NaiveDateTime) -> Option<EffectiveService> {
        let version = resolve_version(&self.versions, at, VersionKey::StartDate)?;
        Some(EffectiveService {
            service_id: self.id.clone(),
            version_id: version.version_id.clone(),
            name: version.name.clone(),
            vat: version.vat,
            nature: version.nature,
            surcharge: version.surcharge.clone(),
            exempt_from_charges: version.exempt_from_charges,
        })
    }
}
