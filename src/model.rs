//! Typed boundary over the loosely-shaped documents the admin tooling writes.
//!
//! Source documents mix scalar and list representations for the same field
//! (`role` may be a bare string or a list, `have_car` may be a boolean or
//! `"Yes"`/`"No"`, certificates may be a plain list or a map with dates).
//! All coercion rules live here; consumers only ever see the strict shapes.

use std::collections::BTreeSet;
use std::fmt;

use indexmap::IndexMap;
use serde::de::{self, Deserializer, SeqAccess, Visitor};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Employee {
    pub worker_id: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub middle_name: String,
    #[serde(default)]
    pub sur_name: String,
    #[serde(default)]
    pub phone_number: String,
    #[serde(default)]
    pub home_address: String,
    #[serde(default, deserialize_with = "yes_no_bool")]
    pub have_car: bool,
    #[serde(default, deserialize_with = "string_or_set")]
    pub role: BTreeSet<String>,
    #[serde(default, deserialize_with = "string_or_set")]
    pub availability: BTreeSet<String>,
    #[serde(default, deserialize_with = "string_or_set")]
    pub skills: BTreeSet<String>,
    #[serde(default, deserialize_with = "certificate_map")]
    pub certificates: IndexMap<String, CertificateDates>,
    #[serde(default, deserialize_with = "clamped_rating")]
    pub rating: f64,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
}

impl Employee {
    pub fn coordinates(&self) -> Option<Coordinates> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lng)) => {
                let coords = Coordinates::new(lat, lng);
                coords.is_valid().then_some(coords)
            }
            _ => None,
        }
    }

    pub fn qualified_for(&self, role: &str) -> bool {
        self.role.contains(role)
    }

    pub fn display_name(&self) -> String {
        let mut parts = vec![self.first_name.as_str()];
        if !self.middle_name.is_empty() {
            parts.push(self.middle_name.as_str());
        }
        if !self.sur_name.is_empty() {
            parts.push(self.sur_name.as_str());
        }
        parts.join(" ").trim().to_string()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CertificateDates {
    #[serde(default)]
    pub issued: Option<String>,
    #[serde(default)]
    pub expires: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SiteStatus {
    Active,
    Inactive,
    Completed,
}

impl SiteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SiteStatus::Active => "active",
            SiteStatus::Inactive => "inactive",
            SiteStatus::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoleRequirement {
    #[serde(default, deserialize_with = "string_or_set")]
    pub work_schedule: BTreeSet<String>,
    #[serde(default)]
    pub num_workers: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "JobSiteDoc")]
pub struct JobSite {
    pub site_id: String,
    pub site_name: String,
    pub location: String,
    pub site_manager: String,
    pub contact_number: String,
    pub status: SiteStatus,
    pub required_roles: IndexMap<String, RoleRequirement>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// Raw document shape; newer documents carry `status`, older ones a bare
/// `active` boolean.
#[derive(Deserialize)]
struct JobSiteDoc {
    site_id: String,
    #[serde(default)]
    site_name: String,
    #[serde(default)]
    location: String,
    #[serde(default)]
    site_manager: String,
    #[serde(default)]
    contact_number: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    active: Option<bool>,
    #[serde(default, deserialize_with = "required_roles")]
    required_roles: IndexMap<String, RoleRequirement>,
    #[serde(default)]
    start_date: Option<String>,
    #[serde(default)]
    end_date: Option<String>,
    #[serde(default)]
    latitude: Option<f64>,
    #[serde(default)]
    longitude: Option<f64>,
}

impl TryFrom<JobSiteDoc> for JobSite {
    type Error = String;

    fn try_from(doc: JobSiteDoc) -> Result<Self, Self::Error> {
        let status = match doc.status {
            Some(status) => match status.trim().to_ascii_lowercase().as_str() {
                "active" => SiteStatus::Active,
                "inactive" => SiteStatus::Inactive,
                "completed" => SiteStatus::Completed,
                other => return Err(format!("unknown site status: {other}")),
            },
            None => match doc.active {
                Some(false) => SiteStatus::Inactive,
                Some(true) | None => SiteStatus::Active,
            },
        };
        Ok(Self {
            site_id: doc.site_id,
            site_name: doc.site_name,
            location: doc.location,
            site_manager: doc.site_manager,
            contact_number: doc.contact_number,
            status,
            required_roles: doc.required_roles,
            start_date: doc.start_date,
            end_date: doc.end_date,
            latitude: doc.latitude,
            longitude: doc.longitude,
        })
    }
}

impl JobSite {
    pub fn coordinates(&self) -> Option<Coordinates> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lng)) => {
                let coords = Coordinates::new(lat, lng);
                coords.is_valid().then_some(coords)
            }
            _ => None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == SiteStatus::Active
    }
}

/// Derived record; the whole set is rebuilt on every run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Assignment {
    pub employee_id: String,
    pub job_site_id: String,
    pub role: String,
    pub distance_km: f64,
    pub assigned_at: String,
}

fn yes_no_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    struct YesNoVisitor;

    impl<'de> Visitor<'de> for YesNoVisitor {
        type Value = bool;

        fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
            formatter.write_str("a boolean or \"Yes\"/\"No\"")
        }

        fn visit_bool<E: de::Error>(self, value: bool) -> Result<bool, E> {
            Ok(value)
        }

        fn visit_str<E: de::Error>(self, value: &str) -> Result<bool, E> {
            Ok(matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "yes" | "true" | "1"
            ))
        }

        fn visit_unit<E: de::Error>(self) -> Result<bool, E> {
            Ok(false)
        }
    }

    deserializer.deserialize_any(YesNoVisitor)
}

fn string_or_set<'de, D>(deserializer: D) -> Result<BTreeSet<String>, D::Error>
where
    D: Deserializer<'de>,
{
    struct StringOrSetVisitor;

    impl<'de> Visitor<'de> for StringOrSetVisitor {
        type Value = BTreeSet<String>;

        fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
            formatter.write_str("a string or a list of strings")
        }

        fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
            let mut set = BTreeSet::new();
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                set.insert(trimmed.to_string());
            }
            Ok(set)
        }

        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
            let mut set = BTreeSet::new();
            while let Some(value) = seq.next_element::<String>()? {
                let trimmed = value.trim();
                if !trimmed.is_empty() {
                    set.insert(trimmed.to_string());
                }
            }
            Ok(set)
        }

        fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(BTreeSet::new())
        }
    }

    deserializer.deserialize_any(StringOrSetVisitor)
}

fn certificate_map<'de, D>(deserializer: D) -> Result<IndexMap<String, CertificateDates>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Certificates {
        Labels(Vec<String>),
        Dated(IndexMap<String, CertificateDates>),
    }

    match Option::<Certificates>::deserialize(deserializer)? {
        Some(Certificates::Labels(labels)) => Ok(labels
            .into_iter()
            .filter(|label| !label.trim().is_empty())
            .map(|label| (label, CertificateDates::default()))
            .collect()),
        Some(Certificates::Dated(map)) => Ok(map),
        None => Ok(IndexMap::new()),
    }
}

fn clamped_rating<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<f64>::deserialize(deserializer)?.unwrap_or(0.0);
    if value.is_finite() {
        Ok(value.clamp(0.0, 5.0))
    } else {
        Ok(0.0)
    }
}

fn required_roles<'de, D>(deserializer: D) -> Result<IndexMap<String, RoleRequirement>, D::Error>
where
    D: Deserializer<'de>,
{
    // The earliest site documents stored a bare list of role names with the
    // schedule at the site level; those entries carry no headcount and the
    // allocator skips them.
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Roles {
        Names(Vec<String>),
        Requirements(IndexMap<String, RoleRequirement>),
    }

    match Option::<Roles>::deserialize(deserializer)? {
        Some(Roles::Names(names)) => Ok(names
            .into_iter()
            .filter(|name| !name.trim().is_empty())
            .map(|name| (name, RoleRequirement::default()))
            .collect()),
        Some(Roles::Requirements(map)) => Ok(map),
        None => Ok(IndexMap::new()),
    }
}
