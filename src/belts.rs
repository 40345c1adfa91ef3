//! Current-belt resolution.
//!
//! A student's belt can be recorded in several places that do not always
//! agree: a catalog link on the profile, a free-text rank on the same profile,
//! the grading history, and a legacy field on the student itself. The resolver
//! walks an ordered list of sources and takes the first one that names a rank;
//! sources are never merged.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;

use crate::catalog::{BeltCatalog, BeltEntry};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileBelt {
    pub belt_id: Option<i64>,
    pub rank: Option<String>,
    pub degree: Option<i64>,
}

/// Everything stored on the student side that can name a belt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StudentBeltFacts {
    pub profile: Option<ProfileBelt>,
    pub legacy_rank: Option<String>,
    pub legacy_degree: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradingEvent {
    pub id: String,
    pub student_id: String,
    pub previous_rank: Option<String>,
    pub previous_degree: Option<i64>,
    pub new_rank: Option<String>,
    pub new_degree: Option<i64>,
    pub date: String,
    pub evaluator_id: Option<String>,
    pub status: Option<String>,
    pub created_at: Option<String>,
}

impl GradingEvent {
    pub fn is_active(&self) -> bool {
        is_active_status(self.status.as_deref())
    }

    fn created_instant(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(self.created_at.as_deref()?)
    }
}

/// Statuses treated as "active" for gradings and enrollments.
pub fn is_active_status(status: Option<&str>) -> bool {
    matches!(
        status.map(|s| s.trim().to_lowercase()).as_deref(),
        Some("active" | "ativa" | "ativo")
    )
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let t = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(t) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(t, fmt).ok())
        .map(|n| n.and_utc())
}

/// Picks the grading that decides the current belt: an active one if any,
/// otherwise the most recently created. Remaining ties go to the latest
/// creation timestamp and then the greatest id, so the choice never depends
/// on input order.
pub fn most_relevant_grading(events: &[GradingEvent]) -> Option<&GradingEvent> {
    events.iter().max_by(|a, b| {
        a.is_active()
            .cmp(&b.is_active())
            .then_with(|| a.created_instant().cmp(&b.created_instant()))
            .then_with(|| a.created_at.cmp(&b.created_at))
            .then_with(|| a.id.cmp(&b.id))
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum BeltSource {
    CatalogLink,
    ProfileRank,
    Grading,
    LegacyRank,
    Fallback,
}

/// Lookup order used everywhere a belt is displayed.
pub const DEFAULT_SOURCES: &[BeltSource] = &[
    BeltSource::CatalogLink,
    BeltSource::ProfileRank,
    BeltSource::Grading,
    BeltSource::LegacyRank,
];

struct Candidate<'c> {
    entry: &'c BeltEntry,
    degree: Option<i64>,
}

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}

impl BeltSource {
    fn candidate<'c>(
        self,
        catalog: &'c BeltCatalog,
        facts: &StudentBeltFacts,
        gradings: &[GradingEvent],
    ) -> Option<Candidate<'c>> {
        match self {
            BeltSource::CatalogLink => {
                let profile = facts.profile.as_ref()?;
                let entry = catalog.by_id(profile.belt_id?)?;
                let degree = match (profile.degree, entry.max_degrees) {
                    (Some(d), max) if max > 0 => Some(d.min(max as i64)),
                    (d, _) => d,
                };
                Some(Candidate { entry, degree })
            }
            BeltSource::ProfileRank => {
                let profile = facts.profile.as_ref()?;
                let rank = non_empty(profile.rank.as_deref())?;
                Some(Candidate {
                    entry: catalog.lookup_or_lowest(rank),
                    degree: profile.degree,
                })
            }
            BeltSource::Grading => {
                let grading = most_relevant_grading(gradings)?;
                let rank = non_empty(grading.new_rank.as_deref())?;
                Some(Candidate {
                    entry: catalog.lookup_or_lowest(rank),
                    degree: grading.new_degree,
                })
            }
            BeltSource::LegacyRank => {
                let rank = non_empty(facts.legacy_rank.as_deref())?;
                Some(Candidate {
                    entry: catalog.lookup_or_lowest(rank),
                    degree: facts.legacy_degree,
                })
            }
            BeltSource::Fallback => Some(Candidate {
                entry: catalog.lowest(),
                degree: None,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedBelt {
    pub rank_key: String,
    pub degree: u32,
    pub label: String,
    pub color: String,
    pub source: BeltSource,
}

pub fn format_label(display_name: &str, degree: u32) -> String {
    if degree == 0 {
        display_name.to_string()
    } else {
        format!("{} • {}º grau", display_name, degree)
    }
}

pub fn resolve_belt(
    catalog: &BeltCatalog,
    facts: &StudentBeltFacts,
    gradings: &[GradingEvent],
) -> ResolvedBelt {
    resolve_belt_with(DEFAULT_SOURCES, catalog, facts, gradings)
}

pub fn resolve_belt_with(
    sources: &[BeltSource],
    catalog: &BeltCatalog,
    facts: &StudentBeltFacts,
    gradings: &[GradingEvent],
) -> ResolvedBelt {
    let (source, candidate) = sources
        .iter()
        .chain(std::iter::once(&BeltSource::Fallback))
        .find_map(|s| s.candidate(catalog, facts, gradings).map(|c| (*s, c)))
        .unwrap_or_else(|| {
            (
                BeltSource::Fallback,
                Candidate {
                    entry: catalog.lowest(),
                    degree: None,
                },
            )
        });
    let degree = u32::try_from(candidate.degree.unwrap_or(0).max(0)).unwrap_or(u32::MAX);
    ResolvedBelt {
        rank_key: candidate.entry.key.clone(),
        degree,
        label: format_label(&candidate.entry.name, degree),
        color: candidate.entry.color.clone(),
        source,
    }
}
