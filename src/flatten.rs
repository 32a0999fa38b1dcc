//! Work flattening.
//!
//! Projects one OpenAlex work (nested JSON) into a [`FlatRow`] of scalar CSV columns.
//! Every nested field is optional: a missing author, institution or topic produces an
//! empty cell, never an error. Only a missing `id` or `title` causes the record to be
//! skipped, which the caller logs and moves past.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Separator for list-valued columns
pub const LIST_SEPARATOR: &str = "; ";

/// Separator between raw affiliation strings of one author
const AFFILIATION_SEPARATOR: &str = " | ";

/// CSV column order, matching the field order of [`FlatRow`]
pub const COLUMNS: &[&str] = &[
    "id",
    "doi",
    "title",
    "abstract",
    "publication_year",
    "publication_date",
    "created_date",
    "type",
    "type_crossref",
    "language",
    "cited_by_count",
    "is_retracted",
    "is_paratext",
    "journal",
    "publisher",
    "host_organization_name",
    "host_venue_issn",
    "is_accepted",
    "open_access",
    "oa_status",
    "license",
    "author_count",
    "author_names",
    "institution_names",
    "institution_types",
    "country_codes",
    "corresponding_authors",
    "raw_affiliations",
    "concepts",
    "keywords",
    "topics",
    "subfields",
    "fields",
    "domains",
    "referenced_works_count",
    "referenced_works",
    "funding_details",
    "counts_by_year",
    "relevance_score",
    "indexed_in",
];

/// One flattened work, one CSV row.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FlatRow {
    pub id: String,
    pub doi: String,
    pub title: String,
    #[serde(rename = "abstract")]
    pub abstract_text: String,
    pub publication_year: Option<i32>,
    pub publication_date: String,
    pub created_date: String,
    #[serde(rename = "type")]
    pub work_type: String,
    pub type_crossref: String,
    pub language: String,
    pub cited_by_count: Option<i64>,
    pub is_retracted: Option<bool>,
    pub is_paratext: Option<bool>,
    pub journal: String,
    pub publisher: String,
    pub host_organization_name: String,
    pub host_venue_issn: String,
    pub is_accepted: Option<bool>,
    pub open_access: Option<bool>,
    pub oa_status: String,
    pub license: String,
    pub author_count: usize,
    pub author_names: String,
    pub institution_names: String,
    pub institution_types: String,
    pub country_codes: String,
    pub corresponding_authors: String,
    pub raw_affiliations: String,
    pub concepts: String,
    pub keywords: String,
    pub topics: String,
    pub subfields: String,
    pub fields: String,
    pub domains: String,
    pub referenced_works_count: usize,
    pub referenced_works: String,
    pub funding_details: String,
    pub counts_by_year: String,
    pub relevance_score: Option<f64>,
    pub indexed_in: String,
}

/// Why a record was left out of the output.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SkipReason {
    #[error("record is not a JSON object")]
    NotAnObject,
    #[error("record has unexpected shape: {0}")]
    Malformed(String),
    #[error("record has no id")]
    MissingId,
    #[error("record {0} has no title")]
    MissingTitle(String),
}

// === OpenAlex Work Types ===

/// Typed view over the fields of a work that end up in [`FlatRow`].
///
/// A field whose value has the wrong type reads as absent, and list elements of the
/// wrong type are dropped, so one odd field never costs the whole record.
#[derive(Debug, Default, Deserialize)]
pub struct Work {
    #[serde(default, deserialize_with = "lenient")]
    id: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    doi: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    title: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    display_name: Option<String>,
    #[serde(default)]
    abstract_inverted_index: Option<Value>,
    #[serde(default, deserialize_with = "lenient")]
    publication_year: Option<i32>,
    #[serde(default, deserialize_with = "lenient")]
    publication_date: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    created_date: Option<String>,
    #[serde(rename = "type", default, deserialize_with = "lenient")]
    work_type: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    type_crossref: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    language: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    cited_by_count: Option<i64>,
    #[serde(default, deserialize_with = "lenient")]
    is_retracted: Option<bool>,
    #[serde(default, deserialize_with = "lenient")]
    is_paratext: Option<bool>,
    #[serde(default, deserialize_with = "lenient")]
    primary_location: Option<Location>,
    #[serde(default, deserialize_with = "lenient")]
    open_access: Option<OpenAccess>,
    #[serde(default, deserialize_with = "lenient_list")]
    authorships: Option<Vec<Authorship>>,
    #[serde(default, deserialize_with = "lenient_list")]
    concepts: Option<Vec<Concept>>,
    #[serde(default, deserialize_with = "lenient_list")]
    keywords: Option<Vec<Named>>,
    #[serde(default, deserialize_with = "lenient_list")]
    topics: Option<Vec<Topic>>,
    #[serde(default, deserialize_with = "lenient_list")]
    referenced_works: Option<Vec<String>>,
    #[serde(default, deserialize_with = "lenient_list")]
    grants: Option<Vec<Grant>>,
    #[serde(default, deserialize_with = "lenient_list")]
    counts_by_year: Option<Vec<Value>>,
    #[serde(default, deserialize_with = "lenient")]
    relevance_score: Option<f64>,
    #[serde(default, deserialize_with = "lenient_list")]
    indexed_in: Option<Vec<String>>,
}

impl Work {
    /// OpenAlex work id, if present and non-blank.
    pub fn id(&self) -> Option<&str> {
        non_blank(self.id.as_deref())
    }
}

#[derive(Debug, Default, Deserialize)]
struct Location {
    #[serde(default, deserialize_with = "lenient")]
    source: Option<Source>,
    #[serde(default, deserialize_with = "lenient")]
    is_accepted: Option<bool>,
    #[serde(default, deserialize_with = "lenient")]
    license: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Source {
    #[serde(default, deserialize_with = "lenient")]
    display_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_list")]
    issn: Option<Vec<String>>,
    #[serde(default, deserialize_with = "lenient")]
    publisher: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    host_organization_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OpenAccess {
    #[serde(default, deserialize_with = "lenient")]
    is_oa: Option<bool>,
    #[serde(default, deserialize_with = "lenient")]
    oa_status: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Authorship {
    #[serde(default, deserialize_with = "lenient")]
    author: Option<Named>,
    #[serde(default, deserialize_with = "lenient_list")]
    institutions: Option<Vec<Institution>>,
    #[serde(default, deserialize_with = "lenient")]
    is_corresponding: Option<bool>,
    #[serde(default, deserialize_with = "lenient_list")]
    raw_affiliation_strings: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct Named {
    #[serde(default, deserialize_with = "lenient")]
    display_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Institution {
    #[serde(default, deserialize_with = "lenient")]
    display_name: Option<String>,
    #[serde(rename = "type", default, deserialize_with = "lenient")]
    institution_type: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    country_code: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Concept {
    #[serde(default, deserialize_with = "lenient")]
    display_name: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    level: Option<i64>,
    #[serde(default, deserialize_with = "lenient")]
    score: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct Topic {
    #[serde(default, deserialize_with = "lenient")]
    display_name: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    subfield: Option<Named>,
    #[serde(default, deserialize_with = "lenient")]
    field: Option<Named>,
    #[serde(default, deserialize_with = "lenient")]
    domain: Option<Named>,
}

#[derive(Debug, Default, Deserialize)]
struct Grant {
    #[serde(default, deserialize_with = "lenient")]
    funder_display_name: Option<String>,
}

/// Any value that does not decode as `T` becomes `None`.
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}

/// Keeps the elements of an array that decode as `T`; anything but an array is `None`.
fn lenient_list<'de, D, T>(deserializer: D) -> Result<Option<Vec<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    match Value::deserialize(deserializer)? {
        Value::Array(items) => Ok(Some(
            items
                .into_iter()
                .filter_map(|item| serde_json::from_value(item).ok())
                .collect(),
        )),
        _ => Ok(None),
    }
}

/// Decode and flatten one raw record from a results page.
pub fn flatten_value(record: &Value) -> Result<FlatRow, SkipReason> {
    if !record.is_object() {
        return Err(SkipReason::NotAnObject);
    }
    let work: Work =
        Work::deserialize(record).map_err(|e| SkipReason::Malformed(e.to_string()))?;
    flatten(&work)
}

/// Flatten a decoded work into a row.
pub fn flatten(work: &Work) -> Result<FlatRow, SkipReason> {
    let id = work.id().ok_or(SkipReason::MissingId)?.to_string();
    let title = non_blank(work.title.as_deref())
        .or_else(|| non_blank(work.display_name.as_deref()))
        .ok_or_else(|| SkipReason::MissingTitle(id.clone()))?
        .to_string();

    let mut row = FlatRow {
        id,
        title,
        doi: text(&work.doi),
        abstract_text: work
            .abstract_inverted_index
            .as_ref()
            .map(reconstruct_abstract)
            .unwrap_or_default(),
        publication_year: work.publication_year,
        publication_date: text(&work.publication_date),
        created_date: text(&work.created_date),
        work_type: text(&work.work_type),
        type_crossref: text(&work.type_crossref),
        language: text(&work.language),
        cited_by_count: work.cited_by_count,
        is_retracted: work.is_retracted,
        is_paratext: work.is_paratext,
        relevance_score: work.relevance_score,
        ..Default::default()
    };

    // Venue
    if let Some(location) = &work.primary_location {
        row.is_accepted = location.is_accepted;
        row.license = text(&location.license);
        if let Some(source) = &location.source {
            row.journal = text(&source.display_name);
            row.publisher = text(&source.publisher);
            row.host_organization_name = text(&source.host_organization_name);
            row.host_venue_issn = source
                .issn
                .as_deref()
                .unwrap_or_default()
                .join(LIST_SEPARATOR);
        }
    }

    if let Some(oa) = &work.open_access {
        row.open_access = oa.is_oa;
        row.oa_status = text(&oa.oa_status);
    }

    // Authors, one slot per authorship
    let authorships = work.authorships.as_deref().unwrap_or_default();
    row.author_count = authorships.len();
    row.author_names = join_slots(authorships.iter().map(|a| {
        a.author
            .as_ref()
            .and_then(|author| author.display_name.as_deref())
    }));

    // First institution of each authorship
    let first_institutions: Vec<Option<&Institution>> = authorships
        .iter()
        .map(|a| a.institutions.as_deref().and_then(|i| i.first()))
        .collect();
    row.institution_names = join_slots(
        first_institutions
            .iter()
            .map(|i| i.and_then(|i| i.display_name.as_deref())),
    );
    row.institution_types = join_slots(
        first_institutions
            .iter()
            .map(|i| i.and_then(|i| i.institution_type.as_deref())),
    );
    row.country_codes = join_slots(
        first_institutions
            .iter()
            .map(|i| i.and_then(|i| i.country_code.as_deref())),
    );

    row.corresponding_authors = authorships
        .iter()
        .filter(|a| a.is_corresponding.unwrap_or(false))
        .filter_map(|a| a.author.as_ref().and_then(|author| author.display_name.clone()))
        .collect::<Vec<_>>()
        .join(LIST_SEPARATOR);

    let affiliations: Vec<String> = authorships
        .iter()
        .map(|a| {
            a.raw_affiliation_strings
                .as_deref()
                .unwrap_or_default()
                .join(AFFILIATION_SEPARATOR)
        })
        .collect();
    row.raw_affiliations = join_slots(affiliations.iter().map(|s| Some(s.as_str())));

    // Classification
    row.concepts = work
        .concepts
        .as_deref()
        .unwrap_or_default()
        .iter()
        .filter_map(concept_label)
        .collect::<Vec<_>>()
        .join(LIST_SEPARATOR);

    row.keywords = work
        .keywords
        .as_deref()
        .unwrap_or_default()
        .iter()
        .filter_map(|k| k.display_name.clone())
        .collect::<Vec<_>>()
        .join(LIST_SEPARATOR);

    let topics = work.topics.as_deref().unwrap_or_default();
    row.topics = join_slots(topics.iter().map(|t| t.display_name.as_deref()));
    row.subfields = join_slots(topics.iter().map(|t| named(&t.subfield)));
    row.fields = join_slots(topics.iter().map(|t| named(&t.field)));
    row.domains = join_slots(topics.iter().map(|t| named(&t.domain)));

    // References and funding
    let references: Vec<&str> = work
        .referenced_works
        .as_deref()
        .unwrap_or_default()
        .iter()
        .map(String::as_str)
        .collect();
    row.referenced_works_count = references.len();
    row.referenced_works = references.join(LIST_SEPARATOR);

    row.funding_details = work
        .grants
        .as_deref()
        .unwrap_or_default()
        .iter()
        .filter_map(|g| g.funder_display_name.clone())
        .collect::<Vec<_>>()
        .join(LIST_SEPARATOR);

    if let Some(counts) = &work.counts_by_year {
        row.counts_by_year = serde_json::to_string(counts).unwrap_or_default();
    }

    row.indexed_in = work
        .indexed_in
        .as_deref()
        .unwrap_or_default()
        .join(LIST_SEPARATOR);

    Ok(row)
}

/// Reconstruct abstract text from an inverted index.
///
/// OpenAlex ships abstracts as `{word: [positions]}`; words are put back in position
/// order. Anything that is not an object of integer arrays yields an empty string.
pub fn reconstruct_abstract(inverted_index: &Value) -> String {
    let Some(obj) = inverted_index.as_object() else {
        return String::new();
    };

    let mut words: Vec<(u64, &str)> = Vec::new();
    for (word, positions) in obj {
        if let Some(pos_array) = positions.as_array() {
            for pos in pos_array {
                if let Some(p) = pos.as_u64() {
                    words.push((p, word.as_str()));
                }
            }
        }
    }

    words.sort_by_key(|(pos, _)| *pos);
    words.iter().map(|(_, w)| *w).collect::<Vec<_>>().join(" ")
}

fn concept_label(concept: &Concept) -> Option<String> {
    let name = concept.display_name.as_deref()?;
    Some(match (concept.level, concept.score) {
        (Some(level), Some(score)) => format!("{} (level {}, score {:.3})", name, level, score),
        (Some(level), None) => format!("{} (level {})", name, level),
        (None, Some(score)) => format!("{} (score {:.3})", name, score),
        (None, None) => name.to_string(),
    })
}

/// Join positional values, keeping empty slots so parallel columns line up.
/// All-empty input yields an empty cell.
fn join_slots<'a>(values: impl Iterator<Item = Option<&'a str>>) -> String {
    let slots: Vec<&str> = values.map(|v| v.unwrap_or_default()).collect();
    if slots.iter().all(|s| s.is_empty()) {
        return String::new();
    }
    slots.join(LIST_SEPARATOR)
}

fn named(value: &Option<Named>) -> Option<&str> {
    value.as_ref().and_then(|n| n.display_name.as_deref())
}

fn text(value: &Option<String>) -> String {
    value.clone().unwrap_or_default()
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}
