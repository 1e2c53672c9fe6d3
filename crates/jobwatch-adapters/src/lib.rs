//! Listing-page extraction: HTML table rows → candidate job listings.

use std::sync::LazyLock;

use jobwatch_core::JobListing;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;

pub const CRATE_NAME: &str = "jobwatch-adapters";

/// Cities matched inside the text before the date to split title from location.
pub const DEFAULT_CITY_KEYWORDS: &[&str] = &[
    "Praha",
    "Brno",
    "Ostrava",
    "Plzeň",
    "Liberec",
    "Olomouc",
    "České Budějovice",
    "Hradec Králové",
    "Ústí nad Labem",
    "Pardubice",
    "Zlín",
    "Havířov",
    "Kladno",
    "Most",
    "Opava",
    "Frýdek-Místek",
    "Karlovy Vary",
    "Jihlava",
    "Teplice",
];

const UNKNOWN: &str = "Unknown";
const TITLE_FALLBACK_CHARS: usize = 100;
const MIN_ROW_CHARS: usize = 10;

static JOB_ROW: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"».*\d{1,2}\.\d{1,2}\.\d{4}.*\d{1,2}:\d{2}\s*-\s*\d{1,2}:\d{2}.*\(\d+(?:\.\d+)?\s*h\).*\d+\s*Kč")
        .expect("valid job row regex")
});
static WAGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\d+)\s*Kč\s*/?\s*h").expect("valid wage regex"));
static DATE_WITH_WEEKDAY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d{1,2}\.\d{1,2}\.\d{4})\s+(Po|Út|St|Čt|Pá|So|Ne)\b").expect("valid date regex")
});
static DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{1,2}\.\d{1,2}\.\d{4})").expect("valid date regex"));
static DATE_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{1,2}\.\d{1,2}\.\d{4}").expect("valid date token regex"));
static TIME_RANGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d{1,2}:\d{2})\s*-\s*(\d{1,2}:\d{2})").expect("valid time range regex")
});
static DURATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\((\d+(?:\.\d+)?)\s*h\)").expect("valid duration regex"));

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid selector {selector}: {message}")]
    Selector { selector: String, message: String },
}

/// Turns a fetched listing page into candidate listings. Only fully populated
/// listings are returned.
pub trait ListingExtractor: Send + Sync {
    fn site_id(&self) -> &'static str;

    fn parse_listing(&self, html: &str) -> Result<Vec<JobListing>, AdapterError>;
}

/// Extractor for the brigoska.cz job table, where each `<tr>` reads like
/// `» Title City 26.1.2026 Po 06:00 - 14:00 (8h) 180 Kč/h`.
#[derive(Debug, Clone)]
pub struct JobTableAdapter {
    city_keywords: Vec<String>,
}

impl Default for JobTableAdapter {
    fn default() -> Self {
        Self::with_city_keywords(DEFAULT_CITY_KEYWORDS.iter().copied())
    }
}

impl JobTableAdapter {
    pub fn with_city_keywords<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            city_keywords: keywords.into_iter().map(Into::into).collect(),
        }
    }

    fn parse_row(&self, raw_text: &str) -> Option<JobListing> {
        if raw_text.chars().count() < MIN_ROW_CHARS {
            return None;
        }

        let mut date = String::new();
        let mut day_of_week = String::new();
        let mut time_range = String::new();
        let mut duration = String::new();

        if let Some(caps) = DATE_WITH_WEEKDAY.captures(raw_text) {
            date = caps[1].to_string();
            day_of_week = caps[2].to_string();
        } else if let Some(caps) = DATE.captures(raw_text) {
            date = caps[1].to_string();
        }

        if !date.is_empty() {
            if let Some(caps) = TIME_RANGE.captures(raw_text) {
                time_range = format!("{} - {}", &caps[1], &caps[2]);
            }
            if let Some(caps) = DURATION.captures(raw_text) {
                duration = caps[1].to_string();
            }
        }

        let wage = WAGE
            .captures(raw_text)
            .map(|caps| format!("{} Kč/h", &caps[1]))
            .unwrap_or_default();

        let (mut title, location) = self.split_title_and_location(raw_text);
        if title.is_empty() {
            title = raw_text.chars().take(TITLE_FALLBACK_CHARS).collect();
        }

        Some(JobListing {
            title: non_empty_or_unknown(title),
            location: non_empty_or_unknown(location),
            date,
            day_of_week,
            time_range,
            duration,
            wage,
            raw_text: raw_text.to_string(),
        })
    }

    /// Splits the words before the first date token into (title, location).
    fn split_title_and_location(&self, raw_text: &str) -> (String, String) {
        let words: Vec<&str> = raw_text.split_whitespace().collect();
        let date_idx = match words.iter().position(|w| DATE_TOKEN.is_match(w)) {
            Some(idx) if idx > 0 => idx,
            _ => return (String::new(), String::new()),
        };

        let joined = words[..date_idx].join(" ");
        let before_date = joined.trim_start_matches(['»', ' ']).trim();

        for keyword in &self.city_keywords {
            if let Some(city_idx) = before_date.find(keyword.as_str()) {
                return (
                    before_date[..city_idx].trim().to_string(),
                    before_date[city_idx..].trim().to_string(),
                );
            }
        }

        match before_date.rsplit_once(' ') {
            Some((title, city)) => (title.trim().to_string(), city.to_string()),
            None => (before_date.to_string(), String::new()),
        }
    }
}

impl ListingExtractor for JobTableAdapter {
    fn site_id(&self) -> &'static str {
        "brigoska"
    }

    fn parse_listing(&self, html: &str) -> Result<Vec<JobListing>, AdapterError> {
        let document = Html::parse_document(html);
        let rows = parse_selector("tr")?;

        Ok(document
            .select(&rows)
            .map(row_text)
            .filter(|text| looks_like_job_row(text))
            .filter_map(|text| self.parse_row(&text))
            .filter(is_complete)
            .collect())
    }
}

/// Extracts listings with the default adapter.
pub fn parse_listings(html: &str) -> Result<Vec<JobListing>, AdapterError> {
    JobTableAdapter::default().parse_listing(html)
}

fn parse_selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Selector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

/// Text nodes of the row, trimmed, joined by single spaces.
fn row_text(row: ElementRef<'_>) -> String {
    row.text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

fn looks_like_job_row(text: &str) -> bool {
    !text.is_empty() && text.contains('»') && WAGE.is_match(text) && JOB_ROW.is_match(text)
}

fn is_complete(listing: &JobListing) -> bool {
    !listing.wage.is_empty()
        && !listing.date.is_empty()
        && !listing.time_range.is_empty()
        && !listing.duration.is_empty()
}

fn non_empty_or_unknown(value: String) -> String {
    if value.is_empty() {
        UNKNOWN.to_string()
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(rows: &[&str]) -> String {
        let body = rows
            .iter()
            .map(|row| format!("<tr>{row}</tr>"))
            .collect::<Vec<_>>()
            .join("\n");
        format!("<html><body><table>{body}</table></body></html>")
    }

    #[test]
    fn parses_a_complete_row() {
        let html = table(&[
            "<td>» Skladník Praha</td><td>26.1.2026 Po</td><td>06:00 - 14:00 (8h)</td><td>180 Kč/h</td>",
        ]);

        let listings = parse_listings(&html).expect("parse");
        assert_eq!(listings.len(), 1);
        let job = &listings[0];
        assert_eq!(job.title, "Skladník");
        assert_eq!(job.location, "Praha");
        assert_eq!(job.date, "26.1.2026");
        assert_eq!(job.day_of_week, "Po");
        assert_eq!(job.time_range, "06:00 - 14:00");
        assert_eq!(job.duration, "8");
        assert_eq!(job.wage, "180 Kč/h");
        assert_eq!(
            job.raw_text,
            "» Skladník Praha 26.1.2026 Po 06:00 - 14:00 (8h) 180 Kč/h"
        );
    }

    #[test]
    fn multi_word_city_keyword_splits_title() {
        let html = table(&[
            "<td>» Pomocná síla do kuchyně Hradec Králové 3.2.2026 Út 10:00-18:30 (8.5 h) 195 Kč / h</td>",
        ]);

        let listings = parse_listings(&html).expect("parse");
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].title, "Pomocná síla do kuchyně");
        assert_eq!(listings[0].location, "Hradec Králové");
        assert_eq!(listings[0].time_range, "10:00 - 18:30");
        assert_eq!(listings[0].duration, "8.5");
        assert_eq!(listings[0].wage, "195 Kč/h");
    }

    #[test]
    fn unknown_city_falls_back_to_last_word() {
        let html = table(&["<td>» Brigáda na poli Čáslav 7.2.2026 So 07:00 - 15:00 (8h) 170 Kč/h</td>"]);

        let listings = parse_listings(&html).expect("parse");
        assert_eq!(listings[0].title, "Brigáda na poli");
        assert_eq!(listings[0].location, "Čáslav");
    }

    #[test]
    fn missing_weekday_is_an_empty_string() {
        let html = table(&["<td>» Úklid kanceláří Brno 9.2.2026 18:00 - 21:00 (3h) 160 Kč/h</td>"]);

        let listings = parse_listings(&html).expect("parse");
        assert_eq!(listings[0].day_of_week, "");
        assert_eq!(listings[0].location, "Brno");
    }

    #[test]
    fn rows_missing_required_fields_are_dropped() {
        let html = table(&[
            // no duration
            "<td>» Skladník Praha 26.1.2026 Po 06:00 - 14:00 180 Kč/h</td>",
            // no bullet
            "<td>Skladník Praha 26.1.2026 Po 06:00 - 14:00 (8h) 180 Kč/h</td>",
            // no wage
            "<td>» Skladník Praha 26.1.2026 Po 06:00 - 14:00 (8h)</td>",
            "<th>Pozice</th><th>Datum</th>",
        ]);

        assert!(parse_listings(&html).expect("parse").is_empty());
    }

    #[test]
    fn empty_and_unrelated_html_yield_nothing() {
        assert!(parse_listings("").expect("parse").is_empty());
        assert!(parse_listings("<html><body><h1>Some other content</h1></body></html>")
            .expect("parse")
            .is_empty());
    }

    #[test]
    fn custom_city_keywords_take_precedence_in_order() {
        let adapter = JobTableAdapter::with_city_keywords(["Mladá Boleslav"]);
        let html = table(&["<td>» Montáž Mladá Boleslav 2.2.2026 Po 06:00 - 14:00 (8h) 210 Kč/h</td>"]);

        let listings = adapter.parse_listing(&html).expect("parse");
        assert_eq!(listings[0].title, "Montáž");
        assert_eq!(listings[0].location, "Mladá Boleslav");
        assert_eq!(adapter.site_id(), "brigoska");
    }
}
