use std::collections::BTreeSet;
use std::path::Path;

use jobwatch_adapters::parse_listings;
use jobwatch_core::{JobRecord, Snapshot};

fn fixture_html() -> String {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/listing_sample.html");
    std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
}

#[test]
fn fixture_rows_become_complete_listings() {
    let listings = parse_listings(&fixture_html()).expect("parse fixture");

    // header and the row without a schedule are skipped; the duplicate row is kept here
    assert_eq!(listings.len(), 4);
    for listing in &listings {
        assert!(!listing.title.is_empty());
        assert!(!listing.date.is_empty());
        assert!(!listing.time_range.is_empty());
        assert!(!listing.duration.is_empty());
        assert!(listing.wage.ends_with("Kč/h"));
    }

    let locations = listings
        .iter()
        .map(|l| l.location.as_str())
        .collect::<BTreeSet<_>>();
    assert_eq!(locations, BTreeSet::from(["Liberec", "Ostrava", "Praha"]));

    let building = listings
        .iter()
        .find(|l| l.location == "Ostrava")
        .expect("ostrava row");
    assert_eq!(building.title, "Pomocník na stavbě");
    assert_eq!(building.day_of_week, "So");
    assert_eq!(building.time_range, "07:00 - 15:30");
    assert_eq!(building.duration, "8.5");
    assert_eq!(building.wage, "205 Kč/h");
}

#[test]
fn duplicate_rows_collapse_by_identity() {
    let snapshot: Snapshot = parse_listings(&fixture_html())
        .expect("parse fixture")
        .into_iter()
        .map(JobRecord::new)
        .collect();

    assert_eq!(snapshot.len(), 3);
}
