//! Fixture-driven checks over the registered site adapters.

use jobgrid_adapters::{adapter_for_source, SourceAdapter};

const JOBSTREET_PAGE: &str = include_str!("../fixtures/jobstreet_listing.html");
const JOIMYANMAR_PAGE: &str = include_str!("../fixtures/joimyanmar_listing.html");

#[test]
fn registered_adapters_emit_only_ingestible_listings_with_absolute_urls() {
    for (source_id, page) in [("jobstreet", JOBSTREET_PAGE), ("joimyanmar", JOIMYANMAR_PAGE)] {
        let adapter = adapter_for_source(source_id, None, None).expect("registered adapter");
        let listings = adapter.parse(page);
        assert!(!listings.is_empty(), "{source_id} fixture should parse");
        for listing in &listings {
            assert!(listing.is_ingestible(), "{source_id} emitted a non-ingestible listing");
            assert!(
                listing.source_url.starts_with("https://"),
                "{source_id} emitted a relative URL: {}",
                listing.source_url
            );
            assert_eq!(listing.source_site, source_id);
        }
    }
}

#[test]
fn max_listings_override_applies_through_the_registry() {
    let adapter = adapter_for_source("jobstreet", None, Some(1)).expect("registered adapter");
    assert_eq!(adapter.parse(JOBSTREET_PAGE).len(), 1);
}
