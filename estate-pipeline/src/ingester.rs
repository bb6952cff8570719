// Copyright 2024 The NativeLink Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Listings ingester: bulk crawl and incremental catch-up-then-yield loop.
//!
//! Grounded on `original_source/src/scrapers/leboncoin/firstScrapper.py`
//! (bulk crawl) and `leboncoinLoopScrapper.py` (incremental loop).

use std::time::Duration;

use chrono::Utc;
use estate_error::Error;
use estate_fetcher::{Fetcher, ListingFilters, RawListing};
use estate_store::records::{is_blacklisted, Agency, Listing};
use estate_store::StoreTrait;
use rand::Rng;
use tracing::{event, Level};

/// Bulk-crawl page ceiling (`N <= 100` in the ingester's contract).
pub const MAX_BULK_PAGES: u32 = 100;

/// Lower/upper bound in seconds for the loop ingester's inter-cycle
/// sleep (2-5 minutes).
const LOOP_DELAY_SECS_MIN: u64 = 120;
const LOOP_DELAY_SECS_MAX: u64 = 300;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkCrawlSummary {
    pub pages_walked: u32,
    pub listings_upserted: u64,
    pub listings_rejected: u64,
}

/// Walks pages `1..=page_limit` (capped at [`MAX_BULK_PAGES`]),
/// normalising and upserting every listing into `Raw`. Stops once a page
/// comes back empty (source exhausted); a fetch failure propagates
/// immediately (the scheduler's retry/backoff envelope handles it).
pub async fn bulk_crawl(
    fetcher: &dyn Fetcher,
    store: &dyn StoreTrait,
    filters: &ListingFilters,
    page_limit: u32,
) -> Result<BulkCrawlSummary, Error> {
    let page_limit = page_limit.min(MAX_BULK_PAGES);
    let mut summary = BulkCrawlSummary::default();

    for page in 1..=page_limit {
        let listings = fetcher.fetch_listing_page(filters, page).await?;
        if listings.is_empty() {
            break;
        }
        summary.pages_walked += 1;
        for raw in listings {
            if ingest_one(store, raw).await? {
                summary.listings_upserted += 1;
            } else {
                summary.listings_rejected += 1;
            }
        }
    }
    event!(Level::INFO, pages = summary.pages_walked, upserted = summary.listings_upserted, "bulk crawl finished");
    Ok(summary)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoopCycleSummary {
    pub pages_walked: u32,
    pub listings_upserted: u64,
    pub stopped_early: bool,
}

/// Runs one cycle of the incremental loop: walks from page 1 until
/// either the source runs dry or two consecutive listings on the same
/// page already exist in `Raw` unchanged (same `id_sec`, `title`,
/// `price`) — the "catch-up-then-yield" heuristic described in the
/// ingester's contract (new listings are prepended upstream, so two
/// known items in a row imply the rest of the page is already ingested).
pub async fn incremental_loop_once(
    fetcher: &dyn Fetcher,
    store: &dyn StoreTrait,
    filters: &ListingFilters,
) -> Result<LoopCycleSummary, Error> {
    let mut summary = LoopCycleSummary::default();
    let mut page = 1u32;

    loop {
        let listings = fetcher.fetch_listing_page(filters, page).await?;
        if listings.is_empty() {
            break;
        }
        summary.pages_walked += 1;

        let mut consecutive_known = 0u32;
        for raw in listings {
            let already_known = listing_unchanged_in_raw(store, &raw).await?;
            consecutive_known = if already_known { consecutive_known + 1 } else { 0 };

            if ingest_one(store, raw).await? {
                summary.listings_upserted += 1;
            }

            if consecutive_known >= 2 {
                summary.stopped_early = true;
                event!(Level::DEBUG, page, "loop ingester stopping early: two consecutive known listings");
                return Ok(summary);
            }
        }
        page += 1;
    }
    Ok(summary)
}

/// A randomised 2-5 minute delay between loop cycles.
#[must_use]
pub fn next_cycle_delay() -> Duration {
    Duration::from_secs(rand::thread_rng().gen_range(LOOP_DELAY_SECS_MIN..=LOOP_DELAY_SECS_MAX))
}

async fn listing_unchanged_in_raw(store: &dyn StoreTrait, raw: &RawListing) -> Result<bool, Error> {
    let existing = store.find_raw_by_id_sec(&raw.id_sec).await?;
    Ok(matches!(existing, Some(existing) if existing.title == raw.title && existing.price == raw.price))
}

/// Normalises and upserts one raw listing into `Raw`. Returns `false`
/// (rejected, not upserted) for a blacklisted `store_id`, an empty
/// `id_sec`, or a negative `price` — defensive checks present in the
/// source scrapers though not called out explicitly in the contract.
async fn ingest_one(store: &dyn StoreTrait, raw: RawListing) -> Result<bool, Error> {
    if raw.id_sec.trim().is_empty() {
        return Ok(false);
    }
    if raw.price.is_some_and(|p| p < 0.0) {
        return Ok(false);
    }
    if raw.store_id.as_deref().is_some_and(is_blacklisted) {
        return Ok(false);
    }

    let mut listing = normalise(raw);

    if let (Some(store_id), Some(agency_name)) = (listing.store_id.clone(), listing.agency_name.clone()) {
        let hint = Agency {
            _id: None,
            store_id,
            name: agency_name,
            lien: String::new(),
            code_siren: None,
            logo: None,
            adresse: None,
            zone_intervention: None,
            site_web: None,
            horaires: None,
            number: None,
            description: None,
            scraped: false,
            scraped_at: None,
        };
        let agency_id = store.upsert_agency_brute(&hint).await?;
        listing.id_agence = Some(agency_id);
    }

    listing.recompute_nbr_images();
    store.upsert_raw(&listing).await?;
    Ok(true)
}

fn normalise(raw: RawListing) -> Listing {
    let mut listing = Listing {
        _id: None,
        id_sec: raw.id_sec,
        title: raw.title,
        price: raw.price,
        publication_date: raw.publication_date,
        index_date: None,
        expiration_date: None,
        body: raw.body,
        surface: raw.surface,
        rooms: raw.rooms,
        bedrooms: None,
        energy_class: None,
        city: raw.city,
        postal_code: raw.postal_code,
        department: None,
        latitude: None,
        longitude: None,
        property_type: None,
        transaction_type: None,
        land_surface: None,
        floor: None,
        number_of_floors: None,
        construction_year: None,
        has_elevator: None,
        has_balcony: None,
        has_parking: None,
        has_cellar: None,
        heating_type: None,
        charges: None,
        deposit: None,
        furnished: None,
        images: raw.images,
        nbr_images: 0,
        store_id: raw.store_id,
        agency_name: raw.agency_name,
        id_agence: None,
        no_agency_found: false,
        scraped_at: Some(Utc::now()),
        processed_at: None,
        processed: false,
    };
    listing.enforce_body_limit();
    listing
}

#[cfg(test)]
mod tests {
    use super::*;
    use estate_fetcher::StaticFetcher;
    use estate_store::MemoryStore;
    use pretty_assertions::assert_eq;

    fn raw(id_sec: &str, title: &str, price: f64) -> RawListing {
        RawListing {
            id_sec: id_sec.to_string(),
            title: title.to_string(),
            price: Some(price),
            publication_date: None,
            body: None,
            surface: None,
            rooms: None,
            city: None,
            postal_code: None,
            images: vec![],
            store_id: None,
            agency_name: None,
        }
    }

    #[tokio::test]
    async fn negative_price_is_rejected_before_any_store_call() {
        let store = MemoryStore::new();
        let accepted = ingest_one(&store, raw("L1", "T", -5.0)).await.unwrap();
        assert!(!accepted);
        assert!(store.raw_snapshot().is_empty());
    }

    #[test]
    fn blacklisted_store_id_is_detected() {
        assert!(is_blacklisted("5608823"));
        assert!(!is_blacklisted("S1"));
    }

    #[test]
    fn normalise_truncates_overlong_body() {
        let mut r = raw("L1", "T", 1.0);
        r.body = Some("a".repeat(estate_store::records::BODY_MAX_LEN + 100));
        let listing = normalise(r);
        assert_eq!(listing.body.unwrap().chars().count(), estate_store::records::BODY_MAX_LEN);
    }

    #[tokio::test]
    async fn static_fetcher_page_exhaustion_matches_bulk_crawl_contract() {
        let fetcher = StaticFetcher::new().with_page(vec![raw("L1", "T", 1.0)]);
        let filters = ListingFilters::default();
        assert_eq!(fetcher.fetch_listing_page(&filters, 1).await.unwrap().len(), 1);
        assert!(fetcher.fetch_listing_page(&filters, 2).await.unwrap().is_empty());
    }
}
