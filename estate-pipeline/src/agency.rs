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

//! Agency resolver (spec §4.F): runs in the night window, promoting
//! `Raw` records into `WithAgency` once an agency identity is resolved.

use chrono::Utc;
use estate_error::Error;
use estate_fetcher::{DetailOutcome, Fetcher};
use estate_store::records::{is_blacklisted, Agency};
use estate_store::StoreTrait;
use tracing::{event, Level};

/// Batch size pulled from `Raw` per sweep; mirrors the image processor's
/// batch size (spec §4.G) since both stages share the same
/// cursor-over-a-durable-queue shape.
pub const BATCH_SIZE: i64 = 20;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolveSweepSummary {
    pub examined: u64,
    pub promoted: u64,
    pub no_agency: u64,
    pub deleted_gone: u64,
    pub deleted_blacklisted: u64,
}

/// Runs one sweep over `Raw` records that are not yet in `WithAgency`
/// and not marked `no_agency_found`, resolving each one's agency and
/// promoting it. A record the Fetcher reports as gone is deleted from
/// `Raw`; a record whose detail page carries no agency link is marked
/// `no_agency_found=true` and left alone (it will not be retried).
pub async fn resolve_sweep(fetcher: &dyn Fetcher, store: &dyn StoreTrait) -> Result<ResolveSweepSummary, Error> {
    let mut summary = ResolveSweepSummary::default();

    let candidates = store.find_raw_unresolved(BATCH_SIZE).await?;
    // Authoritative dedup is WithAgency's unique key on id_sec; this is
    // only a batch-level pre-filter to skip redundant work, same
    // rationale as the image processor's Final-membership check.
    let already_resolved = store.with_agency_id_secs().await?;

    for mut listing in candidates {
        if already_resolved.contains(&listing.id_sec) {
            continue;
        }
        summary.examined += 1;

        if listing.store_id.as_deref().is_some_and(is_blacklisted) {
            store.delete_raw_by_id_sec(&listing.id_sec).await.ok();
            summary.deleted_blacklisted += 1;
            continue;
        }

        let detail_url = format!("listing:{}", listing.id_sec);
        match fetcher.fetch_listing_detail(&detail_url).await? {
            DetailOutcome::PageGone => {
                store.delete_raw_by_id_sec(&listing.id_sec).await.ok();
                summary.deleted_gone += 1;
                continue;
            }
            DetailOutcome::Found(detail) => {
                let Some(agency_link) = detail.agency_link else {
                    store.mark_raw_no_agency_found(&listing.id_sec).await.ok();
                    summary.no_agency += 1;
                    continue;
                };

                let Some(store_id) = detail.store_id.or(listing.store_id.clone()) else {
                    summary.no_agency += 1;
                    continue;
                };
                if is_blacklisted(&store_id) {
                    store.delete_raw_by_id_sec(&listing.id_sec).await.ok();
                    summary.deleted_blacklisted += 1;
                    continue;
                }

                let resolved_id = resolve_agency_id(fetcher, store, &store_id, &agency_link, detail.agency_name).await?;

                listing.id_agence = Some(resolved_id);
                listing.processed = false;
                store.upsert_with_agency(&listing).await?;
                summary.promoted += 1;
            }
        }
    }

    event!(Level::INFO, examined = summary.examined, promoted = summary.promoted, "agency resolve sweep finished");
    Ok(summary)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnrichSweepSummary {
    pub examined: u64,
    pub enriched: u64,
    pub promoted: u64,
}

/// Night-time `agence_brute` enrichment (spec §3 supplement): fetches
/// full detail for `AgencyBrute` rows still at `scraped=false` — the
/// shallow hints the ingester and image processor create from listing-page
/// agency names alone — and flips `scraped=true` once fetched. This is
/// the only stage allowed to make that flip; `agence_notexisting`
/// (`resolve_sweep`) only ever creates shallow rows or reuses existing
/// ones.
pub async fn enrich_sweep(fetcher: &dyn Fetcher, store: &dyn StoreTrait) -> Result<EnrichSweepSummary, Error> {
    let mut summary = EnrichSweepSummary::default();

    let candidates = store.find_unscraped_agency_brute(BATCH_SIZE).await?;

    for agency in candidates {
        summary.examined += 1;
        if is_blacklisted(&agency.store_id) {
            continue;
        }

        let detail_url = if agency.lien.is_empty() {
            format!("agency:{}", agency.store_id)
        } else {
            agency.lien.clone()
        };

        let fields = match fetcher.fetch_agency_detail(&detail_url).await {
            Ok(fields) => fields,
            Err(err) if err.is_transient() => {
                event!(Level::WARN, store_id = %agency.store_id, %err, "agency detail fetch failed transiently, deferring");
                continue;
            }
            Err(err) => {
                event!(Level::WARN, store_id = %agency.store_id, %err, "agency detail fetch failed permanently, leaving unscraped");
                continue;
            }
        };

        let incoming = Agency {
            _id: None,
            store_id: agency.store_id.clone(),
            name: fields.name,
            lien: fields.lien,
            code_siren: fields.code_siren,
            logo: fields.logo,
            adresse: fields.adresse,
            zone_intervention: fields.zone_intervention,
            site_web: fields.site_web,
            horaires: fields.horaires,
            number: fields.number,
            description: fields.description,
            scraped: true,
            scraped_at: Some(Utc::now()),
        };
        let mut enriched = agency.clone();
        enriched.merge_from(&incoming);
        if !incoming.name.is_empty() {
            enriched.name = incoming.name;
        }
        if !incoming.lien.is_empty() {
            enriched.lien = incoming.lien;
        }

        store.upsert_agency_brute(&enriched).await?;
        summary.enriched += 1;

        if enriched.completeness_score() > 0 {
            let mut to_promote = enriched;
            if let Some(id) = store
                .find_agency_brute_by_store_id(&to_promote.store_id)
                .await?
                .and_then(|a| a._id)
            {
                to_promote._id = Some(id);
            }
            store.promote_agency_to_final(&to_promote).await?;
            summary.promoted += 1;
        }
    }

    event!(Level::INFO, examined = summary.examined, enriched = summary.enriched, "agency brute enrichment sweep finished");
    Ok(summary)
}

/// Resolves `store_id`'s agency `_id`, preferring an already-promoted
/// `AgencyFinal` row, then falling back to fetching agency detail and
/// upserting into `AgencyBrute`/`AgencyFinal` with the same id.
async fn resolve_agency_id(
    fetcher: &dyn Fetcher,
    store: &dyn StoreTrait,
    store_id: &str,
    agency_link: &str,
    agency_name: Option<String>,
) -> Result<bson::oid::ObjectId, Error> {
    if let Some(existing) = store.find_agency_final_by_store_id(store_id).await? {
        if let Some(id) = existing._id {
            return Ok(id);
        }
    }

    let fields = fetcher.fetch_agency_detail(agency_link).await?;
    let agency = Agency {
        _id: None,
        store_id: store_id.to_string(),
        name: if fields.name.is_empty() { agency_name.unwrap_or_default() } else { fields.name },
        lien: agency_link.to_string(),
        code_siren: fields.code_siren,
        logo: fields.logo,
        adresse: fields.adresse,
        zone_intervention: fields.zone_intervention,
        site_web: fields.site_web,
        horaires: fields.horaires,
        number: fields.number,
        description: fields.description,
        scraped: true,
        scraped_at: Some(Utc::now()),
    };

    let id = store.upsert_agency_brute(&agency).await?;
    let mut to_promote = agency;
    to_promote._id = Some(id);
    store.promote_agency_to_final(&to_promote).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use estate_fetcher::{AgencyFields, StaticFetcher};
    use estate_store::MemoryStore;
    use pretty_assertions::assert_eq;

    fn shallow_agency(store_id: &str) -> Agency {
        Agency {
            _id: None,
            store_id: store_id.to_string(),
            name: "Hint Name".to_string(),
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
        }
    }

    #[tokio::test]
    async fn enrich_sweep_fills_fields_flips_scraped_and_promotes() {
        let store = MemoryStore::new();
        store.seed_agency_brute(shallow_agency("S9"));

        let fetcher = StaticFetcher::new().with_agency(
            "agency:S9",
            AgencyFields {
                store_id: "S9".to_string(),
                name: "Real Name".to_string(),
                lien: "https://agency/S9".to_string(),
                code_siren: Some("123456789".to_string()),
                logo: None,
                adresse: Some("1 Rue Example".to_string()),
                zone_intervention: None,
                site_web: None,
                horaires: None,
                number: None,
                description: None,
            },
        );

        let summary = enrich_sweep(&fetcher, &store).await.unwrap();
        assert_eq!(summary.examined, 1);
        assert_eq!(summary.enriched, 1);
        assert_eq!(summary.promoted, 1);

        let enriched = store.find_agency_brute_by_store_id("S9").await.unwrap().unwrap();
        assert!(enriched.scraped);
        assert_eq!(enriched.name, "Real Name");
        assert_eq!(enriched.lien, "https://agency/S9");
        assert_eq!(enriched.adresse, Some("1 Rue Example".to_string()));
        assert_eq!(enriched.completeness_score(), 2);

        assert!(store.find_agency_final_by_store_id("S9").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn enrich_sweep_skips_blacklisted_store_ids() {
        let store = MemoryStore::new();
        store.seed_agency_brute(shallow_agency("5608823"));
        let fetcher = StaticFetcher::new();

        let summary = enrich_sweep(&fetcher, &store).await.unwrap();
        assert_eq!(summary.examined, 1);
        assert_eq!(summary.enriched, 0);
        let untouched = store.find_agency_brute_by_store_id("5608823").await.unwrap().unwrap();
        assert!(!untouched.scraped);
    }
}
