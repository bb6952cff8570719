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

//! Abstract source of listings and agency details.
//!
//! The real implementation (browser automation, CAPTCHA handling,
//! anti-bot evasion) is an external collaborator and out of scope; this
//! crate only fixes the contract the pipeline stages code against, plus
//! a deterministic in-memory double for the pipeline's own tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use estate_error::Error;

/// Opaque query the pipeline passes through to a real Fetcher
/// implementation unexamined; its shape is a production concern.
#[derive(Debug, Clone, Default)]
pub struct ListingFilters {
    pub query: Option<String>,
}

/// One listing as returned by the source, before normalisation into a
/// `Listing` record.
#[derive(Debug, Clone, PartialEq)]
pub struct RawListing {
    pub id_sec: String,
    pub title: String,
    pub price: Option<f64>,
    pub publication_date: Option<DateTime<Utc>>,
    pub body: Option<String>,
    pub surface: Option<f64>,
    pub rooms: Option<u32>,
    pub city: Option<String>,
    pub postal_code: Option<String>,
    pub images: Vec<String>,
    pub store_id: Option<String>,
    pub agency_name: Option<String>,
}

/// Agency-related fields extracted from a listing's detail page.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ListingDetail {
    pub agency_link: Option<String>,
    pub agency_name: Option<String>,
    pub store_id: Option<String>,
}

/// Outcome of fetching a listing's detail page: either fields, or a
/// signal that the source page no longer exists.
#[derive(Debug, Clone, PartialEq)]
pub enum DetailOutcome {
    Found(ListingDetail),
    PageGone,
}

/// Fields scraped from an agency's detail page.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AgencyFields {
    pub store_id: String,
    pub name: String,
    pub lien: String,
    pub code_siren: Option<String>,
    pub logo: Option<String>,
    pub adresse: Option<String>,
    pub zone_intervention: Option<String>,
    pub site_web: Option<String>,
    pub horaires: Option<String>,
    pub number: Option<String>,
    pub description: Option<String>,
}

/// The three operations the core pipeline depends on. A page-at-a-time
/// shape stands in for the "stream of listings" described at the
/// contract level: it's the simplest interface that preserves
/// page-order and a `page_limit`, without forcing every Fetcher
/// implementation to produce a boxed async stream.
///
/// Every method may fail with a transient or permanent `Error`, per
/// `estate_error::Code`; the one outcome the pipeline distinguishes
/// explicitly is `DetailOutcome::PageGone`, which the Agency Resolver
/// treats as a signal to delete the offending `Raw` record rather than
/// an error.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Returns the listings on `page` (1-indexed), or an empty vec once
    /// the source has no more pages. May contain duplicates across
    /// calls; the caller deduplicates on `id_sec`.
    async fn fetch_listing_page(&self, filters: &ListingFilters, page: u32) -> Result<Vec<RawListing>, Error>;

    async fn fetch_listing_detail(&self, listing_url: &str) -> Result<DetailOutcome, Error>;

    async fn fetch_agency_detail(&self, agency_url: &str) -> Result<AgencyFields, Error>;
}

/// Deterministic in-memory `Fetcher` fed from fixed data, for the
/// pipeline's own tests. Not a fixture-file reader: tests build the
/// pages/details/agencies inline so they don't depend on file-system
/// layout.
#[derive(Debug, Clone, Default)]
pub struct StaticFetcher {
    /// `pages[n]` is the content of page `n+1`.
    pub pages: Vec<Vec<RawListing>>,
    pub details: Vec<(String, DetailOutcome)>,
    pub agencies: Vec<(String, AgencyFields)>,
}

impl StaticFetcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_page(mut self, listings: Vec<RawListing>) -> Self {
        self.pages.push(listings);
        self
    }

    #[must_use]
    pub fn with_detail(mut self, listing_url: impl Into<String>, outcome: DetailOutcome) -> Self {
        self.details.push((listing_url.into(), outcome));
        self
    }

    #[must_use]
    pub fn with_agency(mut self, agency_url: impl Into<String>, fields: AgencyFields) -> Self {
        self.agencies.push((agency_url.into(), fields));
        self
    }
}

#[async_trait]
impl Fetcher for StaticFetcher {
    async fn fetch_listing_page(&self, _filters: &ListingFilters, page: u32) -> Result<Vec<RawListing>, Error> {
        if page == 0 {
            return Err(estate_error::make_err!(
                estate_error::Code::InvalidArgument,
                "pages are 1-indexed"
            ));
        }
        Ok(self.pages.get((page - 1) as usize).cloned().unwrap_or_default())
    }

    async fn fetch_listing_detail(&self, listing_url: &str) -> Result<DetailOutcome, Error> {
        self.details
            .iter()
            .find(|(url, _)| url == listing_url)
            .map(|(_, outcome)| outcome.clone())
            .ok_or_else(|| {
                estate_error::make_err!(estate_error::Code::NotFound, "no fixture detail for {listing_url}")
            })
    }

    async fn fetch_agency_detail(&self, agency_url: &str) -> Result<AgencyFields, Error> {
        self.agencies
            .iter()
            .find(|(url, _)| url == agency_url)
            .map(|(_, fields)| fields.clone())
            .ok_or_else(|| {
                estate_error::make_err!(estate_error::Code::NotFound, "no fixture agency for {agency_url}")
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn listing(id_sec: &str) -> RawListing {
        RawListing {
            id_sec: id_sec.to_string(),
            title: "T".to_string(),
            price: Some(100.0),
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
    async fn pages_are_returned_in_order_and_exhaust_to_empty() {
        let fetcher = StaticFetcher::new().with_page(vec![listing("L1")]).with_page(vec![listing("L2")]);
        let filters = ListingFilters::default();

        assert_eq!(fetcher.fetch_listing_page(&filters, 1).await.unwrap(), vec![listing("L1")]);
        assert_eq!(fetcher.fetch_listing_page(&filters, 2).await.unwrap(), vec![listing("L2")]);
        assert_eq!(fetcher.fetch_listing_page(&filters, 3).await.unwrap(), vec![]);
    }

    #[tokio::test]
    async fn zero_page_is_rejected() {
        let fetcher = StaticFetcher::new();
        let err = fetcher
            .fetch_listing_page(&ListingFilters::default(), 0)
            .await
            .unwrap_err();
        assert_eq!(err.code, estate_error::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn detail_lookup_honours_page_gone() {
        let fetcher = StaticFetcher::new().with_detail("https://x/1", DetailOutcome::PageGone);
        assert_eq!(fetcher.fetch_listing_detail("https://x/1").await.unwrap(), DetailOutcome::PageGone);
    }

    #[tokio::test]
    async fn unknown_detail_url_is_not_found() {
        let fetcher = StaticFetcher::new();
        let err = fetcher.fetch_listing_detail("https://x/missing").await.unwrap_err();
        assert_eq!(err.code, estate_error::Code::NotFound);
    }
}
