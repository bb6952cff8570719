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

//! In-memory [`StoreTrait`] double, mirroring the teacher's
//! `cas/store/memory_store.rs`: a mutex-guarded map standing in for the
//! backing store so the pipeline stages can be driven by real tests
//! without a live MongoDB deployment.

use std::sync::Mutex;

use async_trait::async_trait;
use bson::oid::ObjectId;
use estate_error::Error;

use crate::records::{Agency, Listing};
use crate::store_trait::StoreTrait;

#[derive(Default)]
struct Collections {
    raw: Vec<Listing>,
    with_agency: Vec<Listing>,
    final_: Vec<Listing>,
    agency_brute: Vec<Agency>,
    agency_final: Vec<Agency>,
}

/// Stands in for [`crate::Store`] in tests: same [`StoreTrait`]
/// contract, no network I/O, no durability across process restarts.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Collections>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every row currently in `Final`, for assertions.
    #[must_use]
    pub fn final_snapshot(&self) -> Vec<Listing> {
        self.inner.lock().unwrap().final_.clone()
    }

    /// Snapshot of every row currently in `WithAgency`, for assertions.
    #[must_use]
    pub fn with_agency_snapshot(&self) -> Vec<Listing> {
        self.inner.lock().unwrap().with_agency.clone()
    }

    /// Snapshot of every row currently in `Raw`, for assertions.
    #[must_use]
    pub fn raw_snapshot(&self) -> Vec<Listing> {
        self.inner.lock().unwrap().raw.clone()
    }

    /// Seeds `AgencyBrute` directly, bypassing the upsert merge rule —
    /// used to set up fixture rows a test then resolves/promotes.
    pub fn seed_agency_brute(&self, mut agency: Agency) -> ObjectId {
        let id = agency._id.unwrap_or_else(ObjectId::new);
        agency._id = Some(id);
        self.inner.lock().unwrap().agency_brute.push(agency);
        id
    }
}

fn upsert_listing(collection: &mut Vec<Listing>, listing: &Listing) -> bool {
    if let Some(slot) = collection.iter_mut().find(|l| l.id_sec == listing.id_sec) {
        *slot = listing.clone();
        false
    } else {
        collection.push(listing.clone());
        true
    }
}

fn upsert_agency_merging(collection: &mut Vec<Agency>, agency: &Agency) -> ObjectId {
    if let Some(slot) = collection.iter_mut().find(|a| a.store_id == agency.store_id) {
        let id = slot._id.unwrap_or_else(ObjectId::new);
        slot._id = Some(id);
        slot.merge_from(agency);
        return id;
    }
    let mut to_insert = agency.clone();
    let id = to_insert._id.unwrap_or_else(ObjectId::new);
    to_insert._id = Some(id);
    collection.push(to_insert);
    id
}

#[async_trait]
impl StoreTrait for MemoryStore {
    async fn upsert_raw(&self, listing: &Listing) -> Result<bool, Error> {
        Ok(upsert_listing(&mut self.inner.lock().unwrap().raw, listing))
    }

    async fn find_raw_by_id_sec(&self, id_sec: &str) -> Result<Option<Listing>, Error> {
        Ok(self.inner.lock().unwrap().raw.iter().find(|l| l.id_sec == id_sec).cloned())
    }

    async fn delete_raw_by_id_sec(&self, id_sec: &str) -> Result<(), Error> {
        self.inner.lock().unwrap().raw.retain(|l| l.id_sec != id_sec);
        Ok(())
    }

    async fn mark_raw_no_agency_found(&self, id_sec: &str) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(listing) = inner.raw.iter_mut().find(|l| l.id_sec == id_sec) {
            listing.no_agency_found = true;
        }
        Ok(())
    }

    async fn find_raw_unresolved(&self, limit: i64) -> Result<Vec<Listing>, Error> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .raw
            .iter()
            .filter(|l| !l.no_agency_found)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn upsert_with_agency(&self, listing: &Listing) -> Result<bool, Error> {
        Ok(upsert_listing(&mut self.inner.lock().unwrap().with_agency, listing))
    }

    async fn with_agency_id_secs(&self) -> Result<Vec<String>, Error> {
        Ok(self.inner.lock().unwrap().with_agency.iter().map(|l| l.id_sec.clone()).collect())
    }

    async fn find_with_agency_unprocessed_batch(&self, limit: i64) -> Result<Vec<Listing>, Error> {
        let inner = self.inner.lock().unwrap();
        let mut batch: Vec<Listing> = inner.with_agency.iter().filter(|l| !l.processed).cloned().collect();
        batch.sort_by_key(|l| l.scraped_at);
        batch.truncate(limit.max(0) as usize);
        Ok(batch)
    }

    async fn mark_with_agency_processed(&self, id_sec: &str) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(listing) = inner.with_agency.iter_mut().find(|l| l.id_sec == id_sec) {
            listing.processed = true;
            listing.processed_at = Some(chrono::Utc::now());
        }
        Ok(())
    }

    async fn upsert_final(&self, listing: &Listing) -> Result<bool, Error> {
        let mut inner = self.inner.lock().unwrap();
        let key = |l: &Listing| (l.id_sec.clone(), l.title.clone(), l.price.map(f64::to_bits));
        let target = key(listing);
        if let Some(slot) = inner.final_.iter_mut().find(|l| key(l) == target) {
            *slot = listing.clone();
            return Ok(false);
        }
        inner.final_.push(listing.clone());
        Ok(true)
    }

    async fn final_id_secs(&self) -> Result<Vec<String>, Error> {
        Ok(self.inner.lock().unwrap().final_.iter().map(|l| l.id_sec.clone()).collect())
    }

    async fn upsert_agency_brute(&self, agency: &Agency) -> Result<ObjectId, Error> {
        Ok(upsert_agency_merging(&mut self.inner.lock().unwrap().agency_brute, agency))
    }

    async fn find_agency_brute_by_store_id(&self, store_id: &str) -> Result<Option<Agency>, Error> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .agency_brute
            .iter()
            .find(|a| a.store_id == store_id)
            .cloned())
    }

    async fn find_agency_brute_by_id(&self, id: ObjectId) -> Result<Option<Agency>, Error> {
        Ok(self.inner.lock().unwrap().agency_brute.iter().find(|a| a._id == Some(id)).cloned())
    }

    async fn find_unscraped_agency_brute(&self, limit: i64) -> Result<Vec<Agency>, Error> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .agency_brute
            .iter()
            .filter(|a| !a.scraped)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn find_agency_final_by_store_id(&self, store_id: &str) -> Result<Option<Agency>, Error> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .agency_final
            .iter()
            .find(|a| a.store_id == store_id)
            .cloned())
    }

    async fn find_agency_final_by_id(&self, id: ObjectId) -> Result<Option<Agency>, Error> {
        Ok(self.inner.lock().unwrap().agency_final.iter().find(|a| a._id == Some(id)).cloned())
    }

    async fn promote_agency_to_final(&self, incoming: &Agency) -> Result<ObjectId, Error> {
        let id = incoming
            ._id
            .ok_or_else(|| estate_error::make_err!(estate_error::Code::Internal, "cannot promote agency without an id"))?;
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner.agency_final.iter_mut().find(|a| a.store_id == incoming.store_id) {
            if existing.completeness_score() >= incoming.completeness_score() {
                return Ok(existing._id.unwrap_or(id));
            }
            existing.merge_from(incoming);
            return Ok(existing._id.unwrap_or(id));
        }
        let mut to_insert = incoming.clone();
        to_insert._id = Some(id);
        inner.agency_final.push(to_insert);
        Ok(id)
    }
}
