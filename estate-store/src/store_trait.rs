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

//! The pipeline's seam onto the document store, narrow enough for
//! [`crate::memory::MemoryStore`] to stand in for a real deployment in
//! tests — mirrors the teacher's own split of a trait at the storage
//! boundary from the concrete client that backs it in production.

use async_trait::async_trait;
use bson::oid::ObjectId;
use estate_error::Error;

use crate::records::{Agency, Listing};

/// Every operation the three pipeline stages (`ingester`, `agency`,
/// `images`) perform against the store, expressed at the domain level
/// rather than as generic document queries — the same "typed façade,
/// not a dynamic map" rule [`crate::Store`] itself follows.
#[async_trait]
pub trait StoreTrait: Send + Sync {
    /// Upserts `listing` into `Raw` keyed on `id_sec`.
    async fn upsert_raw(&self, listing: &Listing) -> Result<bool, Error>;
    async fn find_raw_by_id_sec(&self, id_sec: &str) -> Result<Option<Listing>, Error>;
    async fn delete_raw_by_id_sec(&self, id_sec: &str) -> Result<(), Error>;
    async fn mark_raw_no_agency_found(&self, id_sec: &str) -> Result<(), Error>;
    /// `Raw` rows not yet marked `no_agency_found`, for the resolver sweep.
    async fn find_raw_unresolved(&self, limit: i64) -> Result<Vec<Listing>, Error>;

    /// Upserts `listing` into `WithAgency` keyed on `id_sec`.
    async fn upsert_with_agency(&self, listing: &Listing) -> Result<bool, Error>;
    async fn with_agency_id_secs(&self) -> Result<Vec<String>, Error>;
    /// `WithAgency` rows not yet processed, oldest `scraped_at` first.
    async fn find_with_agency_unprocessed_batch(&self, limit: i64) -> Result<Vec<Listing>, Error>;
    async fn mark_with_agency_processed(&self, id_sec: &str) -> Result<(), Error>;

    /// Upserts `listing` into `Final` keyed on `(id_sec, title, price)`.
    async fn upsert_final(&self, listing: &Listing) -> Result<bool, Error>;
    async fn final_id_secs(&self) -> Result<Vec<String>, Error>;

    /// Upserts `agency` into `AgencyBrute` keyed on `store_id`, merging
    /// into an existing row rather than overwriting it. Returns the
    /// row's `_id`.
    async fn upsert_agency_brute(&self, agency: &Agency) -> Result<ObjectId, Error>;
    async fn find_agency_brute_by_store_id(&self, store_id: &str) -> Result<Option<Agency>, Error>;
    async fn find_agency_brute_by_id(&self, id: ObjectId) -> Result<Option<Agency>, Error>;
    async fn find_unscraped_agency_brute(&self, limit: i64) -> Result<Vec<Agency>, Error>;

    async fn find_agency_final_by_store_id(&self, store_id: &str) -> Result<Option<Agency>, Error>;
    async fn find_agency_final_by_id(&self, id: ObjectId) -> Result<Option<Agency>, Error>;
    /// Promotes `incoming` into `AgencyFinal`, applying the
    /// higher-completeness-wins merge rule and preserving `_id`.
    async fn promote_agency_to_final(&self, incoming: &Agency) -> Result<ObjectId, Error>;
}
