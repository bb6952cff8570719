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

//! Typed façade over the document store. Collections are plain
//! `mongodb::Collection<T>`, so a malformed document fails to
//! deserialize at the boundary instead of surfacing as a silently-wrong
//! dynamic map.

use async_trait::async_trait;
use bson::oid::ObjectId;
use bson::{doc, Document};
use estate_error::{make_err, Code, Error, ResultExt};
use futures::stream::TryStreamExt;
use mongodb::options::{IndexOptions, UpdateOptions};
use mongodb::{Client, Collection, Database, IndexModel};
use serde::de::DeserializeOwned;
use serde::Serialize as SerdeSerialize;

use crate::records::{Agency, Listing};
use crate::store_trait::StoreTrait;

/// Names of the five collections the pipeline reads and writes.
pub mod names {
    pub const RAW: &str = "raw";
    pub const WITH_AGENCY: &str = "with_agency";
    pub const FINAL: &str = "final";
    pub const AGENCY_BRUTE: &str = "agency_brute";
    pub const AGENCY_FINAL: &str = "agency_final";
}

/// Typed façade over the five collections. Cheap to clone; all state
/// lives in the underlying `mongodb::Client`'s connection pool.
#[derive(Clone)]
pub struct Store {
    db: Database,
}

impl Store {
    /// Connects and selects the database, but does not create indexes —
    /// call [`Store::ensure_indexes`] once at startup.
    pub async fn connect(uri: &str, database: &str) -> Result<Self, Error> {
        let client = Client::with_uri_str(uri)
            .await
            .map_err(|e| make_err!(Code::Internal, "failed to connect to store: {e}"))?;
        Ok(Store {
            db: client.database(database),
        })
    }

    pub fn raw(&self) -> Collection<Listing> {
        self.db.collection(names::RAW)
    }

    pub fn with_agency(&self) -> Collection<Listing> {
        self.db.collection(names::WITH_AGENCY)
    }

    pub fn final_(&self) -> Collection<Listing> {
        self.db.collection(names::FINAL)
    }

    pub fn agency_brute(&self) -> Collection<Agency> {
        self.db.collection(names::AGENCY_BRUTE)
    }

    pub fn agency_final(&self) -> Collection<Agency> {
        self.db.collection(names::AGENCY_FINAL)
    }

    /// Idempotent index setup, run once before the service accepts
    /// traffic. A missing index is a startup-time concern; this function
    /// is allowed to be slow.
    pub async fn ensure_indexes(&self) -> Result<(), Error> {
        let unique_id_sec = IndexModel::builder()
            .keys(doc! { "id_sec": 1 })
            .options(IndexOptions::builder().unique(true).build())
            .build();
        self.raw()
            .create_index(unique_id_sec.clone())
            .await
            .map_err(|e| make_err!(Code::Internal, "creating Raw.id_sec index: {e}"))?;
        self.with_agency()
            .create_index(unique_id_sec)
            .await
            .map_err(|e| make_err!(Code::Internal, "creating WithAgency.id_sec index: {e}"))?;

        let unique_final_key = IndexModel::builder()
            .keys(doc! { "id_sec": 1, "title": 1, "price": 1 })
            .options(IndexOptions::builder().unique(true).build())
            .build();
        self.final_()
            .create_index(unique_final_key)
            .await
            .map_err(|e| make_err!(Code::Internal, "creating Final unique key index: {e}"))?;

        let unique_store_id = IndexModel::builder()
            .keys(doc! { "store_id": 1 })
            .options(IndexOptions::builder().unique(true).build())
            .build();
        self.agency_brute()
            .create_index(unique_store_id.clone())
            .await
            .map_err(|e| make_err!(Code::Internal, "creating AgencyBrute.store_id index: {e}"))?;
        self.agency_final()
            .create_index(unique_store_id)
            .await
            .map_err(|e| make_err!(Code::Internal, "creating AgencyFinal.store_id index: {e}"))?;

        Ok(())
    }
}

/// Upserts `listing` into `collection` keyed on `id_sec`, treating a
/// unique-key violation as "already present" rather than an error.
///
/// Returns `Ok(true)` if a new document was inserted, `Ok(false)` if an
/// existing one was updated or the upsert raced and lost to a
/// concurrent insert of the same key.
pub async fn upsert_listing_by_id_sec(collection: &Collection<Listing>, listing: &Listing) -> Result<bool, Error> {
    let filter = doc! { "id_sec": &listing.id_sec };
    let update = doc! { "$set": bson::to_document(listing).err_tip(|| "serialising listing for upsert")? };
    let result = collection
        .update_one(filter, update)
        .with_options(UpdateOptions::builder().upsert(true).build())
        .await
        .map_err(translate_store_error)?;
    Ok(result.upserted_id.is_some())
}

/// Upserts `listing` into `Final` keyed on the triple `(id_sec, title,
/// price)`, per the adopted resolution of the unique-key Open Question.
pub async fn upsert_final(collection: &Collection<Listing>, listing: &Listing) -> Result<bool, Error> {
    let filter = doc! {
        "id_sec": &listing.id_sec,
        "title": &listing.title,
        "price": listing.price,
    };
    let update = doc! { "$set": bson::to_document(listing).err_tip(|| "serialising final listing for upsert")? };
    let result = collection
        .update_one(filter, update)
        .with_options(UpdateOptions::builder().upsert(true).build())
        .await
        .map_err(translate_store_error)?;
    Ok(result.upserted_id.is_some())
}

/// Upserts `agency` into `collection` keyed on `store_id`. Returns the
/// agency's `_id` (existing or newly minted), preserving identity
/// stability across promotions.
pub async fn upsert_agency_by_store_id(
    collection: &Collection<Agency>,
    agency: &Agency,
) -> Result<ObjectId, Error> {
    if let Some(existing) = collection
        .find_one(doc! { "store_id": &agency.store_id })
        .await
        .map_err(translate_store_error)?
    {
        let id = existing._id.ok_or_else(|| make_err!(Code::Internal, "existing agency missing _id"))?;
        let mut merged = existing;
        merged.merge_from(agency);
        let update = doc! { "$set": bson::to_document(&merged).err_tip(|| "serialising agency for update")? };
        collection
            .update_one(doc! { "_id": id }, update)
            .await
            .map_err(translate_store_error)?;
        return Ok(id);
    }
    let mut to_insert = agency.clone();
    let id = to_insert._id.unwrap_or_else(ObjectId::new);
    to_insert._id = Some(id);
    match collection.insert_one(&to_insert).await {
        Ok(_) => Ok(id),
        Err(e) if is_duplicate_key(&e) => {
            // Lost a concurrent insert race; the other writer's row wins,
            // return its id.
            let existing = collection
                .find_one(doc! { "store_id": &agency.store_id })
                .await
                .map_err(translate_store_error)?
                .ok_or_else(|| make_err!(Code::Internal, "duplicate-key race but row now missing"))?;
            existing
                ._id
                .ok_or_else(|| make_err!(Code::Internal, "racing agency row missing _id"))
        }
        Err(e) => Err(translate_store_error(e)),
    }
}

/// Promotes an `AgencyBrute` row into `AgencyFinal`, applying the
/// "higher completeness wins" merge rule and preserving `_id`.
pub async fn promote_agency_if_more_complete(
    agency_final: &Collection<Agency>,
    incoming: &Agency,
) -> Result<ObjectId, Error> {
    let id = incoming
        ._id
        .ok_or_else(|| make_err!(Code::Internal, "cannot promote agency without an id"))?;
    match agency_final
        .find_one(doc! { "store_id": &incoming.store_id })
        .await
        .map_err(translate_store_error)?
    {
        Some(existing) if existing.completeness_score() >= incoming.completeness_score() => {
            // Idempotence of agency merge: a no-op when the incoming row
            // is not strictly more complete.
            Ok(existing._id.unwrap_or(id))
        }
        Some(mut existing) => {
            existing.merge_from(incoming);
            let update = doc! { "$set": bson::to_document(&existing).err_tip(|| "serialising agency merge")? };
            agency_final
                .update_one(doc! { "_id": existing._id }, update)
                .await
                .map_err(translate_store_error)?;
            Ok(existing._id.unwrap_or(id))
        }
        None => {
            let mut to_insert = incoming.clone();
            to_insert._id = Some(id);
            agency_final
                .insert_one(&to_insert)
                .await
                .map_err(translate_store_error)?;
            Ok(id)
        }
    }
}

/// Collects every `id_sec` already present in a collection, for
/// batch-level deduplication (the loop ingester's catch-up check, the
/// image processor's `Final`-membership pre-filter).
pub async fn distinct_id_secs(collection: &Collection<Listing>, filter: Document) -> Result<Vec<String>, Error> {
    collection
        .distinct("id_sec", filter)
        .await
        .map_err(translate_store_error)?
        .into_iter()
        .map(|bson_value| {
            bson::from_bson(bson_value).map_err(|e| make_err!(Code::Internal, "decoding distinct id_sec: {e}"))
        })
        .collect()
}

/// Looks up a single listing by its unique `id_sec`, used by the
/// incremental loop ingester's catch-up check.
pub async fn find_listing_by_id_sec(collection: &Collection<Listing>, id_sec: &str) -> Result<Option<Listing>, Error> {
    collection
        .find_one(doc! { "id_sec": id_sec })
        .await
        .map_err(translate_store_error)
}

/// A lazily-paged cursor over a collection's matching documents.
pub async fn find_many<T>(
    collection: &Collection<T>,
    filter: Document,
    sort: Option<Document>,
    limit: i64,
) -> Result<Vec<T>, Error>
where
    T: SerdeSerialize + DeserializeOwned + Unpin + Send + Sync,
{
    let mut cursor_builder = collection.find(filter);
    if let Some(sort) = sort {
        cursor_builder = cursor_builder.sort(sort);
    }
    let mut cursor = cursor_builder
        .limit(limit)
        .await
        .map_err(translate_store_error)?;
    let mut out = Vec::new();
    while let Some(doc) = cursor.try_next().await.map_err(translate_store_error)? {
        out.push(doc);
    }
    Ok(out)
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    use mongodb::error::ErrorKind;
    matches!(
        err.kind.as_ref(),
        ErrorKind::Write(mongodb::error::WriteFailure::WriteError(we)) if is_duplicate_key_code(we.code)
    )
}

/// MongoDB's numeric code for a unique-index violation, factored out of
/// [`is_duplicate_key`] so the classification itself can be exercised
/// without a live driver error in hand.
#[must_use]
fn is_duplicate_key_code(code: i32) -> bool {
    code == 11000
}

/// Translates a raw driver error into our `Error` type, mapping unique
/// key violations to `Code::AlreadyExists` per the Store's failure
/// semantics (§4.A): a duplicate key is not an error to the caller, it
/// is a signal.
fn translate_store_error(err: mongodb::error::Error) -> Error {
    if is_duplicate_key(&err) {
        make_err!(Code::AlreadyExists, "unique key violation: {err}")
    } else {
        make_err!(Code::Unavailable, "store operation failed: {err}")
    }
}

#[async_trait]
impl StoreTrait for Store {
    async fn upsert_raw(&self, listing: &Listing) -> Result<bool, Error> {
        upsert_listing_by_id_sec(&self.raw(), listing).await
    }

    async fn find_raw_by_id_sec(&self, id_sec: &str) -> Result<Option<Listing>, Error> {
        find_listing_by_id_sec(&self.raw(), id_sec).await
    }

    async fn delete_raw_by_id_sec(&self, id_sec: &str) -> Result<(), Error> {
        self.raw()
            .delete_one(doc! { "id_sec": id_sec })
            .await
            .map_err(translate_store_error)?;
        Ok(())
    }

    async fn mark_raw_no_agency_found(&self, id_sec: &str) -> Result<(), Error> {
        self.raw()
            .update_one(doc! { "id_sec": id_sec }, doc! { "$set": { "no_agency_found": true } })
            .await
            .map_err(translate_store_error)?;
        Ok(())
    }

    async fn find_raw_unresolved(&self, limit: i64) -> Result<Vec<Listing>, Error> {
        find_many(&self.raw(), doc! { "no_agency_found": false }, None, limit).await
    }

    async fn upsert_with_agency(&self, listing: &Listing) -> Result<bool, Error> {
        upsert_listing_by_id_sec(&self.with_agency(), listing).await
    }

    async fn with_agency_id_secs(&self) -> Result<Vec<String>, Error> {
        distinct_id_secs(&self.with_agency(), doc! {}).await
    }

    async fn find_with_agency_unprocessed_batch(&self, limit: i64) -> Result<Vec<Listing>, Error> {
        find_many(
            &self.with_agency(),
            doc! { "processed": false },
            Some(doc! { "scraped_at": 1 }),
            limit,
        )
        .await
    }

    async fn mark_with_agency_processed(&self, id_sec: &str) -> Result<(), Error> {
        self.with_agency()
            .update_one(
                doc! { "id_sec": id_sec },
                doc! { "$set": { "processed": true, "processed_at": bson::DateTime::now() } },
            )
            .await
            .map_err(translate_store_error)?;
        Ok(())
    }

    async fn upsert_final(&self, listing: &Listing) -> Result<bool, Error> {
        upsert_final(&self.final_(), listing).await
    }

    async fn final_id_secs(&self) -> Result<Vec<String>, Error> {
        distinct_id_secs(&self.final_(), doc! {}).await
    }

    async fn upsert_agency_brute(&self, agency: &Agency) -> Result<ObjectId, Error> {
        upsert_agency_by_store_id(&self.agency_brute(), agency).await
    }

    async fn find_agency_brute_by_store_id(&self, store_id: &str) -> Result<Option<Agency>, Error> {
        self.agency_brute()
            .find_one(doc! { "store_id": store_id })
            .await
            .map_err(translate_store_error)
    }

    async fn find_agency_brute_by_id(&self, id: ObjectId) -> Result<Option<Agency>, Error> {
        self.agency_brute()
            .find_one(doc! { "_id": id })
            .await
            .map_err(translate_store_error)
    }

    async fn find_unscraped_agency_brute(&self, limit: i64) -> Result<Vec<Agency>, Error> {
        find_many(&self.agency_brute(), doc! { "scraped": false }, None, limit).await
    }

    async fn find_agency_final_by_store_id(&self, store_id: &str) -> Result<Option<Agency>, Error> {
        self.agency_final()
            .find_one(doc! { "store_id": store_id })
            .await
            .map_err(translate_store_error)
    }

    async fn find_agency_final_by_id(&self, id: ObjectId) -> Result<Option<Agency>, Error> {
        self.agency_final()
            .find_one(doc! { "_id": id })
            .await
            .map_err(translate_store_error)
    }

    async fn promote_agency_to_final(&self, incoming: &Agency) -> Result<ObjectId, Error> {
        promote_agency_if_more_complete(&self.agency_final(), incoming).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn duplicate_key_code_matches_only_mongos_unique_violation() {
        assert!(is_duplicate_key_code(11000));
        assert!(!is_duplicate_key_code(0));
        assert!(!is_duplicate_key_code(11001));
    }
}
