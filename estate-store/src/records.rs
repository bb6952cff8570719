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

//! Typed record schemas. The Store is a typed codec over these, never a
//! dynamic document map — see the design notes on cyclic/dynamic
//! collection types.

use bson::oid::ObjectId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Permanently-unavailable image slot sentinel.
pub const NA: &str = "N/A";

/// Cap on `Listing::body`, matching the original schema's `max_length`.
/// A listing description longer than this is truncated at ingest rather
/// than rejected.
pub const BODY_MAX_LEN: usize = 100_000;

/// `storeId` values that must never reach `Final`/`AgencyFinal`.
pub const BLACKLISTED_STORE_IDS: &[&str] = &["5608823"];

#[must_use]
pub fn is_blacklisted(store_id: &str) -> bool {
    BLACKLISTED_STORE_IDS.contains(&store_id)
}

/// Shared schema for `Raw`, `WithAgency`, and `Final` — they differ only
/// by which collection holds them and which stage flags are set, not by
/// shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Listing {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    pub id_sec: String,
    pub title: String,
    pub price: Option<f64>,

    pub publication_date: Option<DateTime<Utc>>,
    pub index_date: Option<DateTime<Utc>>,
    pub expiration_date: Option<DateTime<Utc>>,

    pub body: Option<String>,
    pub surface: Option<f64>,
    pub rooms: Option<u32>,
    pub bedrooms: Option<u32>,
    pub energy_class: Option<String>,
    pub city: Option<String>,
    pub postal_code: Option<String>,
    pub department: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub property_type: Option<String>,
    pub transaction_type: Option<String>,
    pub land_surface: Option<f64>,
    pub floor: Option<u32>,
    pub number_of_floors: Option<u32>,
    pub construction_year: Option<u32>,
    pub has_elevator: Option<bool>,
    pub has_balcony: Option<bool>,
    pub has_parking: Option<bool>,
    pub has_cellar: Option<bool>,
    pub heating_type: Option<String>,
    pub charges: Option<f64>,
    pub deposit: Option<f64>,
    pub furnished: Option<bool>,

    pub images: Vec<String>,
    pub nbr_images: i64,

    pub store_id: Option<String>,
    pub agency_name: Option<String>,
    pub id_agence: Option<ObjectId>,
    pub no_agency_found: bool,

    pub scraped_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub processed: bool,
}

impl Listing {
    /// Truncates `body` to [`BODY_MAX_LEN`] if needed, returning whether
    /// truncation happened (so the caller can log a warning).
    pub fn enforce_body_limit(&mut self) -> bool {
        match &mut self.body {
            Some(body) if body.chars().count() > BODY_MAX_LEN => {
                *body = body.chars().take(BODY_MAX_LEN).collect();
                true
            }
            _ => false,
        }
    }

    /// Invariant 3: `nbrImages` equals the count of entries that are not
    /// `"N/A"`.
    pub fn recompute_nbr_images(&mut self) {
        self.nbr_images = self.images.iter().filter(|url| url.as_str() != NA).count() as i64;
    }

    #[must_use]
    pub fn is_fully_object_store(&self, objectstore_prefix: &str) -> bool {
        self.images
            .iter()
            .all(|url| url == NA || url.starts_with(objectstore_prefix))
    }
}

/// Shared schema for `AgencyBrute` and `AgencyFinal`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Agency {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

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

    pub scraped: bool,
    pub scraped_at: Option<DateTime<Utc>>,
}

/// The source's `"Non trouvé"` sentinel is treated the same as a null
/// field when computing completeness.
fn is_populated(field: &Option<String>) -> bool {
    match field {
        None => false,
        Some(s) => {
            let trimmed = s.trim();
            !trimmed.is_empty() && !trimmed.eq_ignore_ascii_case("non trouvé")
        }
    }
}

impl Agency {
    /// Count of non-null, non-`"Non trouvé"` fields among the optional
    /// descriptive fields. Used to decide `AgencyBrute -> AgencyFinal`
    /// promotion and to resolve concurrent merges ("higher completeness
    /// wins").
    #[must_use]
    pub fn completeness_score(&self) -> u32 {
        [
            &self.code_siren,
            &self.logo,
            &self.adresse,
            &self.zone_intervention,
            &self.site_web,
            &self.horaires,
            &self.number,
            &self.description,
        ]
        .iter()
        .filter(|field| is_populated(field))
        .count() as u32
    }

    /// Merges `incoming` into `self` field-by-field, keeping `self`'s
    /// value for any field `incoming` leaves unpopulated. Used when
    /// promoting with a strictly higher completeness score; preserves
    /// `_id` (agency identity stability).
    pub fn merge_from(&mut self, incoming: &Agency) {
        macro_rules! take_if_populated {
            ($field:ident) => {
                if is_populated(&incoming.$field) {
                    self.$field = incoming.$field.clone();
                }
            };
        }
        take_if_populated!(code_siren);
        take_if_populated!(logo);
        take_if_populated!(adresse);
        take_if_populated!(zone_intervention);
        take_if_populated!(site_web);
        take_if_populated!(horaires);
        take_if_populated!(number);
        take_if_populated!(description);
        if incoming.scraped {
            self.scraped = true;
            self.scraped_at = incoming.scraped_at.or(self.scraped_at);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn empty_agency(store_id: &str) -> Agency {
        Agency {
            _id: None,
            store_id: store_id.to_string(),
            name: "Agency".to_string(),
            lien: "https://example.com".to_string(),
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

    #[test]
    fn completeness_score_ignores_non_trouve_sentinel() {
        let mut agency = empty_agency("S1");
        agency.adresse = Some("Non trouvé".to_string());
        assert_eq!(agency.completeness_score(), 0);
        agency.number = Some("+33".to_string());
        assert_eq!(agency.completeness_score(), 1);
    }

    #[test]
    fn merge_preserves_id_and_takes_higher_completeness_fields() {
        let id = ObjectId::new();
        let mut existing = empty_agency("S9");
        existing._id = Some(id);
        existing.adresse = Some("X".to_string());

        let incoming = {
            let mut a = empty_agency("S9");
            a.number = Some("+33".to_string());
            a.adresse = Some("X".to_string());
            a
        };

        existing.merge_from(&incoming);
        assert_eq!(existing._id, Some(id));
        assert_eq!(existing.adresse, Some("X".to_string()));
        assert_eq!(existing.number, Some("+33".to_string()));
    }

    #[test]
    fn nbr_images_counts_non_na_entries() {
        let mut listing = sample_listing();
        listing.images = vec![NA.to_string(), "https://obj/a.jpg".to_string()];
        listing.recompute_nbr_images();
        assert_eq!(listing.nbr_images, 1);
    }

    #[test]
    fn body_truncated_past_limit() {
        let mut listing = sample_listing();
        listing.body = Some("a".repeat(BODY_MAX_LEN + 10));
        assert!(listing.enforce_body_limit());
        assert_eq!(listing.body.unwrap().chars().count(), BODY_MAX_LEN);
    }

    #[test]
    fn fully_object_store_requires_every_slot_hosted_or_na() {
        let mut listing = sample_listing();
        listing.images = vec!["https://obj/real_estate/L1_0.jpg".to_string(), NA.to_string()];
        assert!(listing.is_fully_object_store("https://obj/real_estate/"));

        listing.images.push("https://leboncoin.fr/original.jpg".to_string());
        assert!(!listing.is_fully_object_store("https://obj/real_estate/"));
    }

    fn sample_listing() -> Listing {
        Listing {
            _id: None,
            id_sec: "L1".to_string(),
            title: "T".to_string(),
            price: Some(100.0),
            publication_date: None,
            index_date: None,
            expiration_date: None,
            body: None,
            surface: None,
            rooms: None,
            bedrooms: None,
            energy_class: None,
            city: None,
            postal_code: None,
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
            images: vec![],
            nbr_images: 0,
            store_id: None,
            agency_name: None,
            id_agence: None,
            no_agency_found: false,
            scraped_at: None,
            processed_at: None,
            processed: false,
        }
    }
}
