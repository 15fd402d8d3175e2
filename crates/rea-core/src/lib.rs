//! Core domain model and match predicate for saved-search alerts.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "rea-core";

/// Lookback scanned by every batch run.
pub const WINDOW_HOURS: i64 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropertyCategory {
    Land,
    House,
    Apartment,
    Commercial,
}

impl PropertyCategory {
    pub const ALL: [PropertyCategory; 4] = [
        PropertyCategory::Land,
        PropertyCategory::House,
        PropertyCategory::Apartment,
        PropertyCategory::Commercial,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PropertyCategory::Land => "Land",
            PropertyCategory::House => "House",
            PropertyCategory::Apartment => "Apartment",
            PropertyCategory::Commercial => "Commercial",
        }
    }
}

impl fmt::Display for PropertyCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown property category {0:?}")]
pub struct UnknownCategory(pub String);

impl FromStr for PropertyCategory {
    type Err = UnknownCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| UnknownCategory(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ListingStatus {
    #[default]
    Available,
    Sold,
    Pending,
}

/// A persisted property record. Read-only to the alert path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub price: f64,
    pub category: PropertyCategory,
    #[serde(default)]
    pub bedrooms: u32,
    #[serde(default)]
    pub bathrooms: u32,
    pub title: String,
    pub address: String,
    pub listed_by: Uuid,
    #[serde(default)]
    pub status: ListingStatus,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvalidListing {
    #[error("listing {id} has a non-finite price")]
    NonFinitePrice { id: Uuid },
    #[error("listing {id} has a negative price {price}")]
    NegativePrice { id: Uuid, price: f64 },
}

impl Listing {
    pub fn validate(&self) -> Result<(), InvalidListing> {
        if !self.price.is_finite() {
            return Err(InvalidListing::NonFinitePrice { id: self.id });
        }
        if self.price < 0.0 {
            return Err(InvalidListing::NegativePrice {
                id: self.id,
                price: self.price,
            });
        }
        Ok(())
    }
}

/// Saved filter set. Every field is optional; `None` leaves that dimension open.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SearchFilters {
    #[serde(default)]
    pub category: Option<PropertyCategory>,
    #[serde(default)]
    pub min_price: Option<f64>,
    #[serde(default)]
    pub max_price: Option<f64>,
    #[serde(default)]
    pub min_bedrooms: Option<u32>,
    #[serde(default)]
    pub min_bathrooms: Option<u32>,
    /// Interactive search only; never consulted when matching alerts.
    #[serde(default)]
    pub search: Option<String>,
}

impl SearchFilters {
    /// Structural match over category, price range, bedrooms and bathrooms.
    pub fn matches(&self, listing: &Listing) -> bool {
        self.satisfied_by(&MatchQuery::for_listing(listing))
    }

    pub fn satisfied_by(&self, q: &MatchQuery) -> bool {
        self.category.is_none_or(|c| c == q.category)
            && self.min_price.is_none_or(|min| min <= q.price)
            && self.max_price.is_none_or(|max| max >= q.price)
            && self.min_bedrooms.is_none_or(|min| min <= q.bedrooms)
            && self.min_bathrooms.is_none_or(|min| min <= q.bathrooms)
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedSearch {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub filters: SearchFilters,
    #[serde(default = "default_true")]
    pub notification_enabled: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerContact {
    pub user_id: Uuid,
    pub email: String,
    pub full_name: String,
}

/// Saved search with its owner's contact details resolved by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedSearch {
    pub search: SavedSearch,
    pub owner: OwnerContact,
}

/// A confirmed (listing, search) pairing. Consumed by the notifier and dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchEvent {
    pub listing: Listing,
    pub search: ResolvedSearch,
}

/// Store-level query derived from one listing: the values every candidate
/// search's bounds are compared against.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MatchQuery {
    pub category: PropertyCategory,
    pub price: f64,
    pub bedrooms: u32,
    pub bathrooms: u32,
}

impl MatchQuery {
    pub fn for_listing(listing: &Listing) -> Self {
        Self {
            category: listing.category,
            price: listing.price,
            bedrooms: listing.bedrooms,
            bathrooms: listing.bathrooms,
        }
    }

    /// Full alert predicate: notifications enabled and every set bound satisfied.
    pub fn admits(&self, search: &SavedSearch) -> bool {
        search.notification_enabled && search.filters.satisfied_by(self)
    }
}

/// Half-open interval `[start, end)` of listing creation times scanned by a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl AlertWindow {
    pub fn ending_at(now: DateTime<Utc>) -> Self {
        Self {
            start: now - Duration::hours(WINDOW_HOURS),
            end: now,
        }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end
    }
}
