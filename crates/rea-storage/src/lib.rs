//! Listing + saved-search stores: trait contracts, in-memory fixture store, Postgres store.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rea_core::{
    Listing, ListingStatus, MatchQuery, OwnerContact, PropertyCategory, ResolvedSearch,
    SavedSearch, SearchFilters,
};
use serde::Deserialize;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "rea-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("cannot decode {table} row: {message}")]
    Decode { table: &'static str, message: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait ListingStore: Send + Sync {
    /// All listings with `created_at >= since`, oldest first.
    async fn listings_created_since(&self, since: DateTime<Utc>) -> Result<Vec<Listing>, StoreError>;
}

#[async_trait]
pub trait SavedSearchStore: Send + Sync {
    /// Notification-enabled searches whose set bounds admit `query`, owners resolved.
    async fn matching_searches(&self, query: &MatchQuery) -> Result<Vec<ResolvedSearch>, StoreError>;
}

/// YAML seed for [`MemoryStore`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreFixture {
    #[serde(default)]
    pub owners: Vec<OwnerContact>,
    #[serde(default)]
    pub listings: Vec<Listing>,
    #[serde(default)]
    pub saved_searches: Vec<SavedSearch>,
}

impl StoreFixture {
    pub fn from_yaml_str(text: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(text).context("parsing store fixture")
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    owners: HashMap<Uuid, OwnerContact>,
    listings: Vec<Listing>,
    searches: Vec<SavedSearch>,
}

/// Process-local store used by fixture replays and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_fixture(fixture: StoreFixture) -> Self {
        let owners = fixture
            .owners
            .into_iter()
            .map(|o| (o.user_id, o))
            .collect();
        Self {
            state: RwLock::new(MemoryState {
                owners,
                listings: fixture.listings,
                searches: fixture.saved_searches,
            }),
        }
    }

    pub async fn from_fixture_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading fixture {}", path.display()))?;
        let fixture = StoreFixture::from_yaml_str(&text)
            .with_context(|| format!("loading fixture {}", path.display()))?;
        Ok(Self::from_fixture(fixture))
    }

    pub async fn insert_owner(&self, owner: OwnerContact) {
        self.state.write().await.owners.insert(owner.user_id, owner);
    }

    pub async fn insert_listing(&self, listing: Listing) {
        self.state.write().await.listings.push(listing);
    }

    pub async fn insert_search(&self, search: SavedSearch) {
        self.state.write().await.searches.push(search);
    }

    pub async fn listing_count(&self) -> usize {
        self.state.read().await.listings.len()
    }
}

#[async_trait]
impl ListingStore for MemoryStore {
    async fn listings_created_since(&self, since: DateTime<Utc>) -> Result<Vec<Listing>, StoreError> {
        let state = self.state.read().await;
        let mut out = state
            .listings
            .iter()
            .filter(|l| l.created_at >= since)
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by_key(|l| l.created_at);
        Ok(out)
    }
}

#[async_trait]
impl SavedSearchStore for MemoryStore {
    async fn matching_searches(&self, query: &MatchQuery) -> Result<Vec<ResolvedSearch>, StoreError> {
        let state = self.state.read().await;
        let mut out = Vec::new();
        for search in state.searches.iter().filter(|s| query.admits(s)) {
            match state.owners.get(&search.user_id) {
                Some(owner) => out.push(ResolvedSearch {
                    search: search.clone(),
                    owner: owner.clone(),
                }),
                None => warn!(
                    search_id = %search.id,
                    user_id = %search.user_id,
                    "saved search owner not found; skipping"
                ),
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.pool.is_closed() {
            return Err(StoreError::Unavailable("connection pool is closed".into()));
        }
        Ok(())
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl ListingStore for PgStore {
    async fn listings_created_since(&self, since: DateTime<Utc>) -> Result<Vec<Listing>, StoreError> {
        self.ensure_open()?;
        let rows = sqlx::query(
            r#"
            SELECT id, created_at, price, category, bedrooms, bathrooms,
                   title, address, listed_by, status
              FROM listings
             WHERE created_at >= $1
             ORDER BY created_at ASC
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        debug!(rows = rows.len(), %since, "loaded listings");
        rows.iter().map(listing_from_row).collect()
    }
}

#[async_trait]
impl SavedSearchStore for PgStore {
    async fn matching_searches(&self, query: &MatchQuery) -> Result<Vec<ResolvedSearch>, StoreError> {
        self.ensure_open()?;
        let rows = sqlx::query(
            r#"
            SELECT s.id, s.user_id, s.name, s.category, s.min_price, s.max_price,
                   s.min_bedrooms, s.min_bathrooms, s.search_text, s.email_notification,
                   s.created_at, u.email, u.full_name
              FROM saved_searches s
              JOIN users u ON u.id = s.user_id
             WHERE s.email_notification = TRUE
               AND (s.category IS NULL OR s.category = $1)
               AND (s.min_price IS NULL OR s.min_price <= $2)
               AND (s.max_price IS NULL OR s.max_price >= $2)
               AND (s.min_bedrooms IS NULL OR s.min_bedrooms <= $3)
               AND (s.min_bathrooms IS NULL OR s.min_bathrooms <= $4)
             ORDER BY s.created_at ASC
            "#,
        )
        .bind(query.category.as_str())
        .bind(query.price)
        .bind(i64::from(query.bedrooms))
        .bind(i64::from(query.bathrooms))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(resolved_search_from_row).collect()
    }
}

fn decode_err(table: &'static str, message: impl Into<String>) -> StoreError {
    StoreError::Decode {
        table,
        message: message.into(),
    }
}

fn count_from_i32(table: &'static str, column: &str, value: i32) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| decode_err(table, format!("{column} is negative ({value})")))
}

fn parse_category(table: &'static str, raw: &str) -> Result<PropertyCategory, StoreError> {
    raw.parse::<PropertyCategory>()
        .map_err(|err| decode_err(table, err.to_string()))
}

fn parse_status(raw: &str) -> Result<ListingStatus, StoreError> {
    match raw {
        "Available" => Ok(ListingStatus::Available),
        "Sold" => Ok(ListingStatus::Sold),
        "Pending" => Ok(ListingStatus::Pending),
        other => Err(decode_err("listings", format!("unknown status {other:?}"))),
    }
}

fn listing_from_row(row: &PgRow) -> Result<Listing, StoreError> {
    let category: String = row.try_get("category")?;
    let status: String = row.try_get("status")?;
    Ok(Listing {
        id: row.try_get("id")?,
        created_at: row.try_get("created_at")?,
        price: row.try_get("price")?,
        category: parse_category("listings", &category)?,
        bedrooms: count_from_i32("listings", "bedrooms", row.try_get("bedrooms")?)?,
        bathrooms: count_from_i32("listings", "bathrooms", row.try_get("bathrooms")?)?,
        title: row.try_get("title")?,
        address: row.try_get("address")?,
        listed_by: row.try_get("listed_by")?,
        status: parse_status(&status)?,
    })
}

fn resolved_search_from_row(row: &PgRow) -> Result<ResolvedSearch, StoreError> {
    let category: Option<String> = row.try_get("category")?;
    let min_bedrooms: Option<i32> = row.try_get("min_bedrooms")?;
    let min_bathrooms: Option<i32> = row.try_get("min_bathrooms")?;
    let user_id: Uuid = row.try_get("user_id")?;

    let filters = SearchFilters {
        category: category
            .as_deref()
            .map(|c| parse_category("saved_searches", c))
            .transpose()?,
        min_price: row.try_get("min_price")?,
        max_price: row.try_get("max_price")?,
        min_bedrooms: min_bedrooms
            .map(|v| count_from_i32("saved_searches", "min_bedrooms", v))
            .transpose()?,
        min_bathrooms: min_bathrooms
            .map(|v| count_from_i32("saved_searches", "min_bathrooms", v))
            .transpose()?,
        search: row.try_get("search_text")?,
    };

    Ok(ResolvedSearch {
        search: SavedSearch {
            id: row.try_get("id")?,
            user_id,
            name: row.try_get("name")?,
            filters,
            notification_enabled: row.try_get("email_notification")?,
            created_at: row.try_get("created_at")?,
        },
        owner: OwnerContact {
            user_id,
            email: row.try_get("email")?,
            full_name: row.try_get("full_name")?,
        },
    })
}
