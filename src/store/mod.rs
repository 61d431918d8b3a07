//! Entity store access.
//!
//! The pipeline reads creators from and writes magnets back to a
//! REST-over-HTTP table store. [`EntityStore`] exposes the primitive table
//! operations; the find-then-update-or-insert protocol and the best-effort
//! status field are built on top of it in [`upsert`] and [`status`].
//!
//! # Example
//!
//! ```rust,ignore
//! use outreach_forge::store::{upsert_magnet, EntityStore, SupabaseClient};
//!
//! let store = SupabaseClient::from_config(&config)?;
//! let creators = store.fetch_creators().await?;
//! let outcome = upsert_magnet(&store, &record).await?;
//! ```

mod memory;
mod status;
mod supabase;
mod upsert;

pub use memory::MemoryStore;
pub use status::StatusStore;
pub use supabase::SupabaseClient;
pub use upsert::{upsert_magnet, UpsertOutcome};

use async_trait::async_trait;

use crate::error::StoreError;
use crate::model::{Creator, MagnetKey, MagnetRecord, OutreachUpdate, Status};

/// Table name holding creators.
pub const CREATOR_TABLE: &str = "creator";

/// Table name holding magnet and cover images.
pub const MAGNET_TABLE: &str = "magnet_image";

/// Primitive operations on the creator and magnet tables.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Returns every creator, in store order.
    async fn fetch_creators(&self) -> Result<Vec<Creator>, StoreError>;

    /// Returns creators whose status column equals `status`.
    async fn creators_with_status(&self, status: Status) -> Result<Vec<Creator>, StoreError>;

    /// Overwrites the status column of one creator.
    async fn set_creator_status(&self, creator_id: &str, status: Status) -> Result<(), StoreError>;

    /// Writes the generated outreach message onto the creator row.
    async fn update_outreach(
        &self,
        creator_id: &str,
        update: &OutreachUpdate,
    ) -> Result<(), StoreError>;

    /// Looks up a magnet row by its natural key.
    async fn find_magnet(&self, key: &MagnetKey) -> Result<Option<MagnetRecord>, StoreError>;

    /// Inserts a magnet row. A uniqueness violation is `StoreError::Conflict`.
    async fn insert_magnet(&self, record: &MagnetRecord) -> Result<(), StoreError>;

    /// Updates the fields `record` sets on the row matching `key`.
    async fn update_magnet(&self, key: &MagnetKey, record: &MagnetRecord)
        -> Result<(), StoreError>;
}
