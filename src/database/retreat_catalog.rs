use async_trait::async_trait;
use mongodb::{bson::doc, Collection, Database};

use crate::errors::Result;
use crate::models::retreat::{Retreat, RetreatId};

pub const RETREATS_COLLECTION: &str = "retreats";

/// Read-only view of the retreat catalogue.
#[async_trait]
pub trait RetreatCatalog: Send + Sync {
    async fn get_retreat(&self, id: RetreatId) -> Result<Option<Retreat>>;
}

#[derive(Clone)]
pub struct MongoRetreatCatalog {
    collection: Collection<Retreat>,
}

impl MongoRetreatCatalog {
    pub fn new(db: &Database) -> Self {
        MongoRetreatCatalog {
            collection: db.collection(RETREATS_COLLECTION),
        }
    }
}

#[async_trait]
impl RetreatCatalog for MongoRetreatCatalog {
    async fn get_retreat(&self, id: RetreatId) -> Result<Option<Retreat>> {
        Ok(self.collection.find_one(doc! { "_id": id.as_object_id() }).await?)
    }
}
