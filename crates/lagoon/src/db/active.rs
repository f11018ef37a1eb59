//! Active records are a record value plus the behavior needed to persist
//! it; wrapping is shallow and never touches the store.

use crate::{db::facade, db::facade::Collection, error::Error};
use derive_more::{Deref, DerefMut};
use lagoon_core::value::Record;

///
/// ActiveRecord
/// A record view augmented with `save` and `delete`. Dereferences to the
/// underlying record, so fields can be edited in place before saving.
///

#[derive(Clone, Deref, DerefMut)]
pub struct ActiveRecord {
    #[deref]
    #[deref_mut]
    record: Record,
    collection: Collection,
}

impl ActiveRecord {
    pub(crate) const fn new(collection: Collection, record: Record) -> Self {
        Self { record, collection }
    }

    #[must_use]
    pub const fn record(&self) -> &Record {
        &self.record
    }

    /// Persist the current record state through the owning collection.
    pub async fn save(&mut self) -> Result<(), Error> {
        let saved = self.collection.update(self.record.clone()).await?;
        self.record = saved;
        Ok(())
    }

    /// Remove the backing row by key.
    pub async fn delete(&self) -> Result<Option<Record>, Error> {
        let key_value = facade::key_value_of(&self.collection.core.descriptor, &self.record)
            .map_err(Error::from)?;
        self.collection.delete(key_value).await
    }

    /// Strip the active behavior, recovering the plain record.
    #[must_use]
    pub fn into_record(self) -> Record {
        self.record
    }
}
