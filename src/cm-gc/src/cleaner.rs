//! Purges `DELETING` CDC streams (§4.8).

use cm_catalog::EntityRegistry;
use cm_syscatalog::{EntityKind, SysCatalogKey, SysCatalogStore};
use cm_types::{CdcStreamState, LeaderTerm};
use tracing::warn;

use crate::error::GcError;
use crate::traits::CdcStateCleaner;

/// Attempts to purge every `DELETING` CDC stream, deleting its state-table
/// rows on each of its table's tablets before dropping the stream itself.
/// A stream whose row deletions don't all succeed is left `DELETING` for
/// the next run. Returns the number of streams fully purged.
pub async fn purge_deleting_streams(
    registry: &EntityRegistry,
    store: &dyn SysCatalogStore,
    term: LeaderTerm,
    cleaner: &dyn CdcStateCleaner,
) -> Result<usize, GcError> {
    let mut purged = 0;

    for locked in registry.list_cdc_streams().await {
        let (stream_id, table_id, state) = {
            let stream = locked.read().await;
            (stream.id.clone(), stream.table_id.clone(), stream.state)
        };
        if state != CdcStreamState::Deleting {
            continue;
        }

        let tablets = registry.tablets_of_table(&table_id).await;
        let mut all_ok = true;
        for tablet in &tablets {
            let tablet_id = tablet.read().await.id.clone();
            if !cleaner.delete_rows(&tablet_id, &stream_id).await {
                all_ok = false;
            }
        }

        if !all_ok {
            warn!(stream = %stream_id, "CDC state row cleanup incomplete, retrying next run");
            continue;
        }

        store
            .delete_item(SysCatalogKey::new(EntityKind::CdcStream, stream_id.0.clone()), term)
            .await?;
        registry.remove_cdc_stream(&stream_id).await?;
        purged += 1;
    }

    Ok(purged)
}
