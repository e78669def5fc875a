//! Request seeds: which data a page has asked for, so a reload can skip
//! re-requesting what the cache already holds.
//!
//! An entry with an empty collection list means "every collection".

use hearth_types::{PageId, RequestSeed, RequestSeedEntry, SeedFilter};

/// Merge newly requested entries into the page's seed.
///
/// A seed belonging to another page is discarded. Entries are keyed by
/// `(scope, document)`; an "all collections" entry absorbs any specific list.
pub fn update_seed(
    page: PageId,
    existing: Option<&RequestSeed>,
    incoming: &[RequestSeedEntry],
) -> RequestSeed {
    let mut seed = match existing {
        Some(seed) if seed.page == page => seed.clone(),
        _ => RequestSeed::new(page),
    };

    for entry in incoming {
        let current = seed
            .entries
            .iter_mut()
            .find(|e| e.scope_key == entry.scope_key && e.document == entry.document);
        match current {
            None => seed.entries.push(entry.clone()),
            Some(current) => {
                if current.all_collections() {
                    continue;
                }
                if entry.all_collections() {
                    current.collections.clear();
                    continue;
                }
                for collection in &entry.collections {
                    if !current.collections.contains(collection) {
                        current.collections.push(collection.clone());
                    }
                }
            }
        }
    }
    seed
}

/// Narrow a seed to what the caller is resuming.
///
/// Returns `None` when the seed belongs to another page or nothing in it
/// matches the filter. A collection filter that leaves an entry with no
/// collections widens that entry back to "all".
pub fn filter_seed(
    page: PageId,
    seed: Option<&RequestSeed>,
    filter: &SeedFilter,
) -> Option<RequestSeed> {
    let seed = seed?;
    if seed.page != page {
        return None;
    }

    let entries: Vec<RequestSeedEntry> = seed
        .entries
        .iter()
        .filter(|e| {
            filter
                .scope_keys
                .as_ref()
                .is_none_or(|keys| keys.contains(&e.scope_key))
        })
        .map(|e| {
            let Some(wanted) = &filter.collections else {
                return e.clone();
            };
            let collections = if e.all_collections() {
                wanted.clone()
            } else {
                e.collections
                    .iter()
                    .filter(|c| wanted.contains(c))
                    .cloned()
                    .collect()
            };
            RequestSeedEntry::new(e.scope_key.clone(), e.document.clone(), collections)
        })
        .collect();

    if entries.is_empty() {
        return None;
    }
    Some(RequestSeed { page, entries })
}

/// Whether the seed already covers a request for these collections.
pub fn seed_covers(seed: &RequestSeed, entry: &RequestSeedEntry) -> bool {
    let Some(current) = seed.entry(&entry.scope_key, &entry.document) else {
        return false;
    };
    if current.all_collections() {
        return true;
    }
    !entry.all_collections() && entry.collections.iter().all(|c| current.collections.contains(c))
}
