//! Linear scans over every stored entity of a kind: leaderboards, queries and
//! mass updates. Each entity is read through the regular locked path, so a
//! scan never observes a half-applied write, but the scan as a whole is not a
//! snapshot.

use std::cmp::Ordering;

use serde::Serialize;
use tracing::{debug, warn};

use tally_core::DataResult;
use tally_types::{FieldValue, LinkKey, LinkedField, OwnerField, OwnerId};

use crate::api::DataApi;

/// One ranked row of a leaderboard. Ranks start at 1.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LeaderboardEntry<I, T> {
    pub id: I,
    pub value: T,
    pub rank: usize,
}

/// A 1-based page of results.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Page<T> {
    pub content: Vec<T>,
    pub page: usize,
    pub total_pages: usize,
    pub total_elements: usize,
}

impl<T> Page<T> {
    pub fn has_next(&self) -> bool {
        self.page < self.total_pages
    }
}

fn ranked<I, T>(entries: impl IntoIterator<Item = (I, T)>, offset: usize) -> Vec<LeaderboardEntry<I, T>> {
    entries
        .into_iter()
        .enumerate()
        .map(|(i, (id, value))| LeaderboardEntry {
            id,
            value,
            rank: offset + i + 1,
        })
        .collect()
}

impl DataApi {
    fn owner_ids(&self) -> DataResult<Vec<OwnerId>> {
        let bucket = &self.engine().layout().owner_bucket;
        let mut ids: Vec<OwnerId> = self
            .storage()
            .list_ids(bucket)?
            .into_iter()
            .filter_map(|id| match id.parse() {
                Ok(owner) => Some(owner),
                Err(err) => {
                    warn!(bucket = %bucket, id = %id, error = %err, "skipping record with unparsable owner id");
                    None
                }
            })
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    fn owner_values<T: FieldValue>(&self, field: &OwnerField<T>) -> DataResult<Vec<(OwnerId, T)>> {
        self.owner_ids()?
            .into_iter()
            .map(|owner| Ok((owner, self.get(owner, field)?)))
            .collect()
    }

    fn shared_values<K: LinkKey, T: FieldValue>(
        &self,
        field: &LinkedField<K, T>,
    ) -> DataResult<Vec<(K, T)>> {
        let link = field.link_type();
        let bucket = self.engine().layout().shared_bucket(link.name());
        let mut ids = self.storage().list_ids(&bucket)?;
        ids.sort_unstable();
        let mut values = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(key) = link.parse_id(&id) else {
                warn!(bucket = %bucket, id = %id, "skipping record with unparsable shared key");
                continue;
            };
            let value = self.get_direct(&key, field)?;
            values.push((key, value));
        }
        Ok(values)
    }

    /// The first `limit` owners ordered by `cmp`. Ties keep owner id order.
    pub fn top<T: FieldValue>(
        &self,
        field: &OwnerField<T>,
        limit: usize,
        mut cmp: impl FnMut(&T, &T) -> Ordering,
    ) -> DataResult<Vec<LeaderboardEntry<OwnerId, T>>> {
        let mut values = self.owner_values(field)?;
        values.sort_by(|a, b| cmp(&a.1, &b.1));
        values.truncate(limit);
        Ok(ranked(values, 0))
    }

    /// The `limit` highest values of `field`.
    pub fn top_desc<T: FieldValue + Ord>(
        &self,
        field: &OwnerField<T>,
        limit: usize,
    ) -> DataResult<Vec<LeaderboardEntry<OwnerId, T>>> {
        self.top(field, limit, |a, b| b.cmp(a))
    }

    /// One page of the descending leaderboard. `page` and `page_size` are
    /// clamped to at least 1; a page past the end is empty.
    pub fn top_paged<T: FieldValue + Ord>(
        &self,
        field: &OwnerField<T>,
        page: usize,
        page_size: usize,
    ) -> DataResult<Page<LeaderboardEntry<OwnerId, T>>> {
        let page = page.max(1);
        let page_size = page_size.max(1);
        let mut values = self.owner_values(field)?;
        values.sort_by(|a, b| b.1.cmp(&a.1));

        let total_elements = values.len();
        let offset = (page - 1).saturating_mul(page_size);
        let content = ranked(values.into_iter().skip(offset).take(page_size), offset);
        Ok(Page {
            content,
            page,
            total_pages: total_elements.div_ceil(page_size),
            total_elements,
        })
    }

    /// Owners whose value of `field` satisfies `filter`.
    pub fn query<T: FieldValue>(
        &self,
        field: &OwnerField<T>,
        mut filter: impl FnMut(&T) -> bool,
    ) -> DataResult<Vec<OwnerId>> {
        Ok(self
            .owner_values(field)?
            .into_iter()
            .filter(|(_, value)| filter(value))
            .map(|(owner, _)| owner)
            .collect())
    }

    pub fn count<T: FieldValue>(
        &self,
        field: &OwnerField<T>,
        mut filter: impl FnMut(&T) -> bool,
    ) -> DataResult<usize> {
        Ok(self
            .owner_values(field)?
            .iter()
            .filter(|(_, value)| filter(value))
            .count())
    }

    /// Apply `f` to `field` of every stored owner. Returns how many owners
    /// were written, including those whose value came out unchanged.
    pub fn update_all<T: FieldValue>(
        &self,
        field: &OwnerField<T>,
        f: impl FnMut(T) -> T,
    ) -> DataResult<usize> {
        self.update_where(field, |_| true, f)
    }

    /// Apply `f` to owners whose current value satisfies `filter`. The check
    /// and the write happen under the owner's lock. Stops at the first
    /// failure; owners already updated stay updated.
    pub fn update_where<T: FieldValue>(
        &self,
        field: &OwnerField<T>,
        mut filter: impl FnMut(&T) -> bool,
        mut f: impl FnMut(T) -> T,
    ) -> DataResult<usize> {
        let mut updated = 0;
        for owner in self.owner_ids()? {
            if self
                .engine()
                .update_if(owner, field, |v| filter(v), |v| f(v))?
                .is_some()
            {
                updated += 1;
            }
        }
        debug!(field = field.full_key(), updated, "bulk update finished");
        Ok(updated)
    }

    /// The `limit` shared entities with the highest value of `field`.
    pub fn top_linked<K: LinkKey, T: FieldValue + Ord>(
        &self,
        field: &LinkedField<K, T>,
        limit: usize,
    ) -> DataResult<Vec<LeaderboardEntry<K, T>>> {
        let mut values = self.shared_values(field)?;
        values.sort_by(|a, b| b.1.cmp(&a.1));
        values.truncate(limit);
        Ok(ranked(values, 0))
    }

    /// Keys of shared entities whose value of `field` satisfies `filter`.
    pub fn query_linked<K: LinkKey, T: FieldValue>(
        &self,
        field: &LinkedField<K, T>,
        mut filter: impl FnMut(&T) -> bool,
    ) -> DataResult<Vec<K>> {
        Ok(self
            .shared_values(field)?
            .into_iter()
            .filter(|(_, value)| filter(value))
            .map(|(key, _)| key)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tally_core::DataError;
    use tally_store::{DataStorage, InMemoryStorage};
    use tally_types::{field, validators, LinkType};

    fn api() -> DataApi {
        DataApi::builder(Arc::new(InMemoryStorage::new()))
            .without_sweeper()
            .build()
            .unwrap()
    }

    fn level() -> OwnerField<u32> {
        field("progress", "level", 1u32).owner()
    }

    fn seeded(levels: &[u32]) -> (DataApi, Vec<OwnerId>) {
        let api = api();
        let level = level();
        let owners = levels
            .iter()
            .map(|&l| {
                let owner = OwnerId::new();
                api.set(owner, &level, l).unwrap();
                owner
            })
            .collect();
        (api, owners)
    }

    // ---- leaderboards ----

    #[test]
    fn ranks_are_contiguous_and_capped() {
        let (api, owners) = seeded(&[5, 40, 12, 40, 3]);
        let top = api.top_desc(&level(), 3).unwrap();
        assert_eq!(top.iter().map(|e| e.rank).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(top.iter().map(|e| e.value).collect::<Vec<_>>(), vec![40, 40, 12]);
        assert_eq!(top[2].id, owners[2]);

        let all = api.top_desc(&level(), 100).unwrap();
        assert_eq!(all.len(), 5);
        assert_eq!(all.last().unwrap().rank, 5);
    }

    #[test]
    fn custom_order_ascending() {
        let (api, owners) = seeded(&[5, 40, 3]);
        let bottom = api.top(&level(), 1, |a, b| a.cmp(b)).unwrap();
        assert_eq!(
            bottom,
            vec![LeaderboardEntry { id: owners[2], value: 3, rank: 1 }]
        );
    }

    #[test]
    fn empty_population() {
        let api = api();
        assert!(api.top_desc(&level(), 10).unwrap().is_empty());
        let page = api.top_paged(&level(), 1, 10).unwrap();
        assert_eq!(page.total_pages, 0);
        assert_eq!(page.total_elements, 0);
        assert!(!page.has_next());
    }

    #[test]
    fn pages_continue_ranks() {
        let (api, _) = seeded(&[1, 2, 3, 4, 5, 6, 7]);
        let second = api.top_paged(&level(), 2, 3).unwrap();
        assert_eq!(second.page, 2);
        assert_eq!(second.total_pages, 3);
        assert_eq!(second.total_elements, 7);
        assert!(second.has_next());
        assert_eq!(second.content.iter().map(|e| e.rank).collect::<Vec<_>>(), vec![4, 5, 6]);
        assert_eq!(second.content.iter().map(|e| e.value).collect::<Vec<_>>(), vec![4, 3, 2]);

        let last = api.top_paged(&level(), 3, 3).unwrap();
        assert_eq!(last.content.len(), 1);
        assert!(api.top_paged(&level(), 9, 3).unwrap().content.is_empty());
        assert_eq!(api.top_paged(&level(), 0, 0).unwrap().page, 1);
    }

    #[test]
    fn unparsable_ids_are_skipped() {
        let (api, _) = seeded(&[9]);
        api.storage().save("players", "not-a-uuid", b"{}").unwrap();
        assert_eq!(api.top_desc(&level(), 10).unwrap().len(), 1);
    }

    // ---- queries ----

    #[test]
    fn query_and_count_filter_values() {
        let (api, owners) = seeded(&[10, 25, 30]);
        let mut found = api.query(&level(), |&l| l >= 25).unwrap();
        found.sort();
        let mut expected = vec![owners[1], owners[2]];
        expected.sort();
        assert_eq!(found, expected);
        assert_eq!(api.count(&level(), |&l| l < 25).unwrap(), 1);
    }

    #[test]
    fn unset_field_reads_default_in_scan() {
        let (api, _) = seeded(&[7, 8]);
        let title = field("profile", "title", String::new()).owner();
        assert_eq!(api.count(&title, String::is_empty).unwrap(), 2);
    }

    // ---- updates ----

    #[test]
    fn update_where_touches_matching_owners() {
        let (api, owners) = seeded(&[10, 50, 60]);
        let changed = api.update_where(&level(), |&l| l >= 50, |l| l + 1).unwrap();
        assert_eq!(changed, 2);
        assert_eq!(api.get(owners[0], &level()).unwrap(), 10);
        assert_eq!(api.get(owners[1], &level()).unwrap(), 51);
        assert_eq!(api.get(owners[2], &level()).unwrap(), 61);

        assert_eq!(api.update_all(&level(), |_| 1).unwrap(), 3);
        assert_eq!(api.count(&level(), |&l| l == 1).unwrap(), 3);
    }

    #[test]
    fn update_all_counts_owners_written_not_values_changed() {
        let (api, _) = seeded(&[1, 1, 2]);
        assert_eq!(api.update_all(&level(), |_| 1).unwrap(), 3);
        assert_eq!(api.count(&level(), |&l| l == 1).unwrap(), 3);
    }

    #[test]
    fn update_where_stops_on_validation_failure() {
        let api = api();
        let coins = field("economy", "coins", 0i64)
            .validator(validators::non_negative())
            .owner();
        let owner = OwnerId::new();
        api.set(owner, &coins, 5).unwrap();
        let err = api.update_all(&coins, |c| c - 10).unwrap_err();
        assert!(matches!(err, DataError::Validation(_)));
        assert_eq!(api.get(owner, &coins).unwrap(), 5);
    }

    // ---- shared entities ----

    #[test]
    fn linked_leaderboard_and_query() {
        let api = api();
        let guild = LinkType::<String>::serde("guild");
        let xp = field("guild", "xp", 0u64).linked(&guild);
        api.set_direct(&"red".to_string(), &xp, 300).unwrap();
        api.set_direct(&"blue".to_string(), &xp, 900).unwrap();
        api.set_direct(&"green".to_string(), &xp, 100).unwrap();

        let top = api.top_linked(&xp, 2).unwrap();
        assert_eq!(
            top,
            vec![
                LeaderboardEntry { id: "blue".to_string(), value: 900, rank: 1 },
                LeaderboardEntry { id: "red".to_string(), value: 300, rank: 2 },
            ]
        );

        let mut small = api.query_linked(&xp, |&v| v < 500).unwrap();
        small.sort();
        assert_eq!(small, vec!["green".to_string(), "red".to_string()]);
    }
}
