#![forbid(unsafe_code)]

//! Keyed list diffing for `ForEach`.
//!
//! Every item gets a key, either from the caller's id generator or
//! synthesized as `"{index}__{json}"`. On each pass the new key array is
//! compared with the previous one: only items whose key is new get their
//! item generator run, and the element ids created for an item are
//! remembered per key so that removing the key purges exactly that subtree.
//!
//! # Failure Modes
//!
//! | Failure | Cause | Behavior |
//! |---------|-------|----------|
//! | Key synthesis fails | circular item without an id generator | [`ReactiveError::IdGeneration`] naming the `ForEach` element |
//! | Duplicate key | id generator not unique | `warn!`, later duplicates are skipped |
//! | Item generator error | user code | the item's partial subtree is purged; it and every later new item are retried next pass, error returned |

use ahash::{AHashMap, AHashSet};
use tracing::{debug, warn};
use weft_core::{ElementId, ReactiveError, Result, Value};

use crate::view::View;

/// Per-`ForEach` state kept between passes.
#[derive(Debug, Default)]
pub(crate) struct ForEachState {
    keys: Vec<String>,
    slots: AHashMap<String, Vec<ElementId>>,
}

/// Indices into `next` whose key does not appear in `prev`.
///
/// Only the first occurrence of a key in `next` counts; later duplicates are
/// never reported as new.
#[must_use]
pub fn new_item_indices(prev: &[String], next: &[String]) -> Vec<usize> {
    let previous: AHashSet<&str> = prev.iter().map(String::as_str).collect();
    let mut seen = AHashSet::with_capacity(next.len());
    next.iter()
        .enumerate()
        .filter(|(_, key)| seen.insert(key.as_str()) && !previous.contains(key.as_str()))
        .map(|(index, _)| index)
        .collect()
}

/// Key used when no id generator is supplied.
///
/// # Errors
///
/// [`ReactiveError::IdGeneration`] if the item cannot be serialized.
pub fn default_item_key(elmt_id: ElementId, index: usize, item: &Value) -> Result<String> {
    let json = item.to_json().map_err(|e| ReactiveError::IdGeneration {
        elmt_id,
        reason: format!(
            "item {index} cannot be serialized ({e}); supply an id generator for this list"
        ),
    })?;
    Ok(format!("{index}__{json}"))
}

impl View {
    /// Diff `items` against the previous pass of the `ForEach` element
    /// `elmt_id` and run `item_gen` for new items only.
    ///
    /// Returns the indices that were generated.
    pub fn for_each_update_function(
        &self,
        elmt_id: ElementId,
        items: &[Value],
        item_gen: impl Fn(&View, &Value, usize) -> Result<()>,
        id_gen: Option<&dyn Fn(&Value, usize) -> String>,
    ) -> Result<Vec<usize>> {
        self.require_element(elmt_id)?;

        let keys = items
            .iter()
            .enumerate()
            .map(|(index, item)| match id_gen {
                Some(id_gen) => Ok(id_gen(item, index)),
                None => default_item_key(elmt_id, index, item),
            })
            .collect::<Result<Vec<String>>>()?;

        let mut unique = AHashSet::with_capacity(keys.len());
        for key in &keys {
            if !unique.insert(key.as_str()) {
                warn!(%elmt_id, key = %key, "duplicate ForEach key; later items with this key are skipped");
            }
        }

        let (prev_keys, removed_ids) = {
            let mut states = self.inner.foreach.borrow_mut();
            let state = states.entry(elmt_id).or_default();
            let mut removed = Vec::new();
            state.slots.retain(|key, ids| {
                if unique.contains(key.as_str()) {
                    true
                } else {
                    removed.extend(ids.iter().copied());
                    false
                }
            });
            (std::mem::take(&mut state.keys), removed)
        };

        if !removed_ids.is_empty() {
            let mut subtree = Vec::new();
            for id in removed_ids {
                subtree.extend(self.collect_subtree(id, true));
            }
            subtree.sort_unstable();
            subtree.dedup();
            self.purge_element_ids(&subtree);
        }

        let added = new_item_indices(&prev_keys, &keys);
        debug!(
            %elmt_id,
            items = items.len(),
            added = added.len(),
            "ForEach diff"
        );

        self.store_keys(elmt_id, keys.clone());
        for (position, &index) in added.iter().enumerate() {
            self.start_new_child();
            let result = item_gen(self, &items[index], index);
            let created = self.finish_new_child();
            if let Err(err) = result {
                let ungenerated: Vec<&str> =
                    added[position..].iter().map(|&i| keys[i].as_str()).collect();
                self.discard_failed_items(elmt_id, &ungenerated, &created);
                return Err(err);
            }
            if let Some(state) = self.inner.foreach.borrow_mut().get_mut(&elmt_id) {
                state.slots.insert(keys[index].clone(), created);
            }
        }
        Ok(added)
    }

    /// Purge the partial subtree of a failed item and forget the keys of
    /// every item not generated yet, so the next pass retries them all.
    fn discard_failed_items(&self, elmt_id: ElementId, ungenerated: &[&str], created: &[ElementId]) {
        let mut subtree: Vec<ElementId> = created
            .iter()
            .flat_map(|&id| self.collect_subtree(id, true))
            .collect();
        subtree.sort_unstable();
        subtree.dedup();
        self.purge_element_ids(&subtree);
        if let Some(state) = self.inner.foreach.borrow_mut().get_mut(&elmt_id) {
            state.keys.retain(|k| !ungenerated.contains(&k.as_str()));
        }
    }

    fn store_keys(&self, elmt_id: ElementId, keys: Vec<String>) {
        if let Some(state) = self.inner.foreach.borrow_mut().get_mut(&elmt_id) {
            state.keys = keys;
        }
    }

    /// Keys of the last pass of a `ForEach` element.
    #[must_use]
    pub fn for_each_keys(&self, elmt_id: ElementId) -> Vec<String> {
        self.inner
            .foreach
            .borrow()
            .get(&elmt_id)
            .map(|s| s.keys.clone())
            .unwrap_or_default()
    }

    /// Element ids created for the item with `key`.
    #[must_use]
    pub fn for_each_slot(&self, elmt_id: ElementId, key: &str) -> Vec<ElementId> {
        self.inner
            .foreach
            .borrow()
            .get(&elmt_id)
            .and_then(|s| s.slots.get(key).cloned())
            .unwrap_or_default()
    }
}
