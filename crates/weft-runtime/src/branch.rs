#![forbid(unsafe_code)]

//! Conditional branches (`If`).
//!
//! An `If` element remembers which branch is active. Asking for the active
//! branch again does nothing. Switching purges the whole subtree built by
//! the previous branch before the new branch function runs, so the new
//! content never sees stale element ids.
//!
//! States: no branch active, or branch `k` active. The only transition is
//! [`if_else_branch_update_function`](View::if_else_branch_update_function)
//! with `k` different from the current branch. Deleting the owning view
//! purges whatever the last active branch built.

use tracing::{debug, trace};
use weft_core::{ElementId, Result};

use crate::runtime::RenderFrame;
use crate::view::View;

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct BranchState {
    active: Option<u32>,
}

impl View {
    /// Switch the `If` element `if_elmt_id` to `branch_id`, building it with
    /// `branch_fn`. Returns `false` (and does nothing) if that branch is
    /// already active.
    ///
    /// If `branch_fn` fails, whatever it created is purged and no branch is
    /// active, so the next call rebuilds.
    pub fn if_else_branch_update_function(
        &self,
        if_elmt_id: ElementId,
        branch_id: u32,
        branch_fn: impl FnOnce(&View) -> Result<()>,
    ) -> Result<bool> {
        self.require_element(if_elmt_id)?;
        let current = self.active_branch(if_elmt_id);
        if current == Some(branch_id) {
            trace!(%if_elmt_id, branch_id, "branch unchanged");
            return Ok(false);
        }

        let previous = self.collect_subtree(if_elmt_id, false);
        self.set_active_branch(if_elmt_id, Some(branch_id));
        self.purge_element_ids(&previous);
        debug!(
            %if_elmt_id,
            from = ?current,
            to = branch_id,
            purged = previous.len(),
            "switching branch"
        );

        // New elements must be attributed to the If element.
        let rt = self.runtime();
        let in_frame = rt
            .current_render()
            .is_some_and(|f| f.view == self.id() && f.elmt_id == if_elmt_id);
        let result = if in_frame {
            branch_fn(self)
        } else {
            let _frame = rt.push_render(RenderFrame {
                view: self.id(),
                elmt_id: if_elmt_id,
            });
            branch_fn(self)
        };

        if let Err(err) = result {
            let partial = self.collect_subtree(if_elmt_id, false);
            self.purge_element_ids(&partial);
            self.set_active_branch(if_elmt_id, None);
            return Err(err);
        }
        Ok(true)
    }

    /// The active branch of an `If` element.
    #[must_use]
    pub fn active_branch(&self, if_elmt_id: ElementId) -> Option<u32> {
        self.inner
            .branches
            .borrow()
            .get(&if_elmt_id)
            .and_then(|s| s.active)
    }

    fn set_active_branch(&self, if_elmt_id: ElementId, active: Option<u32>) {
        self.inner
            .branches
            .borrow_mut()
            .entry(if_elmt_id)
            .or_default()
            .active = active;
    }
}
