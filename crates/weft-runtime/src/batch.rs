#![forbid(unsafe_code)]

//! Deferred delivery.
//!
//! A [`BatchScope`] holds back change delivery until it ends. Values still
//! change immediately; only the re-running of dependents waits. Scopes nest,
//! and only the outermost one flushes.
//!
//! Prefer [`BatchScope::finish`], which returns flush errors. A scope that is
//! simply dropped still flushes but can only log a failure.

use tracing::error;
use weft_core::Result;

use crate::runtime::Runtime;

/// RAII guard deferring delivery for a runtime.
#[must_use = "dropping the scope ends the batch"]
pub struct BatchScope {
    rt: Runtime,
    open: bool,
}

impl BatchScope {
    pub fn new(rt: &Runtime) -> Self {
        rt.enter_batch();
        Self {
            rt: rt.clone(),
            open: true,
        }
    }

    /// End the scope and deliver pending changes if it was the outermost.
    pub fn finish(mut self) -> Result<()> {
        self.close()
    }

    fn close(&mut self) -> Result<()> {
        if !std::mem::replace(&mut self.open, false) {
            return Ok(());
        }
        if self.rt.leave_batch() {
            self.rt.schedule()
        } else {
            Ok(())
        }
    }
}

impl Drop for BatchScope {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            error!(error = %err, "flush at end of batch scope failed");
        }
    }
}

impl std::fmt::Debug for BatchScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchScope").field("open", &self.open).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::ObservedProperty;
    use std::cell::Cell;
    use std::rc::Rc;
    use weft_core::Value;

    #[test]
    fn deliveries_wait_for_outermost_scope() {
        let rt = Runtime::default();
        let view = rt.create_view("Root", None);
        let cell = view.declare_state("n", 0);
        let runs = Rc::new(Cell::new(0));
        let (c, r) = (cell.clone(), Rc::clone(&runs));
        view.observe_component_creation2(
            move |_, _, _| {
                let _ = c.get();
                r.set(r.get() + 1);
                Ok(())
            },
            "Text",
        )
        .unwrap();

        let outer = BatchScope::new(&rt);
        {
            let inner = BatchScope::new(&rt);
            cell.set(1).unwrap();
            cell.set(2).unwrap();
            inner.finish().unwrap();
        }
        assert_eq!(runs.get(), 1);
        assert_eq!(cell.get_untracked(), Value::from(2));
        outer.finish().unwrap();
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn dropped_scope_still_flushes() {
        let rt = Runtime::default();
        let cell = ObservedProperty::new(&rt, 0, None, "n");
        let seen = Rc::new(Cell::new(0));
        let s = Rc::clone(&seen);
        let _sub = cell.subscribe(move |_| s.set(s.get() + 1));
        {
            let _scope = BatchScope::new(&rt);
            cell.set(1).unwrap();
            assert!(rt.in_batch());
        }
        assert!(!rt.in_batch());
        assert_eq!(seen.get(), 1);
    }
}
