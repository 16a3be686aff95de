#![forbid(unsafe_code)]

//! Field accessors.
//!
//! Bound component fields (state, props, consumed values) are reached
//! through a [`FieldAccessor`]: a pair of closures installed on the view when
//! the field is declared. The view's generic field API
//! ([`View::get_field`](crate::View::get_field) /
//! [`View::set_field`](crate::View::set_field)) and parameter updates go
//! through it, so a field can be rebound without the caller knowing what kind
//! of storage sits behind it.

use std::rc::Rc;

use weft_core::{Result, Value};

use crate::cell::ObservedProperty;
use crate::prop::OneWayProp;

type Getter = dyn Fn() -> Value;
type Setter = dyn Fn(Value) -> Result<()>;

/// `get`/`set` closures for one bound field.
#[derive(Clone)]
pub struct FieldAccessor {
    get: Rc<Getter>,
    set: Rc<Setter>,
}

impl FieldAccessor {
    pub fn new(
        get: impl Fn() -> Value + 'static,
        set: impl Fn(Value) -> Result<()> + 'static,
    ) -> Self {
        Self {
            get: Rc::new(get),
            set: Rc::new(set),
        }
    }

    /// Read and write a cell directly (state, provide/consume).
    #[must_use]
    pub fn for_cell(cell: &ObservedProperty) -> Self {
        let (reader, writer) = (cell.clone(), cell.clone());
        Self::new(move || reader.get(), move |v| writer.set(v))
    }

    /// Read and write a prop's local copy. Writes never reach the source.
    #[must_use]
    pub fn for_prop(prop: &OneWayProp) -> Self {
        let (reader, writer) = (prop.clone(), prop.clone());
        Self::new(move || reader.get(), move |v| writer.set(v))
    }

    #[must_use]
    pub fn get(&self) -> Value {
        (self.get)()
    }

    pub fn set(&self, value: Value) -> Result<()> {
        (self.set)(value)
    }
}

impl std::fmt::Debug for FieldAccessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldAccessor").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;
    use std::cell::RefCell;

    #[test]
    fn custom_closures() {
        let store = Rc::new(RefCell::new(Value::from(1)));
        let (r, w) = (Rc::clone(&store), Rc::clone(&store));
        let accessor = FieldAccessor::new(
            move || r.borrow().clone(),
            move |v| {
                *w.borrow_mut() = v;
                Ok(())
            },
        );
        accessor.set(Value::from("x")).unwrap();
        assert_eq!(accessor.get(), Value::from("x"));
    }

    #[test]
    fn prop_accessor_writes_stay_local() {
        let rt = Runtime::default();
        let prop = OneWayProp::from_value(&rt, 1, None, "n");
        let accessor = FieldAccessor::for_prop(&prop);
        accessor.set(Value::from(2)).unwrap();
        assert_eq!(prop.source().get_untracked(), Value::from(1));
        assert_eq!(accessor.get(), Value::from(2));
    }
}
