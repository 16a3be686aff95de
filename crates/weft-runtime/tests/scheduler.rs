//! View update scheduling: ordering, rollback, ForEach, If, and view trees.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use proptest::prelude::*;
use weft_core::{ElementId, ObjectRef, ReactiveError, Value};
use weft_runtime::{ObservedProperty, Runtime, View};

type Log = Rc<RefCell<Vec<ElementId>>>;

fn no_params() -> Vec<(&'static str, Value)> {
    Vec::new()
}

/// Register `count` elements that each append their id to the log.
fn logging_elements(view: &View, count: usize, log: &Log) -> Vec<ElementId> {
    (0..count)
        .map(|_| {
            let log = Rc::clone(log);
            view.observe_component_creation2(
                move |_, id, _| {
                    log.borrow_mut().push(id);
                    Ok(())
                },
                "Text",
            )
            .unwrap()
        })
        .collect()
}

#[test]
fn update_runs_in_ascending_id_order() {
    let rt = Runtime::default();
    let view = rt.create_view("Root", None);
    let log: Log = Rc::default();

    // Nested creation makes registration order differ from id order: the
    // outer element's closure creates its child before it logs itself.
    let l = Rc::clone(&log);
    let outer = view
        .observe_component_creation2(
            move |v, id, first| {
                if first {
                    let inner_log = Rc::clone(&l);
                    v.observe_component_creation2(
                        move |_, id, _| {
                            inner_log.borrow_mut().push(id);
                            Ok(())
                        },
                        "Text",
                    )?;
                }
                l.borrow_mut().push(id);
                Ok(())
            },
            "Column",
        )
        .unwrap();
    let rest = logging_elements(&view, 2, &log);
    log.borrow_mut().clear();

    view.update(no_params()).unwrap();
    let order = log.borrow().clone();
    let mut sorted = order.clone();
    sorted.sort();
    assert_eq!(order, sorted);
    assert_eq!(order.first(), Some(&outer));
    assert_eq!(order.last(), rest.last());
    assert_eq!(order.len(), 4);
}

proptest! {
    #[test]
    fn dirty_elements_rerender_in_ascending_order(
        order in Just((0..8usize).collect::<Vec<_>>()).prop_shuffle(),
        pick in prop::collection::vec(any::<bool>(), 8),
    ) {
        let rt = Runtime::default();
        let view = rt.create_view("Grid", None);
        let log: Log = Rc::default();
        let cells: Vec<ObservedProperty> =
            (0..8).map(|i| view.declare_state(&format!("c{i}"), 0)).collect();
        let ids: Vec<ElementId> = cells
            .iter()
            .map(|cell| {
                let (cell, log) = (cell.clone(), Rc::clone(&log));
                view.observe_component_creation2(
                    move |_, id, _| {
                        let _ = cell.get();
                        log.borrow_mut().push(id);
                        Ok(())
                    },
                    "Text",
                )
                .unwrap()
            })
            .collect();
        log.borrow_mut().clear();

        rt.batch(|| {
            for &i in &order {
                if pick[i] {
                    cells[i].set(1)?;
                }
            }
            Ok(())
        })
        .unwrap();

        let expected: Vec<ElementId> =
            (0..8).filter(|&i| pick[i]).map(|i| ids[i]).collect();
        prop_assert_eq!(log.borrow().clone(), expected);
    }
}

#[test]
fn first_render_failure_rolls_back() {
    let rt = Runtime::default();
    let view = rt.create_view("Root", None);
    let attempted = Rc::new(Cell::new(None));
    let slot = Rc::clone(&attempted);
    let err = view
        .observe_component_creation2(
            move |v, id, _| {
                slot.set(Some(id));
                v.observe_component_creation2(|_, _, _| Ok(()), "Text")?;
                Err(ReactiveError::render(id, "image decode failed"))
            },
            "Image",
        )
        .unwrap_err();

    let id = attempted.get().unwrap();
    assert_eq!(err, ReactiveError::render(id, "image decode failed"));
    assert!(!view.has_element(id));
    assert_eq!(view.element_count(), 0);
    assert_eq!(rt.element_owner(id), None);
}

#[test]
fn list_diff_only_generates_new_keys() {
    let rt = Runtime::default();
    let view = rt.create_view("List", None);
    let generated = Rc::new(RefCell::new(Vec::new()));
    let items = Rc::new(RefCell::new(vec![
        Value::from(ObjectRef::plain().with("id", "a")),
        Value::from(ObjectRef::plain().with("id", "b")),
        Value::from(ObjectRef::plain().with("id", "c")),
    ]));

    let (gen_log, source) = (Rc::clone(&generated), Rc::clone(&items));
    let list = view
        .observe_component_creation2(
            move |v, id, _| {
                let items = source.borrow().clone();
                let id_gen = |item: &Value, _: usize| {
                    item.as_object()
                        .and_then(|o| o.get("id"))
                        .and_then(|k| k.as_str().map(str::to_string))
                        .unwrap_or_default()
                };
                let log = Rc::clone(&gen_log);
                v.for_each_update_function(
                    id,
                    &items,
                    move |v, item, _| {
                        let key = item.as_object().and_then(|o| o.get("id")).unwrap_or_default();
                        log.borrow_mut().push(key.as_str().unwrap_or_default().to_string());
                        v.observe_component_creation2(|_, _, _| Ok(()), "ListItem")?;
                        Ok(())
                    },
                    Some(&id_gen),
                )?;
                Ok(())
            },
            "ForEach",
        )
        .unwrap();
    assert_eq!(*generated.borrow(), vec!["a", "b", "c"]);
    let b_slot = view.for_each_slot(list, "b");
    generated.borrow_mut().clear();

    *items.borrow_mut() = vec![
        Value::from(ObjectRef::plain().with("id", "a")),
        Value::from(ObjectRef::plain().with("id", "c")),
        Value::from(ObjectRef::plain().with("id", "d")),
    ];
    view.update(no_params()).unwrap();
    assert_eq!(*generated.borrow(), vec!["d"]);
    assert!(b_slot.iter().all(|id| !view.has_element(*id)));
    assert_eq!(view.for_each_keys(list), vec!["a", "c", "d"]);
}

#[test]
fn branch_noop_for_active_branch() {
    let rt = Runtime::default();
    let view = rt.create_view("Root", None);
    let if_id = view
        .observe_component_creation2(|_, _, _| Ok(()), "If")
        .unwrap();
    let calls = Rc::new(Cell::new(0));

    for _ in 0..2 {
        let c = Rc::clone(&calls);
        view.if_else_branch_update_function(if_id, 1, move |_| {
            c.set(c.get() + 1);
            Ok(())
        })
        .unwrap();
    }
    assert_eq!(calls.get(), 1);
}

#[test]
fn state_driven_branch_switch() {
    let rt = Runtime::default();
    let view = rt.create_view("Toggle", None);
    let on = view.declare_state("on", true);
    let built = Rc::new(RefCell::new(Vec::new()));

    let (flag, log) = (on.clone(), Rc::clone(&built));
    let if_id = view
        .observe_component_creation2(
            move |v, id, _| {
                let branch = if flag.get().as_bool().unwrap_or(false) { 0 } else { 1 };
                let log = Rc::clone(&log);
                v.if_else_branch_update_function(id, branch, move |v| {
                    let text = v.observe_component_creation2(|_, _, _| Ok(()), "Text")?;
                    log.borrow_mut().push((branch, text));
                    Ok(())
                })?;
                Ok(())
            },
            "If",
        )
        .unwrap();
    let (_, then_text) = built.borrow()[0];

    on.set(false).unwrap();
    assert_eq!(view.active_branch(if_id), Some(1));
    assert!(!view.has_element(then_text));
    assert_eq!(built.borrow().len(), 2);

    // Same branch again: nothing rebuilt.
    on.set(Value::Null).unwrap();
    assert_eq!(built.borrow().len(), 2);
}

#[test]
fn parent_rerender_pushes_props_into_child() {
    let rt = Runtime::default();
    let parent = rt.create_view("Parent", None);
    let child = parent.create_child("Child");
    let count = parent.declare_state("count", 1);
    let label = child.declare_prop("count", count.get_untracked());

    let rendered = Rc::new(RefCell::new(Vec::new()));
    let (l, r) = (label.clone(), Rc::clone(&rendered));
    child
        .observe_component_creation2(
            move |_, _, _| {
                r.borrow_mut().push(l.get());
                Ok(())
            },
            "Text",
        )
        .unwrap();

    let (c, kid) = (count.clone(), child.clone());
    parent
        .observe_component_creation2(
            move |_, _, first| {
                let value = c.get();
                if !first {
                    kid.update([("count", value)])?;
                }
                Ok(())
            },
            "ChildSlot",
        )
        .unwrap();

    count.set(5).unwrap();
    assert_eq!(label.get(), Value::from(5));
    assert_eq!(rendered.borrow().last(), Some(&Value::from(5)));
    assert_eq!(count.get_untracked(), Value::from(5));

    // Writing the child's copy never reaches the parent.
    label.set(42).unwrap();
    assert_eq!(count.get_untracked(), Value::from(5));
}

#[test]
fn consume_through_a_disposed_parent_is_an_error() {
    let rt = Runtime::default();
    let parent = rt.create_view("Parent", None);
    let kid = parent.create_child("Kid");
    assert!(matches!(
        kid.consume("theme"),
        Err(ReactiveError::MissingProvider { .. })
    ));

    parent.about_to_be_deleted().unwrap();
    assert!(kid.is_deleted());
    assert_eq!(
        kid.consume("theme").unwrap_err(),
        ReactiveError::ViewDisposed { view: parent.id() }
    );
}

#[test]
fn shutdown_clears_every_view() {
    let rt = Runtime::default();
    let root = rt.create_view("Root", None);
    let child = root.create_child("Child");
    let cell = child.declare_state("s", 0);
    let c = cell.clone();
    child
        .observe_component_creation2(
            move |_, _, _| {
                let _ = c.get();
                Ok(())
            },
            "Text",
        )
        .unwrap();
    rt.create_view("Other", None);

    rt.shutdown().unwrap();
    assert_eq!(rt.view_count(), 0);
    assert!(cell.is_deleted());
    assert!(cell.dependent_element_ids().is_empty());
}
