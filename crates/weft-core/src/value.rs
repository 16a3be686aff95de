#![forbid(unsafe_code)]

//! Dynamic values manipulated by the reactive core.
//!
//! Application state is not statically typed from the core's point of view:
//! a cell may hold a number today and an object graph tomorrow. [`Value`]
//! models that, and [`ObjectRef`] gives objects a stable identity so that
//! "same value" can be decided the way a strict equality check would.
//!
//! # Invariants
//!
//! 1. `Value::same` compares primitives by value and objects by identity.
//!    `NaN` is never the same as anything, including itself.
//! 2. Cloning an [`ObjectRef`] clones the handle, never the object.
//! 3. Serialization terminates on cyclic graphs by returning an error.
//!
//! # Failure Modes
//!
//! | Failure | Cause | Behavior |
//! |---------|-------|----------|
//! | Cyclic graph serialized | `a.self = a` | `serde_json::Error` naming the object |
//! | Missing property | `get` on absent key | `None` |
//! | Index past end | `get("9")` on short array | `None` |

use core::fmt;
use std::cell::{Ref, RefCell, RefMut};
use std::rc::Rc;

use indexmap::IndexMap;
use serde::ser::{Error as _, SerializeMap, SerializeSeq, SerializeTuple};
use serde::{Serialize, Serializer};

use crate::id::ObjectId;

// ---------------------------------------------------------------------------
// Value
// ---------------------------------------------------------------------------

/// A dynamically typed value.
#[derive(Clone, Default)]
pub enum Value {
    /// No value.
    #[default]
    Undefined,
    /// Explicit null.
    Null,
    Bool(bool),
    Number(f64),
    String(Rc<str>),
    Object(ObjectRef),
}

impl Value {
    /// Strict-equality check: primitives by value, objects by identity.
    #[must_use]
    pub fn same(&self, other: &Value) -> bool {
        match (self, other) {
            (Self::Undefined, Self::Undefined) | (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Number(a), Self::Number(b)) => a == b,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Object(a), Self::Object(b)) => a.ptr_eq(b),
            _ => false,
        }
    }

    /// Structural equality. Objects are compared by kind, class, and contents;
    /// cycles are assumed equal once both sides revisit the same pair.
    #[must_use]
    pub fn deep_eq(&self, other: &Value) -> bool {
        let mut visiting = Vec::new();
        deep_eq_inner(self, other, &mut visiting)
    }

    #[must_use]
    pub fn is_undefined(&self) -> bool {
        matches!(self, Self::Undefined)
    }

    #[must_use]
    pub fn is_object(&self) -> bool {
        matches!(self, Self::Object(_))
    }

    #[must_use]
    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Self::Object(obj) => Some(obj),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// A short name of the value's type for diagnostics.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::Object(obj) => obj.kind_name(),
        }
    }

    /// Serialize to a JSON string. Fails on cyclic object graphs.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Equality is strict equality ([`Value::same`]), not structural equality.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.same(other)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undefined => f.write_str("undefined"),
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s:?}"),
            Self::Object(obj) => write!(f, "{obj:?}"),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Number(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Number(f64::from(v))
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Self::Number(f64::from(v))
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(Rc::from(v))
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(Rc::from(v))
    }
}

impl From<ObjectRef> for Value {
    fn from(v: ObjectRef) -> Self {
        Self::Object(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Undefined, Into::into)
    }
}

fn deep_eq_inner(a: &Value, b: &Value, visiting: &mut Vec<(ObjectId, ObjectId)>) -> bool {
    let (oa, ob) = match (a, b) {
        (Value::Object(oa), Value::Object(ob)) => (oa, ob),
        _ => return a.same(b),
    };
    if oa.ptr_eq(ob) {
        return true;
    }
    let pair = (oa.id(), ob.id());
    if visiting.contains(&pair) {
        return true;
    }
    visiting.push(pair);

    let da = oa.borrow();
    let db = ob.borrow();
    let equal = da.class == db.class
        && da.props.len() == db.props.len()
        && da
            .props
            .iter()
            .all(|(k, va)| db.props.get(k).is_some_and(|vb| deep_eq_inner(va, vb, visiting)))
        && match (&da.kind, &db.kind) {
            (ObjectKind::Plain, ObjectKind::Plain) => true,
            (ObjectKind::Date(x), ObjectKind::Date(y)) => x == y,
            (ObjectKind::Array(x), ObjectKind::Array(y))
            | (ObjectKind::Set(x), ObjectKind::Set(y)) => {
                x.len() == y.len()
                    && x.iter().zip(y).all(|(vx, vy)| deep_eq_inner(vx, vy, visiting))
            }
            (ObjectKind::Map(x), ObjectKind::Map(y)) => {
                x.len() == y.len()
                    && x.iter().zip(y).all(|((kx, vx), (ky, vy))| {
                        deep_eq_inner(kx, ky, visiting) && deep_eq_inner(vx, vy, visiting)
                    })
            }
            _ => false,
        };

    visiting.pop();
    equal
}

// ---------------------------------------------------------------------------
// Objects
// ---------------------------------------------------------------------------

/// The structural kind of an object.
#[derive(Debug, Clone)]
pub enum ObjectKind {
    Plain,
    Array(Vec<Value>),
    /// Milliseconds since the epoch.
    Date(f64),
    /// Insertion-ordered set; membership by [`Value::same`].
    Set(Vec<Value>),
    /// Insertion-ordered map; key lookup by [`Value::same`].
    Map(Vec<(Value, Value)>),
}

/// Object contents.
#[derive(Debug, Clone)]
pub struct ObjectData {
    pub kind: ObjectKind,
    /// Class tag. Copies keep it, so a copied `Point` is still a `Point`.
    pub class: Option<Rc<str>>,
    /// Named properties in insertion order.
    pub props: IndexMap<Rc<str>, Value>,
    /// Property reads and writes of observed objects are dependency-tracked.
    pub observed: bool,
}

impl ObjectData {
    #[must_use]
    pub fn new(kind: ObjectKind) -> Self {
        Self {
            kind,
            class: None,
            props: IndexMap::new(),
            observed: false,
        }
    }

    /// An empty object with the same kind, class, and observed flag.
    #[must_use]
    pub fn empty_like(&self) -> Self {
        let kind = match &self.kind {
            ObjectKind::Plain => ObjectKind::Plain,
            ObjectKind::Array(_) => ObjectKind::Array(Vec::new()),
            ObjectKind::Date(ms) => ObjectKind::Date(*ms),
            ObjectKind::Set(_) => ObjectKind::Set(Vec::new()),
            ObjectKind::Map(_) => ObjectKind::Map(Vec::new()),
        };
        Self {
            kind,
            class: self.class.clone(),
            props: IndexMap::new(),
            observed: self.observed,
        }
    }
}

/// Shared handle to an object with a stable identity.
#[derive(Clone)]
pub struct ObjectRef {
    id: ObjectId,
    data: Rc<RefCell<ObjectData>>,
}

impl ObjectRef {
    /// Wrap object contents in a fresh identity.
    #[must_use]
    pub fn from_data(data: ObjectData) -> Self {
        Self {
            id: ObjectId::next(),
            data: Rc::new(RefCell::new(data)),
        }
    }

    #[must_use]
    pub fn plain() -> Self {
        Self::from_data(ObjectData::new(ObjectKind::Plain))
    }

    #[must_use]
    pub fn array(items: impl IntoIterator<Item = Value>) -> Self {
        Self::from_data(ObjectData::new(ObjectKind::Array(items.into_iter().collect())))
    }

    #[must_use]
    pub fn date(epoch_ms: f64) -> Self {
        Self::from_data(ObjectData::new(ObjectKind::Date(epoch_ms)))
    }

    #[must_use]
    pub fn set(items: impl IntoIterator<Item = Value>) -> Self {
        let mut unique: Vec<Value> = Vec::new();
        for item in items {
            if !unique.iter().any(|v| v.same(&item)) {
                unique.push(item);
            }
        }
        Self::from_data(ObjectData::new(ObjectKind::Set(unique)))
    }

    #[must_use]
    pub fn map(entries: impl IntoIterator<Item = (Value, Value)>) -> Self {
        let obj = Self::from_data(ObjectData::new(ObjectKind::Map(Vec::new())));
        for (k, v) in entries {
            obj.map_insert(k, v);
        }
        obj
    }

    /// Builder: set a property and return the handle.
    #[must_use]
    pub fn with(self, key: &str, value: impl Into<Value>) -> Self {
        self.insert(key, value.into());
        self
    }

    /// Builder: tag the object with a class name.
    #[must_use]
    pub fn with_class(self, class: &str) -> Self {
        self.data.borrow_mut().class = Some(Rc::from(class));
        self
    }

    /// Builder: mark the object as observed.
    #[must_use]
    pub fn observed(self) -> Self {
        self.data.borrow_mut().observed = true;
        self
    }

    #[inline]
    #[must_use]
    pub fn id(&self) -> ObjectId {
        self.id
    }

    #[inline]
    #[must_use]
    pub fn ptr_eq(&self, other: &ObjectRef) -> bool {
        self.id == other.id
    }

    #[must_use]
    pub fn is_observed(&self) -> bool {
        self.data.borrow().observed
    }

    #[must_use]
    pub fn class(&self) -> Option<Rc<str>> {
        self.data.borrow().class.clone()
    }

    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        kind_name_of(&self.data.borrow())
    }

    pub fn borrow(&self) -> Ref<'_, ObjectData> {
        self.data.borrow()
    }

    pub fn borrow_mut(&self) -> RefMut<'_, ObjectData> {
        self.data.borrow_mut()
    }

    /// Untracked property read. Arrays resolve numeric keys and `length`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        let data = self.data.borrow();
        if let ObjectKind::Array(items) = &data.kind {
            if key == "length" {
                return Some(Value::Number(items.len() as f64));
            }
            if let Some(item) = array_index(key).and_then(|index| items.get(index)) {
                return Some(item.clone());
            }
        }
        data.props.get(key).cloned()
    }

    /// Untracked property write. Returns the previous value.
    pub fn insert(&self, key: &str, value: Value) -> Option<Value> {
        let mut data = self.data.borrow_mut();
        if let ObjectKind::Array(items) = &mut data.kind {
            if let Some(index) = array_index(key) {
                if index < items.len() {
                    return Some(std::mem::replace(&mut items[index], value));
                }
                if index - items.len() <= MAX_ARRAY_GAP {
                    items.resize(index, Value::Undefined);
                    items.push(value);
                    return None;
                }
            }
        }
        data.props.insert(Rc::from(key), value)
    }

    #[must_use]
    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Property names in insertion order (array indices first).
    #[must_use]
    pub fn keys(&self) -> Vec<Rc<str>> {
        let data = self.data.borrow();
        let mut keys: Vec<Rc<str>> = match &data.kind {
            ObjectKind::Array(items) => (0..items.len()).map(|i| Rc::from(i.to_string())).collect(),
            _ => Vec::new(),
        };
        keys.extend(data.props.keys().cloned());
        keys
    }

    /// Elements of an array, or `None` for other kinds.
    #[must_use]
    pub fn array_items(&self) -> Option<Vec<Value>> {
        match &self.data.borrow().kind {
            ObjectKind::Array(items) => Some(items.clone()),
            _ => None,
        }
    }

    /// Append to an array. No-op for other kinds.
    pub fn push(&self, value: Value) {
        if let ObjectKind::Array(items) = &mut self.data.borrow_mut().kind {
            items.push(value);
        }
    }

    /// Add to a set. Returns `true` if the value was not present.
    pub fn set_add(&self, value: Value) -> bool {
        if let ObjectKind::Set(items) = &mut self.data.borrow_mut().kind {
            if !items.iter().any(|v| v.same(&value)) {
                items.push(value);
                return true;
            }
        }
        false
    }

    #[must_use]
    pub fn set_has(&self, value: &Value) -> bool {
        match &self.data.borrow().kind {
            ObjectKind::Set(items) => items.iter().any(|v| v.same(value)),
            _ => false,
        }
    }

    /// Insert into a map, replacing the value of an existing key.
    pub fn map_insert(&self, key: Value, value: Value) {
        if let ObjectKind::Map(entries) = &mut self.data.borrow_mut().kind {
            match entries.iter_mut().find(|(k, _)| k.same(&key)) {
                Some(entry) => entry.1 = value,
                None => entries.push((key, value)),
            }
        }
    }

    #[must_use]
    pub fn map_get(&self, key: &Value) -> Option<Value> {
        match &self.data.borrow().kind {
            ObjectKind::Map(entries) => entries
                .iter()
                .find(|(k, _)| k.same(key))
                .map(|(_, v)| v.clone()),
            _ => None,
        }
    }

    /// Epoch milliseconds of a date object.
    #[must_use]
    pub fn date_value(&self) -> Option<f64> {
        match self.data.borrow().kind {
            ObjectKind::Date(ms) => Some(ms),
            _ => None,
        }
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never recurse: graphs may be cyclic.
        match self.data.try_borrow() {
            Ok(data) => match &data.class {
                Some(class) => write!(f, "{class}{}", self.id),
                None => write!(f, "{}{}", kind_name_of(&data), self.id),
            },
            Err(_) => write!(f, "object{}", self.id),
        }
    }
}

/// Holes an array write may open past the current end. Writes further out
/// are stored as named properties.
const MAX_ARRAY_GAP: usize = 1024;

/// Canonical array index: decimal digits, no sign, no leading zeros.
fn array_index(key: &str) -> Option<usize> {
    let valid = !key.is_empty()
        && key.bytes().all(|b| b.is_ascii_digit())
        && (key == "0" || !key.starts_with('0'));
    if valid { key.parse().ok() } else { None }
}

fn kind_name_of(data: &ObjectData) -> &'static str {
    match data.kind {
        ObjectKind::Plain => "object",
        ObjectKind::Array(_) => "array",
        ObjectKind::Date(_) => "date",
        ObjectKind::Set(_) => "set",
        ObjectKind::Map(_) => "map",
    }
}

// ---------------------------------------------------------------------------
// Serialization
// ---------------------------------------------------------------------------

/// JSON-style serialization. `undefined` properties are skipped, non-finite
/// numbers become `null`, sets serialize as arrays, maps as `[key, value]`
/// pairs, and dates as epoch milliseconds.
impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let seen = RefCell::new(Vec::new());
        Tracked { value: self, seen: &seen }.serialize(serializer)
    }
}

struct Tracked<'a> {
    value: &'a Value,
    seen: &'a RefCell<Vec<ObjectId>>,
}

impl Serialize for Tracked<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.value {
            Value::Undefined | Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Number(n) => serialize_number(*n, serializer),
            Value::String(s) => serializer.serialize_str(s),
            Value::Object(obj) => {
                if self.seen.borrow().contains(&obj.id()) {
                    return Err(S::Error::custom(format!(
                        "circular structure through object {}",
                        obj.id()
                    )));
                }
                self.seen.borrow_mut().push(obj.id());
                let result = serialize_object(obj, self.seen, serializer);
                self.seen.borrow_mut().pop();
                result
            }
        }
    }
}

fn serialize_number<S: Serializer>(n: f64, serializer: S) -> Result<S::Ok, S::Error> {
    const MAX_SAFE: f64 = 9_007_199_254_740_991.0;
    if !n.is_finite() {
        serializer.serialize_unit()
    } else if n.fract() == 0.0 && n.abs() <= MAX_SAFE {
        serializer.serialize_i64(n as i64)
    } else {
        serializer.serialize_f64(n)
    }
}

fn serialize_object<S: Serializer>(
    obj: &ObjectRef,
    seen: &RefCell<Vec<ObjectId>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    let data = obj.borrow();
    match &data.kind {
        ObjectKind::Date(ms) => serialize_number(*ms, serializer),
        ObjectKind::Array(items) | ObjectKind::Set(items) => {
            let mut seq = serializer.serialize_seq(Some(items.len()))?;
            for item in items {
                seq.serialize_element(&Tracked { value: item, seen })?;
            }
            seq.end()
        }
        ObjectKind::Map(entries) => {
            let mut seq = serializer.serialize_seq(Some(entries.len()))?;
            for (key, value) in entries {
                seq.serialize_element(&Entry { key, value, seen })?;
            }
            seq.end()
        }
        ObjectKind::Plain => {
            let defined = data.props.iter().filter(|(_, v)| !v.is_undefined());
            let mut map = serializer.serialize_map(None)?;
            for (key, value) in defined {
                map.serialize_entry(&**key, &Tracked { value, seen })?;
            }
            map.end()
        }
    }
}

struct Entry<'a> {
    key: &'a Value,
    value: &'a Value,
    seen: &'a RefCell<Vec<ObjectId>>,
}

impl Serialize for Entry<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(2)?;
        tuple.serialize_element(&Tracked {
            value: self.key,
            seen: self.seen,
        })?;
        tuple.serialize_element(&Tracked {
            value: self.value,
            seen: self.seen,
        })?;
        tuple.end()
    }
}
