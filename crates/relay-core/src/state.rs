//! Scoped key/value state and delta merging.
//!
//! Keys are partitioned by prefix:
//! - `app:` shared by every session of an application
//! - `user:` shared by every session of one user within an application
//! - `temp:` visible only inside the invocation that wrote it, never persisted
//! - anything else belongs to a single session
//!
//! A delta is a flat key→value map. Deltas merge shallowly in event order and the
//! later value wins. A `null` value is stored like any other value.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type StateMap = serde_json::Map<String, Value>;

pub const APP_PREFIX: &str = "app:";
pub const USER_PREFIX: &str = "user:";
pub const TEMP_PREFIX: &str = "temp:";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateScope {
    Session,
    App,
    User,
    Temp,
}

impl StateScope {
    /// Classify a key by its prefix.
    pub fn of(key: &str) -> Self {
        if key.starts_with(APP_PREFIX) {
            Self::App
        } else if key.starts_with(USER_PREFIX) {
            Self::User
        } else if key.starts_with(TEMP_PREFIX) {
            Self::Temp
        } else {
            Self::Session
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Session => "",
            Self::App => APP_PREFIX,
            Self::User => USER_PREFIX,
            Self::Temp => TEMP_PREFIX,
        }
    }

    pub fn is_persisted(&self) -> bool {
        !matches!(self, Self::Temp)
    }
}

/// Returns `base` with every key of `delta` overwritten.
pub fn merge(base: &StateMap, delta: &StateMap) -> StateMap {
    let mut merged = base.clone();
    merge_into(&mut merged, delta);
    merged
}

pub fn merge_into(target: &mut StateMap, delta: &StateMap) {
    for (key, value) in delta {
        target.insert(key.clone(), value.clone());
    }
}

/// Removes `temp:` keys.
pub fn strip_temp(delta: &StateMap) -> StateMap {
    delta
        .iter()
        .filter(|(key, _)| StateScope::of(key).is_persisted())
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// A delta split by the storage it is routed to.
///
/// `app` and `user` keys have their prefix removed; `temp:` keys are dropped.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ScopedDelta {
    pub app: StateMap,
    pub user: StateMap,
    pub session: StateMap,
}

impl ScopedDelta {
    pub fn is_empty(&self) -> bool {
        self.app.is_empty() && self.user.is_empty() && self.session.is_empty()
    }
}

pub fn split_scopes(delta: &StateMap) -> ScopedDelta {
    let mut scoped = ScopedDelta::default();
    for (key, value) in delta {
        match StateScope::of(key) {
            StateScope::App => {
                scoped.app.insert(key[APP_PREFIX.len()..].to_string(), value.clone());
            }
            StateScope::User => {
                scoped.user.insert(key[USER_PREFIX.len()..].to_string(), value.clone());
            }
            StateScope::Session => {
                scoped.session.insert(key.clone(), value.clone());
            }
            StateScope::Temp => {}
        }
    }
    scoped
}

/// Re-applies a scope prefix to keys stored without it.
pub fn with_prefix(scope: StateScope, stored: &StateMap) -> StateMap {
    stored
        .iter()
        .map(|(key, value)| (format!("{}{key}", scope.prefix()), value.clone()))
        .collect()
}

/// Session state as seen by readers: session keys plus prefixed app and user keys.
pub fn materialize(session: &StateMap, app: &StateMap, user: &StateMap) -> StateMap {
    let mut state = session.clone();
    merge_into(&mut state, &with_prefix(StateScope::App, app));
    merge_into(&mut state, &with_prefix(StateScope::User, user));
    state
}

/// A read-through view over a state snapshot that records writes as a pending delta.
#[derive(Clone, Debug, Default)]
pub struct State {
    base: StateMap,
    delta: StateMap,
}

impl State {
    pub fn new(base: StateMap) -> Self {
        Self {
            base,
            delta: StateMap::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.delta.get(key).or_else(|| self.base.get(key))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.delta.contains_key(key) || self.base.contains_key(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.delta.insert(key.into(), value.into());
    }

    pub fn update(&mut self, delta: &StateMap) {
        merge_into(&mut self.delta, delta);
    }

    pub fn delta(&self) -> &StateMap {
        &self.delta
    }

    pub fn has_delta(&self) -> bool {
        !self.delta.is_empty()
    }

    pub fn into_delta(self) -> StateMap {
        self.delta
    }

    /// Snapshot with the pending delta applied.
    pub fn to_map(&self) -> StateMap {
        merge(&self.base, &self.delta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn map(value: Value) -> StateMap {
        match value {
            Value::Object(m) => m,
            _ => panic!("expected object"),
        }
    }

    fn arb_state() -> impl Strategy<Value = StateMap> {
        prop::collection::btree_map("[a-e]{1,2}", any::<i64>(), 0..6)
            .prop_map(|m| m.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
    }

    #[test]
    fn scope_classification() {
        assert_eq!(StateScope::of("app:theme"), StateScope::App);
        assert_eq!(StateScope::of("user:name"), StateScope::User);
        assert_eq!(StateScope::of("temp:scratch"), StateScope::Temp);
        assert_eq!(StateScope::of("count"), StateScope::Session);
        assert_eq!(StateScope::of("application"), StateScope::Session);
    }

    #[test]
    fn merge_is_shallow() {
        let base = map(json!({"cfg": {"a": 1, "b": 2}, "n": 1}));
        let delta = map(json!({"cfg": {"a": 9}}));
        let merged = merge(&base, &delta);
        assert_eq!(merged["cfg"], json!({"a": 9}));
        assert_eq!(merged["n"], json!(1));
    }

    #[test]
    fn empty_delta_is_noop() {
        let base = map(json!({"x": 1}));
        assert_eq!(merge(&base, &StateMap::new()), base);
    }

    #[test]
    fn null_is_stored_as_overwrite() {
        let base = map(json!({"x": 1}));
        let merged = merge(&base, &map(json!({"x": null})));
        assert_eq!(merged.get("x"), Some(&Value::Null));
    }

    #[test]
    fn strip_temp_removes_only_temp_keys() {
        let delta = map(json!({"temp:a": 1, "app:b": 2, "user:c": 3, "d": 4}));
        let stripped = strip_temp(&delta);
        assert_eq!(stripped, map(json!({"app:b": 2, "user:c": 3, "d": 4})));
    }

    #[test]
    fn split_and_materialize() {
        let delta = map(json!({"app:theme": "dark", "user:name": "ada", "turns": 3, "temp:x": 1}));
        let scoped = split_scopes(&delta);
        assert_eq!(scoped.app, map(json!({"theme": "dark"})));
        assert_eq!(scoped.user, map(json!({"name": "ada"})));
        assert_eq!(scoped.session, map(json!({"turns": 3})));

        let state = materialize(&scoped.session, &scoped.app, &scoped.user);
        assert_eq!(state, strip_temp(&delta));
    }

    #[test]
    fn state_view_reads_through_delta() {
        let mut state = State::new(map(json!({"a": 1, "b": 2})));
        state.set("b", 20);
        state.set("c", "new");
        assert_eq!(state.get("a"), Some(&json!(1)));
        assert_eq!(state.get("b"), Some(&json!(20)));
        assert!(state.contains("c"));
        assert_eq!(state.delta(), &map(json!({"b": 20, "c": "new"})));
        assert_eq!(state.to_map(), map(json!({"a": 1, "b": 20, "c": "new"})));
    }

    proptest! {
        #[test]
        fn later_delta_wins(base in arb_state(), d1 in arb_state(), d2 in arb_state()) {
            let folded = merge(&merge(&base, &d1), &d2);
            for (key, value) in &d2 {
                prop_assert_eq!(folded.get(key), Some(value));
            }
            for (key, value) in &d1 {
                if !d2.contains_key(key) {
                    prop_assert_eq!(folded.get(key), Some(value));
                }
            }
            for (key, value) in &base {
                if !d1.contains_key(key) && !d2.contains_key(key) {
                    prop_assert_eq!(folded.get(key), Some(value));
                }
            }
        }

        #[test]
        fn unrelated_key_does_not_interfere(base in arb_state(), d1 in arb_state(), v in any::<i64>()) {
            let mut with_extra = base.clone();
            with_extra.insert("zz".into(), Value::from(v));
            let plain = merge(&base, &d1);
            let mut extra = merge(&with_extra, &d1);
            extra.remove("zz");
            prop_assert_eq!(plain, extra);
        }
    }
}
