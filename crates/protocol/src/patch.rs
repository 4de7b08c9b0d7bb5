//! Tri-state field updates for delta messages.
//!
//! A delta field can be missing (leave the target alone), explicitly `null`
//! (clear the target), or carry a value (replace the target). Pair every
//! `Patch` field with `#[serde(default, skip_serializing_if = "Patch::is_unchanged")]`
//! so a missing key decodes as `Unchanged` and `Unchanged` is never written.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Patch<T> {
    Unchanged,
    Cleared,
    Set(T),
}

impl<T> Default for Patch<T> {
    fn default() -> Self {
        Patch::Unchanged
    }
}

impl<T> Patch<T> {
    pub fn is_unchanged(&self) -> bool {
        matches!(self, Patch::Unchanged)
    }

    /// `None` becomes `Cleared`, `Some` becomes `Set`.
    pub fn from_option(value: Option<T>) -> Self {
        match value {
            Some(v) => Patch::Set(v),
            None => Patch::Cleared,
        }
    }

    pub fn as_ref(&self) -> Patch<&T> {
        match self {
            Patch::Unchanged => Patch::Unchanged,
            Patch::Cleared => Patch::Cleared,
            Patch::Set(v) => Patch::Set(v),
        }
    }

    /// Write the patch into `target`. Returns true when the target was touched.
    pub fn apply_to(self, target: &mut Option<T>) -> bool {
        match self {
            Patch::Unchanged => false,
            Patch::Cleared => {
                *target = None;
                true
            }
            Patch::Set(v) => {
                *target = Some(v);
                true
            }
        }
    }
}

impl<T: Serialize> Serialize for Patch<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Patch::Set(v) => v.serialize(serializer),
            Patch::Unchanged | Patch::Cleared => serializer.serialize_none(),
        }
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Patch<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Patch::from_option(Option::<T>::deserialize(deserializer)?))
    }
}
