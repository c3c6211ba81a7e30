//! Conversions between model field types and the engine's structural values.
//!
//! The derive macro routes every structural field through these traits, so a
//! model may use `i32` or `i64` columns (nullable or not) without the engine
//! caring.

use chrono::{DateTime, FixedOffset, Utc};

use crate::error::NestedSetError;
use crate::node::{NodeId, ScopeValue};

/// Integer column holding an id or a boundary.
pub trait IntColumn: Sized {
    fn to_i64(&self) -> i64;
    fn from_i64(value: i64) -> Result<Self, NestedSetError>;
}

impl IntColumn for i64 {
    fn to_i64(&self) -> i64 {
        *self
    }

    fn from_i64(value: i64) -> Result<Self, NestedSetError> {
        Ok(value)
    }
}

impl IntColumn for i32 {
    fn to_i64(&self) -> i64 {
        i64::from(*self)
    }

    fn from_i64(value: i64) -> Result<Self, NestedSetError> {
        i32::try_from(value)
            .map_err(|_| NestedSetError::invariant(format!("{value} does not fit an i32 column")))
    }
}

/// A missing boundary reads as `0`, which the validator reports as oddness.
impl<T: IntColumn> IntColumn for Option<T> {
    fn to_i64(&self) -> i64 {
        self.as_ref().map_or(0, T::to_i64)
    }

    fn from_i64(value: i64) -> Result<Self, NestedSetError> {
        T::from_i64(value).map(Some)
    }
}

/// Nullable parent reference.
pub trait ParentColumn: Sized {
    fn to_parent(&self) -> Option<NodeId>;
    fn from_parent(parent: Option<NodeId>) -> Result<Self, NestedSetError>;
}

impl<T: IntColumn> ParentColumn for Option<T> {
    fn to_parent(&self) -> Option<NodeId> {
        self.as_ref().map(|value| NodeId::new(value.to_i64()))
    }

    fn from_parent(parent: Option<NodeId>) -> Result<Self, NestedSetError> {
        parent.map(|id| T::from_i64(id.get())).transpose()
    }
}

/// One scope column.
pub trait ScopeColumn: Sized {
    fn to_scope_value(&self) -> ScopeValue;
    fn from_scope_value(value: &ScopeValue) -> Result<Self, NestedSetError>;
}

fn scope_type_error(expected: &str, value: &ScopeValue) -> NestedSetError {
    NestedSetError::invariant(format!("scope value {value} is not a valid {expected}"))
}

impl ScopeColumn for i64 {
    fn to_scope_value(&self) -> ScopeValue {
        ScopeValue::Int(*self)
    }

    fn from_scope_value(value: &ScopeValue) -> Result<Self, NestedSetError> {
        match value {
            ScopeValue::Int(value) => Ok(*value),
            other => Err(scope_type_error("integer", other)),
        }
    }
}

impl ScopeColumn for i32 {
    fn to_scope_value(&self) -> ScopeValue {
        ScopeValue::Int(i64::from(*self))
    }

    fn from_scope_value(value: &ScopeValue) -> Result<Self, NestedSetError> {
        match value {
            ScopeValue::Int(value) => i32::from_i64(*value),
            other => Err(scope_type_error("integer", other)),
        }
    }
}

impl ScopeColumn for bool {
    fn to_scope_value(&self) -> ScopeValue {
        ScopeValue::Bool(*self)
    }

    fn from_scope_value(value: &ScopeValue) -> Result<Self, NestedSetError> {
        match value {
            ScopeValue::Bool(value) => Ok(*value),
            other => Err(scope_type_error("boolean", other)),
        }
    }
}

impl ScopeColumn for String {
    fn to_scope_value(&self) -> ScopeValue {
        ScopeValue::Text(self.clone())
    }

    fn from_scope_value(value: &ScopeValue) -> Result<Self, NestedSetError> {
        match value {
            ScopeValue::Text(value) => Ok(value.clone()),
            other => Err(scope_type_error("string", other)),
        }
    }
}

/// Soft-delete timestamp column.
pub trait DeletedAtColumn: Sized {
    fn to_marker(&self) -> Option<DateTime<Utc>>;
    fn from_marker(marker: Option<DateTime<Utc>>) -> Self;
}

impl DeletedAtColumn for Option<DateTime<Utc>> {
    fn to_marker(&self) -> Option<DateTime<Utc>> {
        *self
    }

    fn from_marker(marker: Option<DateTime<Utc>>) -> Self {
        marker
    }
}

impl DeletedAtColumn for Option<DateTime<FixedOffset>> {
    fn to_marker(&self) -> Option<DateTime<Utc>> {
        self.map(|value| value.with_timezone(&Utc))
    }

    fn from_marker(marker: Option<DateTime<Utc>>) -> Self {
        marker.map(|value| value.fixed_offset())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn narrow_columns_reject_overflow() {
        assert_eq!(<i32 as IntColumn>::from_i64(42).ok(), Some(42));
        assert!(<i32 as IntColumn>::from_i64(i64::from(i32::MAX) + 1).is_err());
        assert_eq!(<Option<i32> as IntColumn>::to_i64(&None), 0);
    }

    #[test]
    fn parent_round_trips_null() {
        let parent = <Option<i32> as ParentColumn>::from_parent(None).ok().flatten();
        assert_eq!(parent, None);
        let some = <Option<i64> as ParentColumn>::from_parent(Some(NodeId::new(9)));
        assert_eq!(some.ok().flatten(), Some(9));
    }

    #[test]
    fn scope_values_check_their_type() {
        assert_eq!(String::from_scope_value(&ScopeValue::from("x")).ok(), Some("x".into()));
        assert!(bool::from_scope_value(&ScopeValue::Int(1)).is_err());
        assert_eq!(7_i32.to_scope_value(), ScopeValue::Int(7));
    }
}
