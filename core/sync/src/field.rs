//! Single attribute cell with change tracking and access policy.

use thiserror::Error;

use mirrorsync_common::{Access, Error, FieldKey, FieldValue};

/// A write refused by a field's access policy.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FieldError {
    #[error("field '{0}' is read-only")]
    ReadOnly(&'static str),

    #[error("field '{0}' can only be set before the object has an identifier")]
    CreateOnly(&'static str),

    #[error("field '{field}' is append-only: {detail}")]
    AppendOnly { field: &'static str, detail: String },
}

impl From<FieldError> for Error {
    fn from(err: FieldError) -> Self {
        Error::NotPermitted(err.to_string())
    }
}

/// One attribute of a syncable object.
///
/// Keeps the value last loaded from the store next to the value set since,
/// so a write only carries what actually changed.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedField {
    name: &'static str,
    access: Access,
    sentinel: Option<FieldValue>,
    original: FieldValue,
    new: FieldValue,
    touched: bool,
}

impl TrackedField {
    /// Create an empty field.
    pub fn new(name: &'static str, access: Access, sentinel: Option<FieldValue>) -> Self {
        Self {
            name,
            access,
            sentinel,
            original: FieldValue::Null,
            new: FieldValue::Null,
            touched: false,
        }
    }

    /// Create an empty field described by `key`.
    pub fn for_key<F: FieldKey>(key: F) -> Self {
        Self::new(key.name(), key.access(), key.clear_sentinel())
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn access(&self) -> Access {
        self.access
    }

    /// Replace the loaded value and forget any pending change.
    ///
    /// A stored clear sentinel reads back as `Null`.
    pub fn load(&mut self, value: FieldValue) {
        let value = match &self.sentinel {
            Some(sentinel) if &value == sentinel => FieldValue::Null,
            _ => value,
        };
        self.original = value.clone();
        self.new = value;
        self.touched = false;
    }

    /// Current value. Never the clear sentinel.
    pub fn get(&self) -> &FieldValue {
        &self.new
    }

    /// Value as last loaded.
    pub fn original(&self) -> &FieldValue {
        &self.original
    }

    /// Set a new value.
    ///
    /// # Errors
    /// - `ReadOnly` for read-only fields
    /// - `CreateOnly` once the owner has an identifier
    /// - `AppendOnly` if `value` does not extend the loaded value
    pub fn set(&mut self, value: FieldValue, owner_has_id: bool) -> Result<(), FieldError> {
        match self.access {
            Access::ReadOnly => return Err(FieldError::ReadOnly(self.name)),
            Access::CreateOnly if owner_has_id => return Err(FieldError::CreateOnly(self.name)),
            Access::AppendOnly => self.check_append(&value)?,
            _ => {}
        }
        self.new = value;
        self.touched = true;
        Ok(())
    }

    fn check_append(&self, value: &FieldValue) -> Result<(), FieldError> {
        if self.original.is_empty() {
            return Ok(());
        }
        let extends = match (&self.original, value) {
            (FieldValue::List(old), FieldValue::List(new)) => {
                old.iter().all(|item| new.contains(item))
            }
            (FieldValue::Text(old), FieldValue::Text(new)) => new.starts_with(old.as_str()),
            (old, new) => old.equivalent(new),
        };
        if extends {
            Ok(())
        } else {
            Err(FieldError::AppendOnly {
                field: self.name,
                detail: format!("{} does not extend {}", value, self.original),
            })
        }
    }

    /// Whether `set` was called since the last load.
    pub fn is_touched(&self) -> bool {
        self.touched
    }

    /// Touched and different from the loaded value.
    pub fn is_altered(&self) -> bool {
        self.touched && !self.new.equivalent(&self.original)
    }

    /// Value to send to the store.
    ///
    /// Clearing a previously non-empty value sends the clear sentinel when
    /// the field has one.
    pub fn for_write(&self) -> FieldValue {
        match &self.sentinel {
            Some(sentinel) if self.new.is_empty() && !self.original.is_empty() => sentinel.clone(),
            _ => self.new.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn free(name: &'static str) -> TrackedField {
        TrackedField::new(name, Access::Free, None)
    }

    #[test]
    fn test_set_then_get() {
        let mut field = free("email");
        field.load(FieldValue::text("a@x"));
        assert!(!field.is_touched());
        assert!(!field.is_altered());

        field.set(FieldValue::text("b@x"), true).unwrap();
        assert_eq!(field.get(), &FieldValue::text("b@x"));
        assert_eq!(field.original(), &FieldValue::text("a@x"));
        assert!(field.is_altered());
    }

    #[test]
    fn test_setting_same_value_is_touched_not_altered() {
        let mut field = free("email");
        field.load(FieldValue::text("a@x"));
        field.set(FieldValue::text("a@x"), true).unwrap();
        assert!(field.is_touched());
        assert!(!field.is_altered());
    }

    #[test]
    fn test_load_resets_touch_state() {
        let mut field = free("email");
        field.set(FieldValue::text("a@x"), false).unwrap();
        field.load(FieldValue::text("c@x"));
        assert!(!field.is_touched());
        assert_eq!(field.get(), &FieldValue::text("c@x"));
    }

    #[test]
    fn test_read_only_refuses_writes() {
        let mut field = TrackedField::new("total", Access::ReadOnly, None);
        assert_eq!(
            field.set(FieldValue::Int(3), false),
            Err(FieldError::ReadOnly("total"))
        );
    }

    #[test]
    fn test_create_only_after_id() {
        let mut field = TrackedField::new("origin_system", Access::CreateOnly, None);
        field.set(FieldValue::text("crm"), false).unwrap();
        assert_eq!(
            field.set(FieldValue::text("other"), true),
            Err(FieldError::CreateOnly("origin_system"))
        );
        assert_eq!(field.get(), &FieldValue::text("crm"));
    }

    #[test]
    fn test_append_only() {
        let mut tags = TrackedField::new("tags", Access::AppendOnly, None);
        tags.load(FieldValue::List(vec!["a".into()]));
        tags.set(FieldValue::List(vec!["b".into(), "a".into()]), true).unwrap();
        assert!(tags.set(FieldValue::List(vec!["b".into()]), true).is_err());

        let mut log = TrackedField::new("log", Access::AppendOnly, None);
        log.load(FieldValue::text("first"));
        log.set(FieldValue::text("first; second"), true).unwrap();
        assert!(matches!(
            log.set(FieldValue::text("second"), true),
            Err(FieldError::AppendOnly { field: "log", .. })
        ));
    }

    #[test]
    fn test_clear_sentinel_is_hidden() {
        let mut phone = TrackedField::new("phone", Access::Free, Some(FieldValue::text("-")));
        phone.load(FieldValue::text("-"));
        assert_eq!(phone.get(), &FieldValue::Null);

        phone.load(FieldValue::text("555"));
        phone.set(FieldValue::Null, true).unwrap();
        assert_eq!(phone.get(), &FieldValue::Null);
        assert_eq!(phone.for_write(), FieldValue::text("-"));

        let mut blank = TrackedField::new("phone", Access::Free, Some(FieldValue::text("-")));
        blank.set(FieldValue::Null, false).unwrap();
        assert_eq!(blank.for_write(), FieldValue::Null);
    }

    #[test]
    fn test_field_error_converts() {
        let err: Error = FieldError::ReadOnly("total").into();
        assert!(matches!(err, Error::NotPermitted(_)));
    }

    proptest! {
        #[test]
        fn prop_altered_iff_value_differs(loaded in "[a-z]{0,5}", set in "[a-z]{0,5}") {
            let mut field = free("name");
            field.load(FieldValue::text(loaded.clone()));
            prop_assert!(!field.is_altered());
            field.set(FieldValue::text(set.clone()), true).unwrap();
            prop_assert_eq!(field.get(), &FieldValue::text(set.clone()));
            prop_assert_eq!(field.is_altered(), loaded != set);
        }
    }
}
