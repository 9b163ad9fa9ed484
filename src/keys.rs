//! Aggregate key derivation from a declared key schema.
//!
//! An aggregate type may declare an ordered list of key properties. The
//! aggregate key string is the derived property values joined with a
//! separator; the derived properties themselves are merged back into the
//! creation props so the initial event can see them.

use serde_json::{Map, Value};

use crate::error::Error;

/// Property map passed to key derivation and aggregate creation.
pub type Props = Map<String, Value>;

/// One entry in a key schema.
pub enum KeyProp {
    /// Must be present in the props; [`Error::MissingKeyProperty`]
    /// otherwise.
    Required(&'static str),
    /// May be absent; contributes an empty fragment when missing.
    Optional(&'static str),
    /// Computed from the props by a pure function, whether or not the
    /// property is present.
    Derived(&'static str, fn(&Props) -> Value),
}

impl KeyProp {
    fn name(&self) -> &'static str {
        match self {
            KeyProp::Required(name) | KeyProp::Optional(name) | KeyProp::Derived(name, _) => name,
        }
    }
}

/// Ordered key schema plus the separator joining its fragments.
pub struct KeySchema {
    /// Key properties in key order.
    pub props: Vec<KeyProp>,
    /// Separator between fragments. Default `'.'`.
    pub separator: char,
}

impl KeySchema {
    /// Build a schema with the default `'.'` separator.
    pub fn new(props: Vec<KeyProp>) -> Self {
        Self {
            props,
            separator: '.',
        }
    }

    /// A single derived `id` property: taken from the props when present,
    /// otherwise a fresh UUID v4. The common schema for free-standing
    /// entities.
    pub fn generated_id() -> Self {
        Self::new(vec![KeyProp::Derived("id", |props| {
            props
                .get("id")
                .cloned()
                .unwrap_or_else(|| Value::String(uuid::Uuid::new_v4().to_string()))
        })])
    }

    /// Derive the key string and the resolved key properties.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingKeyProperty`] if a required property is
    /// absent, or [`Error::Configuration`] if a fragment contains the
    /// separator character (which would make the key ambiguous).
    pub fn key_from_props(&self, props: &Props) -> Result<(String, Props), Error> {
        let mut key_props = Props::new();
        let mut fragments = Vec::with_capacity(self.props.len());

        for prop in &self.props {
            let name = prop.name();
            let value = match prop {
                KeyProp::Derived(_, derive) => Some(derive(props)),
                KeyProp::Required(_) => match props.get(name) {
                    Some(v) if !v.is_null() => Some(v.clone()),
                    _ => return Err(Error::MissingKeyProperty(name.to_string())),
                },
                KeyProp::Optional(_) => props.get(name).filter(|v| !v.is_null()).cloned(),
            };

            let fragment = value.as_ref().map(fragment_string).unwrap_or_default();
            if fragment.contains(self.separator) {
                return Err(Error::Configuration(format!(
                    "key property '{name}' value '{fragment}' contains the separator '{}'",
                    self.separator
                )));
            }

            fragments.push(fragment);
            if let Some(v) = value {
                key_props.insert(name.to_string(), v);
            }
        }

        Ok((fragments.join(&self.separator.to_string()), key_props))
    }
}

/// Render one key fragment: strings verbatim, everything else as JSON.
fn fragment_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
