//! Conversion options: a typed value map keyed by option name.
//!
//! Each output format publishes a table of [`OptionDefinition`]s; a
//! [`ConversionOptions`] starts from the defaults and accepts overrides,
//! rejecting unknown names, type mismatches, and values outside an
//! option's allowed set. Formats wrap the map with strongly-typed
//! accessors.

use std::collections::BTreeMap;

use crate::status::{convert_error, ModuleError};

/// The value of a single option.
#[derive(Clone, Debug, PartialEq)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    Double(f64),
    Str(String),
}

impl OptionValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            OptionValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            OptionValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            OptionValue::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            OptionValue::Str(v) => Some(v),
            _ => None,
        }
    }

    fn same_kind(&self, other: &OptionValue) -> bool {
        matches!(
            (self, other),
            (OptionValue::Bool(_), OptionValue::Bool(_))
                | (OptionValue::Int(_), OptionValue::Int(_))
                | (OptionValue::Double(_), OptionValue::Double(_))
                | (OptionValue::Str(_), OptionValue::Str(_))
        )
    }
}

/// Static definition of one option a format recognizes.
pub struct OptionDefinition {
    pub name: &'static str,
    pub default: OptionValue,
    /// Allowed values for string options; empty means unrestricted.
    pub allowed: &'static [&'static str],
    pub description: &'static str,
}

impl OptionDefinition {
    pub const fn flag(name: &'static str, default: bool, description: &'static str) -> Self {
        Self { name, default: OptionValue::Bool(default), allowed: &[], description }
    }
}

/// A set of option values for one conversion.
#[derive(Clone, Debug, Default)]
pub struct ConversionOptions {
    values: BTreeMap<String, OptionValue>,
}

impl ConversionOptions {
    /// Build from a definition table, with every option at its default.
    pub fn from_definitions(definitions: &[OptionDefinition]) -> Self {
        let values = definitions
            .iter()
            .map(|def| (def.name.to_string(), def.default.clone()))
            .collect();
        Self { values }
    }

    /// Override an option. The name must exist, the value kind must match
    /// the default's, and string values must be in the allowed set.
    pub fn set(
        &mut self,
        definitions: &[OptionDefinition],
        name: &str,
        value: OptionValue,
    ) -> Result<(), ModuleError> {
        let def = definitions.iter().find(|d| d.name == name).ok_or_else(|| {
            ModuleError::convert(
                convert_error::INVALID_ARGUMENT,
                format!("Unknown option: {name}"),
            )
        })?;
        if !def.default.same_kind(&value) {
            return Err(ModuleError::convert(
                convert_error::INVALID_ARGUMENT,
                format!("Wrong value type for option: {name}"),
            ));
        }
        if let OptionValue::Str(ref s) = value {
            if !def.allowed.is_empty() && !def.allowed.contains(&s.as_str()) {
                return Err(ModuleError::convert(
                    convert_error::INVALID_ARGUMENT,
                    format!("Invalid value \"{s}\" for option: {name}"),
                ));
            }
        }
        self.values.insert(name.to_string(), value);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&OptionValue> {
        self.values.get(name)
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(OptionValue::as_bool)
    }

    pub fn get_int(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(OptionValue::as_int)
    }

    pub fn get_double(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(OptionValue::as_double)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(OptionValue::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEFS: &[OptionDefinition] = &[
        OptionDefinition::flag("downsample", false, "Allow wavetable downsampling"),
        OptionDefinition {
            name: "tempo",
            default: OptionValue::Str(String::new()),
            allowed: &["accuracy", "compat"],
            description: "Tempo conversion mode",
        },
    ];

    fn defaults() -> ConversionOptions {
        ConversionOptions::from_definitions(DEFS)
    }

    #[test]
    fn defaults_are_populated() {
        let opts = defaults();
        assert_eq!(opts.get_bool("downsample"), Some(false));
        assert_eq!(opts.get_str("tempo"), Some(""));
        assert_eq!(opts.get("missing"), None);
    }

    #[test]
    fn set_validates_name_kind_and_allowed_values() {
        let mut opts = defaults();
        assert!(opts.set(DEFS, "downsample", OptionValue::Bool(true)).is_ok());
        assert_eq!(opts.get_bool("downsample"), Some(true));

        assert!(opts.set(DEFS, "nope", OptionValue::Bool(true)).is_err());
        assert!(opts.set(DEFS, "downsample", OptionValue::Int(1)).is_err());
        assert!(opts
            .set(DEFS, "tempo", OptionValue::Str("speed".into()))
            .is_err());
        assert!(opts
            .set(DEFS, "tempo", OptionValue::Str("compat".into()))
            .is_ok());
    }
}
