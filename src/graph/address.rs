//! Resource addresses.
//!
//! An address identifies one resource instance: `type.name`, or
//! `type.name[index]` for instances expanded from `count`.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ConfigError;

/// Address of a single resource instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceAddress {
    resource_type: String,
    name: String,
    index: Option<u32>,
}

impl ResourceAddress {
    /// Creates an address without an instance index.
    #[must_use]
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            name: name.into(),
            index: None,
        }
    }

    /// Creates an address for one instance of a counted resource.
    #[must_use]
    pub fn indexed(resource_type: impl Into<String>, name: impl Into<String>, index: u32) -> Self {
        Self {
            resource_type: resource_type.into(),
            name: name.into(),
            index: Some(index),
        }
    }

    /// Parses `type.name` or `type.name[index]`.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a well-formed address.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let invalid = |message: &str| ConfigError::InvalidAddress {
            address: text.to_string(),
            message: message.to_string(),
        };

        let (resource_type, rest) = text
            .split_once('.')
            .ok_or_else(|| invalid("expected <type>.<name>"))?;

        let (name, index) = split_index(rest).map_err(|m| invalid(&m))?;

        if !is_valid_type(resource_type) {
            return Err(invalid(
                "resource type must be lowercase alphanumeric with underscores, starting with a letter",
            ));
        }
        if !is_valid_name(name) {
            return Err(invalid(
                "name must start with a letter or underscore and contain only letters, digits, '_' or '-'",
            ));
        }

        Ok(Self {
            resource_type: resource_type.to_string(),
            name: name.to_string(),
            index,
        })
    }

    /// Returns the resource type.
    #[must_use]
    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    /// Returns the declared resource name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the instance index, if the resource is counted.
    #[must_use]
    pub const fn index(&self) -> Option<u32> {
        self.index
    }

    /// Returns the address of the declaration this instance came from.
    #[must_use]
    pub fn base(&self) -> Self {
        Self::new(self.resource_type.clone(), self.name.clone())
    }

    /// Returns the provider implied by the type prefix (`azurerm_subnet` -> `azurerm`).
    #[must_use]
    pub fn implied_provider(&self) -> &str {
        self.resource_type
            .split_once('_')
            .map_or(self.resource_type.as_str(), |(prefix, _)| prefix)
    }
}

/// Splits `name[3]` into `("name", Some(3))`.
pub(crate) fn split_index(text: &str) -> Result<(&str, Option<u32>), String> {
    let Some(open) = text.find('[') else {
        return Ok((text, None));
    };

    let Some(inner) = text[open + 1..].strip_suffix(']') else {
        return Err(String::from("unterminated index"));
    };

    let index = inner
        .parse::<u32>()
        .map_err(|_| format!("index '{inner}' is not a non-negative integer"))?;

    Ok((&text[..open], Some(index)))
}

/// Validates a resource type: lowercase alphanumeric with underscores, starting with a letter.
pub(crate) fn is_valid_type(resource_type: &str) -> bool {
    let mut chars = resource_type.chars();

    match chars.next() {
        Some(first) if first.is_ascii_lowercase() => {}
        _ => return false,
    }

    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Validates a resource name.
pub(crate) fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();

    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }

    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

impl fmt::Display for ResourceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.resource_type, self.name)?;
        if let Some(index) = self.index {
            write!(f, "[{index}]")?;
        }
        Ok(())
    }
}

impl TryFrom<String> for ResourceAddress {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ResourceAddress> for String {
    fn from(address: ResourceAddress) -> Self {
        address.to_string()
    }
}
