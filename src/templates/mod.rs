//! Embedded templates for scriptbox files.

/// Default `scriptbox.toml` configuration.
pub(crate) const SCRIPTBOX_TOML: &str = include_str!("scriptbox.toml");
