use std::fmt;

use anyhow::{Result, ensure};
use lazy_regex::{Lazy, Regex, lazy_regex};

pub mod commands;
pub mod executor;
pub mod host;
pub mod transfer;
pub mod transport;

pub static PACKAGE_NAME_REGEX: Lazy<Regex> = lazy_regex!(r"^(?:[A-Za-z]{1}[\w]*\.)+[A-Za-z][\w]*$");

/// Validated Android package name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PackageName(String);

impl PackageName {
    /// Validates and constructs a `PackageName` from the provided string-like value.
    pub fn parse(value: impl AsRef<str>) -> Result<Self> {
        let value = value.as_ref().trim();
        ensure!(PACKAGE_NAME_REGEX.is_match(value), "Invalid package name: '{}'", value);
        Ok(Self(value.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PackageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
