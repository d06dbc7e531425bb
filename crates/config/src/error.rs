// SPDX-License-Identifier: Apache-2.0

//! Errors for the config crate.

/// Errors that can occur while loading or validating configuration.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A collection of errors found while validating a spec.
    #[error("invalid configuration: {errors:?}")]
    InvalidConfiguration {
        /// Every validation error found.
        errors: Vec<Error>,
    },

    /// A configuration file could not be read.
    #[error("failed to read `{path}`: {details}")]
    FileRead {
        /// Path of the unreadable file.
        path: String,
        /// Description of the underlying I/O error.
        details: String,
    },

    /// A configuration document could not be deserialized.
    #[error("{format} deserialization error: {details}")]
    Deserialization {
        /// Input format (e.g. "YAML").
        format: String,
        /// Description of the parse error.
        details: String,
    },

    /// Two entities of the same kind share a name.
    #[error("duplicate {kind} `{name}`")]
    DuplicateName {
        /// Entity kind ("module", "traffic class", ...).
        kind: &'static str,
        /// The duplicated name.
        name: String,
    },

    /// A spec references an entity that is not defined.
    #[error("{referrer} references unknown {kind} `{name}`")]
    UnknownReference {
        /// Entity kind being referenced.
        kind: &'static str,
        /// The missing name.
        name: String,
        /// Which spec entry holds the dangling reference.
        referrer: String,
    },

    /// A field value is out of range or inconsistent.
    #[error("invalid value for {field}: {reason}")]
    InvalidField {
        /// Dotted path of the offending field.
        field: String,
        /// Why the value is rejected.
        reason: String,
    },
}
