// SPDX-License-Identifier: Apache-2.0

//! Errors for traffic-class tree operations.

/// Errors that can occur while building or mutating a traffic-class tree.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A class with the same name already exists in this tree.
    #[error("traffic class `{name}` already exists")]
    DuplicateName {
        /// The conflicting class name.
        name: String,
    },

    /// The named class does not exist in this tree.
    #[error("unknown traffic class `{name}`")]
    UnknownClass {
        /// The missing class name.
        name: String,
    },

    /// The class is already attached to a parent.
    #[error("traffic class `{class}` is already attached to a parent")]
    AlreadyAttached {
        /// The class that has a parent.
        class: String,
    },

    /// The class has no parent to detach from.
    #[error("traffic class `{class}` is not attached to any parent")]
    NotAttached {
        /// The detached class.
        class: String,
    },

    /// A sibling already carries the given priority.
    #[error("priority {priority} is already taken under `{parent}`")]
    DuplicatePriority {
        /// The priority-policy parent.
        parent: String,
        /// The conflicting priority value.
        priority: i32,
    },

    /// The share is outside `[1, MAX_SHARE]`.
    #[error("share {share} is out of range [1, {max}]", max = crate::resource::MAX_SHARE)]
    ShareOutOfRange {
        /// The rejected share value.
        share: u32,
    },

    /// A rate-limit class already has its one child.
    #[error("rate-limit class `{parent}` already has a child")]
    SoleChildOccupied {
        /// The rate-limit parent.
        parent: String,
    },

    /// The attach argument does not match the parent's policy.
    #[error("attach argument does not match the policy of parent `{parent}`")]
    AttachArgMismatch {
        /// The parent whose policy disagrees with the argument.
        parent: String,
    },

    /// The operation requires a leaf class.
    #[error("traffic class `{class}` is not a leaf")]
    NotALeaf {
        /// The non-leaf class.
        class: String,
    },

    /// The leaf already owns a task.
    #[error("leaf `{class}` already owns a task")]
    TaskAlreadyAttached {
        /// The occupied leaf.
        class: String,
    },

    /// The class still has children and cannot be destroyed.
    #[error("traffic class `{class}` still has children")]
    HasChildren {
        /// The class with children.
        class: String,
    },
}
