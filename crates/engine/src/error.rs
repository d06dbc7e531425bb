// SPDX-License-Identifier: Apache-2.0

//! Errors for the engine.
//!
//! Every control operation returns a two-level outcome: a variant with
//! operation-specific context, and a [`ErrorKind`] from the closed taxonomy
//! via [`Error::kind`]. Programming faults (emitting outside a module entry,
//! running a detached task, freeing into the wrong pool) panic instead of
//! returning an error.

use crate::gate::GateIdx;
use std::fmt;

/// The closed set of error classifications exposed to the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// EINVAL: a parameter is malformed or inconsistent.
    InvalidArgument,
    /// ENOENT: the referenced entity does not exist.
    NotFound,
    /// EEXIST: the entity already exists.
    AlreadyExists,
    /// EBUSY: the operation conflicts with running workers or live references.
    Busy,
    /// ENOMEM: a resource pool is exhausted.
    NoMemory,
    /// ENOTSUP: the entity does not support the operation.
    Unsupported,
    /// EIO: an internal failure.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::NotFound => "not_found",
            ErrorKind::AlreadyExists => "already_exists",
            ErrorKind::Busy => "busy",
            ErrorKind::NoMemory => "no_memory",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::Internal => "internal",
        };
        write!(f, "{label}")
    }
}

/// All errors that can occur in the engine.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The operation requires all workers to be paused.
    #[error("`{operation}` requires all workers paused")]
    WorkersNotPaused {
        /// Name of the rejected operation.
        operation: &'static str,
    },

    /// A module with this name already exists.
    #[error("module `{module}` already exists")]
    ModuleAlreadyExists {
        /// The conflicting module name.
        module: String,
    },

    /// The named module does not exist.
    #[error("unknown module `{module}`")]
    UnknownModule {
        /// The missing module name.
        module: String,
    },

    /// The named module class is not registered.
    #[error("unknown module class `{class}`")]
    UnknownModuleClass {
        /// The missing class name.
        class: String,
    },

    /// The connect target cannot receive batches.
    #[error("module `{module}` does not process input batches")]
    NotAReceiver {
        /// The module lacking the receive capability.
        module: String,
    },

    /// A gate index exceeds the module's gate range.
    #[error("gate {gate} is out of range for module `{module}`")]
    GateOutOfRange {
        /// The module owning the gate space.
        module: String,
        /// The rejected gate index.
        gate: GateIdx,
    },

    /// The output gate is already connected.
    #[error("output gate {gate} of module `{module}` is already connected")]
    GateBusy {
        /// The emitting module.
        module: String,
        /// The occupied gate index.
        gate: GateIdx,
    },

    /// The module still has live references and cannot be destroyed.
    #[error("module `{module}` is in use: {reason}")]
    ModuleInUse {
        /// The module with live references.
        module: String,
        /// What still references it.
        reason: String,
    },

    /// The module class does not define a task entry.
    #[error("module `{module}` does not support tasks")]
    TasksNotSupported {
        /// The task-less module.
        module: String,
    },

    /// The module has hit its per-module task limit.
    #[error("module `{module}` has too many tasks")]
    TooManyTasks {
        /// The saturated module.
        module: String,
    },

    /// The module failed to initialise.
    #[error("module `{module}` failed to initialise: {details}")]
    ModuleInitFailed {
        /// The failing module.
        module: String,
        /// The module's own account of the failure.
        details: String,
    },

    /// The named worker does not exist.
    #[error("unknown worker {wid}")]
    UnknownWorker {
        /// The missing worker id.
        wid: u32,
    },

    /// A worker with this id already exists.
    #[error("worker {wid} already exists")]
    WorkerAlreadyExists {
        /// The conflicting worker id.
        wid: u32,
    },

    /// The core already runs a worker.
    #[error("core {core} already runs a worker")]
    CoreInUse {
        /// The occupied core.
        core: u32,
    },

    /// The core does not exist on this machine.
    #[error("core {core} is not present")]
    InvalidCore {
        /// The invalid core id.
        core: u32,
    },

    /// The named traffic class does not exist.
    #[error("unknown traffic class `{name}`")]
    UnknownTc {
        /// The missing class name.
        name: String,
    },

    /// A wrapper for traffic-class tree errors.
    #[error("traffic class error: {0}")]
    Tc(#[from] pktflow_sched::Error),

    /// A wrapper for configuration errors.
    #[error("configuration error: {0}")]
    Config(#[from] Box<pktflow_config::Error>),

    /// The module does not implement the command.
    #[error("module `{module}` has no command `{command}`")]
    UnknownCommand {
        /// The module the command was sent to.
        module: String,
        /// The unknown command name.
        command: String,
    },

    /// A hook with this name is already installed on the gate.
    #[error("hook `{hook}` is already installed on {gate}")]
    HookAlreadyInstalled {
        /// Description of the gate.
        gate: String,
        /// The duplicate hook name.
        hook: String,
    },

    /// No hook with this name is installed on the gate.
    #[error("no hook `{hook}` on {gate}")]
    UnknownHook {
        /// Description of the gate.
        gate: String,
        /// The missing hook name.
        hook: String,
    },

    /// The named port does not exist.
    #[error("unknown port `{port}`")]
    UnknownPort {
        /// The missing port name.
        port: String,
    },

    /// A port with this name already exists.
    #[error("port `{port}` already exists")]
    PortAlreadyExists {
        /// The conflicting port name.
        port: String,
    },

    /// The named port driver is not registered.
    #[error("unknown port driver `{driver}`")]
    UnknownPortDriver {
        /// The missing driver name.
        driver: String,
    },

    /// No packet pool serves the socket.
    #[error("no packet pool for socket {socket}")]
    NoPacketPool {
        /// The poolless socket.
        socket: u32,
    },

    /// An I/O failure in a control-plane operation.
    #[error("I/O error while {context}: {error}")]
    Io {
        /// What the engine was doing.
        context: String,
        /// The underlying error.
        error: std::io::Error,
    },

    /// A worker thread could not be spawned.
    #[error("failed to spawn thread `{thread_name}`: {error}")]
    ThreadSpawn {
        /// The thread that failed to start.
        thread_name: String,
        /// The underlying error.
        error: std::io::Error,
    },

    /// A parameter is malformed; catch-all with context.
    #[error("invalid value for {field}: {reason}")]
    InvalidArgument {
        /// The offending field or parameter.
        field: String,
        /// Why it is rejected.
        reason: String,
    },
}

impl Error {
    /// Classifies the error into the closed taxonomy.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::WorkersNotPaused { .. }
            | Error::GateBusy { .. }
            | Error::ModuleInUse { .. }
            | Error::CoreInUse { .. } => ErrorKind::Busy,

            Error::ModuleAlreadyExists { .. }
            | Error::WorkerAlreadyExists { .. }
            | Error::PortAlreadyExists { .. }
            | Error::HookAlreadyInstalled { .. } => ErrorKind::AlreadyExists,

            Error::UnknownModule { .. }
            | Error::UnknownModuleClass { .. }
            | Error::UnknownWorker { .. }
            | Error::UnknownTc { .. }
            | Error::UnknownHook { .. }
            | Error::UnknownPort { .. }
            | Error::UnknownPortDriver { .. } => ErrorKind::NotFound,

            Error::NotAReceiver { .. }
            | Error::GateOutOfRange { .. }
            | Error::TasksNotSupported { .. }
            | Error::TooManyTasks { .. }
            | Error::ModuleInitFailed { .. }
            | Error::InvalidCore { .. }
            | Error::Config(_)
            | Error::InvalidArgument { .. } => ErrorKind::InvalidArgument,

            Error::Tc(e) => match e {
                pktflow_sched::Error::DuplicateName { .. }
                | pktflow_sched::Error::AlreadyAttached { .. }
                | pktflow_sched::Error::DuplicatePriority { .. }
                | pktflow_sched::Error::TaskAlreadyAttached { .. } => ErrorKind::AlreadyExists,
                pktflow_sched::Error::UnknownClass { .. } => ErrorKind::NotFound,
                pktflow_sched::Error::SoleChildOccupied { .. }
                | pktflow_sched::Error::HasChildren { .. } => ErrorKind::Busy,
                _ => ErrorKind::InvalidArgument,
            },

            Error::UnknownCommand { .. } => ErrorKind::Unsupported,

            Error::NoPacketPool { .. } => ErrorKind::NoMemory,

            Error::Io { .. } | Error::ThreadSpawn { .. } => ErrorKind::Internal,
        }
    }
}
