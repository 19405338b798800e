// Error taxonomy: caller mistakes vs. environment failures

use thiserror::Error;

/// Invalid caller input. Reported before any control-plane mutation; a run
/// that fails with one of these has changed nothing (beyond the idempotent
/// pre-clear).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("class {mark}: ceiling {ceil} mbit exceeds total rate {total} mbit")]
    CeilExceedsTotal { mark: u32, ceil: u32, total: u32 },

    #[error("aggregated guaranteed class rates leave no budget for the default class")]
    NoDefaultBudget,

    #[error("duplicate class mark {0}")]
    DuplicateMark(u32),

    #[error("class mark {0} is reserved for the default class")]
    ReservedMark(u32),

    #[error("invalid rate {input:?}: {reason}")]
    InvalidRate { input: String, reason: &'static str },

    #[error("invalid class spec {input:?}: {reason}")]
    InvalidClassSpec { input: String, reason: &'static str },
}

/// The system cannot satisfy the request. Fatal; the run aborts without
/// retrying.
#[derive(Debug, Error)]
pub enum EnvironmentError {
    #[error("interface {dev} does not exist or its MTU is unreadable")]
    InterfaceMissing {
        dev: String,
        #[source]
        source: std::io::Error,
    },

    #[error("kernel reported a non-numeric MTU for {dev}: {raw:?}")]
    BadMtu { dev: String, raw: String },
}
