//! Class plan building
//!
//! Turns the upload budget plus an optional list of marked traffic classes
//! into a validated allocation: every class gets a concrete ceiling and
//! priority, and whatever budget the marked classes leave over becomes the
//! guaranteed rate of the reserved default class.

use crate::error::ConfigError;

/// Reserved HTB class ID for unmarked traffic. User marks must not collide
/// with it.
pub const DEFAULT_CLASS_ID: u32 = 99;

/// Priority assigned when a class spec does not name one; also the default
/// class's priority.
pub const DEFAULT_PRIORITY: u8 = 4;

/// A marked traffic class as requested by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassSpec {
    /// fwmark selecting the traffic; doubles as the HTB class ID.
    pub mark: u32,
    /// Guaranteed rate in mbit/s.
    pub rate: u32,
    /// Ceiling in mbit/s; the interface's total upload rate when absent.
    pub ceil: Option<u32>,
    /// HTB priority; [`DEFAULT_PRIORITY`] when absent.
    pub prio: Option<u8>,
}

/// A class with all defaults resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedClass {
    pub id: u32,
    pub rate: u32,
    pub ceil: u32,
    pub prio: u8,
}

/// Validated allocation of the upload budget across classes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassPlan {
    /// User classes, in caller order.
    pub classes: Vec<ResolvedClass>,
    /// Catch-all for unmarked traffic ([`DEFAULT_CLASS_ID`]).
    pub default: ResolvedClass,
}

impl ClassPlan {
    /// Resolve `specs` against the `total_up` budget.
    ///
    /// Fail-fast: the first invalid spec aborts with a [`ConfigError`] and no
    /// partial plan is returned. A half-applied shaping tree is worse than
    /// none, so callers configure nothing unless this succeeds.
    pub fn build(total_up: u32, specs: &[ClassSpec]) -> Result<Self, ConfigError> {
        let mut remaining = i64::from(total_up);
        let mut classes: Vec<ResolvedClass> = Vec::with_capacity(specs.len());

        for spec in specs {
            if spec.mark == DEFAULT_CLASS_ID {
                return Err(ConfigError::ReservedMark(spec.mark));
            }
            if classes.iter().any(|c| c.id == spec.mark) {
                return Err(ConfigError::DuplicateMark(spec.mark));
            }

            let ceil = spec.ceil.unwrap_or(total_up);
            if ceil > total_up {
                return Err(ConfigError::CeilExceedsTotal {
                    mark: spec.mark,
                    ceil,
                    total: total_up,
                });
            }

            remaining -= i64::from(spec.rate);
            if remaining <= 0 {
                return Err(ConfigError::NoDefaultBudget);
            }

            classes.push(ResolvedClass {
                id: spec.mark,
                rate: spec.rate,
                ceil,
                prio: spec.prio.unwrap_or(DEFAULT_PRIORITY),
            });
        }

        Ok(Self {
            classes,
            default: ResolvedClass {
                id: DEFAULT_CLASS_ID,
                rate: remaining as u32,
                ceil: total_up,
                prio: DEFAULT_PRIORITY,
            },
        })
    }

    /// All classes in emission order: user classes first, then the default.
    pub fn iter(&self) -> impl Iterator<Item = &ResolvedClass> {
        self.classes.iter().chain(std::iter::once(&self.default))
    }
}
