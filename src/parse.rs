//! Parsing of user-facing rate and class-list strings

use crate::error::ConfigError;
use crate::plan::ClassSpec;

/// Parse a bandwidth string into integer mbit/s.
///
/// A plain number is mbit/s; `k`/`K` means kbit/s, `m`/`M` means mbit/s.
/// Fractions are allowed ("2.5m"); the result rounds half-up and anything
/// that rounds to zero is rejected so the rest of the tool never sees a
/// non-positive rate.
pub fn parse_rate(input: &str) -> Result<u32, ConfigError> {
    let invalid = |reason| ConfigError::InvalidRate { input: input.to_string(), reason };

    let trimmed = input.trim();
    let (number, scale) = match trimmed.chars().last() {
        Some('k') | Some('K') => (&trimmed[..trimmed.len() - 1], 1.0 / 1000.0),
        Some('m') | Some('M') => (&trimmed[..trimmed.len() - 1], 1.0),
        Some(_) => (trimmed, 1.0),
        None => return Err(invalid("empty")),
    };

    let value: f64 = number.trim().parse().map_err(|_| invalid("not a number"))?;
    if !value.is_finite() || value <= 0.0 {
        return Err(invalid("must be positive"));
    }

    let mbit = (value * scale).round() as u32;
    if mbit == 0 {
        return Err(invalid("rounds to zero mbit/s"));
    }
    Ok(mbit)
}

/// Parse a class list of the form `mark:rate[:ceil[:prio]][,mark:rate...]`.
pub fn parse_classes(input: &str) -> Result<Vec<ClassSpec>, ConfigError> {
    input.split(',').map(parse_class).collect()
}

fn parse_class(entry: &str) -> Result<ClassSpec, ConfigError> {
    let invalid = |reason| ConfigError::InvalidClassSpec { input: entry.to_string(), reason };

    let mut fields = entry.trim().split(':');

    let mark: u32 = fields
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| invalid("missing mark"))?
        .parse()
        .map_err(|_| invalid("mark is not an integer"))?;
    if mark == 0 {
        return Err(invalid("mark must be positive"));
    }

    let rate = parse_rate(fields.next().ok_or_else(|| invalid("missing rate"))?)?;

    let ceil = fields.next().map(parse_rate).transpose()?;

    let prio = fields
        .next()
        .map(|s| s.parse::<u8>().map_err(|_| invalid("priority is not a small integer")))
        .transpose()?;

    if fields.next().is_some() {
        return Err(invalid("too many fields"));
    }

    Ok(ClassSpec { mark, rate, ceil, prio })
}
