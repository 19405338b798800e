//! Inspection of live interface configuration

use std::fmt;

use anyhow::Result;
use serde::Serialize;

use crate::backends::ControlPlane;

/// Snapshot of the traffic-control state of one interface. A never-configured
/// interface yields its default qdisc listing, not an error.
#[derive(Debug, Clone, Serialize)]
pub struct InterfaceStatus {
    pub interface: String,
    /// Opaque qdisc/class/filter listing as the control plane reports it.
    pub config: String,
    /// State of the device this interface redirects its ingress to, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect: Option<Box<InterfaceStatus>>,
}

/// Collect the state of `dev`, following at most the one redirect hop the
/// topology can produce (redirect devices do not redirect further).
pub fn gather(cp: &dyn ControlPlane, dev: &str) -> Result<InterfaceStatus> {
    let config = cp.query_config(dev)?;
    let redirect = match cp.redirect_target(dev) {
        Some(target) => {
            log::debug!("{dev} redirects ingress to {target}");
            Some(Box::new(InterfaceStatus {
                interface: target.clone(),
                config: cp.query_config(&target)?,
                redirect: None,
            }))
        }
        None => None,
    };
    Ok(InterfaceStatus {
        interface: dev.to_string(),
        config,
        redirect,
    })
}

impl fmt::Display for InterfaceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== {} ===", self.interface)?;
        write!(f, "{}", self.config)?;
        if let Some(redirect) = &self.redirect {
            writeln!(f, "--- ingress redirected to {} ---", redirect.interface)?;
            write!(f, "{redirect}")?;
        }
        Ok(())
    }
}
