// Control-plane backend trait and implementations

pub mod linux_tc;

pub use linux_tc::TcCommandBackend;

use anyhow::Result;

use crate::params::TargetLatency;

/// Hardware offload features toggled around ingress policing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffloadFeature {
    /// Generic receive offload. Aggregated super-packets defeat policer
    /// accounting, so this is switched off while policing is active.
    Gro,
    /// Generic segmentation offload.
    Gso,
    /// TCP segmentation offload.
    Tso,
}

impl OffloadFeature {
    pub fn flag(self) -> &'static str {
        match self {
            Self::Gro => "gro",
            Self::Gso => "gso",
            Self::Tso => "tso",
        }
    }
}

/// Narrow contract between the decision core and the packet-scheduling
/// control plane.
///
/// The core hands over fully-resolved values (integer mbit/s rates, derived
/// quanta/targets/limits); implementations only translate them into
/// imperative configuration commands. Keeping command construction and
/// output scraping behind this trait keeps the core testable without a
/// kernel.
pub trait ControlPlane {
    /// Install the root HTB qdisc with `default_class_id` as the catch-all.
    fn add_root_qdisc(&self, dev: &str, default_class_id: u32) -> Result<()>;

    /// Add one HTB rate class under `parent`.
    #[allow(clippy::too_many_arguments)]
    fn add_rate_class(
        &self,
        dev: &str,
        parent: &str,
        class_id: u32,
        rate_mbit: u32,
        ceil_mbit: u32,
        prio: u8,
        quantum: u32,
    ) -> Result<()>;

    /// Attach (or swap) the FQ-CoDel AQM under `parent`.
    #[allow(clippy::too_many_arguments)]
    fn replace_aqm(
        &self,
        dev: &str,
        parent: &str,
        handle: u32,
        limit_packets: u32,
        target: TargetLatency,
        quantum: Option<u32>,
        ecn: bool,
    ) -> Result<()>;

    /// Steer packets carrying fwmark `mark` into `class_id`.
    fn add_mark_filter(&self, dev: &str, parent: &str, mark: u32, class_id: u32) -> Result<()>;

    /// Redirect all ingress traffic on `dev` to `target_dev`.
    fn add_ingress_redirect(&self, dev: &str, target_dev: &str) -> Result<()>;

    /// Rate-limit ingress on `dev` by dropping excess traffic.
    fn add_ingress_police(&self, dev: &str, rate_mbit: u32, burst_bytes: u32, mtu: u32)
        -> Result<()>;

    /// Remove root and ingress qdiscs. Idempotent: deleting a qdisc that is
    /// not there is the normal case, never an error.
    fn clear_qdiscs(&self, dev: &str);

    /// Toggle hardware offload `features` on or off.
    fn set_offload(&self, dev: &str, features: &[OffloadFeature], enabled: bool) -> Result<()>;

    /// Ensure `dev` exists (redirect devices are created on demand) and is
    /// administratively up.
    fn link_up(&self, dev: &str) -> Result<()>;

    /// Kernel-reported MTU of `dev`. A missing interface is fatal to the
    /// whole invocation.
    fn query_mtu(&self, dev: &str) -> Result<u32>;

    /// Opaque description of the current qdisc/class/filter state.
    fn query_config(&self, dev: &str) -> Result<String>;

    /// The device `dev` currently redirects its ingress traffic to, if any.
    fn redirect_target(&self, dev: &str) -> Option<String>;
}
