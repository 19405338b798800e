//! Topology selection
//!
//! One decision per invocation: which control-plane shape the run builds.
//! The presence of a redirect interface name is the sole discriminator
//! between shaping and policing downloads.

/// The control-plane shape for one run. Chosen once, immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topology {
    /// Read-only: report the current configuration, following a discovered
    /// ingress redirect.
    Inspect,
    /// Tear down shaping on the interface and its redirect device, and
    /// restore hardware offloads.
    Clear,
    /// Shape egress only.
    EgressOnly { upload: u32 },
    /// Shape ingress through a redirect device (plus egress when an upload
    /// rate is set).
    EgressAndIngressShaping {
        upload: Option<u32>,
        download: u32,
        redirect: String,
    },
    /// Police ingress in place (plus egress shaping when an upload rate is
    /// set).
    EgressAndIngressPolicing { upload: Option<u32>, download: u32 },
}

impl Topology {
    /// Pure function of the four inputs; always yields exactly one variant.
    pub fn select(
        upload: Option<u32>,
        download: Option<u32>,
        redirect: Option<&str>,
        clear: bool,
    ) -> Self {
        if clear {
            return Self::Clear;
        }
        match (upload, download) {
            (None, None) => Self::Inspect,
            (Some(up), None) => Self::EgressOnly { upload: up },
            (upload, Some(down)) => match redirect {
                Some(dev) => Self::EgressAndIngressShaping {
                    upload,
                    download: down,
                    redirect: dev.to_string(),
                },
                None => Self::EgressAndIngressPolicing { upload, download: down },
            },
        }
    }
}
