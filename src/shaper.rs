//! Topology execution
//!
//! Walks the selected [`Topology`] and drives the control plane in order.
//! Every build starts from clear semantics, and validation runs before any
//! mutating command is issued for a sub-tree, so a failed run leaves either
//! the previous state (validation error during planning) or a clean slate,
//! never a half-built tree.

use anyhow::Result;

use crate::backends::{ControlPlane, OffloadFeature};
use crate::params;
use crate::plan::{ClassPlan, ClassSpec, DEFAULT_CLASS_ID, DEFAULT_PRIORITY, ResolvedClass};
use crate::status::{self, InterfaceStatus};
use crate::topology::Topology;

/// Root handle of the HTB tree, on the physical and the redirect device.
const ROOT: &str = "1:";

/// Offloads restored on clear. Policing only disables GRO, but restoring
/// the wider set also repairs what earlier runs or manual fiddling left off.
const RESTORED_OFFLOADS: &[OffloadFeature] =
    &[OffloadFeature::Gro, OffloadFeature::Gso, OffloadFeature::Tso];

/// Immutable per-run configuration assembled by the CLI.
#[derive(Debug, Clone)]
pub struct ShaperConfig {
    pub interface: String,
    /// Upload limit in mbit/s.
    pub upload: Option<u32>,
    /// Download limit in mbit/s.
    pub download: Option<u32>,
    /// Redirect (ifb) device for download shaping; without it downloads are
    /// policed.
    pub redirect: Option<String>,
    pub classes: Vec<ClassSpec>,
    pub clear: bool,
}

pub struct Shaper<'a> {
    cp: &'a dyn ControlPlane,
}

impl<'a> Shaper<'a> {
    pub fn new(cp: &'a dyn ControlPlane) -> Self {
        Self { cp }
    }

    /// Run one configuration pass. Returns the gathered status in Inspect
    /// mode, `None` otherwise.
    pub fn run(&self, cfg: &ShaperConfig) -> Result<Option<InterfaceStatus>> {
        let topology =
            Topology::select(cfg.upload, cfg.download, cfg.redirect.as_deref(), cfg.clear);
        log::debug!("selected topology: {topology:?}");

        match topology {
            Topology::Inspect => return status::gather(self.cp, &cfg.interface).map(Some),
            Topology::Clear => {
                self.clear(&cfg.interface);
                log::info!("cleared shaping on {}", cfg.interface);
            }
            Topology::EgressOnly { upload } => {
                self.clear(&cfg.interface);
                self.build_egress(&cfg.interface, upload, &cfg.classes)?;
            }
            Topology::EgressAndIngressShaping { upload, download, redirect } => {
                self.clear(&cfg.interface);
                if let Some(upload) = upload {
                    self.build_egress(&cfg.interface, upload, &cfg.classes)?;
                }
                self.build_ingress_shaping(&cfg.interface, download, &redirect)?;
            }
            Topology::EgressAndIngressPolicing { upload, download } => {
                self.clear(&cfg.interface);
                if let Some(upload) = upload {
                    self.build_egress(&cfg.interface, upload, &cfg.classes)?;
                }
                self.build_ingress_policing(&cfg.interface, download)?;
            }
        }
        Ok(None)
    }

    /// Tear down whatever a previous run left behind. Safe to repeat: all
    /// removals swallow "nothing to clear".
    fn clear(&self, dev: &str) {
        // The redirect target must be read before the ingress filter
        // holding it is deleted.
        if let Some(target) = self.cp.redirect_target(dev) {
            self.cp.clear_qdiscs(&target);
        }
        self.cp.clear_qdiscs(dev);

        if let Err(err) = self.cp.set_offload(dev, RESTORED_OFFLOADS, true) {
            log::debug!("offload restore skipped: {err:#}");
        }
    }

    /// One HTB class plus its FQ-CoDel leaf. AQM parameters derive from the
    /// ceiling: the queue a class can build is bounded by what it may send,
    /// not by what it is guaranteed.
    fn add_class_with_aqm(&self, dev: &str, class: &ResolvedClass, mtu: u32, ecn: bool) -> Result<()> {
        self.cp.add_rate_class(
            dev,
            ROOT,
            class.id,
            class.rate,
            class.ceil,
            class.prio,
            params::htb_quantum(class.ceil),
        )?;
        self.cp.replace_aqm(
            dev,
            &format!("1:{}", class.id),
            class.id,
            params::queue_limit(class.ceil),
            params::target_latency(class.ceil, mtu),
            params::fq_codel_quantum(class.ceil),
            ecn,
        )
    }

    fn build_egress(&self, dev: &str, upload: u32, specs: &[ClassSpec]) -> Result<()> {
        // Plan first: a validation failure aborts before any mutation.
        let plan = ClassPlan::build(upload, specs)?;
        let mtu = self.cp.query_mtu(dev)?;

        self.cp.add_root_qdisc(dev, DEFAULT_CLASS_ID)?;
        for class in plan.iter() {
            self.add_class_with_aqm(dev, class, mtu, false)?;
        }
        for class in &plan.classes {
            self.cp.add_mark_filter(dev, ROOT, class.id, class.id)?;
        }

        log::info!(
            "egress shaping on {dev}: {upload} mbit, {} marked classes",
            plan.classes.len()
        );
        Ok(())
    }

    fn build_ingress_shaping(&self, dev: &str, download: u32, redirect: &str) -> Result<()> {
        let mtu = self.cp.query_mtu(dev)?;

        self.cp.link_up(redirect)?;
        // A reused redirect device may still carry an old tree.
        self.cp.clear_qdiscs(redirect);

        self.cp.add_root_qdisc(redirect, DEFAULT_CLASS_ID)?;
        let class = ResolvedClass {
            id: DEFAULT_CLASS_ID,
            rate: download,
            ceil: download,
            prio: DEFAULT_PRIORITY,
        };
        self.add_class_with_aqm(redirect, &class, mtu, true)?;

        // Redirect goes in last: traffic starts flowing through the tree
        // only once the tree is complete.
        self.cp.add_ingress_redirect(dev, redirect)?;

        log::info!("ingress shaping on {dev}: {download} mbit via {redirect}");
        Ok(())
    }

    fn build_ingress_policing(&self, dev: &str, download: u32) -> Result<()> {
        let mtu = self.cp.query_mtu(dev)?;

        // GRO super-packets defeat the policer's byte accounting.
        self.cp.set_offload(dev, &[OffloadFeature::Gro], false)?;
        self.cp
            .add_ingress_police(dev, download, params::police_burst(download), mtu)?;

        log::info!("ingress policing on {dev}: {download} mbit");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConfigError;
    use crate::params::TargetLatency;
    use std::cell::RefCell;

    /// Records every control-plane call as a flat op string.
    #[derive(Default)]
    struct Recorder {
        ops: RefCell<Vec<String>>,
        redirect: Option<String>,
    }

    impl Recorder {
        fn with_redirect(target: &str) -> Self {
            Self { redirect: Some(target.to_string()), ..Self::default() }
        }

        fn push(&self, op: String) {
            self.ops.borrow_mut().push(op);
        }

        fn ops(&self) -> Vec<String> {
            self.ops.borrow().clone()
        }
    }

    impl ControlPlane for Recorder {
        fn add_root_qdisc(&self, dev: &str, default_class_id: u32) -> Result<()> {
            self.push(format!("root {dev} default {default_class_id}"));
            Ok(())
        }

        fn add_rate_class(
            &self,
            dev: &str,
            parent: &str,
            class_id: u32,
            rate_mbit: u32,
            ceil_mbit: u32,
            prio: u8,
            quantum: u32,
        ) -> Result<()> {
            self.push(format!(
                "class {dev} {parent}{class_id} rate {rate_mbit} ceil {ceil_mbit} prio {prio} quantum {quantum}"
            ));
            Ok(())
        }

        fn replace_aqm(
            &self,
            dev: &str,
            parent: &str,
            _handle: u32,
            limit_packets: u32,
            target: TargetLatency,
            quantum: Option<u32>,
            ecn: bool,
        ) -> Result<()> {
            let quantum = quantum.map_or_else(|| "-".to_string(), |q| q.to_string());
            self.push(format!(
                "aqm {dev} {parent} limit {limit_packets} target {target} quantum {quantum} ecn {ecn}"
            ));
            Ok(())
        }

        fn add_mark_filter(&self, dev: &str, parent: &str, mark: u32, class_id: u32) -> Result<()> {
            self.push(format!("filter {dev} mark {mark} -> {parent}{class_id}"));
            Ok(())
        }

        fn add_ingress_redirect(&self, dev: &str, target_dev: &str) -> Result<()> {
            self.push(format!("redirect {dev} -> {target_dev}"));
            Ok(())
        }

        fn add_ingress_police(
            &self,
            dev: &str,
            rate_mbit: u32,
            burst_bytes: u32,
            mtu: u32,
        ) -> Result<()> {
            self.push(format!("police {dev} rate {rate_mbit} burst {burst_bytes} mtu {mtu}"));
            Ok(())
        }

        fn clear_qdiscs(&self, dev: &str) {
            self.push(format!("clear {dev}"));
        }

        fn set_offload(&self, dev: &str, features: &[OffloadFeature], enabled: bool) -> Result<()> {
            let flags: Vec<&str> = features.iter().map(|f| f.flag()).collect();
            let state = if enabled { "on" } else { "off" };
            self.push(format!("offload {dev} {} {state}", flags.join("+")));
            Ok(())
        }

        fn link_up(&self, dev: &str) -> Result<()> {
            self.push(format!("up {dev}"));
            Ok(())
        }

        fn query_mtu(&self, dev: &str) -> Result<u32> {
            self.push(format!("mtu {dev}"));
            Ok(1500)
        }

        fn query_config(&self, dev: &str) -> Result<String> {
            Ok(format!("qdisc mq 0: dev {dev}\n"))
        }

        fn redirect_target(&self, _dev: &str) -> Option<String> {
            self.redirect.clone()
        }
    }

    fn config(
        upload: Option<u32>,
        download: Option<u32>,
        redirect: Option<&str>,
        classes: Vec<ClassSpec>,
        clear: bool,
    ) -> ShaperConfig {
        ShaperConfig {
            interface: "eth0".to_string(),
            upload,
            download,
            redirect: redirect.map(Into::into),
            classes,
            clear,
        }
    }

    #[test]
    fn test_egress_only_emission_order() {
        let cp = Recorder::default();
        let classes = vec![ClassSpec { mark: 107, rate: 10, ceil: None, prio: None }];
        let cfg = config(Some(30), None, None, classes, false);

        Shaper::new(&cp).run(&cfg).unwrap();

        assert_eq!(
            cp.ops(),
            vec![
                "clear eth0",
                "offload eth0 gro+gso+tso on",
                "mtu eth0",
                "root eth0 default 99",
                "class eth0 1:107 rate 10 ceil 30 prio 4 quantum 1514",
                "aqm eth0 1:107 limit 800 target 5.0ms quantum 300 ecn false",
                "class eth0 1:99 rate 20 ceil 30 prio 4 quantum 1514",
                "aqm eth0 1:99 limit 800 target 5.0ms quantum 300 ecn false",
                "filter eth0 mark 107 -> 1:107",
            ]
        );
    }

    #[test]
    fn test_policing_disables_gro_before_the_filter() {
        let cp = Recorder::default();
        let cfg = config(None, Some(50), None, Vec::new(), false);

        Shaper::new(&cp).run(&cfg).unwrap();

        let ops = cp.ops();
        assert_eq!(
            ops,
            vec![
                "clear eth0",
                "offload eth0 gro+gso+tso on",
                "mtu eth0",
                "offload eth0 gro off",
                "police eth0 rate 50 burst 32768 mtu 1500",
            ]
        );
    }

    #[test]
    fn test_ingress_shaping_redirects_last() {
        let cp = Recorder::default();
        let cfg = config(None, Some(100), Some("ifb0"), Vec::new(), false);

        Shaper::new(&cp).run(&cfg).unwrap();

        assert_eq!(
            cp.ops(),
            vec![
                "clear eth0",
                "offload eth0 gro+gso+tso on",
                "mtu eth0",
                "up ifb0",
                "clear ifb0",
                "root ifb0 default 99",
                "class ifb0 1:99 rate 100 ceil 100 prio 4 quantum 8000",
                "aqm ifb0 1:99 limit 800 target 5.0ms quantum - ecn true",
                "redirect eth0 -> ifb0",
            ]
        );
    }

    #[test]
    fn test_full_duplex_builds_both_trees() {
        let cp = Recorder::default();
        let cfg = config(Some(30), Some(100), Some("ifb0"), Vec::new(), false);

        Shaper::new(&cp).run(&cfg).unwrap();

        let ops = cp.ops();
        assert!(ops.contains(&"root eth0 default 99".to_string()));
        assert!(ops.contains(&"root ifb0 default 99".to_string()));
        assert_eq!(ops.last().unwrap(), "redirect eth0 -> ifb0");
    }

    #[test]
    fn test_clear_tears_down_discovered_redirect() {
        let cp = Recorder::with_redirect("ifb0");
        let cfg = config(None, None, None, Vec::new(), true);

        let shaper = Shaper::new(&cp);
        shaper.run(&cfg).unwrap();
        // clearing twice must not error either
        shaper.run(&cfg).unwrap();

        let once = vec![
            "clear ifb0".to_string(),
            "clear eth0".to_string(),
            "offload eth0 gro+gso+tso on".to_string(),
        ];
        assert_eq!(cp.ops(), [once.clone(), once].concat());
    }

    #[test]
    fn test_config_error_aborts_before_any_build() {
        let cp = Recorder::default();
        let classes = vec![ClassSpec { mark: 107, rate: 50, ceil: None, prio: None }];
        let cfg = config(Some(25), None, None, classes, false);

        let err = Shaper::new(&cp).run(&cfg).unwrap_err();
        assert_eq!(
            err.downcast_ref::<ConfigError>(),
            Some(&ConfigError::NoDefaultBudget)
        );

        // only the idempotent pre-clear ran, nothing was built
        assert_eq!(cp.ops(), vec!["clear eth0", "offload eth0 gro+gso+tso on"]);
    }

    #[test]
    fn test_inspect_is_read_only() {
        let cp = Recorder::default();
        let cfg = config(None, None, None, Vec::new(), false);

        let status = Shaper::new(&cp).run(&cfg).unwrap().expect("inspect returns status");
        assert_eq!(status.interface, "eth0");
        assert!(status.redirect.is_none());
        assert!(cp.ops().is_empty());
    }

    #[test]
    fn test_inspect_follows_redirect() {
        let cp = Recorder::with_redirect("ifb0");
        let cfg = config(None, None, None, Vec::new(), false);

        let status = Shaper::new(&cp).run(&cfg).unwrap().unwrap();
        assert_eq!(status.redirect.unwrap().interface, "ifb0");
    }
}
