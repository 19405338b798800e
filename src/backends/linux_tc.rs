// tc/ip/ethtool control-plane emitter

use std::fs;
use std::process::Command;

use anyhow::{Context, Result, anyhow};

use super::{ControlPlane, OffloadFeature};
use crate::error::EnvironmentError;
use crate::params::TargetLatency;

const REDIRECT_MARKER: &str = "Egress Redirect to device ";

/// Emits traffic-control configuration by invoking `tc`, `ip` and
/// `ethtool`. Stateless: every method is a one-shot command sequence.
#[derive(Debug, Default)]
pub struct TcCommandBackend;

impl TcCommandBackend {
    pub fn new() -> Self {
        Self
    }

    /// Run a command that must succeed. `what` names the operation in the
    /// error so a failure is attributable without reading the command line.
    fn run(&self, what: &str, program: &str, args: &[&str]) -> Result<()> {
        log::debug!("{} {}", program, args.join(" "));

        let status = Command::new(program)
            .args(args)
            .status()
            .with_context(|| format!("{what}: failed to execute {program}"))?;

        if !status.success() {
            return Err(anyhow!(
                "{what}: `{program} {}` exited with {status}",
                args.join(" ")
            ));
        }
        Ok(())
    }

    fn capture(&self, what: &str, program: &str, args: &[&str]) -> Result<String> {
        let output = Command::new(program)
            .args(args)
            .output()
            .with_context(|| format!("{what}: failed to execute {program}"))?;

        if !output.status.success() {
            return Err(anyhow!("{what}: `{program} {}` exited with {}", args.join(" "), output.status));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn device_exists(&self, dev: &str) -> bool {
        Command::new("ip")
            .args(["link", "show", "dev", dev])
            .output()
            .map(|out| out.status.success())
            .unwrap_or(false)
    }
}

impl ControlPlane for TcCommandBackend {
    fn add_root_qdisc(&self, dev: &str, default_class_id: u32) -> Result<()> {
        self.run(
            "add root qdisc",
            "tc",
            &[
                "qdisc", "add", "dev", dev, "root", "handle", "1:", "htb", "default",
                &default_class_id.to_string(),
            ],
        )
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
        let classid = format!("{}:{}", parent.trim_end_matches(':'), class_id);
        self.run(
            "add rate class",
            "tc",
            &[
                "class", "add", "dev", dev, "parent", parent, "classid", &classid, "htb",
                "rate", &format!("{rate_mbit}mbit"),
                "ceil", &format!("{ceil_mbit}mbit"),
                "prio", &prio.to_string(),
                "quantum", &quantum.to_string(),
            ],
        )
    }

    fn replace_aqm(
        &self,
        dev: &str,
        parent: &str,
        handle: u32,
        limit_packets: u32,
        target: TargetLatency,
        quantum: Option<u32>,
        ecn: bool,
    ) -> Result<()> {
        let mut args: Vec<String> = [
            "qdisc", "replace", "dev", dev, "parent", parent, "handle",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        args.push(format!("{handle}:"));
        args.push("fq_codel".into());
        args.push("limit".into());
        args.push(limit_packets.to_string());
        args.push("target".into());
        args.push(target.to_string());
        if let Some(quantum) = quantum {
            args.push("quantum".into());
            args.push(quantum.to_string());
        }
        args.push(if ecn { "ecn" } else { "noecn" }.into());

        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run("attach fq_codel", "tc", &args)
    }

    fn add_mark_filter(&self, dev: &str, parent: &str, mark: u32, class_id: u32) -> Result<()> {
        let classid = format!("{}:{}", parent.trim_end_matches(':'), class_id);
        // fw filters ignore the packet payload, but tc still wants one
        // filter per protocol; ip and ipv6 need distinct preferences.
        self.run(
            "add mark filter",
            "tc",
            &[
                "filter", "add", "dev", dev, "parent", parent, "protocol", "ip", "prio", "1",
                "handle", &mark.to_string(), "fw", "classid", &classid,
            ],
        )?;
        self.run(
            "add mark filter (ipv6)",
            "tc",
            &[
                "filter", "add", "dev", dev, "parent", parent, "protocol", "ipv6", "prio", "2",
                "handle", &mark.to_string(), "fw", "classid", &classid,
            ],
        )
    }

    fn add_ingress_redirect(&self, dev: &str, target_dev: &str) -> Result<()> {
        self.run(
            "add ingress qdisc",
            "tc",
            &["qdisc", "add", "dev", dev, "handle", "ffff:", "ingress"],
        )?;

        for (protocol, prio) in [("ip", "1"), ("ipv6", "2")] {
            self.run(
                "add ingress redirect filter",
                "tc",
                &[
                    "filter", "add", "dev", dev, "parent", "ffff:", "protocol", protocol,
                    "prio", prio, "u32", "match", "u32", "0", "0",
                    "action", "mirred", "egress", "redirect", "dev", target_dev,
                ],
            )?;
        }
        Ok(())
    }

    fn add_ingress_police(
        &self,
        dev: &str,
        rate_mbit: u32,
        burst_bytes: u32,
        mtu: u32,
    ) -> Result<()> {
        self.run(
            "add ingress qdisc",
            "tc",
            &["qdisc", "add", "dev", dev, "handle", "ffff:", "ingress"],
        )?;
        self.run(
            "add ingress police filter",
            "tc",
            &[
                "filter", "add", "dev", dev, "parent", "ffff:", "protocol", "ip", "prio", "1",
                "u32", "match", "u32", "0", "0",
                "police", "rate", &format!("{rate_mbit}mbit"),
                "burst", &burst_bytes.to_string(),
                "mtu", &mtu.to_string(),
                "drop", "flowid", ":1",
            ],
        )
    }

    fn clear_qdiscs(&self, dev: &str) {
        // Deleting a qdisc that is not there is the normal case. output()
        // rather than status() so tc's complaint does not reach the console.
        let _ = Command::new("tc")
            .args(["qdisc", "del", "dev", dev, "root"])
            .output();
        let _ = Command::new("tc")
            .args(["qdisc", "del", "dev", dev, "ingress"])
            .output();
    }

    fn set_offload(&self, dev: &str, features: &[OffloadFeature], enabled: bool) -> Result<()> {
        let mut args = vec!["-K", dev];
        let state = if enabled { "on" } else { "off" };
        for feature in features {
            args.push(feature.flag());
            args.push(state);
        }
        self.run("toggle hardware offload", "ethtool", &args)
    }

    fn link_up(&self, dev: &str) -> Result<()> {
        if !self.device_exists(dev) {
            // Redirect devices come from the ifb module; loading it is
            // best-effort since it may be built in or already loaded.
            let _ = Command::new("modprobe").args(["ifb", "numifbs=1"]).output();

            if !self.device_exists(dev) {
                self.run(
                    "create redirect device",
                    "ip",
                    &["link", "add", "name", dev, "type", "ifb"],
                )?;
            }
        }
        self.run("bring interface up", "ip", &["link", "set", "dev", dev, "up"])
    }

    fn query_mtu(&self, dev: &str) -> Result<u32> {
        let path = format!("/sys/class/net/{dev}/mtu");
        let raw = fs::read_to_string(&path).map_err(|source| EnvironmentError::InterfaceMissing {
            dev: dev.to_string(),
            source,
        })?;
        let mtu = raw.trim().parse().map_err(|_| EnvironmentError::BadMtu {
            dev: dev.to_string(),
            raw: raw.trim().to_string(),
        })?;
        log::debug!("{dev} mtu {mtu}");
        Ok(mtu)
    }

    fn query_config(&self, dev: &str) -> Result<String> {
        let qdiscs = self.capture("list qdiscs", "tc", &["qdisc", "show", "dev", dev])?;
        let classes = self.capture("list classes", "tc", &["class", "show", "dev", dev])?;
        let filters = self.capture("list filters", "tc", &["filter", "show", "dev", dev])?;
        Ok(format!("qdisc:\n{qdiscs}class:\n{classes}filter:\n{filters}"))
    }

    fn redirect_target(&self, dev: &str) -> Option<String> {
        let output = Command::new("tc")
            .args(["filter", "show", "dev", dev, "parent", "ffff:"])
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }

        // mirred actions print as "... (Egress Redirect to device ifb0) ...".
        let text = String::from_utf8_lossy(&output.stdout);
        let rest = &text[text.find(REDIRECT_MARKER)? + REDIRECT_MARKER.len()..];
        let name: String = rest
            .chars()
            .take_while(|c| !c.is_whitespace() && *c != ')')
            .collect();
        (!name.is_empty()).then_some(name)
    }
}
