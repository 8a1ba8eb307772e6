//! Host-network fabric.
//!
//! Per-VM resources (a TAP device enslaved to the shared bridge) plus the
//! process-wide shared pieces: the `fcbr0` bridge, the ip_forward sysctl,
//! and the NAT/FORWARD rules. Shared mutations run behind a mutex so two
//! jobs racing to first use cannot double-insert a rule, and every rule is
//! checked with `iptables -C` before an `-A`.

use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{cmd_succeeds, run_cmd, VmError};

pub const BRIDGE_NAME: &str = "fcbr0";
pub const BRIDGE_ADDR: &str = "192.168.100.1/24";
pub const GUEST_SUBNET: &str = "192.168.100.0/24";

/// A TAP handed to one VM. The guest-side MAC rides along so the VMM
/// configuration and the fabric agree on the interface identity.
#[derive(Debug, Clone)]
pub struct TapDevice {
    pub name: String,
    pub guest_mac: String,
}

/// TAP name derived from the vm id: `fc-tap-<first-8-of-vm-id>`.
pub fn tap_name(vm_id: &str) -> String {
    let prefix: String = vm_id.chars().take(8).collect();
    format!("fc-tap-{}", prefix)
}

/// Random locally-administered unicast MAC for the guest interface.
pub fn random_mac() -> String {
    let mut buf: [u8; 6] = rand::random();
    buf[0] = (buf[0] | 0x02) & 0xfe;
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        buf[0], buf[1], buf[2], buf[3], buf[4], buf[5]
    )
}

// ── Firewall rule specs ─────────────────────────────────────────────

/// One iptables rule, expressed once so the existence check (`-C`) and the
/// append (`-A`) can never drift apart.
#[derive(Debug, Clone)]
pub struct RuleSpec {
    table: Option<&'static str>,
    chain: &'static str,
    args: Vec<String>,
}

impl RuleSpec {
    pub fn masquerade(iface: &str) -> Self {
        Self {
            table: Some("nat"),
            chain: "POSTROUTING",
            args: vec![
                "-s".into(),
                GUEST_SUBNET.into(),
                "-o".into(),
                iface.into(),
                "-j".into(),
                "MASQUERADE".into(),
            ],
        }
    }

    pub fn forward_outbound(iface: &str) -> Self {
        Self {
            table: None,
            chain: "FORWARD",
            args: vec![
                "-i".into(),
                BRIDGE_NAME.into(),
                "-o".into(),
                iface.into(),
                "-j".into(),
                "ACCEPT".into(),
            ],
        }
    }

    pub fn forward_return(iface: &str) -> Self {
        Self {
            table: None,
            chain: "FORWARD",
            args: vec![
                "-i".into(),
                iface.into(),
                "-o".into(),
                BRIDGE_NAME.into(),
                "-m".into(),
                "state".into(),
                "--state".into(),
                "RELATED,ESTABLISHED".into(),
                "-j".into(),
                "ACCEPT".into(),
            ],
        }
    }

    /// Full argv for a given iptables operation (`-C` or `-A`).
    pub fn argv(&self, op: &str) -> Vec<String> {
        let mut argv = Vec::new();
        if let Some(table) = self.table {
            argv.push("-t".into());
            argv.push(table.into());
        }
        argv.push(op.into());
        argv.push(self.chain.into());
        argv.extend(self.args.iter().cloned());
        argv
    }
}

// ── Fabric ──────────────────────────────────────────────────────────

struct SharedNetState {
    ensured: bool,
}

/// Owner of all host-side networking mutation. Per-VM TAP operations run
/// lock-free; the shared bridge/sysctl/rule sequence is serialized by the
/// internal mutex for the whole check-and-insert pass.
pub struct NetworkFabric {
    fallback_iface: String,
    shared: Mutex<SharedNetState>,
}

impl NetworkFabric {
    pub fn new(fallback_iface: impl Into<String>) -> Self {
        Self {
            fallback_iface: fallback_iface.into(),
            shared: Mutex::new(SharedNetState { ensured: false }),
        }
    }

    /// Create and enslave a TAP for one VM.
    ///
    /// TAP creation failures are fatal; shared-state failures are tolerated
    /// (the VM simply boots without working egress).
    pub async fn acquire(&self, vm_id: &str) -> Result<TapDevice, VmError> {
        let tap = tap_name(vm_id);

        run_cmd("ip", &["tuntap", "add", &tap, "mode", "tap"])
            .await
            .map_err(|c| VmError::NetworkSetup {
                stage: "tap create",
                cause: c,
            })?;

        if let Err(c) = run_cmd("ip", &["link", "set", &tap, "up"]).await {
            let _ = run_cmd("ip", &["link", "delete", &tap]).await;
            return Err(VmError::NetworkSetup {
                stage: "tap up",
                cause: c,
            });
        }

        self.ensure_shared_once().await;

        if let Err(e) = run_cmd("ip", &["link", "set", &tap, "master", BRIDGE_NAME]).await {
            warn!(tap = %tap, error = %e, "failed to enslave TAP to bridge");
        }

        let device = TapDevice {
            name: tap,
            guest_mac: random_mac(),
        };
        info!(tap = %device.name, mac = %device.guest_mac, "tap acquired");
        Ok(device)
    }

    /// Tear down one VM's TAP. The bridge and firewall rules are shared and
    /// stay in place. All errors are logged, none propagate.
    pub async fn release(&self, tap: &str) {
        if tap.is_empty() {
            return;
        }
        if let Err(e) = run_cmd("ip", &["link", "set", tap, "nomaster"]).await {
            warn!(tap = %tap, error = %e, "failed to detach TAP from bridge");
        }
        match run_cmd("ip", &["link", "delete", tap]).await {
            Ok(()) => info!(tap = %tap, "tap deleted"),
            Err(e) => warn!(tap = %tap, error = %e, "failed to delete TAP"),
        }
    }

    /// Bring up the shared bridge, sysctl, and firewall rules, once.
    ///
    /// Every mutation is preceded by an existence check, so a second caller
    /// (or a restart against a configured host) is a no-op. The `ensured`
    /// flag only short-circuits after a fully successful pass, so a partial
    /// failure is retried by the next job.
    async fn ensure_shared_once(&self) {
        let mut shared = self.shared.lock().await;
        if shared.ensured {
            return;
        }

        let mut complete = true;

        if !cmd_succeeds("ip", &["link", "show", BRIDGE_NAME]).await {
            for args in [
                vec!["link", "add", BRIDGE_NAME, "type", "bridge"],
                vec!["link", "set", BRIDGE_NAME, "up"],
                vec!["addr", "add", BRIDGE_ADDR, "dev", BRIDGE_NAME],
            ] {
                if let Err(e) = run_cmd("ip", &args).await {
                    warn!(error = %e, "bridge setup step failed");
                    complete = false;
                }
            }
        }

        if let Err(e) = run_cmd("sysctl", &["-w", "net.ipv4.ip_forward=1"]).await {
            warn!(error = %e, "failed to enable IP forwarding");
            complete = false;
        }

        let iface = self.default_interface().await;
        debug!(iface = %iface, "using egress interface for NAT");

        for spec in [
            RuleSpec::masquerade(&iface),
            RuleSpec::forward_outbound(&iface),
            RuleSpec::forward_return(&iface),
        ] {
            if !ensure_rule_once(&spec).await {
                complete = false;
            }
        }

        if complete {
            shared.ensured = true;
            info!(bridge = BRIDGE_NAME, "shared network fabric ready");
        }
    }

    /// Device of the kernel's default route, or the configured fallback.
    async fn default_interface(&self) -> String {
        match Command::new("ip")
            .args(["route", "show", "default"])
            .output()
            .await
        {
            Ok(out) if out.status.success() => {
                let text = String::from_utf8_lossy(&out.stdout);
                if let Some(dev) = parse_default_device(&text) {
                    return dev;
                }
                warn!(
                    fallback = %self.fallback_iface,
                    "no default route found, using fallback interface"
                );
            }
            _ => warn!(
                fallback = %self.fallback_iface,
                "default route lookup failed, using fallback interface"
            ),
        }
        self.fallback_iface.clone()
    }
}

/// Insert a rule unless it already exists. Returns false when the host
/// state is still incomplete (check-and-insert both failed).
async fn ensure_rule_once(spec: &RuleSpec) -> bool {
    let check: Vec<String> = spec.argv("-C");
    let check_refs: Vec<&str> = check.iter().map(String::as_str).collect();
    if cmd_succeeds("iptables", &check_refs).await {
        return true;
    }

    let add: Vec<String> = spec.argv("-A");
    let add_refs: Vec<&str> = add.iter().map(String::as_str).collect();
    match run_cmd("iptables", &add_refs).await {
        Ok(()) => {
            debug!(rule = ?add, "firewall rule added");
            true
        }
        Err(e) => {
            warn!(error = %e, "failed to add firewall rule");
            false
        }
    }
}

/// Pull the `dev` operand out of `ip route show default` output.
fn parse_default_device(route_output: &str) -> Option<String> {
    let line = route_output
        .lines()
        .find(|l| l.trim_start().starts_with("default"))?;
    let mut tokens = line.split_whitespace();
    while let Some(token) = tokens.next() {
        if token == "dev" {
            return tokens.next().map(str::to_string);
        }
    }
    None
}
