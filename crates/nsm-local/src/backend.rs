//! Firewall and routing backends for the daemon.
//!
//! `Command*` drive the system `iptables`/`ip` tools; the private table and
//! mark rules follow the same shape as the core expects (mark N routes via
//! table N). `Null*` log what they would do and are the default, so the
//! daemon can run unprivileged.

use std::collections::HashMap;
use std::process::Command;

use tracing::{debug, warn};

use libnsm::{
    Family, FirewallBackend, Mark, MarkRule, NsmError, Result, RoutingBackend, RuleHandle,
    SessionOwnerId,
};

fn run(program: &str, args: &[String]) -> Result<()> {
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|err| NsmError::ResourceExhausted(format!("failed to run {program}: {err}")))?;
    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(NsmError::ResourceExhausted(format!(
            "{program} {} failed: {}",
            args.join(" "),
            stderr.trim()
        )))
    }
}

/// Best-effort delete: the rule or route may already be gone.
fn run_ignore(program: &str, args: &[String]) {
    if let Err(err) = run(program, args) {
        debug!("{err}");
    }
}

fn owner_match_args(owner: &SessionOwnerId) -> Result<Vec<String>> {
    match owner {
        SessionOwnerId::Uid(uid) => Ok(vec![
            "-m".to_string(),
            "owner".to_string(),
            "--uid-owner".to_string(),
            uid.to_string(),
        ]),
        SessionOwnerId::Gid(gid) => Ok(vec![
            "-m".to_string(),
            "owner".to_string(),
            "--gid-owner".to_string(),
            gid.to_string(),
        ]),
        SessionOwnerId::SecurityContext(_) => Err(NsmError::InvalidArgument(
            "security-context matching is not supported by the iptables backend".to_string(),
        )),
        SessionOwnerId::Unknown => Err(NsmError::InvalidArgument(
            "cannot build a mark rule without an owner identity".to_string(),
        )),
    }
}

const CONTEXT_RULES: [(&str, &[&str]); 2] = [
    ("INPUT", &["-j", "CONNMARK", "--restore-mark"]),
    ("POSTROUTING", &["-j", "CONNMARK", "--save-mark"]),
];

/// iptables-driven firewall backend.
#[derive(Default)]
pub struct CommandFirewall {
    rules: HashMap<RuleHandle, Vec<String>>,
    next_handle: RuleHandle,
}

impl CommandFirewall {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FirewallBackend for CommandFirewall {
    fn create_context(&mut self) -> Result<()> {
        for (chain, spec) in CONTEXT_RULES {
            let mut args = vec!["-t".to_string(), "mangle".to_string(), "-I".to_string()];
            args.push(chain.to_string());
            args.extend(spec.iter().map(|s| s.to_string()));
            run("iptables", &args)?;
        }
        Ok(())
    }

    fn destroy_context(&mut self) -> Result<()> {
        for (chain, spec) in CONTEXT_RULES {
            let mut args = vec!["-t".to_string(), "mangle".to_string(), "-D".to_string()];
            args.push(chain.to_string());
            args.extend(spec.iter().map(|s| s.to_string()));
            run_ignore("iptables", &args);
        }
        Ok(())
    }

    fn add_rule(&mut self, table: &str, chain: &str, rule: &MarkRule) -> Result<RuleHandle> {
        let mut spec = owner_match_args(&rule.owner)?;
        spec.extend([
            "-j".to_string(),
            "MARK".to_string(),
            "--set-mark".to_string(),
            rule.mark.to_string(),
        ]);

        let mut args = vec![
            "-t".to_string(),
            table.to_string(),
            "-A".to_string(),
            chain.to_string(),
        ];
        args.extend(spec.clone());
        run("iptables", &args)?;

        self.next_handle += 1;
        // Remember the full rule so removal can replay it with -D.
        let mut delete_args = vec![
            "-t".to_string(),
            table.to_string(),
            "-D".to_string(),
            chain.to_string(),
        ];
        delete_args.extend(spec);
        self.rules.insert(self.next_handle, delete_args);
        Ok(self.next_handle)
    }

    fn remove_rule(&mut self, handle: RuleHandle) -> Result<()> {
        if let Some(args) = self.rules.remove(&handle) {
            run_ignore("iptables", &args);
        }
        Ok(())
    }
}

fn ip_base(family: Family) -> Vec<String> {
    match family {
        Family::V4 => Vec::new(),
        Family::V6 => vec!["-6".to_string()],
    }
}

/// `ip rule` / `ip route` driven routing backend.
#[derive(Default)]
pub struct CommandRouting;

impl CommandRouting {
    pub fn new() -> Self {
        Self
    }
}

impl RoutingBackend for CommandRouting {
    fn add_fwmark_rule(&mut self, mark: Mark, family: Family, table: u32) -> Result<()> {
        let mut args = ip_base(family);
        args.extend([
            "rule".to_string(),
            "add".to_string(),
            "fwmark".to_string(),
            mark.to_string(),
            "table".to_string(),
            table.to_string(),
        ]);
        run("ip", &args)
    }

    fn del_fwmark_rule(&mut self, mark: Mark, family: Family, table: u32) -> Result<()> {
        let mut args = ip_base(family);
        args.extend([
            "rule".to_string(),
            "del".to_string(),
            "fwmark".to_string(),
            mark.to_string(),
            "table".to_string(),
            table.to_string(),
        ]);
        run_ignore("ip", &args);
        Ok(())
    }

    fn add_default_route(
        &mut self,
        table: u32,
        family: Family,
        ifindex: u32,
        gateway: Option<&str>,
    ) -> Result<()> {
        let Some(gateway) = gateway else {
            warn!(table, ifindex, "service has no gateway, skipping default route");
            return Ok(());
        };
        let mut args = ip_base(family);
        args.extend([
            "route".to_string(),
            "replace".to_string(),
            "default".to_string(),
            "via".to_string(),
            gateway.to_string(),
            "table".to_string(),
            table.to_string(),
        ]);
        run("ip", &args)
    }

    fn del_default_route(&mut self, table: u32, family: Family) -> Result<()> {
        let mut args = ip_base(family);
        args.extend([
            "route".to_string(),
            "del".to_string(),
            "default".to_string(),
            "table".to_string(),
            table.to_string(),
        ]);
        run_ignore("ip", &args);
        Ok(())
    }
}

/// Log-only firewall backend for unprivileged runs.
#[derive(Default)]
pub struct NullFirewall;

impl NullFirewall {
    pub fn new() -> Self {
        Self
    }
}

impl FirewallBackend for NullFirewall {
    fn create_context(&mut self) -> Result<()> {
        debug!("null firewall: create context");
        Ok(())
    }

    fn destroy_context(&mut self) -> Result<()> {
        debug!("null firewall: destroy context");
        Ok(())
    }

    fn add_rule(&mut self, table: &str, chain: &str, rule: &MarkRule) -> Result<RuleHandle> {
        debug!(table, chain, mark = rule.mark, "null firewall: add rule");
        Ok(u64::from(rule.mark))
    }

    fn remove_rule(&mut self, handle: RuleHandle) -> Result<()> {
        debug!(handle, "null firewall: remove rule");
        Ok(())
    }
}

/// Log-only routing backend for unprivileged runs.
#[derive(Default)]
pub struct NullRouting;

impl NullRouting {
    pub fn new() -> Self {
        Self
    }
}

impl RoutingBackend for NullRouting {
    fn add_fwmark_rule(&mut self, mark: Mark, family: Family, table: u32) -> Result<()> {
        debug!(mark, ?family, table, "null routing: add fwmark rule");
        Ok(())
    }

    fn del_fwmark_rule(&mut self, mark: Mark, family: Family, table: u32) -> Result<()> {
        debug!(mark, ?family, table, "null routing: del fwmark rule");
        Ok(())
    }

    fn add_default_route(
        &mut self,
        table: u32,
        family: Family,
        ifindex: u32,
        gateway: Option<&str>,
    ) -> Result<()> {
        debug!(table, ?family, ifindex, ?gateway, "null routing: add default route");
        Ok(())
    }

    fn del_default_route(&mut self, table: u32, family: Family) -> Result<()> {
        debug!(table, ?family, "null routing: del default route");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_match_covers_uid_and_gid() {
        let uid_args = owner_match_args(&SessionOwnerId::Uid(1000)).expect("uid");
        assert_eq!(uid_args, vec!["-m", "owner", "--uid-owner", "1000"]);

        let gid_args = owner_match_args(&SessionOwnerId::Gid(20)).expect("gid");
        assert_eq!(gid_args, vec!["-m", "owner", "--gid-owner", "20"]);

        assert!(owner_match_args(&SessionOwnerId::Unknown).is_err());
    }

    #[test]
    fn null_backends_accept_everything() {
        let mut firewall = NullFirewall::new();
        firewall.create_context().expect("context");
        let handle = firewall
            .add_rule(
                "mangle",
                "OUTPUT",
                &MarkRule {
                    owner: SessionOwnerId::Uid(1000),
                    mark: 256,
                },
            )
            .expect("rule");
        firewall.remove_rule(handle).expect("remove");

        let mut routing = NullRouting::new();
        routing.add_fwmark_rule(256, Family::V4, 256).expect("rule");
        routing.del_fwmark_rule(256, Family::V4, 256).expect("del");
    }
}
