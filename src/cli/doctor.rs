// src/cli/doctor.rs — Preflight checks for `handoff doctor`

use crate::infra::config::Config;
use crate::infra::paths;
use crate::runner::{AnsibleRunner, JobKind};

#[derive(Debug, PartialEq, Eq)]
pub struct Check {
    pub name: String,
    pub ok: bool,
    pub detail: String,
}

impl Check {
    fn new(name: impl Into<String>, ok: bool, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ok,
            detail: detail.into(),
        }
    }
}

/// Run every check against `config`.
pub fn checks(config: &Config) -> Vec<Check> {
    let mut out = Vec::new();

    match which::which(&config.runner.program) {
        Ok(path) => out.push(Check::new("runner", true, path.display().to_string())),
        Err(_) => out.push(Check::new(
            "runner",
            false,
            format!("'{}' not found in PATH", config.runner.program),
        )),
    }

    let runner = AnsibleRunner::new(&config.runner);
    for kind in [JobKind::InstallKey, JobKind::Transfer, JobKind::RevokeKey] {
        let playbook = runner.playbook(kind);
        let ok = playbook.is_file();
        let detail = if ok {
            playbook.display().to_string()
        } else {
            format!("missing {}", playbook.display())
        };
        out.push(Check::new(format!("playbook {}", kind.as_str()), ok, detail));
    }

    if let Some(identity) = &config.runner.bootstrap_identity {
        let ok = identity.is_file();
        out.push(Check::new(
            "bootstrap identity",
            ok,
            if ok {
                identity.display().to_string()
            } else {
                format!("missing {}", identity.display())
            },
        ));
    }

    if config.server.token.is_none() {
        out.push(Check::new(
            "operator token",
            false,
            "server.token unset; session creation is unauthenticated",
        ));
    }

    out
}

pub async fn run_doctor(config: &Config) -> anyhow::Result<()> {
    println!("handoff v{}", env!("CARGO_PKG_VERSION"));
    println!();

    let config_path = paths::config_file_path();
    if config_path.exists() {
        println!("  Config:     {} (loaded)", config_path.display());
    } else {
        println!("  Config:     (using defaults)");
    }
    println!("  Work dir:   {}", config.runner.work_dir().display());
    println!();

    let results = checks(config);
    for check in &results {
        let mark = if check.ok { "ok" } else { "!!" };
        println!("  [{mark}] {:<22} {}", check.name, check.detail);
    }

    println!();
    verdict(&results)?;
    println!("  All checks passed.");
    Ok(())
}

/// Fails when any check did, so scripts can gate on the exit status.
fn verdict(results: &[Check]) -> anyhow::Result<()> {
    let failed = results.iter().filter(|c| !c.ok).count();
    if failed > 0 {
        anyhow::bail!("{failed} check(s) need attention");
    }
    Ok(())
}
