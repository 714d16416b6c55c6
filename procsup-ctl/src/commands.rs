use console::style;
use log::info;
use procsup::resolve::{search_dirs, which_all};
use procsup::{BackendCapabilities, SupervisorConfig};
use std::ffi::{OsStr, OsString};
use std::path::PathBuf;

fn mark(ok: bool) -> String {
    if ok {
        format!("{}", style("[✓]").green())
    } else {
        format!("{}", style("[✗]").red())
    }
}

pub fn check_backend() {
    info!("Checking spawn backend");
    let caps = BackendCapabilities::current();
    println!("Spawn backend: {}\n", style(caps.name).bold());

    println!("{} Identity switching (uid/gid)", mark(caps.identity_switch));
    println!("{} Pseudo-terminals", mark(caps.pty));
    println!("{} Child descriptors beyond stdio", mark(caps.extra_child_fds));
    println!("{} Descriptor pass-through", mark(caps.pass_through));
    println!("{} Named signals besides TERM/KILL", mark(caps.named_signals));

    #[cfg(unix)]
    {
        use procsup_core::util;

        println!("\nSystem info:");
        println!("  UID: {} (effective {})", util::get_uid(), util::get_euid());
        println!("  GID: {} (effective {})", util::get_gid(), util::get_egid());
        if util::started_elevated() {
            println!("  Started as root: children may switch to any uid/gid");
        }
    }
}

/// Directories searched for `name`, from `PATH` or the built-in default
fn lookup_dirs() -> Vec<PathBuf> {
    let path = std::env::var_os("PATH")
        .unwrap_or_else(|| OsString::from(SupervisorConfig::default().default_path));
    search_dirs(&path)
}

/// Print matches for `name`; returns false when there are none
pub fn which(name: &str, all: bool) -> bool {
    let matches = which_all(OsStr::new(name), &lookup_dirs());
    if matches.is_empty() {
        eprintln!("{} {} not found", style("error:").red().bold(), name);
        return false;
    }
    let shown = if all { matches.len() } else { 1 };
    for path in matches.iter().take(shown) {
        println!("{}", path.display());
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_backend_runs() {
        check_backend();
    }

    #[cfg(unix)]
    #[test]
    fn which_reports_missing_names() {
        assert!(!which("surely-no-such-program-exists", false));
    }
}
