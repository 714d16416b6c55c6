use console::style;
use env_logger::{Builder, Env};
use log::Level;
use std::io::Write;

/// Install the styled logger; `RUST_LOG` overrides the verbosity flag
pub fn init_logger(verbose: bool) {
    let env = Env::default().filter_or("RUST_LOG", default_filter(verbose));

    Builder::from_env(env)
        .format(|buf, record| {
            let level = match record.level() {
                Level::Error => format!("{}", style("ERROR").red().bold()),
                Level::Warn => format!("{}", style("WARN ").yellow().bold()),
                Level::Info => format!("{}", style("INFO ").green()),
                Level::Debug => format!("{}", style("DEBUG").cyan()),
                Level::Trace => format!("{}", style("TRACE").dim()),
            };
            writeln!(
                buf,
                "{} {} {}",
                level,
                style(record.target()).dim(),
                record.args()
            )
        })
        .init();
}

fn default_filter(verbose: bool) -> &'static str {
    if verbose { "debug" } else { "warn" }
}
