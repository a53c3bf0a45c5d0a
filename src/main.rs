//! appdivert daemon
//!
//! Starts one split-tunnel session from command-line arguments and runs it
//! until the operator stops it. All presentation beyond a stats line on
//! shutdown is left to embedders of the library.

#[cfg(windows)]
fn main() -> anyhow::Result<()> {
    windows_main::run()
}

#[cfg(not(windows))]
fn main() {
    eprintln!("appdivert only runs on Windows.");
    std::process::exit(1);
}

#[cfg(windows)]
mod windows_main {
    use std::collections::HashSet;
    use std::time::Duration;

    use anyhow::{bail, Context};
    use log::info;

    use appdivert::engine::policy::Mode;
    use appdivert::engine::session::SplitSession;

    pub fn run() -> anyhow::Result<()> {
        init_logging();

        let options = Options::parse(std::env::args().skip(1))?;

        info!("Starting appdivert v{}", env!("CARGO_PKG_VERSION"));

        if !appdivert::is_administrator() {
            bail!("appdivert requires an elevated (Administrator) console");
        }

        let mut session = SplitSession::start(options.mode, options.targets)
            .context("failed to start split session")?;

        let adapters = session.adapters();
        println!(
            "Session running (mode {:?}): vpn '{}' {} / physical '{}' {} via {}",
            session.mode(),
            adapters.vpn.name,
            adapters.vpn.ip,
            adapters.physical.name,
            adapters.physical.ip,
            adapters.gateway,
        );
        println!("Press Enter to stop.");

        // Stdin read happens on its own thread so a worker fault can still
        // shut the daemon down.
        let (stdin_tx, stdin_rx) = crossbeam_channel::bounded::<()>(1);
        std::thread::spawn(move || {
            let mut line = String::new();
            let _ = std::io::stdin().read_line(&mut line);
            let _ = stdin_tx.send(());
        });

        loop {
            if let Some(fault) = session.fault() {
                session.stop();
                bail!("session fault: {fault}");
            }
            if stdin_rx.recv_timeout(Duration::from_millis(500)).is_ok() {
                break;
            }
        }

        let stats = session.stats();
        session.stop();

        info!(
            "Final stats: {} bytes out, {} bytes in, {} active flows, {} NAT entries, {} discarded",
            stats.bytes_out,
            stats.bytes_in,
            stats.flows_active,
            stats.nat_entries,
            stats.packets_discarded
        );

        Ok(())
    }

    struct Options {
        mode: Mode,
        targets: HashSet<String>,
    }

    impl Options {
        fn parse(mut args: impl Iterator<Item = String>) -> anyhow::Result<Options> {
            let mut mode = Mode::Exclude;
            let mut targets = HashSet::new();

            while let Some(arg) = args.next() {
                match arg.as_str() {
                    "--mode" => {
                        let value = args.next().context("--mode requires a value")?;
                        mode = match value.as_str() {
                            "exclude" => Mode::Exclude,
                            "include" => Mode::Include,
                            other => bail!("unknown mode '{other}' (expected exclude|include)"),
                        };
                    }
                    "--app" => {
                        let value = args.next().context("--app requires a path")?;
                        targets.insert(value);
                    }
                    "--help" | "-h" => {
                        print_usage();
                        std::process::exit(0);
                    }
                    other => bail!("unknown argument '{other}' (try --help)"),
                }
            }

            Ok(Options { mode, targets })
        }
    }

    fn print_usage() {
        println!("Usage: appdivert [--mode exclude|include] [--app <exe path>]...");
        println!();
        println!("  --mode exclude   VPN by default; listed apps use the physical adapter");
        println!("  --mode include   physical by default; listed apps use the VPN");
        println!("  --app <path>     full path of an executable to toggle (repeatable)");
    }

    /// Log to a file next to the executable so elevated release runs can be
    /// debugged; fall back to stderr.
    fn init_logging() {
        let level = std::env::var("RUST_LOG")
            .map(|_| log::LevelFilter::Debug)
            .unwrap_or(log::LevelFilter::Info);

        let log_path = std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(|d| d.join("appdivert.log")));

        let file = log_path.and_then(|path| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .ok()
        });

        match file {
            Some(file) => {
                env_logger::Builder::from_default_env()
                    .filter_level(level)
                    .format_timestamp_millis()
                    .target(env_logger::Target::Pipe(Box::new(file)))
                    .init();
            }
            None => {
                env_logger::Builder::from_default_env()
                    .filter_level(level)
                    .format_timestamp_millis()
                    .init();
            }
        }
    }
}
