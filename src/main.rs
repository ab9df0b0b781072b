use std::ffi::OsString;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use log::LevelFilter;

use lazyload::{debug, image, loader, logger, rt};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Off => LevelFilter::Off,
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
        }
    }
}

/// Run a static executable, mapping its pages only when they are first touched.
///
/// Only statically linked, non-PIE executables without PT_GNU_RELRO are
/// accepted; build them with `-static -no-pie -Wl,-z,norelro`.
#[derive(Debug, Parser)]
#[command(name = "lazyload", version)]
struct Cli {
    #[arg(long, value_enum, env = "LAZYLOAD_LOG", default_value_t = LogLevel::Warn)]
    log_level: LogLevel,

    /// Print the parsed segment table and exit without running the program.
    #[arg(long)]
    dump_segments: bool,

    program: PathBuf,

    /// Arguments passed through to the program.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<OsString>,
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = logger::init(cli.log_level.into()) {
        eprintln!("lazyload: logger init failed: {e}");
    }

    if cli.dump_segments {
        match image::parse(&cli.program) {
            Ok(image) => debug::print_segment_table(&image),
            Err(err) => rt::fatal(err.to_string()),
        }
        return;
    }

    let mut argv = Vec::with_capacity(cli.args.len() + 1);
    argv.push(cli.program.clone().into_os_string());
    argv.extend(cli.args);

    match loader::execute(&cli.program, &argv) {
        Ok(never) => match never {},
        Err(err) => rt::fatal(err.to_string()),
    }
}
