use clap::{ArgAction, Parser};
use nix::unistd::{access, AccessFlags};
use std::{
    env,
    ffi::OsString,
    path::{Path, PathBuf},
    process::ExitCode,
};
use tracing_subscriber::EnvFilter;

use filetrace_rs::{
    diag::{Context, Error, Result},
    engine::FileTracer,
    input,
    path::Scope,
    report::{self, Format},
    trace,
};

#[derive(Parser, Debug)]
#[command(name = "filetrace-rs")]
#[command(version)]
#[command(
    about = "Record the files a command and all of its processes and threads open",
    long_about = None
)]
struct Cli {
    /// Report file
    #[arg(
        short = 'o',
        long = "output",
        visible_alias = "output-html",
        value_name = "FILE",
        default_value = "filetrace_output.html"
    )]
    output: PathBuf,

    /// Record files outside the base directory too
    #[arg(short = 'a', long = "all")]
    all: bool,

    /// Base directory; only files under it are recorded (default: current
    /// directory)
    #[arg(short = 'd', long = "directory", value_name = "DIR")]
    directory: Option<PathBuf>,

    /// Report format
    #[arg(long = "format", value_enum, default_value_t = Format::Html)]
    format: Format,

    /// Increase log verbosity (-v, -vv, -vvv); RUST_LOG takes precedence
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbose: u8,

    /// Command to trace, with its arguments
    #[arg(
        value_name = "COMMAND",
        required = true,
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    command: Vec<OsString>,
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn output_file(output: &Path) -> Result<PathBuf> {
    let parent = match output.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    if !parent.is_dir() {
        return Err(Error::from(format!(
            "output directory {} does not exist",
            parent.display()
        )));
    }
    access(parent, AccessFlags::W_OK)
        .context(format!("output directory {} is not writable", parent.display()))?;
    Ok(output.to_path_buf())
}

fn base_directory(directory: Option<&Path>) -> Result<PathBuf> {
    let directory = match directory {
        Some(directory) => directory.to_path_buf(),
        None => env::current_dir().context("current directory")?,
    };
    let directory = directory
        .canonicalize()
        .context(format!("base directory {}", directory.display()))?;
    if !directory.is_dir() {
        return Err(Error::from(format!(
            "{} is not a directory",
            directory.display()
        )));
    }
    Ok(directory)
}

fn command_line(command: &[OsString]) -> String {
    command
        .iter()
        .map(|arg| arg.to_string_lossy())
        .collect::<Vec<_>>()
        .join(" ")
}

fn run(cli: &Cli) -> Result<i32> {
    let output = output_file(&cli.output)?;
    let base_dir = base_directory(cli.directory.as_deref())?;
    let scope = if cli.all {
        Scope::within(base_dir).unfiltered()
    } else {
        Scope::within(base_dir)
    };
    let args = input::args(&cli.command)?;
    let env = input::env()?;

    let mut tracer = FileTracer::new(scope);
    let code = trace::run(&mut tracer, &args, &env)?;
    let session = tracer
        .into_session()
        .ok_or_else(|| Error::from("no session recorded"))?;

    let label = command_line(&cli.command);
    report::write(&session, &label, &output, cli.format)?;
    eprintln!(
        "{} file operations recorded, report written to {}",
        session.log().len(),
        output.display()
    );
    if let Some(fatal) = session.fatal() {
        eprintln!("Error: tracing aborted: {fatal}");
    }

    Ok(code)
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) if !err.use_stderr() => err.exit(),
        Err(err) => {
            let _ = err.print();
            return ExitCode::FAILURE;
        }
    };
    init_tracing(cli.verbose);

    match run(&cli) {
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        Err(err) => {
            eprintln!("Error: {err:?}");
            ExitCode::FAILURE
        }
    }
}
