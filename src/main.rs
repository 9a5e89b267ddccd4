use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use blockjit::jit::{CompilerContext, JitOptions, OptLevel};
use blockjit::script::{ScriptFile, host_functions};

#[derive(Parser, Debug)]
#[command(name = "blockjit", version)]
#[command(about = "JIT-compile and run block scripts")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compile a JSON script and run it tick by tick
    Run {
        /// Path to the script file
        script: PathBuf,

        /// Give up after this many ticks
        #[arg(long)]
        ticks: Option<u64>,

        /// Run the top-level script without yielding between loop iterations
        #[arg(long)]
        warp: bool,

        #[arg(long, value_enum, default_value_t = Opt::Speed)]
        opt_level: Opt,

        /// Verify generated code
        #[arg(long)]
        verify: bool,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Opt {
    None,
    Speed,
}

impl From<Opt> for OptLevel {
    fn from(opt: Opt) -> Self {
        match opt {
            Opt::None => OptLevel::None,
            Opt::Speed => OptLevel::Speed,
        }
    }
}

fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let Cli { command: Command::Run { script, ticks, warp, opt_level, verify } } = Cli::parse();

    let file = match ScriptFile::load(&script) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    };

    let options = JitOptions { opt_level: opt_level.into(), verify };
    let ctx = CompilerContext::new(&host_functions(), &options);
    let program = match file.compile(&ctx, warp) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    };
    if !program.is_functional() {
        error!(script = %script.display(), "compilation failed");
        eprintln!("error: {} failed to compile", script.display());
        std::process::exit(1);
    }

    let mut exec = program.start();
    match program.run_ticks(&mut exec, ticks) {
        Some(n) => eprintln!("finished after {n} ticks"),
        None => {
            eprintln!("still running after {} ticks", ticks.unwrap_or_default());
            std::process::exit(2);
        }
    }
}
