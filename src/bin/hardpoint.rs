use anyhow::{Context as _, anyhow};
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use console::style;
use hardpoint::agent::Agent;
use hardpoint::refs::CommitRef;
use hardpoint::{Config, Engine, Environment, SymbolEngine};

#[derive(Parser, Debug)]
#[clap(version, about)]
struct Args {
    /// Engine settings, as a JSON file.
    #[clap(long, global = true)]
    config: Option<Utf8PathBuf>,

    /// Print a waterfall chart of the producers that ran.
    #[clap(long, global = true)]
    diagnostics: bool,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resolve commit symbols in the working copy.
    Commit {
        #[clap(required = true)]
        symbols: Vec<String>,
    },
    /// Serve command execution over stdin and stdout.
    Agent,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging();

    match args.command {
        Command::Commit { symbols } => commit(args.config.as_ref(), args.diagnostics, &symbols),
        Command::Agent => agent(),
    }
}

fn init_logging() {
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&Utf8PathBuf>) -> anyhow::Result<Config> {
    let Some(path) = path else {
        return Ok(Config::default());
    };
    let text = std::fs::read_to_string(path).with_context(|| format!("Failed to read {path}"))?;
    Config::from_json(&text).with_context(|| format!("Failed to parse {path}"))
}

fn commit(config: Option<&Utf8PathBuf>, diagnostics: bool, symbols: &[String]) -> anyhow::Result<()> {
    let config = load_config(config)?;

    let cwd = std::env::current_dir()?;
    let cwd = Utf8PathBuf::try_from(cwd)?;
    let repository = hardpoint::repository::discover(&cwd)
        .ok_or_else(|| anyhow!("No working copy found at {cwd}"))?;

    let env = Environment::new(config).with_repository(repository);
    let mut engine = Engine::builder(env)
        .producers(hardpoint::query::producers())
        .build()?;

    let map = SymbolEngine::new(&mut engine).load_commits_for_symbols(symbols)?;

    let width = symbols.iter().map(String::len).max().unwrap_or(0);
    for symbol in symbols {
        let commit = map
            .get(symbol)
            .copied()
            .flatten()
            .and_then(|id| engine.get::<CommitRef>(id));

        match commit {
            Some(commit) => println!("{symbol:width$}  {}", style(commit.hash()).yellow()),
            None => println!("{symbol:width$}  {}", style("(unresolved)").dim()),
        }
    }

    if diagnostics {
        let report = engine.diagnostics();
        eprint!("{}", report.render_waterfall());
        eprintln!("{report}");
    }

    Ok(())
}

fn agent() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(Agent::new(tokio::io::stdin(), tokio::io::stdout()).run())?;
    Ok(())
}
