use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use verdict::config::Config;
use verdict::runner::TestRunRequest;
use verdict::session::CaptureSessions;

#[derive(Parser, Debug)]
#[command(
    name = "verdict",
    about = "Run a test command and produce a trustworthy diagnostic report",
    version
)]
struct Args {
    /// Target label for the run (concurrency key, used in the report)
    #[arg(short, long, default_value = "default")]
    target: String,

    /// Working directory for the test process (defaults to current directory)
    #[arg(short = 'C', long, default_value = ".")]
    dir: PathBuf,

    /// Time limit in seconds (overrides the configured default)
    #[arg(long)]
    timeout: Option<u64>,

    /// Print the structured result as JSON instead of the text report
    #[arg(long)]
    json: bool,

    /// Test command and its arguments
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = Config::load();

    let timeout = args.timeout.unwrap_or(config.default_timeout_secs);
    let (program, rest) = args
        .command
        .split_first()
        .context("no test command given")?;
    let request = TestRunRequest::new(args.target.as_str(), program.as_str(), &args.dir)
        .args(rest.iter().cloned())
        .timeout(Duration::from_secs(timeout));

    let sessions = Arc::new(CaptureSessions::new(&config));
    let id = sessions.begin(request).await;

    // Light progress feedback on stderr while the run is in flight.
    let ticker = {
        let sessions = sessions.clone();
        tokio::spawn(async move {
            let mut last = None;
            loop {
                tokio::time::sleep(Duration::from_millis(500)).await;
                match sessions.progress(id).await {
                    Some(progress) if Some(progress) != last => {
                        eprintln!(
                            "  {} tests seen, {} files",
                            progress.tests_seen, progress.files_seen
                        );
                        last = Some(progress);
                    }
                    Some(_) => {}
                    None => break,
                }
            }
        })
    };

    let outcome = match sessions.end(id).await {
        Ok(outcome) => outcome,
        Err(err) => {
            ticker.abort();
            eprintln!("Error: {:#}", err);
            std::process::exit(2);
        }
    };
    ticker.abort();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&outcome.result)?);
    } else {
        print!("{}", outcome.report.to_text());
    }

    if !outcome.result.success {
        std::process::exit(1);
    }
    Ok(())
}
