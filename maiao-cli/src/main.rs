use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::level_filters::LevelFilter;

use maiao_core::hook;
use maiao_core::rebase::{apply_prepared_todo, REBASE_ARGS_ENV};
use maiao_core::{review, Environment, GitRepository, Repository, ReviewOptions};

/// Submit the local stack of commits for review as chained pull requests,
/// one per change, identified by the Change-Id trailer in commit messages.
#[derive(Parser, Debug)]
#[command(name = "maiao", version, about)]
struct Cli {
    /// Target base branch; defaults to the remote's default branch
    branch: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,

    /// Remote the review should be done on. By default the tracking remote
    /// of the target branch is used
    #[arg(long, global = true)]
    remote: Option<String>,

    /// Don't rebase changes before submitting
    #[arg(short = 'R', long = "no-rebase", global = true)]
    no_rebase: bool,

    /// Topic to submit the branch to
    #[arg(short, long, global = true)]
    topic: Option<String>,

    /// Path of the repository to push reviews from
    #[arg(short = 'C', long = "path", default_value = ".", global = true)]
    path: PathBuf,

    /// Logging verbosity (0-5)
    #[arg(short, long, default_value_t = 0, global = true)]
    verbose: u8,

    /// Mark draft pull requests as ready for review
    #[arg(long, global = true)]
    ready: bool,

    /// Open new pull requests as drafts
    #[arg(long, global = true)]
    draft: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Install the commit message hook into the repository
    Install,
    /// Print the version
    Version,
    /// Replace git's rebase instruction file with a prepared one. Invoked by
    /// git as its editor during the review rebase; selects rewords so the
    /// commit-msg hook can inject missing Change-Ids, and leaves every other
    /// edited file untouched
    #[command(name = "add-change-id-editor", hide = true)]
    AddChangeIdEditor {
        /// Prepared instruction file
        prepared: PathBuf,
        /// Files git asked to edit; only a trailing git-rebase-todo is replaced
        #[arg(num_args = 1.., required = true)]
        files: Vec<PathBuf>,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // The exec step at the end of the review rebase re-invokes this program
    // with the original arguments stashed in the environment. The variable is
    // cleared before anything else so a failure cannot re-trigger the resume.
    if cli.command.is_none() {
        if let Ok(stashed) = std::env::var(REBASE_ARGS_ENV) {
            std::env::remove_var(REBASE_ARGS_ENV);
            let args: Vec<String> =
                serde_json::from_str(&stashed).context("Failed to decode stashed rebase arguments")?;
            let argv = std::iter::once("maiao".to_string()).chain(args);
            return run(Cli::parse_from(argv)).await;
        }
    }
    run(cli).await
}

async fn run(cli: Cli) -> Result<()> {
    init_logging(cli.verbose)?;

    match cli.command {
        Some(Commands::AddChangeIdEditor { prepared, files }) => {
            if let Some(target) = files.last() {
                apply_prepared_todo(&prepared, target);
            }
            Ok(())
        }
        Some(Commands::Install) => {
            let repo = GitRepository::discover(&cli.path)?;
            hook::install(&repo.git_dir()?).await
        }
        Some(Commands::Version) => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        None => run_review(cli).await,
    }
}

async fn run_review(cli: Cli) -> Result<()> {
    let repo = GitRepository::discover(&cli.path)?;
    let git_dir = repo.git_dir()?;
    if !hook::installed(&git_dir) {
        if prompt_yes_no("commit message hook is missing, do you want to install it automatically?")?
        {
            hook::install(&git_dir).await?;
        } else {
            println!(
                "You are missing change ids in your commits.\n\
                 Please install the commit hook by running\n\
                 `curl -o .git/hooks/commit-msg {} && chmod +x .git/hooks/commit-msg`",
                hook::COMMIT_MSG_HOOK_URL
            );
            return Ok(());
        }
    }

    let options = ReviewOptions {
        remote: cli.remote.filter(|remote| !remote.is_empty()),
        branch: cli.branch.filter(|branch| !branch.is_empty()),
        skip_rebase: cli.no_rebase,
        topic: cli.topic.filter(|topic| !topic.is_empty()),
        ready: cli.ready,
        wip: cli.draft,
    };
    review(&repo, &Environment::default(), &options).await
}

fn init_logging(verbosity: u8) -> Result<()> {
    let level = match verbosity {
        0 => LevelFilter::OFF,
        1 => LevelFilter::ERROR,
        2 => LevelFilter::WARN,
        3 => LevelFilter::INFO,
        4 => LevelFilter::DEBUG,
        5 => LevelFilter::TRACE,
        other => bail!("unexpected log level {other}, expecting 0-5"),
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(io::stderr)
        .init();
    Ok(())
}

fn prompt_yes_no(question: &str) -> Result<bool> {
    let stdin = io::stdin();
    loop {
        print!("{question} [y/n]: ");
        io::stdout().flush().context("failed to flush stdout")?;
        let mut answer = String::new();
        let read = stdin
            .lock()
            .read_line(&mut answer)
            .context("failed to read answer")?;
        if read == 0 {
            // No terminal to ask; treat as a refusal.
            return Ok(false);
        }
        match answer.trim().to_ascii_lowercase().as_str() {
            "y" | "yes" => return Ok(true),
            "n" | "no" => return Ok(false),
            _ => {}
        }
    }
}
