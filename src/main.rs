use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use self_iterate::command::{Command, CommandContext};
use self_iterate::config::Config;
use self_iterate::diff::DiffGenerator;
use self_iterate::policy::AdminPolicy;
use self_iterate::service::PipelineHandle;
use self_iterate::session::Pipeline;
use self_iterate::verify::SyntaxVerifier;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "self-iterate",
    about = "Stage, review and apply changes to a source tree with backups",
    version
)]
struct Cli {
    /// Project root that targets are relative to
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    /// Config file (defaults to ~/.config/self-iterate/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Identity used for admin checks and iteration ownership
    #[arg(long, global = true, default_value = "operator")]
    identity: String,

    /// Log filter, e.g. "info" or "self_iterate=debug"
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Interactive command loop over stdin
    Shell,
    /// Iteration status, staged files and backup count
    Status {
        /// Emit the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Check a file without staging it
    Verify { file: PathBuf },
    /// Unified diff between two files
    Diff { original: PathBuf, modified: PathBuf },
    /// List backups, newest first
    Backups,
    /// Restore a backup by id or unique id prefix
    Rollback { id: String },
    /// List staged files
    Staged,
    /// Remove every staged file
    ClearStaged,
    /// Evict backups beyond the configured bound
    CleanupBackups,
    /// Show the effective configuration and where it is read from
    Config {
        /// Write the defaults to the config file if it does not exist yet
        #[arg(long)]
        init: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let config = Config::load(cli.config.as_deref());

    match cli.command {
        Commands::Verify { ref file } => run_verify(file),
        Commands::Diff {
            ref original,
            ref modified,
        } => run_diff(original, modified, &config),
        Commands::Config { init } => run_config(cli.config.as_deref(), &config, init),
        Commands::Shell => run_shell(&cli, config).await,
        Commands::Status { json } => {
            if !json {
                return run_command(&cli, config, Command::Status).await;
            }
            let handle = open_pipeline(&cli.root, config)?;
            let status = handle.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Commands::Backups => run_command(&cli, config, Command::Backups).await,
        Commands::Rollback { ref id } => {
            run_command(&cli, config, Command::Rollback { id: Some(id.clone()) }).await
        }
        Commands::ClearStaged => run_command(&cli, config, Command::Clear).await,
        Commands::Staged => {
            let handle = open_pipeline(&cli.root, config)?;
            let status = handle.status().await?;
            if status.staged.is_empty() {
                println!("No staged files.");
            }
            for entry in status.staged {
                println!(
                    "{}  {} byte(s)  {}",
                    entry.target,
                    entry.size,
                    entry.staged_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
            Ok(())
        }
        Commands::CleanupBackups => {
            let handle = open_pipeline(&cli.root, config)?;
            let removed = handle.run(|p| p.cleanup_backups()).await?;
            println!("Removed {} backup(s).", removed);
            Ok(())
        }
    }
}

fn open_pipeline(root: &Path, config: Config) -> Result<PipelineHandle> {
    let pipeline = Pipeline::open(root, config)
        .with_context(|| format!("Failed to open pipeline at {}", root.display()))?;
    Ok(PipelineHandle::new(pipeline))
}

fn context_for(cli: &Cli, config: &Config) -> CommandContext {
    CommandContext::new(
        &cli.identity,
        AdminPolicy::new(&config.security.admins),
        config.iteration.diff_max_lines,
    )
}

async fn run_command(cli: &Cli, config: Config, command: Command) -> Result<()> {
    let ctx = context_for(cli, &config);
    let handle = open_pipeline(&cli.root, config)?;
    let output = handle.run(move |p| Ok(ctx.execute(p, command))).await?;
    println!("{}", output);
    Ok(())
}

async fn run_shell(cli: &Cli, config: Config) -> Result<()> {
    let ctx = context_for(cli, &config);
    let handle = open_pipeline(&cli.root, config)?;
    println!("self-iterate shell. Type `help` for commands, `exit` to quit.");

    loop {
        print!("self-iterate> ");
        std::io::stdout().flush().ok();

        let line = tokio::task::spawn_blocking(|| {
            let mut line = String::new();
            std::io::stdin().read_line(&mut line).map(|read| (read, line))
        })
        .await
        .map_err(|e| anyhow!("stdin reader failed: {}", e))?
        .context("Failed to read stdin")?;

        let (read, line) = line;
        let line = line.trim().to_string();
        if read == 0 || line == "exit" || line == "quit" {
            break;
        }
        if line.is_empty() {
            continue;
        }

        let ctx = ctx.clone();
        let output = handle.run(move |p| Ok(ctx.execute_line(p, &line))).await?;
        println!("{}", output);
    }
    Ok(())
}

fn run_config(explicit: Option<&Path>, config: &Config, init: bool) -> Result<()> {
    let location = match explicit {
        Some(path) => path.display().to_string(),
        None => Config::config_location(),
    };

    if init {
        let path = explicit
            .map(Path::to_path_buf)
            .or_else(Config::default_path)
            .ok_or_else(|| anyhow!("No config directory on this platform; pass --config"))?;
        if path.exists() {
            bail!("{} already exists; edit it or remove it first", path.display());
        }
        Config::default().save_to(&path).map_err(|e| anyhow!(e))?;
        println!("Wrote default config to {}", path.display());
        return Ok(());
    }

    println!("# {}", location);
    print!(
        "{}",
        toml::to_string_pretty(config).context("Failed to render config")?
    );
    Ok(())
}

fn run_verify(file: &Path) -> Result<()> {
    let report = SyntaxVerifier::new().verify_file(file);
    println!("{}", report.render());
    if !report.passed {
        bail!("{} failed verification", file.display());
    }
    Ok(())
}

fn run_diff(original: &Path, modified: &Path, config: &Config) -> Result<()> {
    let before = std::fs::read_to_string(original)
        .with_context(|| format!("Failed to read {}", original.display()))?;
    let after = std::fs::read_to_string(modified)
        .with_context(|| format!("Failed to read {}", modified.display()))?;

    let differ = DiffGenerator::new(config.iteration.diff_context_lines);
    let diff = differ.diff(
        &before,
        &after,
        &original.display().to_string(),
        &modified.display().to_string(),
    );
    if diff.is_empty() {
        println!("Files are identical.");
    } else {
        print!("{}", diff);
        println!("{}", differ.stats(&before, &after));
    }
    Ok(())
}
