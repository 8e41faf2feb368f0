//! sandpreview CLI
//!
//! Command-line interface for laying out, previewing and diagnosing generated projects.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use console::style;
use sandpreview::classify::classify_message;
use sandpreview::config::{
    config_path, load_config, save_config, validate_config, Config, RuntimeBackend,
};
use sandpreview::isolation::{hosting_headers, PreviewFrame};
use sandpreview::session::{Phase, PreviewPanel};
use sandpreview::vfs::{build_with, GeneratedFileSet, MountNode};
use sandpreview::{Previewer, VERSION};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(
    name = "sandpreview",
    version = VERSION,
    about = "sandpreview - live previews of generated web projects",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Lay out a generated file set and show the resulting project tree
    Build {
        /// JSON file with the generated files
        files: PathBuf,
        /// Write the project into this directory
        #[arg(long, short)]
        out: Option<PathBuf>,
    },

    /// Run a preview and keep it up until Ctrl+C
    Serve {
        /// JSON file with the generated files
        files: PathBuf,
        /// Sandbox backend (local or container)
        #[arg(long, short)]
        backend: Option<RuntimeBackend>,
        /// Preview port
        #[arg(long, short)]
        port: Option<u16>,
        /// How long to wait for the server, e.g. "90s"; "0s" waits forever
        #[arg(long, value_parser = humantime_serde::re::humantime::parse_duration)]
        timeout: Option<Duration>,
        /// Print the frame markup for the preview
        #[arg(long)]
        frame: bool,
    },

    /// Classify an error message and show remediation steps
    Classify {
        /// Raw error text
        #[arg(required = true)]
        message: Vec<String>,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the headers the hosting page must send
    Headers,

    /// Write a configuration file with default values
    InitConfig {
        /// Destination; defaults to the standard config path
        #[arg(long)]
        path: Option<PathBuf>,
        /// Overwrite an existing file
        #[arg(long, short)]
        force: bool,
    },

    /// Validate the current configuration
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("sandpreview=info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Build { files, out } => build_project(&files, out.as_deref()).await,
        Commands::Serve {
            files,
            backend,
            port,
            timeout,
            frame,
        } => serve(&files, backend, port, timeout, frame).await,
        Commands::Classify { message, json } => classify(&message.join(" "), json),
        Commands::Headers => print_headers(),
        Commands::InitConfig { path, force } => init_config(path, force),
        Commands::CheckConfig => check_config(),
    }
}

async fn load_files(path: &Path) -> anyhow::Result<GeneratedFileSet> {
    let files = GeneratedFileSet::load(path)
        .await
        .with_context(|| format!("Failed to load generated files from {}", path.display()))?;
    Ok(files)
}

/// Lay out the files and print or write the tree
async fn build_project(path: &Path, out: Option<&Path>) -> anyhow::Result<()> {
    let config = load_config()?;
    let files = load_files(path).await?;
    let tree = build_with(&files, &config.build_options());

    let skipped = files.len() - files.completed().count();
    println!(
        "{} {} files, {} skipped",
        style("Project:").bold(),
        files.completed().count(),
        skipped
    );
    for (file, contents) in tree.files() {
        println!("  {:<40} {:>8} bytes", file, contents.len());
    }

    if let Some(out) = out {
        write_tree(&tree, out)?;
        println!("\n{} {}", style("✓ Written to").green(), out.display());
    }
    Ok(())
}

fn write_tree(tree: &MountNode, root: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(root)?;
    for dir in tree.directories() {
        std::fs::create_dir_all(root.join(dir))?;
    }
    for (file, contents) in tree.files() {
        let target = root.join(&file);
        std::fs::write(&target, contents)
            .with_context(|| format!("Failed to write {}", target.display()))?;
    }
    Ok(())
}

/// Run a preview until Ctrl+C
async fn serve(
    path: &Path,
    backend: Option<RuntimeBackend>,
    port: Option<u16>,
    timeout: Option<Duration>,
    frame: bool,
) -> anyhow::Result<()> {
    let mut config = load_config()?;
    if let Some(backend) = backend {
        config.runtime.backend = backend;
    }
    if let Some(port) = port {
        config.pipeline.port = port;
    }
    if let Some(timeout) = timeout {
        config.pipeline.ready_timeout = timeout;
    }

    let validation = validate_config(&config);
    for warning in &validation.warnings {
        println!("{} {}", style("!").yellow(), warning);
    }
    if !validation.valid {
        for issue in &validation.errors {
            println!("{} {}", style("✗").red(), issue);
        }
        bail!("Configuration is invalid");
    }

    let files = load_files(path).await?;
    let previewer = Previewer::from_config(&config)?;

    let mut logs = previewer.logs();
    tokio::spawn(async move {
        loop {
            match logs.recv().await {
                Ok(line) => println!("{} {}", style(format!("[{}]", line.source)).dim(), line.line),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    println!("{}", style(format!("... {} lines skipped", n)).dim())
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let mut sessions = previewer.subscribe();
    tokio::spawn(async move {
        while sessions.changed().await.is_ok() {
            let session = sessions.borrow_and_update().clone();
            if let PreviewPanel::Spinner { detail } = PreviewPanel::for_session(&session, true) {
                println!("{} {}", style("…").cyan(), detail);
            }
        }
    });

    let session = previewer.start_preview(&files).await;
    match (session.phase, &session.url, &session.error) {
        (Phase::Ready, Some(url), _) => {
            println!("\n{} {}", style("✓ Preview ready:").green().bold(), style(url).cyan());
            if frame {
                println!("\n{}", PreviewFrame::new(url.as_str()).to_html());
            }
            println!("{}", style("Press Ctrl+C to stop").dim());

            // Resolves on Ctrl+C or SIGTERM, after the sandbox is released.
            previewer.manager().spawn_unload_watcher().await?;
            info!("Stopping preview");
            previewer.shutdown().await;
            Ok(())
        }
        (_, _, Some(error)) => {
            println!("\n{} {}", style("✗").red(), error.user_message());
            previewer.shutdown().await;
            bail!("Preview failed ({})", error.category)
        }
        _ => {
            previewer.shutdown().await;
            bail!("Preview ended in unexpected state {:?}", session.phase)
        }
    }
}

fn classify(message: &str, json: bool) -> anyhow::Result<()> {
    let classified = classify_message(message);
    if json {
        println!("{}", serde_json::to_string_pretty(&classified)?);
    } else {
        println!("{} {}", style("Category:").bold(), classified.category);
        println!("{}", classified.user_message());
    }
    Ok(())
}

fn print_headers() -> anyhow::Result<()> {
    println!("{}", style("Hosting page response headers:").bold());
    for (name, value) in hosting_headers() {
        println!("  {}: {}", name, value);
    }
    println!("\n{}", style("Preview frame:").bold());
    println!("  {}", PreviewFrame::new("<preview url>").to_html());
    Ok(())
}

fn init_config(path: Option<PathBuf>, force: bool) -> anyhow::Result<()> {
    let path = path.unwrap_or_else(config_path);
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }

    save_config(&Config::default(), &path)?;
    println!("{} {}", style("✓ Wrote").green(), path.display());
    Ok(())
}

fn check_config() -> anyhow::Result<()> {
    let config = load_config()?;
    let result = validate_config(&config);

    println!("{} {}", style("Config file:").bold(), config_path().display());
    println!("  Backend: {}", style(config.runtime.backend).cyan());
    println!("  Install: {}", config.pipeline.install_command.join(" "));
    println!("  Start:   {}", config.pipeline.start_command.join(" "));
    println!("  Port:    {}", config.pipeline.port);

    for issue in &result.errors {
        println!("{} {}", style("✗").red(), issue);
    }
    for issue in &result.warnings {
        println!("{} {}", style("!").yellow(), issue);
    }

    if result.valid {
        println!("{}", style("✓ Configuration is valid").green());
        Ok(())
    } else {
        bail!("Configuration has {} error(s)", result.errors.len())
    }
}
