use std::path::PathBuf;

use clap::{
    CommandFactory, Parser, Subcommand,
    builder::{
        Styles,
        styling::{AnsiColor, Effects},
    },
};
use clap_complete::{Shell, generate};
use tracing_subscriber::EnvFilter;

use fodcli::{
    Error, cli, config, error,
    fod::{Connection, ConnectionBuilder, parse_connection_string},
    types::ArtifactKind,
};

fn styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::White.on_default() | Effects::BOLD)
        .usage(AnsiColor::White.on_default() | Effects::BOLD)
        .literal(AnsiColor::BrightBlue.on_default())
        .placeholder(AnsiColor::BrightGreen.on_default())
}

#[derive(Parser, Debug, Clone)]
#[clap(
  version = env!("CARGO_PKG_VERSION"),
  name=env!("CARGO_PKG_NAME"),
  bin_name=env!("CARGO_PKG_NAME"),
  about=env!("CARGO_PKG_DESCRIPTION"),
  styles=styles(),
)]
struct Cli {
    /// FoD URL in the form http(s)://<user>:<password>@host:port/ (defaults to FOD_URL)
    #[clap(long, global = true)]
    url: Option<String>,

    /// Release to run the samples against, application:release or id (defaults to FOD_RELEASE)
    #[clap(long, global = true)]
    release: Option<String>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Query releases and demonstrate response caching
    Releases(ReleasesOptions),

    /// Process vulnerabilities of the release page by page
    Vulnerabilities(VulnerabilitiesOptions),

    /// Download the FPR of the release concurrently
    Download(DownloadOptions),

    /// Process recently completed scans
    Scans(ScansOptions),

    /// Get shell completions
    Completions(CompletionsOption),
}

#[derive(Parser, Debug, Clone)]
pub struct ReleasesOptions {
    /// Number of rounds of cached queries
    #[clap(long, default_value_t = 10)]
    rounds: usize,
}

#[derive(Parser, Debug, Clone)]
pub struct VulnerabilitiesOptions {
    /// Maximum number of vulnerabilities to process
    #[clap(long, default_value_t = 5)]
    max_results: usize,
}

#[derive(Parser, Debug, Clone)]
pub struct DownloadOptions {
    /// Number of downloads
    #[clap(long, default_value_t = 10)]
    count: usize,

    /// Number of downloads running at the same time
    #[clap(long, default_value_t = 10)]
    threads: usize,

    /// Scan type of the FPR (static, dynamic, mobile)
    #[clap(long, default_value = "static")]
    scan_type: ArtifactKind,

    /// Directory for the downloaded files (defaults to the temp directory)
    #[clap(long)]
    output_dir: Option<PathBuf>,

    /// Keep the downloaded files instead of deleting them afterwards
    #[clap(long)]
    keep: bool,
}

#[derive(Parser, Debug, Clone)]
pub struct ScansOptions {
    /// Only scans completed within this many days
    #[clap(long, default_value_t = 90)]
    days: i64,

    /// Maximum number of scans to process
    #[clap(long, default_value_t = 5)]
    max_results: usize,
}

#[derive(Parser, Debug, Clone)]
pub struct CompletionsOption {
    shell: Shell,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = config::load_env().await {
        error!("Cannot load environment. Err: {}", e);
    }

    let cli = Cli::parse();

    if let Command::Completions(opt) = &cli.command {
        let mut cmd = Cli::command();
        let name = cmd.get_name().to_string();
        generate(opt.shell, &mut cmd, name, &mut std::io::stdout());
        return;
    }

    let release = cli.release.clone().unwrap_or_else(config::fod_release);
    let builder = match connection_builder(cli.url.clone(), &release) {
        Ok(builder) => builder,
        Err(e) => error!("Invalid FoD settings. Error: {}", e),
    };
    // settings were checked above, so a configuration error here is the release lookup
    let conn = match builder.build().await {
        Ok(conn) => conn,
        Err(e @ Error::Configuration(_)) => error!(
            "Your FoD instance must have an application and release matching '{}'.\n Error: {}",
            release, e
        ),
        Err(e) => error!("Cannot connect to FoD. Error: {}", e),
    };

    let result = match cli.command {
        Command::Releases(opt) => cli::releases(&conn, &release, opt.rounds).await,
        Command::Vulnerabilities(opt) => cli::vulnerabilities(&conn, opt.max_results).await,
        Command::Download(opt) => {
            let output_dir = opt.output_dir.unwrap_or_else(std::env::temp_dir);
            cli::download(
                &conn,
                opt.scan_type,
                opt.count,
                opt.threads,
                &output_dir,
                opt.keep,
            )
            .await
        }
        Command::Scans(opt) => cli::scans(&conn, opt.days, opt.max_results).await,
        Command::Completions(_) => Ok(()),
    };

    if let Err(e) = result {
        error!("{}", e);
    }
}

/// Collects the connection settings, rejecting a malformed connection string
/// before anything goes over the wire.
fn connection_builder(url: Option<String>, release: &str) -> fodcli::Result<ConnectionBuilder> {
    let url = match url {
        Some(url) => url,
        None => config::fod_url()?,
    };
    parse_connection_string(&url)?;

    let mut builder: ConnectionBuilder = Connection::builder()
        .connection_string(url)
        .retry_policy(config::retry_policy()?)
        .page_size(config::page_size()?)
        .target_release(release);
    if let Some(timeout) = config::request_timeout()? {
        builder = builder.request_timeout(timeout);
    }
    Ok(builder)
}
