/*!
`tuftool` manages an update repository on the publisher's machine.

```text
tuftool init <app-name> [--repo DIR]       create keys and version 1 of every role
tuftool full <version> [--dist DIR]        package <dist>/<app-name> and publish it
tuftool add <version> --archive FILE       publish an already packaged .tar.gz
tuftool refresh                            re-sign snapshot and timestamp
tuftool rotate-key <role>                  replace a role's keys
tuftool versions                           list published versions
```

Offline keys (root and targets) are encrypted at rest when `TUFTOOL_PASSPHRASE` is set.
*/

#![warn(clippy::pedantic)]

use argh::FromArgs;
use semver::Version;
use simplelog::{ColorChoice, Config as LogConfig, LevelFilter, TermLogger, TerminalMode};
use snafu::{ErrorCompat, ResultExt};
use std::path::PathBuf;
use tuf_schema::RoleType;
use tuftool::config::RepoConfig;
use tuftool::{Repository, PASSPHRASE_ENV};

/// Create a new repository with fresh keys
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "init")]
struct InitArgs {
    /// name of the application the repository publishes
    #[argh(positional)]
    app_name: String,
}

/// Package a freshly built artifact and publish it
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "full")]
struct FullArgs {
    /// version to publish
    #[argh(positional)]
    version: Version,

    /// directory holding the built artifact, named after the application
    #[argh(option, default = "PathBuf::from(\"dist\")")]
    dist: PathBuf,
}

/// Publish an archive that is already packaged
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "add")]
struct AddArgs {
    /// version to publish
    #[argh(positional)]
    version: Version,

    /// path to the .tar.gz archive
    #[argh(option)]
    archive: PathBuf,
}

/// Re-sign snapshot and timestamp with new expirations
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "refresh")]
struct RefreshArgs {}

/// Replace the keys of a role
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "rotate-key")]
struct RotateKeyArgs {
    /// role whose keys to replace: root, targets, snapshot or timestamp
    #[argh(positional)]
    role: RoleType,
}

/// List the published versions
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "versions")]
struct VersionsArgs {}

#[derive(FromArgs, Debug)]
#[argh(subcommand)]
enum Command {
    Init(InitArgs),
    Full(FullArgs),
    Add(AddArgs),
    Refresh(RefreshArgs),
    RotateKey(RotateKeyArgs),
    Versions(VersionsArgs),
}

#[derive(FromArgs, Debug)]
/// Manage an update repository.
struct TopLevel {
    /// repository directory (default: current directory)
    #[argh(option, default = "PathBuf::from(\".\")")]
    repo: PathBuf,

    /// log level: trace, debug, info, warn or error
    #[argh(option, default = "LevelFilter::Info")]
    log_level: LevelFilter,

    #[argh(subcommand)]
    cmd: Command,
}

fn main_inner() -> Result<()> {
    let args: TopLevel = argh::from_env();

    // TermLogger sends errors to stderr and anything less to stdout.
    TermLogger::init(
        args.log_level,
        LogConfig::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )
    .context(error::LoggerSnafu)?;

    let passphrase = std::env::var(PASSPHRASE_ENV).ok();
    let passphrase = passphrase.as_deref();
    if let Command::Init(init) = &args.cmd {
        Repository::init(&args.repo, RepoConfig::new(&init.app_name), passphrase)
            .context(error::TuftoolSnafu)?;
        return Ok(());
    }

    let repo = Repository::open(&args.repo, passphrase).context(error::TuftoolSnafu)?;
    run(&repo, args.cmd).context(error::TuftoolSnafu)
}

fn run(repo: &Repository, cmd: Command) -> tuftool::Result<()> {
    match cmd {
        Command::Init(_) => {}
        Command::Full(full) => {
            let artifact_path = full.dist.join(&repo.config().app_name);
            let release = repo.publish_file(&full.version, &artifact_path)?;
            println!("{}", release.archive.display());
        }
        Command::Add(add) => {
            let release = repo.add(&add.version, &add.archive)?;
            println!("{}", release.archive.display());
        }
        Command::Refresh(_) => repo.refresh()?,
        Command::RotateKey(rotate) => {
            let root = repo.rotate_key(rotate.role)?;
            println!("root.json is now version {}", root.version);
        }
        Command::Versions(_) => {
            for version in repo.versions()? {
                println!("{version}");
            }
        }
    }
    Ok(())
}

fn main() -> ! {
    std::process::exit(match main_inner() {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("{err}");
            if let Some(var) = std::env::var_os("RUST_BACKTRACE") {
                if var != "0" {
                    if let Some(backtrace) = err.backtrace() {
                        eprintln!("\n{backtrace:?}");
                    }
                }
            }
            1
        }
    })
}

mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub(super) enum Error {
        #[snafu(display("Logger setup error: {}", source))]
        Logger { source: log::SetLoggerError },

        #[snafu(display("{}", source))]
        Tuftool {
            #[snafu(backtrace)]
            source: tuftool::Error,
        },
    }
}

type Result<T> = std::result::Result<T, error::Error>;
