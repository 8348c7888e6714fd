/*!
`updog` checks for and applies application updates from the command line.

```text
updog check-update      print the available update, if any
updog update            check and apply
```

Global options: `--config PATH` (default `/etc/updog.toml`), `--log-level LEVEL`, `--json`.
Exits 0 for "no update", "update available" and "applied", and 1 when the check or apply
failed.
*/

#![warn(clippy::pedantic)]

use argh::FromArgs;
use simplelog::{ColorChoice, Config as LogConfig, LevelFilter, TermLogger, TerminalMode};
use snafu::{ErrorCompat, ResultExt};
use std::path::PathBuf;
use updog::config::DEFAULT_CONFIG_PATH;
use updog::{bootstrap, Config, Outcome, Updater};

/// Show whether an update is available
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "check-update")]
struct CheckUpdateArgs {}

/// Apply the newest update, if there is one
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "update")]
struct UpdateArgs {}

#[derive(FromArgs, Debug)]
#[argh(subcommand)]
enum Command {
    CheckUpdate(CheckUpdateArgs),
    Update(UpdateArgs),
}

#[derive(FromArgs, Debug)]
/// Check for and apply application updates.
struct TopLevel {
    /// path to the configuration file
    #[argh(option, default = "PathBuf::from(DEFAULT_CONFIG_PATH)")]
    config: PathBuf,

    /// log level: trace, debug, info, warn or error
    #[argh(option, default = "LevelFilter::Info")]
    log_level: LevelFilter,

    /// JSON-formatted output
    #[argh(switch, short = 'j')]
    json: bool,

    #[argh(subcommand)]
    cmd: Command,
}

fn output(json: bool, outcome: &Outcome) -> Result<()> {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(outcome).context(error::SerializeSnafu)?
        );
        return Ok(());
    }
    match outcome {
        Outcome::NoUpdate => eprintln!("No update available"),
        Outcome::UpdateAvailable(update) => println!("{} {}", update.name, update.version),
        Outcome::Applied {
            version,
            restart_required,
        } => {
            println!("Update applied: {version}");
            if *restart_required {
                eprintln!("Restart the application to run the new version");
            }
        }
        Outcome::Failed { reason, message } => eprintln!("Update failed ({reason}): {message}"),
    }
    Ok(())
}

fn main_inner() -> Result<Outcome> {
    let args: TopLevel = argh::from_env();

    // TerminalMode::Mixed will send errors to stderr and anything less to stdout.
    TermLogger::init(
        args.log_level,
        LogConfig::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )
    .context(error::LoggerSnafu)?;

    let config = Config::load(&args.config).context(error::UpdogSnafu)?;
    bootstrap::init(&config).context(error::UpdogSnafu)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context(error::RuntimeSnafu)?;
    let outcome = runtime.block_on(async {
        let updater = Updater::new(config).context(error::UpdogSnafu)?;
        Ok::<_, error::Error>(match args.cmd {
            Command::CheckUpdate(_) => updater.check().await,
            Command::Update(_) => updater.check_and_apply().await,
        })
    })?;
    output(args.json, &outcome)?;
    Ok(outcome)
}

fn main() -> ! {
    std::process::exit(match main_inner() {
        Ok(Outcome::Failed { .. }) => 1,
        Ok(_) => 0,
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

        #[snafu(display("Failed to initialize async runtime: {}", source))]
        Runtime { source: std::io::Error },

        #[snafu(display("Failed to serialize output: {}", source))]
        Serialize { source: serde_json::Error },

        #[snafu(display("{}", source))]
        Updog {
            #[snafu(backtrace)]
            source: updog::Error,
        },
    }
}

type Result<T> = std::result::Result<T, error::Error>;
