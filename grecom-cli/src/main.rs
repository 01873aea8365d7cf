use std::{path::PathBuf, time::Duration};

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use grecom_rcp::{RxMode, Session};
use log::{debug, info};

mod serial;

use serial::SerialPort;

/// Remote control for a scanner radio attached to a serial port.
#[derive(Debug, Parser)]
#[command(version)]
struct Args {
    /// Serial device of the radio. Set it to 115200 baud raw mode first,
    /// e.g. `stty -F /dev/ttyUSB0 115200 raw -echo`.
    #[arg(short, long, env = "GRECOM_PORT")]
    port: PathBuf,

    /// Seconds to wait for the radio before giving up; 0 waits forever.
    #[arg(short, long, env = "GRECOM_TIMEOUT", default_value_t = 30)]
    timeout: u64,

    #[command(subcommand)]
    action: Action,
}

#[derive(Debug, Subcommand)]
enum Action {
    /// Press a key, given as a key code (decimal or 0x-prefixed hex)
    Key {
        #[arg(value_parser = parse_byte)]
        code: u8,
    },
    /// Tune to a frequency in MHz
    Tune {
        frequency: String,
        #[arg(short, long, value_enum, default_value_t = Mode::Auto)]
        mode: Mode,
    },
    /// Print what the display shows
    Lcd,
    /// Print the radio status
    Status,
    /// Save the memory image to a file
    Download { output: PathBuf },
    /// Write a memory image file to the radio
    Upload { input: PathBuf },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Mode {
    Am,
    Fm,
    Auto,
}

impl From<Mode> for RxMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Am => RxMode::Am,
            Mode::Fm => RxMode::Fm,
            Mode::Auto => RxMode::Auto,
        }
    }
}

fn parse_byte(s: &str) -> Result<u8, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("{s:?} is not a byte: {e}"))
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let result = rt.block_on(run(args));
    // the read half may still be parked in the blocking pool
    rt.shutdown_timeout(Duration::from_millis(100));
    result
}

async fn run(args: Args) -> anyhow::Result<()> {
    let port = SerialPort::open(&args.port)
        .with_context(|| format!("couldn't open {}", args.port.display()))?;
    debug!("opened {}", args.port.display());

    let (session, driver) = Session::new(port);
    let limit = (args.timeout > 0).then(|| Duration::from_secs(args.timeout));
    let work = async move {
        let op = execute(&session, args.action);
        match limit {
            Some(limit) => tokio::time::timeout(limit, op)
                .await
                .context("timed out waiting for the radio")?,
            None => op.await,
        }
    };

    let (result, driver_result) = tokio::join!(work, driver.run());
    result?;
    driver_result.context("serial link failed")?;
    Ok(())
}

async fn execute(session: &Session, action: Action) -> anyhow::Result<()> {
    match action {
        Action::Key { code } => {
            session.send_key(code).await?;
            info!("sent key 0x{code:x}");
        }

        Action::Tune { frequency, mode } => {
            session.tune(&frequency, mode.into()).await?;
            info!("tuned to {frequency} MHz ({mode:?})");
        }

        Action::Lcd => {
            let lcd = session.get_lcd().await?;
            print!("{lcd}");
            debug!("{lcd:?}");
        }

        Action::Status => {
            let status = session.get_status().await?;
            println!("{status:#?}");
        }

        Action::Download { output } => {
            let image = session.download().await?;
            tokio::fs::write(&output, &image)
                .await
                .with_context(|| format!("couldn't write {}", output.display()))?;
            println!("saved {} bytes to {}", image.len(), output.display());
        }

        Action::Upload { input } => {
            let image = tokio::fs::read(&input)
                .await
                .with_context(|| format!("couldn't read {}", input.display()))?;
            session
                .upload(&image)
                .await
                .with_context(|| format!("couldn't upload {}", input.display()))?;
            println!("uploaded {}", input.display());
        }
    }
    Ok(())
}
