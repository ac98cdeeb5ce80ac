use std::fs::File;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use picload::flashing::{FlashConfig, Flashing, PageDiff};
use picload::protocol::{BLoad, Icsp, Protocol};
use picload::sim::IcspTarget;
use picload::transport::SerialTransport;
use picload::{Family, Image, Registry, hexfile};

/// Device id the `mock` port simulates (a 12F1822).
const MOCK_DEVICE_ID: u16 = 0x138;

#[derive(Parser)]
#[command(
    name = "picload",
    about = "PIC serial programmer for the BLoad bootloader and the ICSP host controller",
    version
)]
struct Cli {
    /// Serial device, or "mock" for the built-in target simulator
    #[arg(short, long, default_value = "/dev/ttyUSB0")]
    port: String,

    /// Baud rate
    #[arg(short, long, default_value_t = 38400)]
    baud: u32,

    /// Programming family used to decode the id word
    #[arg(long, value_enum, default_value = "enhanced")]
    family: Family,

    /// Talk to an ICSP host controller instead of the resident bootloader
    #[arg(long)]
    icsp: bool,

    /// Skip the verify pass after writing
    #[arg(short, long)]
    fast: bool,

    /// Raise log verbosity (-v: debug, -vv: trace with wire bytes)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Also append logs to a file
    #[arg(long, value_name = "FILE")]
    log: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Write a HEX file to the target and verify it
    Write { path: PathBuf },
    /// Read the target's memory and save it as a HEX file
    Read { path: PathBuf },
    /// Identify the connected chip
    Id,
    /// Print the word-usage map of a HEX file
    Map { path: PathBuf },
    /// List available serial ports
    Ports,
}

fn init_logging(cli: &Cli) -> Result<()> {
    let level = match cli.verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let term = simplelog::TermLogger::new(
        level,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );

    let mut loggers: Vec<Box<dyn simplelog::SharedLogger>> = vec![term];
    if let Some(path) = &cli.log {
        loggers.push(simplelog::WriteLogger::new(
            simplelog::LevelFilter::Trace,
            simplelog::Config::default(),
            File::create(path)?,
        ));
    }
    simplelog::CombinedLogger::init(loggers)?;
    Ok(())
}

fn show_diffs(diffs: &[PageDiff]) {
    for diff in diffs {
        println!("Page 0x{:03X}", diff.page_num);
        if let Some(page) = &diff.file {
            println!("File:\n{}", page.display(diff.page_num));
        }
        if let Some(page) = &diff.chip {
            println!("Chip:\n{}", page.display(diff.page_num));
        }
    }
}

fn run<P: Protocol>(proto: P, cli: &Cli) -> Result<()> {
    let config = FlashConfig {
        family: cli.family,
        fast: cli.fast,
    };
    let mut flashing = Flashing::start(proto, config)?;

    match &cli.command {
        Command::Write { path } => {
            let firmware = hexfile::load(path)?;
            let diffs = flashing.flash(&firmware)?;
            flashing.release()?;
            if !diffs.is_empty() {
                show_diffs(&diffs);
                anyhow::bail!("verify failed on {} page(s)", diffs.len());
            }
        }
        Command::Read { path } => {
            let image = flashing.read_image()?;
            flashing.release()?;
            hexfile::save(path, &image)?;
            log::info!("saved firmware to {}", path.display());
        }
        Command::Id => {
            println!("{}", flashing.profile());
            flashing.release()?;
        }
        // handled before a connection is made
        Command::Map { .. } | Command::Ports => unreachable!(),
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli)?;

    if let Command::Map { path } = &cli.command {
        let image = hexfile::load(path)?;
        print!("{}", image.usage_map());
        return Ok(());
    }
    if let Command::Ports = &cli.command {
        for name in SerialTransport::scan_ports()? {
            println!("{name}");
        }
        return Ok(());
    }

    if cli.port == "mock" {
        let profile = Registry::load()?.find(MOCK_DEVICE_ID)?;
        let target = IcspTarget::new(profile, Image::new());
        return run(Icsp::new(target), &cli);
    }

    let port = SerialTransport::open(&cli.port, cli.baud)?;
    if cli.icsp {
        run(Icsp::new(port), &cli)
    } else {
        run(BLoad::new(port), &cli)
    }
}
