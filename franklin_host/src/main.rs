use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use franklin::sim::{SimAdc, SimPins};
use franklin::LinkConfig;
use log::{debug, info, warn};
use std::path::PathBuf;
use std::time::Duration;

mod clock;
mod config;
mod driver;
mod serial;
mod simulator;
mod store;

use config::MachineConfig;
use driver::Driver;
use serial::{Port, Pty, SerialPort};
use simulator::Simulator;
use store::FileStore;

/// Franklin printer controller tools
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// write log to file instead of stderr
    #[arg(short, long, global = true)]
    logfile: Option<PathBuf>,

    /// enable debug messages
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the firmware against simulated hardware on a pseudo-terminal
    Simulate {
        /// JSON machine description
        config: PathBuf,

        /// file holding saved settings across runs
        #[arg(short, long)]
        eeprom: Option<PathBuf>,

        /// speak the protocol on stdin and stdout instead of a pseudo-terminal
        #[arg(long)]
        stdio: bool,
    },
    /// Connect to a board, start a session and run moves
    Drive {
        /// serial device of the board
        tty: PathBuf,

        /// comma separated axis targets, empty entries leave an axis alone
        #[arg(short, long)]
        goto: Vec<String>,

        /// seconds to wait for the moves to finish
        #[arg(long, default_value_t = 120)]
        timeout: u64,
    },
}

fn parse_targets(text: &str) -> Result<Vec<(usize, f64)>> {
    let mut targets = Vec::new();
    for (axis, field) in text.split(',').enumerate() {
        let field = field.trim();
        if field.is_empty() {
            continue;
        }
        let value = field
            .parse()
            .with_context(|| format!("bad target {field:?} for axis {axis}"))?;
        targets.push((axis, value));
    }
    Ok(targets)
}

fn simulate(config: PathBuf, eeprom: Option<PathBuf>, stdio: bool) -> Result<()> {
    let description = MachineConfig::load(&config)?;
    let store = match &eeprom {
        Some(path) => FileStore::open(path)?,
        None => FileStore::in_memory(),
    };
    let mut machine = description.build(SimPins::new(), SimAdc::new(), store)?;
    match machine.load_settings() {
        Ok(()) => info!("using saved settings"),
        Err(e) => debug!("no saved settings: {e}"),
    }

    let mut sim = Simulator::new(machine, description.link.into(), clock::HostClock);
    info!(
        "simulating {} spaces and {} temps",
        sim.machine().spaces().len(),
        sim.machine().temps().len()
    );
    if stdio {
        return simulator::serve(&mut sim, &mut SerialPort::stdio());
    }
    let pty = Pty::new()?;
    println!("{}", pty.ttyname()?.display());
    simulator::serve(&mut sim, &mut SerialPort::pty_master(&pty))
}

fn drive(tty: PathBuf, gotos: Vec<String>, timeout: u64) -> Result<()> {
    let port = SerialPort::open(&tty)?;
    let mut driver = Driver::new(port, LinkConfig::default());
    let session = driver.begin()?;
    driver.ping(0x5A)?;
    info!("board speaks protocol {}", session.version);
    for (s, shape) in session.spaces.iter().enumerate() {
        info!(
            "space {s}: kind {} with {} axes and {} motors",
            shape.kind, shape.axes, shape.motors
        );
    }

    let moves = gotos
        .iter()
        .map(|text| parse_targets(text))
        .collect::<Result<Vec<_>>>()?;
    for (i, targets) in moves.iter().enumerate() {
        driver.goto(targets, i + 1 == moves.len())?;
    }
    if !moves.is_empty() {
        if let Err(e) = driver.wait_moves(1, Duration::from_secs(timeout)) {
            driver.stop()?;
            return Err(e);
        }
    }

    for (s, shape) in session.spaces.iter().enumerate() {
        if shape.axes == 0 {
            continue;
        }
        let position = driver.position(s as u8)?;
        println!("space {s}: {position:?}");
    }
    for t in 0..session.temps {
        println!("temp {t}: {:.1} °C", driver.read_temp(t)?);
    }
    for event in driver.take_events() {
        warn!("unhandled event {event:?}");
    }
    debug!("link idle at {} µs", driver.port().now());
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut builder = env_logger::Builder::from_default_env();
    if args.verbose {
        builder.filter(None, log::LevelFilter::Debug);
    } else {
        builder.filter(None, log::LevelFilter::Info);
    }
    if let Some(ref logfile) = args.logfile {
        let target = Box::new(std::fs::File::create(logfile).context("Can't create logfile")?);
        builder.target(env_logger::Target::Pipe(target));
    }
    builder.init();

    match args.command {
        Command::Simulate {
            config,
            eeprom,
            stdio,
        } => simulate(config, eeprom, stdio),
        Command::Drive { tty, goto, timeout } => drive(tty, goto, timeout),
    }
}
