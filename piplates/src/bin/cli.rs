//! Command-line interface for piplates.
//!
//! One-shot control of individual plates: discovery, identity, relays,
//! digital and analog I/O, LEDs and reset.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use piplates::board::{scan_all, Edge, LedColor};
use piplates::hw_trait::SystemClock;
use piplates::tracing::{self, prelude::*};
use piplates::transport::sim::SimBus;
use piplates::{
    BoardHandle, BusContext, Config, Daqc2Plate, PinState, Plate, PlateModel, RelayPlate,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Control Pi-Plates from the command line", long_about = None)]
struct Cli {
    /// Configuration file (defaults to the standard search path)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Run against simulated plates instead of hardware
    #[arg(long, global = true)]
    simulate: bool,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List plates that answer on the bus
    Scan {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Show a plate's identity and revisions
    Info {
        model: PlateModel,
        index: u8,
        #[arg(long)]
        json: bool,
    },
    /// Switch one relay (1-7)
    Relay {
        index: u8,
        relay: i32,
        state: PinState,
    },
    /// Read the relay state byte, or set all relays from a mask
    Relays {
        index: u8,
        #[arg(long, value_parser = parse_mask)]
        set: Option<u8>,
    },
    /// Drive a digital output on any plate model
    Dout {
        model: PlateModel,
        index: u8,
        pin: i32,
        state: PinState,
    },
    /// Read DAQC2 digital inputs (all of them without a pin)
    Din { index: u8, pin: Option<i32> },
    /// Read DAQC2 analog inputs in volts (channel 8 is the reference)
    Adc { index: u8, channel: Option<i32> },
    /// Set a DAQC2 analog output in volts
    Dac { index: u8, channel: i32, volts: f64 },
    /// Set or read the DAQC2 RGB LED
    Led { index: u8, color: Option<LedColor> },
    /// Switch a relay plate status LED (0-1)
    RelayLed { index: u8, led: u8, state: PinState },
    /// Arm a DAQC2 input interrupt, or read and clear the latched flags
    Irq {
        index: u8,
        #[arg(long, requires = "edge")]
        pin: Option<i32>,
        #[arg(long)]
        edge: Option<Edge>,
    },
    /// Reset a plate to its power-on state
    Reset { model: PlateModel, index: u8 },
}

fn parse_mask(s: &str) -> std::result::Result<u8, String> {
    let parsed = match s.strip_prefix("0x") {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| e.to_string())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing::init_with_default(if cli.verbose {
        tracing::LevelFilter::DEBUG
    } else {
        tracing::LevelFilter::WARN
    });

    let config = match &cli.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("loading configuration")?;

    let bus = if cli.simulate {
        BusContext::new(SimBus::stack(), SystemClock::new(), config.timing)?
    } else {
        BusContext::open(&config).context("opening plate bus")?
    };

    run(cli.command, &bus, &config)
}

fn run(command: Command, bus: &BusContext, config: &Config) -> Result<()> {
    match command {
        Command::Scan { json } => {
            let found = scan_all(bus, &config.scan);
            if json {
                let infos = found
                    .iter()
                    .map(|&(model, index)| Ok(BoardHandle::new(bus.clone(), model, index)?.info()))
                    .collect::<piplates::Result<Vec<_>>>()?;
                println!("{}", serde_json::to_string_pretty(&infos)?);
            } else if found.is_empty() {
                println!("No plates found");
            } else {
                for (model, index) in found {
                    println!("{} {} (address {})", model, index, model.address(index));
                }
            }
        }
        Command::Info { model, index, json } => {
            let mut handle = BoardHandle::new(bus.clone(), model, index)?;
            if !handle.validate() {
                bail!("no {} plate answers at index {}", model, index);
            }
            let info = handle.info();
            if json {
                println!("{}", serde_json::to_string_pretty(&info)?);
            } else {
                println!("{} at address {}", info.id, info.address);
                println!("  hardware {}", info.hw_revision);
                println!("  firmware {}", info.fw_revision);
            }
        }
        Command::Relay {
            index,
            relay,
            state,
        } => {
            let plate = RelayPlate::open(bus.clone(), index)?;
            plate.handle().set_digital_pin(relay, state)?;
            println!("relay {}: {}", relay, on_off(plate.relay(relay)?));
        }
        Command::Relays { index, set } => {
            let plate = RelayPlate::open(bus.clone(), index)?;
            if let Some(mask) = set {
                plate.set_all(mask)?;
            }
            println!("{:#09b}", plate.state()?);
        }
        Command::Dout {
            model,
            index,
            pin,
            state,
        } => {
            let mut handle = BoardHandle::new(bus.clone(), model, index)?;
            if !handle.validate() {
                bail!("no {} plate answers at index {}", model, index);
            }
            let applied = handle.set_digital_pin(pin, state)?;
            debug!(pin, %applied, "Output set");
        }
        Command::Din { index, pin } => {
            let plate = Daqc2Plate::open(bus.clone(), index)?;
            match pin {
                Some(pin) => println!("{}", on_off(plate.digital_input(pin)?)),
                None => println!("{:#010b}", plate.digital_inputs()?),
            }
        }
        Command::Adc { index, channel } => {
            let plate = Daqc2Plate::open(bus.clone(), index)?;
            match channel {
                Some(channel) => println!("{:.4}", plate.read_analog(channel)?),
                None => {
                    for (channel, volts) in plate.read_all_analog()?.iter().enumerate() {
                        println!("{}: {:.4}", channel, volts);
                    }
                }
            }
        }
        Command::Dac {
            index,
            channel,
            volts,
        } => {
            let plate = Daqc2Plate::open(bus.clone(), index)?;
            let code = plate.write_analog(channel, volts)?;
            println!("channel {}: code {}", channel, code);
        }
        Command::Led { index, color } => {
            let plate = Daqc2Plate::open(bus.clone(), index)?;
            if let Some(color) = color {
                plate.set_led(color)?;
            }
            println!("{}", plate.led()?);
        }
        Command::RelayLed { index, led, state } => {
            let plate = RelayPlate::open(bus.clone(), index)?;
            plate.set_led(led, state)?;
            println!("led {}: {}", led, on_off(plate.led_state(led)?));
        }
        Command::Irq { index, pin, edge } => {
            let plate = Daqc2Plate::open(bus.clone(), index)?;
            match (pin, edge) {
                (Some(pin), Some(edge)) => {
                    plate.enable_edge_interrupt(pin, edge)?;
                    plate.interrupts_enable()?;
                    println!("armed {} edge on input {}", edge, pin);
                }
                _ => {
                    let pending = bus.interrupt_pending()?;
                    let flags = plate.interrupt_flags()?;
                    println!("pending: {}, flags: {:?}", pending, flags);
                }
            }
        }
        Command::Reset { model, index } => {
            let mut handle = BoardHandle::new(bus.clone(), model, index)?;
            if !handle.validate() {
                bail!("no {} plate answers at index {}", model, index);
            }
            handle.reset()?;
            println!("reset {} {}", model, index);
        }
    }
    Ok(())
}

fn on_off(level: bool) -> &'static str {
    if level {
        "on"
    } else {
        "off"
    }
}
