//! Exercise every plate on the bus.
//!
//! Scans for DAQC2 plates, reports identity and ADC timing, cycles the LED
//! and walks the digital outputs, then walks the relays on every relay
//! plate found.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use strum::IntoEnumIterator;

use piplates::board::{scan, LedColor};
use piplates::hw_trait::SystemClock;
use piplates::tracing::{self, prelude::*};
use piplates::transport::sim::SimBus;
use piplates::{BusContext, Config, Daqc2Plate, PinState, Plate, PlateModel, RelayPlate};

const ADC_SAMPLES: usize = 5;

/// Pi-Plates demonstration sequence
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (defaults to the standard search path)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run against simulated plates instead of hardware
    #[arg(long)]
    simulate: bool,

    /// Pause between visible steps, in milliseconds
    #[arg(long, default_value_t = 2000)]
    step_delay_ms: u64,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    tracing::init_with_default(if args.verbose {
        tracing::LevelFilter::DEBUG
    } else {
        tracing::LevelFilter::INFO
    });

    let config = match &args.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("loading configuration")?;

    let bus = if args.simulate {
        info!("Using simulated plates");
        BusContext::new(SimBus::stack(), SystemClock::new(), config.timing)?
    } else {
        BusContext::open(&config).context("opening plate bus")?
    };
    let step = Duration::from_millis(args.step_delay_ms);

    for index in scan(&bus, PlateModel::Daqc2, config.scan.indices()) {
        let plate = Daqc2Plate::open(bus.clone(), index)?;
        info!(address = plate.handle().address(), "Found DAQC2");
        daqc2_demo(&plate, step)?;
    }

    for index in scan(&bus, PlateModel::Relay, config.scan.indices()) {
        let plate = RelayPlate::open(bus.clone(), index)?;
        info!(address = plate.handle().address(), "Found relay plate");
        relay_demo(&plate, step)?;
    }

    info!("Done.");
    Ok(())
}

fn daqc2_demo(plate: &Daqc2Plate, step: Duration) -> Result<()> {
    report_identity(plate);

    let start = Instant::now();
    let samples = (0..ADC_SAMPLES)
        .map(|_| plate.read_all_analog())
        .collect::<piplates::Result<Vec<_>>>()?;
    let average = start.elapsed() / ADC_SAMPLES as u32;
    info!(?average, "Average time to read all 8 ADC channels");
    for (k, sample) in samples.iter().enumerate() {
        for (channel, volts) in sample.iter().enumerate() {
            info!("ADC[{}][{}] = {:.4}", k, channel, volts);
        }
    }

    for channel in 0..Daqc2Plate::ADC_CHANNELS as i32 {
        match plate.read_analog(channel) {
            Ok(volts) => info!(channel, "ADC {:.4} V", volts),
            Err(e) => warn!(channel, error = %e, "ADC read failed"),
        }
    }

    for color in LedColor::iter().skip(1).chain([LedColor::Off]) {
        info!(%color, "LED");
        plate.set_led(color)?;
        std::thread::sleep(step);
    }

    for pin in PlateModel::Daqc2.pins() {
        info!(pin, "Output high");
        plate.handle().set_digital_pin(pin, PinState::On)?;
        std::thread::sleep(step);
        info!(pin, "Output low");
        plate.handle().set_digital_pin(pin, PinState::Off)?;
        std::thread::sleep(step);
    }

    for pin in PlateModel::Daqc2.pins() {
        let level = plate.digital_input(pin)?;
        info!(pin, level, "Input");
    }
    Ok(())
}

fn relay_demo(plate: &RelayPlate, step: Duration) -> Result<()> {
    report_identity(plate);

    for relay in PlateModel::Relay.pins() {
        info!(relay, "Relay on");
        plate.relay_on(relay)?;
        std::thread::sleep(step);
        info!(relay, "Relay off");
        plate.relay_off(relay)?;
        std::thread::sleep(step);
    }
    Ok(())
}

fn report_identity(plate: &impl Plate) {
    info!(
        id = %plate.id(),
        hw = %plate.hw_revision(),
        fw = %plate.fw_revision(),
        "Plate identity"
    );
}
