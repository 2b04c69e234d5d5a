//! End-to-end plate behaviour over the simulated bus.

use piplates::board::{scan_all, BoardHandle, Edge, IrqFlags, LedColor, ID_UNAVAILABLE};
use piplates::config::ScanConfig;
use piplates::protocol::{opcode, CommandFrame, ReadMode, Timing, TransactionError};
use piplates::transport::sim::{BusEvent, FakeClock, Fault, SimBus, SimPlate};
use piplates::{BusContext, Daqc2Plate, Error, PinState, Plate, PlateModel, RelayPlate, Revision};
use test_case::test_case;

fn bus(sim: &SimBus) -> BusContext {
    let bus = BusContext::new(sim.clone(), FakeClock::new(), Timing::default()).unwrap();
    sim.clear_events();
    bus
}

#[test_case(PlateModel::Daqc2, -1)]
#[test_case(PlateModel::Daqc2, 8)]
#[test_case(PlateModel::Relay, -1)]
#[test_case(PlateModel::Relay, 8)]
fn test_pin_out_of_range_never_touches_bus(model: PlateModel, pin: i32) {
    let sim = SimBus::new().with_plate(SimPlate::daqc2(0)).with_plate(SimPlate::relay(0));
    let handle = BoardHandle::new(bus(&sim), model, 0).unwrap();

    for state in [PinState::On, PinState::Off, PinState::Toggle] {
        assert!(matches!(
            handle.set_digital_pin(pin, state),
            Err(Error::InvalidArgument(_))
        ));
    }
    assert!(handle.get_digital_pin(pin).is_err());
    assert!(sim.events().is_empty());
}

#[test]
fn test_raw_command_stamps_address() {
    let sim = SimBus::new().with_plate(SimPlate::relay(3));
    let handle = BoardHandle::new(bus(&sim), PlateModel::Relay, 3).unwrap();

    let response = handle.command(CommandFrame::new(opcode::OUTPUT_ON, 2, 0), ReadMode::NONE);
    assert!(response.is_valid());
    assert_eq!(sim.exchanges(), vec![vec![27, opcode::OUTPUT_ON, 2, 0]]);
    assert_eq!(
        sim.events(),
        vec![
            BusEvent::FrameAsserted,
            BusEvent::Exchange(vec![27, opcode::OUTPUT_ON, 2, 0]),
            BusEvent::FrameReleased,
        ]
    );
}

#[test]
fn test_validate_and_identity() {
    let sim = SimBus::new().with_plate(SimPlate::daqc2(2));
    let mut plate = Daqc2Plate::new(bus(&sim), 2).unwrap();

    assert!(plate.validate());
    assert_eq!(plate.handle().reported_address(), Some(34));
    assert_eq!(plate.id(), "Pi-Plate DAQC2");
    assert_eq!(plate.hw_revision(), Revision { major: 1, minor: 0 });
    assert_eq!(plate.fw_revision(), Revision { major: 1, minor: 2 });
}

#[test]
fn test_absent_plate_placeholders() {
    let sim = SimBus::new();
    let mut handle = BoardHandle::new(bus(&sim), PlateModel::Daqc2, 6).unwrap();

    assert!(!handle.validate());
    assert_eq!(handle.get_id(), ID_UNAVAILABLE);
    assert_eq!(handle.fw_revision(), Revision::UNKNOWN);
    assert_eq!(sim.frame_asserts(), sim.frame_releases());
}

#[test]
fn test_ack_timeout_surfaces_as_transaction_error() {
    let sim = SimBus::new().with_plate(SimPlate::daqc2(0));
    let plate = Daqc2Plate::new(bus(&sim), 0).unwrap();
    sim.inject(Fault::AckNeverAsserted);

    assert!(matches!(
        plate.read_analog(0),
        Err(Error::Transaction(TransactionError::AckTimeout))
    ));
    assert_eq!(sim.bytes_read(), 0);
}

#[test]
fn test_truncated_read_hides_payload() {
    let sim = SimBus::new().with_plate(SimPlate::daqc2(0));
    let plate = Daqc2Plate::new(bus(&sim), 0).unwrap();
    sim.inject(Fault::ReadBudget(1));

    assert!(matches!(
        plate.read_analog(3),
        Err(Error::Transaction(TransactionError::ReadTruncated { received: 1 }))
    ));
}

#[test]
fn test_calibration_survives_unreadable_bytes() {
    let sim = SimBus::new().with_plate(SimPlate::daqc2(0).with_calibration([0x11; 48]));
    let bus = bus(&sim);
    sim.inject(Fault::ExchangeFails);

    let plate = Daqc2Plate::new(bus, 0).unwrap();
    assert!(plate
        .calibration()
        .channels()
        .iter()
        .all(|cal| cal.scale == 1.0 && cal.offset == 0.0));
}

#[test]
fn test_adc_and_dac_conversions() {
    let sim = SimBus::new().with_plate(SimPlate::daqc2(0));
    let plate = Daqc2Plate::open(bus(&sim), 0).unwrap();
    sim.with_plate_mut(32, |p| {
        p.adc[4] = 0x0000;
        p.adc[5] = 0xFFFF;
    });

    assert!((plate.read_analog(4).unwrap() + 12.0).abs() < 1e-9);
    assert!((plate.read_analog(5).unwrap() - 11.99963).abs() < 1e-4);

    assert_eq!(plate.write_analog(0, 4.095).unwrap(), 4095);
    assert_eq!(plate.write_analog(1, 9.0).unwrap(), 4095);
    assert_eq!(plate.write_analog(3, -2.0).unwrap(), 0);
    assert_eq!(sim.plate(32).unwrap().dac, [4095, 4095, 0, 0]);
}

#[test]
fn test_relay_pin_zero_rejected() {
    let sim = SimBus::new().with_plate(SimPlate::relay(0));
    let plate = RelayPlate::open(bus(&sim), 0).unwrap();
    sim.clear_events();

    assert!(plate.relay_on(0).is_err());
    assert!(plate.relay_on(1).is_ok());
    assert_eq!(sim.exchanges(), vec![vec![24, opcode::OUTPUT_ON, 1, 0]]);
}

#[test]
fn test_interrupt_flow() {
    let sim = SimBus::new().with_plate(SimPlate::daqc2(4));
    let bus = bus(&sim);
    let plate = Daqc2Plate::open(bus.clone(), 4).unwrap();

    plate.enable_edge_interrupt(0, Edge::Both).unwrap();
    plate.enable_edge_interrupt(7, Edge::Rising).unwrap();
    plate.interrupts_enable().unwrap();
    sim.with_plate_mut(36, |p| {
        p.set_input(0, true);
        p.set_input(7, true);
    });

    assert!(bus.interrupt_pending().unwrap());
    assert_eq!(plate.interrupt_flags().unwrap(), IrqFlags::DIN0 | IrqFlags::DIN7);
    assert!(!bus.interrupt_pending().unwrap());

    plate.disable_edge_interrupt(7).unwrap();
    sim.with_plate_mut(36, |p| {
        p.set_input(7, false);
        p.set_input(7, true);
    });
    assert!(plate.interrupt_flags().unwrap().is_empty());
}

#[test]
fn test_led_cycle() {
    let sim = SimBus::new().with_plate(SimPlate::daqc2(0));
    let plate = Daqc2Plate::open(bus(&sim), 0).unwrap();

    for color in [LedColor::Red, LedColor::White, LedColor::Off] {
        plate.set_led(color).unwrap();
        assert_eq!(plate.led().unwrap(), color);
    }
}

#[test]
fn test_scan_whole_stack() {
    let sim = SimBus::new()
        .with_plate(SimPlate::daqc2(0))
        .with_plate(SimPlate::daqc2(3))
        .with_plate(SimPlate::relay(7));

    let found = scan_all(&bus(&sim), &ScanConfig::default());
    assert_eq!(
        found,
        vec![
            (PlateModel::Daqc2, 0),
            (PlateModel::Daqc2, 3),
            (PlateModel::Relay, 7)
        ]
    );
    assert_eq!(sim.frame_asserts(), 16);
    assert_eq!(sim.frame_asserts(), sim.frame_releases());
}

#[test]
fn test_shared_bus_across_threads() {
    let sim = SimBus::new().with_plate(SimPlate::relay(0)).with_plate(SimPlate::relay(1));
    let bus = bus(&sim);

    let workers: Vec<_> = [0u8, 1]
        .into_iter()
        .map(|index| {
            let bus = bus.clone();
            std::thread::spawn(move || {
                let plate = RelayPlate::new(bus, index).unwrap();
                for relay in 1..=7 {
                    plate.relay_on(relay).unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(sim.plate(24).unwrap().outputs, 0x7F);
    assert_eq!(sim.plate(25).unwrap().outputs, 0x7F);
}
