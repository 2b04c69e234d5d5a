//! Linear discovery of plates on the bus.

use std::ops::RangeInclusive;

use super::{BoardHandle, PlateModel};
use crate::bus::BusContext;
use crate::config::ScanConfig;
use crate::tracing::prelude::*;

/// Probe each slot in `indices` and return the ones whose plate reports
/// the expected address. Only the address query is sent; calibration and
/// identity are left to the caller.
pub fn scan(bus: &BusContext, model: PlateModel, indices: RangeInclusive<u8>) -> Vec<u8> {
    let found: Vec<u8> = indices
        .filter(|&index| index < PlateModel::MAX_PLATES)
        .filter(|&index| match BoardHandle::new(bus.clone(), model, index) {
            Ok(mut handle) => handle.validate(),
            Err(_) => false,
        })
        .collect();
    info!(%model, ?found, "Scan complete");
    found
}

/// Scan every model over the configured slot range, DAQC2 plates first.
pub fn scan_all(bus: &BusContext, config: &ScanConfig) -> Vec<(PlateModel, u8)> {
    [PlateModel::Daqc2, PlateModel::Relay]
        .into_iter()
        .flat_map(|model| {
            scan(bus, model, config.indices())
                .into_iter()
                .map(move |index| (model, index))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{opcode, Timing};
    use crate::transport::sim::{FakeClock, SimBus, SimPlate};

    #[test]
    fn test_scan_finds_only_answering_slots() {
        let sim = SimBus::new()
            .with_plate(SimPlate::relay(1))
            .with_plate(SimPlate::relay(5))
            .with_plate(SimPlate::daqc2(0));
        let bus = BusContext::new(sim.clone(), FakeClock::new(), Timing::default()).unwrap();
        sim.clear_events();

        assert_eq!(scan(&bus, PlateModel::Relay, 0..=7), vec![1, 5]);
        assert_eq!(sim.exchanges().len(), 8);
        assert!(sim
            .exchanges()
            .iter()
            .all(|tx| tx[1] == opcode::ADDRESS));
    }

    #[test]
    fn test_scan_all_orders_models() {
        let sim = SimBus::new()
            .with_plate(SimPlate::relay(2))
            .with_plate(SimPlate::daqc2(7));
        let bus = BusContext::new(sim, FakeClock::new(), Timing::default()).unwrap();

        let found = scan_all(&bus, &ScanConfig::default());
        assert_eq!(found, vec![(PlateModel::Daqc2, 7), (PlateModel::Relay, 2)]);
    }

    #[test]
    fn test_scan_clips_range() {
        let sim = SimBus::new().with_plate(SimPlate::daqc2(7));
        let bus = BusContext::new(sim.clone(), FakeClock::new(), Timing::default()).unwrap();
        sim.clear_events();

        assert_eq!(scan(&bus, PlateModel::Daqc2, 6..=12), vec![7]);
        assert_eq!(sim.exchanges().len(), 2);
    }
}
