//! High-level HS6602 client: register decoding, retry, fix assembly.

use std::thread;
use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime};
use tracing::{debug, info};

use super::fix::{AntennaStatus, GpsHealth, PositionFix};
use super::registers;
use super::rtu::{RegisterBus, SerialRtuBus, TransportResult};

/// Attempts per register read before the field is reported absent.
pub const READ_RETRY_ATTEMPTS: u32 = 3;
/// Pause between attempts.
pub const READ_RETRY_PAUSE: Duration = Duration::from_millis(50);

/// Client for the HS6602 positioning module.
///
/// All read methods absorb transport failures: after the retry budget is
/// spent the affected field is simply absent. Callers see data, never
/// transport errors.
pub struct Hs6602 {
    bus: Box<dyn RegisterBus>,
}

impl Hs6602 {
    /// Open the module on a serial port (8N1).
    pub fn open(path: &str, baud: u32, slave: u8, timeout: Duration) -> TransportResult<Self> {
        let bus = SerialRtuBus::open(path, baud, slave, timeout)?;
        info!(port = path, baud, slave, "HS6602 connected");
        Ok(Self::with_bus(Box::new(bus)))
    }

    /// Build a client over any register bus. Used by tests and by the
    /// diagnostic tool when probing alternative transports.
    pub fn with_bus(bus: Box<dyn RegisterBus>) -> Self {
        Self { bus }
    }

    fn read_block(&mut self, address: u16, count: u16) -> Option<Vec<u16>> {
        for attempt in 1..=READ_RETRY_ATTEMPTS {
            match self.bus.read_registers(address, count) {
                Ok(values) => return Some(values),
                Err(err) if attempt == READ_RETRY_ATTEMPTS => {
                    debug!(
                        address = %format_args!("{address:#06x}"),
                        %err,
                        "register read failed after {READ_RETRY_ATTEMPTS} attempts"
                    );
                }
                Err(_) => thread::sleep(READ_RETRY_PAUSE),
            }
        }
        None
    }

    fn read_register(&mut self, address: u16) -> Option<u16> {
        self.read_block(address, 1).map(|values| values[0])
    }

    /// 32-bit float spanning two registers, big-endian register order.
    fn read_float(&mut self, address: u16) -> Option<f64> {
        self.read_block(address, 2)
            .map(|values| f32::from_bits((u32::from(values[0]) << 16) | u32::from(values[1])) as f64)
    }

    /// Firmware version string, e.g. register `0x0010` reads as `"1.0"`.
    pub fn read_version(&mut self) -> Option<String> {
        let raw = self.read_register(registers::VERSION)?;
        Some(format!("{}.{}", raw >> 4, raw & 0xF))
    }

    /// Whether the module currently has a positioning solution. An
    /// unreadable register counts as "no solution" - absence of a fix is a
    /// normal state, not an error.
    pub fn read_positioning_status(&mut self) -> bool {
        self.read_register(registers::POSITIONING_STATUS)
            .is_some_and(|value| value == registers::POSITIONING_VALID)
    }

    pub fn read_antenna_status(&mut self) -> Option<AntennaStatus> {
        self.read_register(registers::ANTENNA_STATUS)
            .map(AntennaStatus::from_register)
    }

    /// Local civil time from the six-register block. Registers are read
    /// individually so one flaky register only costs the timestamp, and
    /// out-of-range calendar values yield `None` instead of a bogus date.
    fn read_local_time(&mut self) -> Option<NaiveDateTime> {
        let year = self.read_register(registers::LOCAL_YEAR)?;
        let month = self.read_register(registers::LOCAL_MONTH)?;
        let day = self.read_register(registers::LOCAL_DAY)?;
        let hour = self.read_register(registers::LOCAL_HOUR)?;
        let minute = self.read_register(registers::LOCAL_MINUTE)?;
        let second = self.read_register(registers::LOCAL_SECOND)?;

        NaiveDate::from_ymd_opt(i32::from(year), u32::from(month), u32::from(day))?
            .and_hms_opt(u32::from(hour), u32::from(minute), u32::from(second))
    }

    /// Read a complete positioning fix.
    ///
    /// Gated, early-exit sequence: positioning status, antenna status,
    /// position, then the individually-optional extras (altitude, speed,
    /// heading, timestamp, satellite counts). Never returns an error; an
    /// unusable solution comes back as an invalid fix with a reason.
    pub fn read_fix(&mut self) -> PositionFix {
        if !self.read_positioning_status() {
            return PositionFix::invalid("positioning invalid - waiting for fix");
        }

        let antenna_status = self.read_antenna_status();
        if let Some(status) = antenna_status {
            if status.is_fault() {
                return PositionFix::antenna_fault(status);
            }
        }

        let lon_dir = self.read_register(registers::LONGITUDE_DIRECTION);
        let longitude = self.read_float(registers::LONGITUDE_VALUE);
        let lat_dir = self.read_register(registers::LATITUDE_DIRECTION);
        let latitude = self.read_float(registers::LATITUDE_VALUE);

        let (Some(lon_dir), Some(longitude), Some(lat_dir), Some(latitude)) =
            (lon_dir, longitude, lat_dir, latitude)
        else {
            return PositionFix::invalid("failed to read position data");
        };

        let lon_direction = if lon_dir == registers::DIRECTION_EAST {
            'E'
        } else {
            'W'
        };
        let lat_direction = if lat_dir == registers::DIRECTION_NORTH {
            'N'
        } else {
            'S'
        };

        let altitude = self.read_float(registers::ALTITUDE);
        let speed_knots = self.read_float(registers::GROUND_SPEED);
        let heading_degrees = self.read_float(registers::GROUND_HEADING);
        let timestamp = self.read_local_time();

        let gps_satellites = self.read_register(registers::GPS_SATELLITES_USED).unwrap_or(0);
        let bds_satellites = self.read_register(registers::BDS_SATELLITES_USED).unwrap_or(0);

        PositionFix {
            valid: true,
            latitude: Some(latitude),
            longitude: Some(longitude),
            lat_direction: Some(lat_direction),
            lon_direction: Some(lon_direction),
            altitude,
            speed_knots,
            heading_degrees,
            timestamp,
            antenna_status,
            gps_satellites,
            bds_satellites,
            error_message: None,
        }
    }

    /// Module diagnostic: communication, version, positioning and antenna
    /// state plus human-readable problem strings. Never errors.
    pub fn health_check(&mut self) -> GpsHealth {
        let mut health = GpsHealth {
            communication: false,
            version: None,
            positioning: false,
            antenna: None,
            problems: Vec::new(),
        };

        match self.read_version() {
            Some(version) => {
                health.communication = true;
                health.version = Some(version);
            }
            None => health.problems.push("failed to read module version".to_string()),
        }

        if health.communication {
            health.positioning = self.read_positioning_status();
            health.antenna = self.read_antenna_status();

            if !health.positioning {
                health.problems.push("positioning not ready".to_string());
            }
            if let Some(antenna) = health.antenna {
                if antenna.is_fault() {
                    health.problems.push(format!("antenna fault: {antenna}"));
                }
            }
        }

        health
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::hs6602::rtu::TransportError;
    use approx::assert_relative_eq;

    /// In-memory register space with per-address failure injection.
    #[derive(Default)]
    struct MockBus {
        registers: HashMap<u16, u16>,
        /// Addresses that always fail.
        dead: HashSet<u16>,
        /// Addresses that fail N times before succeeding.
        flaky: HashMap<u16, u32>,
        /// Start addresses of every read_registers call.
        log: Arc<Mutex<Vec<u16>>>,
    }

    impl MockBus {
        fn put(&mut self, address: u16, value: u16) {
            self.registers.insert(address, value);
        }

        fn put_float(&mut self, address: u16, value: f32) {
            let bits = value.to_bits();
            self.registers.insert(address, (bits >> 16) as u16);
            self.registers.insert(address + 1, (bits & 0xFFFF) as u16);
        }

        fn put_local_time(&mut self, ymd: (u16, u16, u16), hms: (u16, u16, u16)) {
            self.put(registers::LOCAL_YEAR, ymd.0);
            self.put(registers::LOCAL_MONTH, ymd.1);
            self.put(registers::LOCAL_DAY, ymd.2);
            self.put(registers::LOCAL_HOUR, hms.0);
            self.put(registers::LOCAL_MINUTE, hms.1);
            self.put(registers::LOCAL_SECOND, hms.2);
        }
    }

    impl RegisterBus for MockBus {
        fn read_registers(&mut self, start: u16, count: u16) -> TransportResult<Vec<u16>> {
            self.log.lock().unwrap().push(start);

            if self.dead.contains(&start) {
                return Err(TransportError::Timeout);
            }
            if let Some(remaining) = self.flaky.get_mut(&start) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(TransportError::Timeout);
                }
            }

            (start..start + count)
                .map(|address| {
                    self.registers
                        .get(&address)
                        .copied()
                        .ok_or(TransportError::Timeout)
                })
                .collect()
        }
    }

    /// A bus holding the full register image of a healthy, moving fix.
    fn moving_fix_bus() -> MockBus {
        let mut bus = MockBus::default();
        bus.put(registers::VERSION, 0x0010);
        bus.put(registers::POSITIONING_STATUS, registers::POSITIONING_VALID);
        bus.put(registers::ANTENNA_STATUS, 0);
        bus.put(registers::LONGITUDE_DIRECTION, registers::DIRECTION_EAST);
        bus.put_float(registers::LONGITUDE_VALUE, 117.12583);
        bus.put(registers::LATITUDE_DIRECTION, registers::DIRECTION_NORTH);
        bus.put_float(registers::LATITUDE_VALUE, 36.67438);
        bus.put_float(registers::ALTITUDE, 125.5);
        bus.put_float(registers::GROUND_SPEED, 12.4);
        bus.put_float(registers::GROUND_HEADING, 271.0);
        bus.put_local_time((2025, 11, 7), (15, 30, 45));
        bus.put(registers::GPS_SATELLITES_USED, 8);
        bus.put(registers::BDS_SATELLITES_USED, 6);
        bus
    }

    fn client(bus: MockBus) -> (Hs6602, Arc<Mutex<Vec<u16>>>) {
        let log = bus.log.clone();
        (Hs6602::with_bus(Box::new(bus)), log)
    }

    #[test]
    fn version_splits_bcd_nibbles() {
        for (raw, expected) in [(0x0010u16, "1.0"), (0x0035, "3.5"), (0x0012, "1.2")] {
            let mut bus = MockBus::default();
            bus.put(registers::VERSION, raw);
            let (mut gps, _) = client(bus);
            assert_eq!(gps.read_version().as_deref(), Some(expected));
        }
    }

    #[test]
    fn invalid_positioning_short_circuits() {
        let mut bus = moving_fix_bus();
        bus.put(registers::POSITIONING_STATUS, 0);
        let (mut gps, log) = client(bus);

        let fix = gps.read_fix();
        assert!(!fix.valid);
        assert!(fix
            .error_message
            .as_deref()
            .unwrap()
            .contains("positioning invalid"));

        // Nothing past the status gate was touched.
        let reads = log.lock().unwrap().clone();
        assert_eq!(reads, vec![registers::POSITIONING_STATUS]);
    }

    #[test]
    fn unreadable_positioning_status_is_invalid_not_error() {
        let mut bus = moving_fix_bus();
        bus.dead.insert(registers::POSITIONING_STATUS);
        let (mut gps, _) = client(bus);
        assert!(!gps.read_fix().valid);
    }

    #[test]
    fn antenna_fault_overrides_valid_positioning() {
        for (raw, status) in [(1u16, AntennaStatus::Open), (2, AntennaStatus::Short)] {
            let mut bus = moving_fix_bus();
            bus.put(registers::ANTENNA_STATUS, raw);
            let (mut gps, log) = client(bus);

            let fix = gps.read_fix();
            assert!(!fix.valid);
            assert_eq!(fix.antenna_status, Some(status));
            assert!(fix.error_message.as_deref().unwrap().contains("antenna fault"));

            // Position registers were never read.
            let reads = log.lock().unwrap().clone();
            assert!(!reads.contains(&registers::LONGITUDE_DIRECTION));
            assert!(!reads.contains(&registers::LATITUDE_VALUE));
        }
    }

    #[test]
    fn full_fix_decodes_every_field() {
        let (mut gps, _) = client(moving_fix_bus());
        let fix = gps.read_fix();

        assert!(fix.valid);
        assert_relative_eq!(fix.latitude.unwrap(), 36.67438, epsilon = 1e-5);
        assert_relative_eq!(fix.longitude.unwrap(), 117.12583, epsilon = 1e-5);
        assert_eq!(fix.lat_direction, Some('N'));
        assert_eq!(fix.lon_direction, Some('E'));
        assert_relative_eq!(fix.altitude.unwrap(), 125.5, epsilon = 1e-5);
        assert_relative_eq!(fix.speed_knots.unwrap(), 12.4, epsilon = 1e-5);
        assert_relative_eq!(fix.heading_degrees.unwrap(), 271.0, epsilon = 1e-5);
        assert_eq!(
            fix.timestamp,
            NaiveDate::from_ymd_opt(2025, 11, 7)
                .unwrap()
                .and_hms_opt(15, 30, 45)
        );
        assert_eq!(fix.antenna_status, Some(AntennaStatus::Good));
        assert_eq!(fix.gps_satellites, 8);
        assert_eq!(fix.bds_satellites, 6);
        assert!(fix.error_message.is_none());
    }

    #[test]
    fn fix_serializes_exact_field_values() {
        let fix = PositionFix {
            valid: true,
            latitude: Some(36.67438),
            longitude: Some(117.12583),
            lat_direction: Some('N'),
            lon_direction: Some('E'),
            altitude: Some(125.5),
            speed_knots: None,
            heading_degrees: None,
            timestamp: NaiveDate::from_ymd_opt(2025, 11, 7)
                .unwrap()
                .and_hms_opt(15, 30, 45),
            antenna_status: Some(AntennaStatus::Good),
            gps_satellites: 8,
            bds_satellites: 6,
            error_message: None,
        };

        let value = serde_json::to_value(&fix).unwrap();
        assert_eq!(value["valid"], serde_json::json!(true));
        assert_eq!(value["latitude"].as_f64().unwrap(), 36.67438);
        assert_eq!(value["longitude"].as_f64().unwrap(), 117.12583);
        assert_eq!(value["altitude"].as_f64().unwrap(), 125.5);
        assert_eq!(value["lat_direction"], serde_json::json!("N"));
        assert_eq!(value["lon_direction"], serde_json::json!("E"));
        assert_eq!(value["gps_satellites"], serde_json::json!(8));
        assert_eq!(value["bds_satellites"], serde_json::json!(6));
        assert_eq!(value["antenna_status"], serde_json::json!("good"));
        assert_eq!(value["timestamp"], serde_json::json!("2025-11-07T15:30:45"));
    }

    #[test]
    fn missing_position_register_invalidates_fix() {
        let mut bus = moving_fix_bus();
        bus.dead.insert(registers::LATITUDE_VALUE);
        let (mut gps, _) = client(bus);

        let fix = gps.read_fix();
        assert!(!fix.valid);
        assert!(fix
            .error_message
            .as_deref()
            .unwrap()
            .contains("failed to read position"));
    }

    #[test]
    fn optional_fields_degrade_independently() {
        let mut bus = moving_fix_bus();
        bus.dead.insert(registers::ALTITUDE);
        bus.dead.insert(registers::GROUND_SPEED);
        bus.dead.insert(registers::LOCAL_HOUR);
        bus.dead.insert(registers::GPS_SATELLITES_USED);
        let (mut gps, _) = client(bus);

        let fix = gps.read_fix();
        assert!(fix.valid);
        assert!(fix.altitude.is_none());
        assert!(fix.speed_knots.is_none());
        assert!(fix.heading_degrees.is_some());
        assert!(fix.timestamp.is_none());
        assert_eq!(fix.gps_satellites, 0);
        assert_eq!(fix.bds_satellites, 6);
    }

    #[test]
    fn nonsense_calendar_values_drop_the_timestamp() {
        let mut bus = moving_fix_bus();
        bus.put(registers::LOCAL_MONTH, 13);
        let (mut gps, _) = client(bus);

        let fix = gps.read_fix();
        assert!(fix.valid);
        assert!(fix.timestamp.is_none());
    }

    #[test]
    fn reads_retry_before_giving_up() {
        let mut bus = MockBus::default();
        bus.put(registers::VERSION, 0x0021);
        bus.flaky.insert(registers::VERSION, 2);
        let (mut gps, log) = client(bus);

        assert_eq!(gps.read_version().as_deref(), Some("2.1"));
        assert_eq!(log.lock().unwrap().len(), 3);
    }

    #[test]
    fn retry_budget_is_bounded() {
        let mut bus = MockBus::default();
        bus.dead.insert(registers::VERSION);
        let (mut gps, log) = client(bus);

        assert!(gps.read_version().is_none());
        assert_eq!(log.lock().unwrap().len(), READ_RETRY_ATTEMPTS as usize);
    }

    #[test]
    fn health_check_reports_problems() {
        let mut bus = moving_fix_bus();
        bus.put(registers::POSITIONING_STATUS, 0);
        bus.put(registers::ANTENNA_STATUS, 1);
        let (mut gps, _) = client(bus);

        let health = gps.health_check();
        assert!(health.communication);
        assert_eq!(health.version.as_deref(), Some("1.0"));
        assert!(!health.positioning);
        assert_eq!(health.antenna, Some(AntennaStatus::Open));
        assert_eq!(health.problems.len(), 2);
    }

    #[test]
    fn health_check_without_communication() {
        let mut bus = MockBus::default();
        bus.dead.insert(registers::VERSION);
        let (mut gps, _) = client(bus);

        let health = gps.health_check();
        assert!(!health.communication);
        assert!(health.version.is_none());
        assert_eq!(health.problems.len(), 1);
    }
}
