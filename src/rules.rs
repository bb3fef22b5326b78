//! Fault rule engine: classifies one set of sensor values into a fault
//! bitmask plus human-readable findings. Pure — no state, no I/O.
//!
//! Bit assignments are wire format shared with every consumer of the
//! fault-notification topic and must not be renumbered.

use crate::db::models::SensorType;

pub const FAULT_SENSOR_NOT_WORKING: u32 = 1; // bit 0, iaq: all three values zero
pub const FAULT_CALIBRATION_ERROR: u32 = 2; // bit 1, iaq: some but not all zero
pub const FAULT_TEMP_HIGH: u32 = 4; // bit 2, iaq: temperature > 35
pub const FAULT_HUM_HIGH: u32 = 8; // bit 3, iaq: humidity > 60
pub const FAULT_CO2_LOW: u32 = 16; // bit 4, iaq: co2 < 200
pub const FAULT_CO2_HIGH: u32 = 32; // bit 5, iaq: co2 > 800
pub const FAULT_POWER_NOT_WORKING: u32 = 64; // bit 6, power: 0.0 kW
pub const FAULT_POWER_SPIKE: u32 = 128; // bit 7, power: > 45.0 kW
pub const FAULT_PRESENCE_NOT_READING: u32 = 256; // bit 8, presence: sentinel 3

/// Bits owned by each device class. Disjoint; a fault notification is split
/// along these ranges before persistence.
pub const IAQ_FAULTS: u32 = FAULT_SENSOR_NOT_WORKING
    | FAULT_CALIBRATION_ERROR
    | FAULT_TEMP_HIGH
    | FAULT_HUM_HIGH
    | FAULT_CO2_LOW
    | FAULT_CO2_HIGH;
pub const POWER_FAULTS: u32 = FAULT_POWER_NOT_WORKING | FAULT_POWER_SPIKE;
pub const PRESENCE_FAULTS: u32 = FAULT_PRESENCE_NOT_READING;

/// Field values extracted from one telemetry message, keyed by sensor class.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SensorValues {
    Iaq {
        temperature: f64,
        humidity: f64,
        co2: f64,
    },
    Power {
        power_kw: f64,
    },
    Presence {
        presence: i64,
    },
}

/// One matched rule: a fixed label and the offending values.
#[derive(Debug, Clone, PartialEq)]
pub struct Finding {
    pub label: &'static str,
    pub detail: String,
}

/// Result of running the rules over one message.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub fault_flags: u32,
    pub findings: Vec<Finding>,
}

impl Evaluation {
    fn none() -> Self {
        Self {
            fault_flags: 0,
            findings: Vec::new(),
        }
    }

    fn single(flag: u32, label: &'static str, detail: String) -> Self {
        Self {
            fault_flags: flag,
            findings: vec![Finding { label, detail }],
        }
    }

    fn add(&mut self, flag: u32, label: &'static str, detail: String) {
        self.fault_flags |= flag;
        self.findings.push(Finding { label, detail });
    }

    pub fn is_fault(&self) -> bool {
        self.fault_flags != 0
    }

    /// `"Temperature High (temp=40), CO2 High (co2=900)"` — used in logs.
    pub fn summary(&self) -> String {
        self.findings
            .iter()
            .map(|f| format!("{} ({})", f.label, f.detail))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Run the rules for one message.
///
/// iaq short-circuits: an all-zero reading reports only "sensor not
/// working", a partially-zero reading only "calibration error"; the four
/// threshold rules are evaluated (and OR-ed) only when every field is
/// nonzero. power and presence rules are always evaluated independently.
pub fn evaluate(values: &SensorValues) -> Evaluation {
    match *values {
        SensorValues::Iaq {
            temperature,
            humidity,
            co2,
        } => evaluate_iaq(temperature, humidity, co2),
        SensorValues::Power { power_kw } => evaluate_power(power_kw),
        SensorValues::Presence { presence } => evaluate_presence(presence),
    }
}

fn evaluate_iaq(temperature: f64, humidity: f64, co2: f64) -> Evaluation {
    let zeros = [temperature, humidity, co2]
        .iter()
        .filter(|v| **v == 0.0)
        .count();

    if zeros == 3 {
        return Evaluation::single(
            FAULT_SENSOR_NOT_WORKING,
            "Sensor Not Working",
            "all values 0".to_owned(),
        );
    }
    if zeros > 0 {
        return Evaluation::single(
            FAULT_CALIBRATION_ERROR,
            "Calibration Error",
            format!("temp={temperature}, hum={humidity}, co2={co2}"),
        );
    }

    let mut eval = Evaluation::none();
    if temperature > 35.0 {
        eval.add(FAULT_TEMP_HIGH, "Temperature High", format!("temp={temperature}"));
    }
    if humidity > 60.0 {
        eval.add(FAULT_HUM_HIGH, "Humidity High", format!("hum={humidity}"));
    }
    if co2 < 200.0 {
        eval.add(FAULT_CO2_LOW, "CO2 Low", format!("co2={co2}"));
    }
    if co2 > 800.0 {
        eval.add(FAULT_CO2_HIGH, "CO2 High", format!("co2={co2}"));
    }
    eval
}

fn evaluate_power(power_kw: f64) -> Evaluation {
    let mut eval = Evaluation::none();
    if power_kw == 0.0 {
        eval.add(
            FAULT_POWER_NOT_WORKING,
            "Power Not Working",
            format!("power_kw={power_kw}"),
        );
    }
    if power_kw > 45.0 {
        eval.add(FAULT_POWER_SPIKE, "Power Spike", format!("power_kw={power_kw}"));
    }
    eval
}

fn evaluate_presence(presence: i64) -> Evaluation {
    let mut eval = Evaluation::none();
    if presence == 3 {
        eval.add(
            FAULT_PRESENCE_NOT_READING,
            "Presence Not Reading",
            format!("presence={presence}"),
        );
    }
    eval
}

/// Severity of a mask: maximum severity among its set bits, defaulting to 1
/// for a nonzero mask with no mapped bit.
pub fn severity(fault_flags: u32) -> i64 {
    const SEVERITIES: [(u32, i64); 9] = [
        (FAULT_SENSOR_NOT_WORKING, 2),
        (FAULT_CALIBRATION_ERROR, 2),
        (FAULT_TEMP_HIGH, 2),
        (FAULT_HUM_HIGH, 2),
        (FAULT_CO2_LOW, 1),
        (FAULT_CO2_HIGH, 2),
        (FAULT_POWER_NOT_WORKING, 3),
        (FAULT_POWER_SPIKE, 3),
        (FAULT_PRESENCE_NOT_READING, 2),
    ];

    let max = SEVERITIES
        .iter()
        .filter(|(flag, _)| fault_flags & flag != 0)
        .map(|(_, sev)| *sev)
        .max()
        .unwrap_or(0);
    if max == 0 {
        1
    } else {
        max
    }
}

/// Split a mask into the nonempty per-device submasks. Upstream never emits
/// bits from more than one range in a single notification, but nothing in
/// the wire format prevents it, so the split handles the general case.
pub fn split_by_device(fault_flags: u32) -> Vec<(SensorType, u32)> {
    [
        (SensorType::Iaq, fault_flags & IAQ_FAULTS),
        (SensorType::Power, fault_flags & POWER_FAULTS),
        (SensorType::Presence, fault_flags & PRESENCE_FAULTS),
    ]
    .into_iter()
    .filter(|(_, mask)| *mask != 0)
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iaq(temperature: f64, humidity: f64, co2: f64) -> Evaluation {
        evaluate(&SensorValues::Iaq {
            temperature,
            humidity,
            co2,
        })
    }

    #[test]
    fn iaq_all_zero_sets_only_bit_0() {
        let eval = iaq(0.0, 0.0, 0.0);
        assert_eq!(eval.fault_flags, FAULT_SENSOR_NOT_WORKING);
        assert_eq!(eval.findings.len(), 1);
        assert_eq!(eval.findings[0].label, "Sensor Not Working");
    }

    #[test]
    fn iaq_partial_zero_sets_only_bit_1() {
        // Even with co2 in the "high" range, the short-circuit means only
        // the calibration bit is reported.
        let eval = iaq(0.0, 45.0, 900.0);
        assert_eq!(eval.fault_flags, FAULT_CALIBRATION_ERROR);

        let eval = iaq(25.0, 0.0, 0.0);
        assert_eq!(eval.fault_flags, FAULT_CALIBRATION_ERROR);
    }

    #[test]
    fn iaq_temperature_threshold_only() {
        let eval = iaq(40.0, 30.0, 500.0);
        assert_eq!(eval.fault_flags, FAULT_TEMP_HIGH);
        assert_eq!(severity(eval.fault_flags), 2);
    }

    #[test]
    fn iaq_threshold_bits_combine() {
        let eval = iaq(40.0, 70.0, 900.0);
        assert_eq!(
            eval.fault_flags,
            FAULT_TEMP_HIGH | FAULT_HUM_HIGH | FAULT_CO2_HIGH
        );
        assert_eq!(eval.findings.len(), 3);
    }

    #[test]
    fn iaq_in_range_reading_is_clean() {
        let eval = iaq(25.0, 45.0, 500.0);
        assert!(!eval.is_fault());
        assert!(eval.findings.is_empty());
    }

    #[test]
    fn iaq_boundary_values_are_not_faults() {
        assert!(!iaq(35.0, 60.0, 200.0).is_fault());
        assert!(!iaq(25.0, 45.0, 800.0).is_fault());
    }

    #[test]
    fn power_zero_is_severity_three() {
        let eval = evaluate(&SensorValues::Power { power_kw: 0.0 });
        assert_eq!(eval.fault_flags, FAULT_POWER_NOT_WORKING);
        assert_eq!(severity(eval.fault_flags), 3);
    }

    #[test]
    fn power_spike_is_severity_three() {
        let eval = evaluate(&SensorValues::Power { power_kw: 50.0 });
        assert_eq!(eval.fault_flags, FAULT_POWER_SPIKE);
        assert_eq!(severity(eval.fault_flags), 3);
    }

    #[test]
    fn power_nominal_is_clean() {
        assert!(!evaluate(&SensorValues::Power { power_kw: 20.0 }).is_fault());
        assert!(!evaluate(&SensorValues::Power { power_kw: 45.0 }).is_fault());
    }

    #[test]
    fn presence_sentinel_is_fault() {
        let eval = evaluate(&SensorValues::Presence { presence: 3 });
        assert_eq!(eval.fault_flags, FAULT_PRESENCE_NOT_READING);
        assert_eq!(severity(eval.fault_flags), 2);

        for p in [0, 1, 2] {
            assert!(!evaluate(&SensorValues::Presence { presence: p }).is_fault());
        }
    }

    #[test]
    fn severity_takes_the_maximum_over_set_bits() {
        assert_eq!(severity(FAULT_CO2_LOW), 1);
        assert_eq!(severity(FAULT_CO2_LOW | FAULT_TEMP_HIGH), 2);
        assert_eq!(severity(FAULT_CO2_LOW | FAULT_POWER_SPIKE), 3);
    }

    #[test]
    fn severity_defaults_to_one_for_unmapped_bits() {
        assert_eq!(severity(1 << 12), 1);
    }

    #[test]
    fn split_separates_device_ranges() {
        let mixed = FAULT_TEMP_HIGH | FAULT_POWER_SPIKE | FAULT_PRESENCE_NOT_READING;
        let parts = split_by_device(mixed);
        assert_eq!(
            parts,
            vec![
                (SensorType::Iaq, FAULT_TEMP_HIGH),
                (SensorType::Power, FAULT_POWER_SPIKE),
                (SensorType::Presence, FAULT_PRESENCE_NOT_READING),
            ]
        );
    }

    #[test]
    fn split_of_single_range_mask_is_that_mask() {
        let parts = split_by_device(FAULT_CALIBRATION_ERROR);
        assert_eq!(parts, vec![(SensorType::Iaq, FAULT_CALIBRATION_ERROR)]);
        assert!(split_by_device(0).is_empty());
    }

    #[test]
    fn summary_joins_findings_in_order() {
        let eval = iaq(40.0, 30.0, 100.0);
        assert_eq!(
            eval.summary(),
            "Temperature High (temp=40), CO2 Low (co2=100)"
        );
    }
}
