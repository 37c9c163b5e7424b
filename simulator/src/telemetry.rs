use dashboard::model::{Numeric, Reading};
use rand::Rng;

pub const STATUS: &str = "active";
pub const MESSAGE: &str = "sensor reading";

/// One sample as the Raspberry Pi emulator reports it: an integer in 0..=100.
pub fn generate_reading(
    rng: &mut impl Rng,
    device_id: &str,
    message_id: u64,
    timestamp: i64,
) -> Reading {
    Reading {
        device_id: device_id.to_string(),
        timestamp,
        message_id: Some(message_id),
        value: Numeric::Int(rng.gen_range(0..=100)),
        status: STATUS.to_string(),
        message: MESSAGE.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_reading_is_valid() {
        let mut rng = rand::thread_rng();
        for id in 1..=50 {
            let reading = generate_reading(&mut rng, "RaspberryPiEmulator1", id, 1_700_000_000);

            assert!(dashboard::validate::validate(&reading).is_ok());
            assert_eq!(reading.message_id, Some(id));
            match reading.value {
                Numeric::Int(v) => assert!((0..=100).contains(&v)),
                Numeric::Float(v) => panic!("unexpected float {}", v),
            }
        }
    }

    #[test]
    fn test_payload_shape() {
        let mut rng = rand::thread_rng();
        let reading = generate_reading(&mut rng, "dev-1", 1, 1_700_000_000);
        let json: serde_json::Value = serde_json::to_value(&reading).unwrap();

        for key in ["device_id", "timestamp", "message_id", "value", "status", "message"] {
            assert!(json.get(key).is_some(), "missing {}", key);
        }
    }
}
