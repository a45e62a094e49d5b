pub mod sensor_reading;

pub use sensor_reading::{parse_iso8601, MalformedRecordError, SensorReading};
