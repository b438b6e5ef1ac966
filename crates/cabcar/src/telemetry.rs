//! Simulated telemetry: one well-typed record per tick.
//!
//! Station progression, battery and fuel drain, and the speed ramp toward
//! the commanded target are simulated; real vehicles replace this module
//! with sensor adapters producing the same record.

use railproto::{Direction, Gps, TelemetryReport};
use rand::Rng;

/// Stations along the simulated line, with coordinates.
const STATIONS: &[(&str, f64, f64)] = &[
    ("Malente", 54.1722, 10.5597),
    ("Gremsmühlen", 53.9036, 10.3111),
    ("Plön", 54.1624, 10.4234),
    ("Ascheberg", 54.1500, 10.3450),
    ("Preetz", 54.2353, 10.2775),
    ("Raisdorf Rosenthal", 54.2500, 10.2333),
    ("Rastorfer Kreuz", 54.2700, 10.3000),
    ("Wildenhorst", 54.2800, 10.3500),
    ("Fuhlenbrügge", 54.2850, 10.4000),
    ("Lütjenburg", 54.2941, 10.5868),
];

/// Maximum speed per step of the ramp toward the target.
const RAMP_STEP: f64 = 5.0;

pub const STATUS_RUNNING: &str = "running";
pub const STATUS_STOPPED: &str = "stopped";

pub struct TelemetrySimulator {
    train_id: String,
    status: &'static str,
    direction: Direction,
    speed: f64,
    max_speed: f64,
    target_speed: f64,
    location_index: usize,
    next_station_index: usize,
    temperature: f64,
    engine_temperature_base: f64,
    battery_level: f64,
    fuel_level: f64,
    network_signal_strength: u8,
    ticks: u64,
}

impl TelemetrySimulator {
    pub fn new(train_id: impl Into<String>) -> Self {
        let mut rng = rand::thread_rng();
        let location_index = rng.gen_range(0..STATIONS.len());
        Self {
            train_id: train_id.into(),
            status: STATUS_RUNNING,
            direction: Direction::Forward,
            speed: 0.0,
            max_speed: 60.0,
            target_speed: 0.0,
            location_index,
            next_station_index: (location_index + 1) % STATIONS.len(),
            temperature: rng.gen_range(-5.0..30.0),
            engine_temperature_base: rng.gen_range(70.0..85.0),
            battery_level: rng.gen_range(70.0..99.0),
            fuel_level: rng.gen_range(70.0..99.0),
            network_signal_strength: rng.gen_range(40..100),
            ticks: 0,
        }
    }

    pub fn set_target_speed(&mut self, target: f64) {
        self.target_speed = target.clamp(0.0, self.max_speed);
    }

    pub fn target_speed(&self) -> f64 {
        self.target_speed
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }

    pub fn set_direction(&mut self, direction: Direction) {
        self.direction = direction;
    }

    pub fn power_on(&mut self) {
        self.status = STATUS_RUNNING;
    }

    pub fn power_off(&mut self) {
        self.status = STATUS_STOPPED;
        self.target_speed = 0.0;
    }

    /// Advance the simulation one tick and produce the record.
    pub fn tick(&mut self) -> TelemetryReport {
        let mut rng = rand::thread_rng();
        self.ticks += 1;

        // Ramp toward the target by at most RAMP_STEP per tick.
        let delta = (self.target_speed - self.speed).clamp(-RAMP_STEP, RAMP_STEP);
        self.speed = (self.speed + delta).clamp(0.0, self.max_speed);

        self.battery_level = (self.battery_level - rng.gen_range(0.01..0.05)).max(0.0);
        self.fuel_level = (self.fuel_level - rng.gen_range(0.01..0.05)).max(0.0);

        // Station progression and signal wander on a slow cadence.
        if self.ticks % 30 == 0 && self.speed > 0.0 {
            self.location_index = self.next_station_index;
            self.next_station_index = (self.location_index + 1) % STATIONS.len();
            self.network_signal_strength = rng.gen_range(10..100);
        }

        let (location, lat, lon) = STATIONS[self.location_index];
        let (next_station, _, _) = STATIONS[self.next_station_index];

        TelemetryReport {
            train_id: self.train_id.clone(),
            status: self.status.to_string(),
            direction: match self.direction {
                Direction::Forward => 1,
                Direction::Backward => -1,
            },
            speed: self.speed,
            max_speed: self.max_speed,
            brake_status: (if self.speed == 0.0 { "applied" } else { "released" }).to_string(),
            location: location.to_string(),
            next_station: next_station.to_string(),
            gps: Gps { lat, lon },
            temperature: self.temperature,
            engine_temperature: self.engine_temperature_base + rng.gen_range(0.0..10.0),
            battery_level: self.battery_level,
            fuel_level: self.fuel_level,
            network_signal_strength: self.network_signal_strength,
            timestamp: now_ms(),
        }
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
