//! Motor driver facade.
//!
//! The physical driver is an external collaborator; its contract is the
//! trait below. The simulation driver just narrates what the hardware
//! would do.

use railproto::Direction;
use tracing::info;

pub trait MotorDriver: Send {
    fn set_speed(&mut self, speed: f64);
    fn set_direction(&mut self, direction: Direction);
    /// Immediate stop, used by POWER_OFF.
    fn stop(&mut self);
}

/// Logging stand-in for bench setups without a vehicle.
#[derive(Debug)]
pub struct SimMotor {
    speed: f64,
    direction: Direction,
}

impl Default for SimMotor {
    fn default() -> Self {
        Self {
            speed: 0.0,
            direction: Direction::Forward,
        }
    }
}

impl MotorDriver for SimMotor {
    fn set_speed(&mut self, speed: f64) {
        self.speed = speed;
        info!(speed, "motor speed set");
    }

    fn set_direction(&mut self, direction: Direction) {
        self.direction = direction;
        info!(?direction, "motor direction set");
    }

    fn stop(&mut self) {
        self.speed = 0.0;
        info!("motor stopped");
    }
}
