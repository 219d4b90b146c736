// Controller logic that runs on the rover boards
//
// Provides:
// - Latched fault state with listeners
// - H-bridge drive, current supervision and the stall classifier
// - PID loop, position/speed motor roles, quadrature encoder, ADC scheduling
// - Register devices for slaves and the master, and the frame processor

pub mod adc;
pub mod clock;
pub mod drive;
pub mod encoder;
pub mod fault;
pub mod master;
pub mod motor;
pub mod pid;
pub mod slave;
pub mod store;

pub use adc::{AdcConverter, AdcKind, AdcScheduler, AdcSink};
pub use clock::Clock;
pub use drive::{DrivePins, DriveState, HBridge, MotorController, StallPolicy};
pub use encoder::QuadEncoder;
pub use fault::{FaultController, FaultKind, FaultListener, FaultOrigin};
pub use master::{MasterDevice, SlaveLink};
pub use motor::{ControlledMotor, MotorRole};
pub use pid::PidLoop;
pub use slave::SlaveBoard;
pub use store::{CommandProcessor, RegisterDevice, RegisterFile};
