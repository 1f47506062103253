//! Binary wiring: startup and the console command surface

pub mod console;
pub mod init;
