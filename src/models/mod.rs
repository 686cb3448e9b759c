pub mod device;
pub mod intake;
pub mod medication;

pub use device::*;
pub use intake::*;
pub use medication::*;
