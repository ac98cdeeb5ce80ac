//! PIC serial programmer: BLoad bootloader and ICSP host-controller
//! protocols over a plain serial line.

pub mod constants;
pub mod device;
pub mod error;
pub mod flashing;
pub mod hexfile;
pub mod memory;
pub mod protocol;
pub mod sim;
pub mod transport;

pub use self::device::{DeviceProfile, Family, Registry};
pub use self::error::{Error, Result};
pub use self::flashing::{FlashConfig, Flashing};
pub use self::memory::{Image, Page};
pub use self::protocol::{BLoad, Icsp, Protocol};
pub use self::transport::Transport;
