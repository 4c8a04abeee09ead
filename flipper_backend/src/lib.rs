pub mod channel;
pub mod config;
pub mod controller;
pub mod error;
pub mod monitor;
pub mod port;
pub mod sim;
pub mod supervisor;
pub mod task;
pub mod utils;
pub mod waveform;

pub use channel::*;
pub use config::*;
pub use controller::*;
pub use error::*;
pub use monitor::*;
pub use port::*;
pub use supervisor::*;
pub use task::*;
pub use utils::*;
pub use waveform::*;
