pub mod channel;
pub mod config;
pub mod errors;
pub mod frame;
pub mod frame_buffer;
pub mod heartbeat;
pub mod import;
pub mod layout;
pub mod message;
pub mod paths;
pub mod power;
#[cfg(feature = "frame-producer")]
pub mod producer;
pub mod protocol;
pub mod queue;
pub mod session;
pub mod slot_table;
mod worker;

pub use config::ClientConfig;
pub use errors::IpcError;
pub use frame::FrameView;
pub use frame_buffer::SharedFrameBuffer;
#[cfg(feature = "ion")]
pub use import::IonImporter;
pub use import::{DmaBufImporter, MappedRegion, MemoryImporter};
pub use layout::{FrameHeader, PixelFormat};
pub use message::{CameraParams, MessageId, WireMessage};
pub use power::{GpioPin, Level, PowerController, SysfsGpio};
#[cfg(feature = "frame-producer")]
pub use producer::FrameProducer;
pub use protocol::{RequestOutcome, SessionState, Ticket};
pub use session::ClientSession;
